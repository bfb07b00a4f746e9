//! Similarity-driven graph de-duplication
//!
//! The merger owns the growing entity set behind a `(label, name)` index.
//! An incoming entity either hits an existing key, merges into its best
//! embedding candidate above the threshold, or enters as new. Relationships
//! pass through the entity remapping first, so endpoint keys stay valid
//! across merges.

use std::collections::HashMap;

use graphloom_core::config::EntityLabelConfig;
use graphloom_core::domain::{Entity, EntityKey, KnowledgeGraph, Relationship};
use tracing::debug;

use crate::similarity::{cosine, entity_score};

/// Longest label kept after normalization.
const MAX_LABEL_LEN: usize = 64;

/// Thresholds and flags controlling the merge, from the `atom` config.
#[derive(Debug, Clone)]
pub struct MergeParams {
    pub ent_threshold: f32,
    pub rel_threshold: f32,
    pub entity_name_weight: f32,
    pub entity_label_weight: f32,
    pub require_same_entity_label: bool,
    pub rename_relationship_by_embedding: bool,
}

/// Canonicalizes an extracted entity label: trim, alias mapping, allowlist
/// enforcement, unknown fallback.
pub fn normalize_label(raw: &str, labels: &EntityLabelConfig) -> String {
    let mut label = raw.trim().to_string();
    if label.is_empty() {
        return labels.unknown_label.clone();
    }
    if let Some(canonical) = labels.aliases.get(&label) {
        label = canonical.clone();
    }
    if let Some(allowlist) = &labels.allowlist {
        if !allowlist.iter().any(|allowed| allowed == &label) {
            return labels.unknown_label.clone();
        }
    }
    if label.chars().count() > MAX_LABEL_LEN {
        label = label.chars().take(MAX_LABEL_LEN).collect();
    }
    label
}

/// Accumulates entities and relationships under similarity merging.
pub struct GraphMerger {
    params: MergeParams,
    entities: Vec<Entity>,
    index: HashMap<EntityKey, usize>,
    relationships: Vec<Relationship>,
}

impl GraphMerger {
    pub fn new(params: MergeParams) -> Self {
        Self {
            params,
            entities: Vec::new(),
            index: HashMap::new(),
            relationships: Vec::new(),
        }
    }

    /// Seeds the merger with a prior graph. Prior entities and relationships
    /// enter verbatim; later arrivals merge into them.
    pub fn seed(&mut self, prior: KnowledgeGraph) {
        for entity in prior.entities {
            let key = entity.key();
            if let Some(&i) = self.index.get(&key) {
                if self.entities[i].embedding.is_none() {
                    self.entities[i].embedding = entity.embedding;
                }
                continue;
            }
            self.index.insert(key, self.entities.len());
            self.entities.push(entity);
        }
        for rel in prior.relationships {
            self.push_relationship(rel, None);
        }
    }

    /// Merges one entity and returns the key it ended up under.
    ///
    /// Resolution order: exact `(label, name)` hit, then the best embedding
    /// candidate at or above `ent_threshold`, then insertion as new. With
    /// `require_same_entity_label` set, candidates with a different label are
    /// never considered.
    pub fn merge_entity(&mut self, entity: Entity) -> EntityKey {
        let key = entity.key();
        if let Some(&i) = self.index.get(&key) {
            if self.entities[i].embedding.is_none() {
                self.entities[i].embedding = entity.embedding;
            }
            return key;
        }

        if let Some(embedding) = &entity.embedding {
            let mut best: Option<(usize, f32)> = None;
            for (i, existing) in self.entities.iter().enumerate() {
                let labels_match = existing.label == entity.label;
                if self.params.require_same_entity_label && !labels_match {
                    continue;
                }
                let name_sim = match &existing.embedding {
                    Some(other) => cosine(embedding, other),
                    None => continue,
                };
                let score = entity_score(
                    name_sim,
                    labels_match,
                    self.params.entity_name_weight,
                    self.params.entity_label_weight,
                );
                if score >= self.params.ent_threshold
                    && best.map(|(_, s)| score > s).unwrap_or(true)
                {
                    best = Some((i, score));
                }
            }
            if let Some((i, score)) = best {
                let winner = self.entities[i].key();
                debug!(
                    incoming = %key,
                    merged_into = %winner,
                    score,
                    "entity merged by embedding similarity"
                );
                return winner;
            }
        }

        self.index.insert(key.clone(), self.entities.len());
        self.entities.push(entity);
        key
    }

    /// Merges one relationship, unioning evidence with an existing edge when
    /// the endpoints match and the predicate is the same or close enough.
    ///
    /// Predicate proximity merging only applies when
    /// `rename_relationship_by_embedding` is set; the surviving edge keeps
    /// the representative's predicate (the first one seen).
    pub fn merge_relationship(
        &mut self,
        rel: Relationship,
        predicate_embeddings: &HashMap<String, Vec<f32>>,
    ) {
        self.push_relationship(rel, Some(predicate_embeddings));
    }

    fn push_relationship(
        &mut self,
        rel: Relationship,
        predicate_embeddings: Option<&HashMap<String, Vec<f32>>>,
    ) {
        for existing in &mut self.relationships {
            if existing.source != rel.source || existing.target != rel.target {
                continue;
            }
            if existing.predicate == rel.predicate {
                existing.absorb(&rel);
                return;
            }
            if self.params.rename_relationship_by_embedding {
                if let Some(embeddings) = predicate_embeddings {
                    let sim = match (
                        embeddings.get(&existing.predicate),
                        embeddings.get(&rel.predicate),
                    ) {
                        (Some(a), Some(b)) => cosine(a, b),
                        _ => 0.0,
                    };
                    if sim >= self.params.rel_threshold {
                        debug!(
                            kept = %existing.predicate,
                            merged = %rel.predicate,
                            sim,
                            "relationship predicates merged"
                        );
                        existing.absorb(&rel);
                        return;
                    }
                }
            }
        }
        self.relationships.push(rel);
    }

    /// Consumes the merger and returns the final graph, with dangling
    /// relationship endpoints dropped.
    pub fn finish(self) -> KnowledgeGraph {
        let mut kg = KnowledgeGraph {
            entities: self.entities,
            relationships: self.relationships,
        };
        kg.normalize();
        kg
    }
}
