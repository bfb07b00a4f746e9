//! Graph construction pipeline
//!
//! [`GraphBuilder::build_graph`] turns a list of atomic facts into a merged
//! [`KnowledgeGraph`]: one structured extraction call per fact (batched by
//! the throttled parser), embeddings for unique entity names and predicates,
//! then a similarity merge seeded with the prior graph in incremental mode.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt, TryStreamExt};
use graphloom_core::config::{AtomConfig, EntityLabelConfig, OntologyConfig, OutputConfig};
use graphloom_core::domain::{Entity, EntityKey, KnowledgeGraph, Relationship};
use graphloom_core::ports::LlmError;
use graphloom_llm::ThrottledParser;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::merge::{normalize_label, GraphMerger, MergeParams};
use crate::schema::{fact_graph_schema, FactGraphBlock};

/// Texts per embedding request.
const EMBED_CHUNK: usize = 64;

/// Errors surfaced by graph construction.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// All construction parameters, assembled from the `atom`, `output` and
/// `ontology` config sections.
#[derive(Debug, Clone)]
pub struct BuildParams {
    pub ent_threshold: f32,
    pub rel_threshold: f32,
    pub entity_name_weight: f32,
    pub entity_label_weight: f32,
    pub max_workers: usize,
    pub require_same_entity_label: bool,
    pub rename_relationship_by_embedding: bool,
    pub labels: EntityLabelConfig,
    pub relation_fallback_name: String,
    pub output_language: String,
    pub entity_name_mode: String,
}

impl BuildParams {
    pub fn from_config(atom: &AtomConfig, output: &OutputConfig, ontology: &OntologyConfig) -> Self {
        Self {
            ent_threshold: atom.ent_threshold,
            rel_threshold: atom.rel_threshold,
            entity_name_weight: atom.entity_name_weight,
            entity_label_weight: atom.entity_label_weight,
            max_workers: atom.max_workers,
            require_same_entity_label: atom.require_same_entity_label,
            rename_relationship_by_embedding: atom.rename_relationship_by_embedding,
            labels: ontology.entity_label.clone(),
            relation_fallback_name: output.relation_fallback_name.clone(),
            output_language: output.language.clone(),
            entity_name_mode: output.entity_name_mode.clone(),
        }
    }

    fn merge_params(&self) -> MergeParams {
        MergeParams {
            ent_threshold: self.ent_threshold,
            rel_threshold: self.rel_threshold,
            entity_name_weight: self.entity_name_weight,
            entity_label_weight: self.entity_label_weight,
            require_same_entity_label: self.require_same_entity_label,
            rename_relationship_by_embedding: self.rename_relationship_by_embedding,
        }
    }
}

/// Builds versionless in-memory graphs; the caller tags them with a version
/// when persisting.
pub struct GraphBuilder {
    parser: Arc<ThrottledParser>,
    params: BuildParams,
}

impl GraphBuilder {
    pub fn new(parser: Arc<ThrottledParser>, params: BuildParams) -> Self {
        Self { parser, params }
    }

    fn extraction_prompt(&self) -> String {
        let naming = if self.params.entity_name_mode == "source" {
            "Keep entity names exactly as written in the fact: no translation, no paraphrasing."
        } else {
            "Normalize entity names to their canonical form."
        };
        format!(
            "You are an entity and relationship extractor for knowledge graph construction.\n\
             Given one atomic fact and its observation_date, extract the entities it mentions\n\
             and the relationships between them.\n\
             - Write entity labels and relationship predicates in {language}.\n\
             - {naming}\n\
             - Use short snake_case predicates.\n\
             - Resolve relative time expressions against observation_date; fill t_start and\n\
               t_end with ISO dates only when the fact states them.\n\
             - Do not add information the fact does not mention.",
            language = self.params.output_language,
        )
    }

    /// Builds a graph from atomic facts, merging into `existing` when given.
    pub async fn build_graph(
        &self,
        atomic_facts: &[String],
        obs_timestamp: &str,
        existing: Option<KnowledgeGraph>,
    ) -> Result<KnowledgeGraph, BuildError> {
        let facts: Vec<&str> = atomic_facts
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .collect();
        if facts.is_empty() {
            return Ok(existing.unwrap_or_default());
        }

        let contexts: Vec<String> = facts
            .iter()
            .map(|fact| format!("observation_date: {obs_timestamp}\n\natomic_fact:\n{fact}"))
            .collect();
        let schema = fact_graph_schema();
        let prompt = self.extraction_prompt();
        let blocks = self
            .parser
            .extract_structured(&schema, &contexts, Some(&prompt))
            .await?;

        // Collect candidate entities (insertion order) and relationships.
        let mut entity_order: Vec<Entity> = Vec::new();
        let mut entity_seen: HashSet<EntityKey> = HashSet::new();
        let mut candidate_rels: Vec<Relationship> = Vec::new();

        let add_entity =
            |order: &mut Vec<Entity>, seen: &mut HashSet<EntityKey>, label: String, name: &str| {
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                let key = EntityKey::new(label.clone(), name);
                if seen.insert(key.clone()) {
                    order.push(Entity::new(label, name));
                }
                Some(key)
            };

        for (fact, value) in facts.iter().zip(blocks) {
            let block: FactGraphBlock = match serde_json::from_value(value) {
                Ok(block) => block,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable extraction block");
                    continue;
                }
            };

            for extracted in block.entities {
                let label = normalize_label(&extracted.label, &self.params.labels);
                add_entity(&mut entity_order, &mut entity_seen, label, &extracted.name);
            }

            for extracted in block.relationships {
                let source_label = normalize_label(&extracted.source_label, &self.params.labels);
                let target_label = normalize_label(&extracted.target_label, &self.params.labels);
                if self.params.labels.drop_unknown
                    && (source_label == self.params.labels.unknown_label
                        || target_label == self.params.labels.unknown_label)
                {
                    debug!(fact, "dropping relationship with unknown-labeled endpoint");
                    continue;
                }
                let source = match add_entity(
                    &mut entity_order,
                    &mut entity_seen,
                    source_label,
                    &extracted.source_name,
                ) {
                    Some(key) => key,
                    None => continue,
                };
                let target = match add_entity(
                    &mut entity_order,
                    &mut entity_seen,
                    target_label,
                    &extracted.target_name,
                ) {
                    Some(key) => key,
                    None => continue,
                };

                let predicate = {
                    let p = extracted.predicate.trim();
                    if p.is_empty() {
                        self.params.relation_fallback_name.clone()
                    } else {
                        p.to_string()
                    }
                };
                let mut rel = Relationship::new(source, target, predicate);
                rel.atomic_facts = vec![fact.to_string()];
                rel.t_obs = vec![obs_timestamp.to_string()];
                if let Some(t) = extracted.t_start.filter(|t| !t.trim().is_empty()) {
                    rel.t_start = vec![t];
                }
                if let Some(t) = extracted.t_end.filter(|t| !t.trim().is_empty()) {
                    rel.t_end = vec![t];
                }
                candidate_rels.push(rel);
            }
        }

        // Embeddings for unique names (new and prior-without-embedding) and,
        // when predicate merging is on, unique predicates.
        let mut names: Vec<String> = entity_order.iter().map(|e| e.name.clone()).collect();
        if let Some(prior) = &existing {
            names.extend(
                prior
                    .entities
                    .iter()
                    .filter(|e| e.embedding.is_none())
                    .map(|e| e.name.clone()),
            );
        }
        let name_embeddings = self.embed_unique(names).await?;

        let predicate_embeddings = if self.params.rename_relationship_by_embedding {
            let mut predicates: Vec<String> =
                candidate_rels.iter().map(|r| r.predicate.clone()).collect();
            if let Some(prior) = &existing {
                predicates.extend(prior.relationships.iter().map(|r| r.predicate.clone()));
            }
            self.embed_unique(predicates).await?
        } else {
            HashMap::new()
        };

        // Merge, prior graph first so it provides the representatives.
        let mut merger = GraphMerger::new(self.params.merge_params());
        if let Some(mut prior) = existing {
            for entity in &mut prior.entities {
                if entity.embedding.is_none() {
                    entity.embedding = name_embeddings.get(&entity.name).cloned();
                }
            }
            merger.seed(prior);
        }

        let mut remap: HashMap<EntityKey, EntityKey> = HashMap::new();
        for mut entity in entity_order {
            let original = entity.key();
            entity.embedding = name_embeddings.get(&entity.name).cloned();
            let merged = merger.merge_entity(entity);
            remap.insert(original, merged);
        }

        for mut rel in candidate_rels {
            if let Some(key) = remap.get(&rel.source) {
                rel.source = key.clone();
            }
            if let Some(key) = remap.get(&rel.target) {
                rel.target = key.clone();
            }
            rel.embedding = predicate_embeddings.get(&rel.predicate).cloned();
            merger.merge_relationship(rel, &predicate_embeddings);
        }

        let kg = merger.finish();
        info!(
            facts = facts.len(),
            entities = kg.entities.len(),
            relationships = kg.relationships.len(),
            "graph constructed"
        );
        Ok(kg)
    }

    /// Embeds deduplicated texts, `max_workers` chunks in flight.
    async fn embed_unique(
        &self,
        texts: Vec<String>,
    ) -> Result<HashMap<String, Vec<f32>>, LlmError> {
        let mut unique: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for text in texts {
            if !text.is_empty() && seen.insert(text.clone()) {
                unique.push(text);
            }
        }
        if unique.is_empty() {
            return Ok(HashMap::new());
        }

        let chunks: Vec<Vec<String>> = unique.chunks(EMBED_CHUNK).map(<[String]>::to_vec).collect();
        let results: Vec<(Vec<String>, Vec<Vec<f32>>)> = stream::iter(chunks.into_iter().map(
            |chunk| async move {
                let vectors = self.parser.embed_many(&chunk).await?;
                Ok::<_, LlmError>((chunk, vectors))
            },
        ))
        .buffered(self.params.max_workers.max(1))
        .try_collect()
        .await?;

        let mut map = HashMap::new();
        for (chunk, vectors) in results {
            for (text, vector) in chunk.into_iter().zip(vectors) {
                map.insert(text, vector);
            }
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use graphloom_core::config::{BatchSettings, RateLimitSettings, RetrySettings};
    use graphloom_core::ports::{ChatModel, EmbeddingModel};
    use graphloom_llm::parser::ParserSettings;
    use serde_json::{json, Value};

    use super::*;

    /// Chat fake keyed on fact substrings found in the prompt.
    struct ScriptedExtractor {
        answers: Vec<(&'static str, Value)>,
    }

    #[async_trait]
    impl ChatModel for ScriptedExtractor {
        async fn extract_structured(
            &self,
            prompt: &str,
            _schema: &Value,
        ) -> Result<Value, LlmError> {
            for (marker, answer) in &self.answers {
                if prompt.contains(marker) {
                    return Ok(answer.clone());
                }
            }
            Ok(json!({"entities": [], "relationships": []}))
        }
    }

    /// Embedding fake: explicit vectors for known texts, a stable axis for
    /// everything else so unrelated texts stay dissimilar.
    struct TableEmbeddings {
        table: HashMap<String, Vec<f32>>,
    }

    impl TableEmbeddings {
        fn new(entries: &[(&str, Vec<f32>)]) -> Self {
            Self {
                table: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            }
        }

        fn axis(text: &str) -> Vec<f32> {
            let mut vector = vec![0.0; 16];
            let index = text.bytes().fold(0usize, |acc, b| {
                acc.wrapping_mul(31).wrapping_add(b as usize)
            }) % 16;
            vector[index] = 1.0;
            vector
        }
    }

    #[async_trait]
    impl EmbeddingModel for TableEmbeddings {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts
                .iter()
                .map(|t| self.table.get(t).cloned().unwrap_or_else(|| Self::axis(t)))
                .collect())
        }
    }

    fn parser(chat: ScriptedExtractor, embeddings: TableEmbeddings) -> Arc<ThrottledParser> {
        Arc::new(ThrottledParser::new(
            Arc::new(chat),
            Arc::new(embeddings),
            ParserSettings {
                llm_rate_limit: RateLimitSettings { rpm: 0, tpm: 0 },
                emb_rate_limit: RateLimitSettings { rpm: 0, tpm: 0 },
                llm_retry: RetrySettings {
                    max_retries: 0,
                    initial_backoff_s: 0.0,
                    max_backoff_s: 0.0,
                    backoff_multiplier: 1.0,
                },
                emb_retry: RetrySettings {
                    max_retries: 0,
                    initial_backoff_s: 0.0,
                    max_backoff_s: 0.0,
                    backoff_multiplier: 1.0,
                },
                llm_max_concurrency: 0,
                emb_max_in_flight: 0,
                batch: BatchSettings {
                    max_elements: 0,
                    max_tokens: 0,
                    sleep_between_batches_s: 0.0,
                    max_pending_requests: 0,
                },
                token_model: "gpt-4".into(),
            },
        ))
    }

    fn params() -> BuildParams {
        BuildParams {
            ent_threshold: 0.8,
            rel_threshold: 0.7,
            entity_name_weight: 0.8,
            entity_label_weight: 0.2,
            max_workers: 4,
            require_same_entity_label: true,
            rename_relationship_by_embedding: true,
            labels: EntityLabelConfig {
                allowlist: None,
                aliases: HashMap::new(),
                unknown_label: "unknown".into(),
                drop_unknown: false,
            },
            relation_fallback_name: "related_to".into(),
            output_language: "en".into(),
            entity_name_mode: "source".into(),
        }
    }

    fn works_at_block(name: &str, predicate: &str) -> Value {
        json!({
            "entities": [
                {"name": name, "label": "Person"},
                {"name": "Acme", "label": "Organization"},
            ],
            "relationships": [{
                "source_name": name, "source_label": "Person",
                "target_name": "Acme", "target_label": "Organization",
                "predicate": predicate,
            }],
        })
    }

    #[tokio::test]
    async fn builds_and_merges_similar_entities_and_predicates() {
        let chat = ScriptedExtractor {
            answers: vec![
                ("Alice Smith works", works_at_block("Alice Smith", "works_at")),
                ("A. Smith is employed", works_at_block("A. Smith", "employed_by")),
            ],
        };
        let embeddings = TableEmbeddings::new(&[
            ("Alice Smith", vec![1.0, 0.0, 0.0]),
            ("A. Smith", vec![0.98, 0.1, 0.0]),
            ("Acme", vec![0.0, 1.0, 0.0]),
            ("works_at", vec![0.0, 0.0, 1.0]),
            ("employed_by", vec![0.05, 0.0, 0.99]),
        ]);
        let builder = GraphBuilder::new(parser(chat, embeddings), params());

        let facts = vec![
            "Alice Smith works at Acme.".to_string(),
            "A. Smith is employed by Acme.".to_string(),
        ];
        let kg = builder
            .build_graph(&facts, "2026-08-01T00:00:00Z", None)
            .await
            .unwrap();

        // Alice Smith and A. Smith collapse; Acme stays.
        assert_eq!(kg.entities.len(), 2);
        assert_eq!(kg.relationships.len(), 1);
        let rel = &kg.relationships[0];
        assert_eq!(rel.predicate, "works_at");
        assert_eq!(rel.atomic_facts.len(), 2);
        assert_eq!(rel.t_obs.len(), 2);
        assert_eq!(rel.source, EntityKey::new("Person", "Alice Smith"));
    }

    #[tokio::test]
    async fn incremental_build_extends_the_prior_graph() {
        let chat = ScriptedExtractor {
            answers: vec![(
                "Bob joined",
                json!({
                    "entities": [{"name": "Bob", "label": "Person"}],
                    "relationships": [{
                        "source_name": "Bob", "source_label": "Person",
                        "target_name": "Acme", "target_label": "Organization",
                        "predicate": "works_at",
                    }],
                }),
            )],
        };
        let embeddings = TableEmbeddings::new(&[]);

        let mut alice = Entity::new("Person", "Alice");
        alice.embedding = Some(vec![1.0, 0.0]);
        let mut acme = Entity::new("Organization", "Acme");
        acme.embedding = Some(vec![0.0, 1.0]);
        let mut prior_rel = Relationship::new(alice.key(), acme.key(), "works_at");
        prior_rel.atomic_facts = vec!["Alice works at Acme.".into()];
        let prior = KnowledgeGraph {
            entities: vec![alice, acme],
            relationships: vec![prior_rel],
        };

        let builder = GraphBuilder::new(parser(chat, embeddings), params());
        let kg = builder
            .build_graph(
                &["Bob joined Acme.".to_string()],
                "2026-08-01T00:00:00Z",
                Some(prior),
            )
            .await
            .unwrap();

        assert_eq!(kg.entities.len(), 3);
        assert_eq!(kg.relationships.len(), 2);
    }

    #[tokio::test]
    async fn label_aliases_and_drop_unknown_apply() {
        let chat = ScriptedExtractor {
            answers: vec![(
                "mystery",
                json!({
                    "entities": [{"name": "Thing", "label": ""}],
                    "relationships": [{
                        "source_name": "Thing", "source_label": "",
                        "target_name": "Acme", "target_label": "Company",
                        "predicate": "",
                    }],
                }),
            )],
        };
        let embeddings = TableEmbeddings::new(&[]);

        let mut p = params();
        p.labels.aliases.insert("Company".into(), "Organization".into());
        p.labels.drop_unknown = true;
        let builder = GraphBuilder::new(parser(chat, embeddings), p);

        let kg = builder
            .build_graph(&["mystery fact".to_string()], "2026-08-01T00:00:00Z", None)
            .await
            .unwrap();

        // The relationship is dropped (unknown endpoint); the unlabeled
        // entity still lands with the unknown label.
        assert!(kg.relationships.is_empty());
        assert_eq!(kg.entities.len(), 1);
        assert_eq!(kg.entities[0].label, "unknown");
    }

    #[tokio::test]
    async fn empty_predicate_uses_the_fallback_name() {
        let chat = ScriptedExtractor {
            answers: vec![(
                "linked",
                json!({
                    "entities": [],
                    "relationships": [{
                        "source_name": "A", "source_label": "Person",
                        "target_name": "B", "target_label": "Person",
                        "predicate": "  ",
                    }],
                }),
            )],
        };
        let builder = GraphBuilder::new(parser(chat, TableEmbeddings::new(&[])), params());
        let kg = builder
            .build_graph(&["linked fact".to_string()], "2026-08-01T00:00:00Z", None)
            .await
            .unwrap();
        assert_eq!(kg.relationships[0].predicate, "related_to");
    }

    #[tokio::test]
    async fn blank_facts_produce_the_prior_or_empty_graph() {
        let builder = GraphBuilder::new(
            parser(ScriptedExtractor { answers: vec![] }, TableEmbeddings::new(&[])),
            params(),
        );
        let kg = builder
            .build_graph(&["   ".to_string()], "2026-08-01T00:00:00Z", None)
            .await
            .unwrap();
        assert!(kg.is_empty());
    }

    #[tokio::test]
    async fn undecodable_blocks_are_skipped() {
        struct BadChat;
        #[async_trait]
        impl ChatModel for BadChat {
            async fn extract_structured(
                &self,
                _prompt: &str,
                _schema: &Value,
            ) -> Result<Value, LlmError> {
                Ok(json!({"entities": "not an array"}))
            }
        }
        let parser = Arc::new(ThrottledParser::new(
            Arc::new(BadChat),
            Arc::new(TableEmbeddings::new(&[])),
            ParserSettings {
                llm_rate_limit: RateLimitSettings { rpm: 0, tpm: 0 },
                emb_rate_limit: RateLimitSettings { rpm: 0, tpm: 0 },
                llm_retry: RetrySettings {
                    max_retries: 0,
                    initial_backoff_s: 0.0,
                    max_backoff_s: 0.0,
                    backoff_multiplier: 1.0,
                },
                emb_retry: RetrySettings {
                    max_retries: 0,
                    initial_backoff_s: 0.0,
                    max_backoff_s: 0.0,
                    backoff_multiplier: 1.0,
                },
                llm_max_concurrency: 0,
                emb_max_in_flight: 0,
                batch: BatchSettings {
                    max_elements: 0,
                    max_tokens: 0,
                    sleep_between_batches_s: 0.0,
                    max_pending_requests: 0,
                },
                token_model: "gpt-4".into(),
            },
        ));
        let builder = GraphBuilder::new(parser, params());
        let kg = builder
            .build_graph(&["anything".to_string()], "2026-08-01T00:00:00Z", None)
            .await
            .unwrap();
        assert!(kg.is_empty());
    }
}
