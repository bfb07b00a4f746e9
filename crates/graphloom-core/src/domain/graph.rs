//! Knowledge graph snapshot types
//!
//! A snapshot is a set of entities and relationships that all carry the same
//! version tag in storage. In memory the version is implicit: a
//! [`KnowledgeGraph`] value always describes exactly one snapshot.
//!
//! Relationships refer to their endpoints by [`EntityKey`] rather than by
//! value. De-duplication during graph construction merges entities, and
//! key-based endpoints let the merge rewire relationships without chasing
//! shared ownership.

use serde::{Deserialize, Serialize};

/// Predicate used when a relationship arrives without one.
pub const DEFAULT_PREDICATE: &str = "related_to";

/// Identity of an entity within one snapshot: `(label, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub label: String,
    pub name: String,
}

impl EntityKey {
    pub fn new(label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    /// Formats as the client-facing node id, `{label}:{name}`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.label, self.name)
    }
}

/// A node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub label: String,
    pub name: String,
    /// Name embedding, present once the construction pipeline has run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Entity {
    pub fn new(label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            name: name.into(),
            embedding: None,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.label.clone(), self.name.clone())
    }
}

/// A directed edge between two entities of the same snapshot.
///
/// `atomic_facts` carries the evidentiary sentences the edge was derived
/// from; `t_obs`, `t_start` and `t_end` are parallel lists of observation
/// and validity timestamps accumulated across merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source: EntityKey,
    pub target: EntityKey,
    pub predicate: String,
    #[serde(default)]
    pub atomic_facts: Vec<String>,
    #[serde(default)]
    pub t_obs: Vec<String>,
    #[serde(default)]
    pub t_start: Vec<String>,
    #[serde(default)]
    pub t_end: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Relationship {
    pub fn new(source: EntityKey, target: EntityKey, predicate: impl Into<String>) -> Self {
        let predicate = predicate.into();
        let predicate = if predicate.trim().is_empty() {
            DEFAULT_PREDICATE.to_string()
        } else {
            predicate
        };
        Self {
            source,
            target,
            predicate,
            atomic_facts: Vec::new(),
            t_obs: Vec::new(),
            t_start: Vec::new(),
            t_end: Vec::new(),
            embedding: None,
        }
    }

    /// Identity of the edge within a snapshot: `(source, target, predicate)`.
    pub fn edge_key(&self) -> (EntityKey, EntityKey, String) {
        (
            self.source.clone(),
            self.target.clone(),
            self.predicate.clone(),
        )
    }

    /// Folds another relationship's evidence into this one, skipping facts
    /// already present.
    pub fn absorb(&mut self, other: &Relationship) {
        for (i, fact) in other.atomic_facts.iter().enumerate() {
            if self.atomic_facts.iter().any(|f| f == fact) {
                continue;
            }
            self.atomic_facts.push(fact.clone());
            if let Some(t) = other.t_obs.get(i) {
                self.t_obs.push(t.clone());
            }
            if let Some(t) = other.t_start.get(i) {
                self.t_start.push(t.clone());
            }
            if let Some(t) = other.t_end.get(i) {
                self.t_end.push(t.clone());
            }
        }
    }
}

/// One in-memory snapshot: entities plus relationships between them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }

    /// Drops duplicate entities (same key, first occurrence wins) and drops
    /// relationships whose endpoints are not present.
    ///
    /// Storage enforces the same constraint with a uniqueness index and a
    /// MATCH on both endpoints; running this before a write avoids partial
    /// relationship batches.
    pub fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.entities.retain(|e| seen.insert(e.key()));
        self.relationships
            .retain(|r| seen.contains(&r.source) && seen.contains(&r.target));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(label: &str, name: &str) -> EntityKey {
        EntityKey::new(label, name)
    }

    #[test]
    fn entity_key_display_is_node_id() {
        assert_eq!(key("Person", "Alice").to_string(), "Person:Alice");
        assert_eq!(key("", "Alice").to_string(), ":Alice");
    }

    #[test]
    fn empty_predicate_falls_back() {
        let rel = Relationship::new(key("P", "a"), key("P", "b"), "  ");
        assert_eq!(rel.predicate, DEFAULT_PREDICATE);
        let rel = Relationship::new(key("P", "a"), key("P", "b"), "knows");
        assert_eq!(rel.predicate, "knows");
    }

    #[test]
    fn absorb_unions_facts_and_parallel_times() {
        let mut a = Relationship::new(key("P", "a"), key("P", "b"), "knows");
        a.atomic_facts = vec!["fact one".into()];
        a.t_obs = vec!["2026-01-01".into()];

        let mut b = Relationship::new(key("P", "a"), key("P", "b"), "knows");
        b.atomic_facts = vec!["fact one".into(), "fact two".into()];
        b.t_obs = vec!["2026-01-02".into(), "2026-01-03".into()];
        b.t_start = vec!["2025-01-01".into(), "2025-06-01".into()];

        a.absorb(&b);
        assert_eq!(a.atomic_facts, vec!["fact one", "fact two"]);
        assert_eq!(a.t_obs, vec!["2026-01-01", "2026-01-03"]);
        assert_eq!(a.t_start, vec!["2025-06-01"]);
    }

    #[test]
    fn normalize_deduplicates_and_drops_dangling_edges() {
        let mut kg = KnowledgeGraph::new();
        kg.entities.push(Entity::new("Person", "Alice"));
        kg.entities.push(Entity::new("Person", "Alice"));
        kg.entities.push(Entity::new("Person", "Bob"));
        kg.relationships
            .push(Relationship::new(key("Person", "Alice"), key("Person", "Bob"), "knows"));
        kg.relationships.push(Relationship::new(
            key("Person", "Alice"),
            key("Person", "Carol"),
            "knows",
        ));

        kg.normalize();
        assert_eq!(kg.entities.len(), 2);
        assert_eq!(kg.relationships.len(), 1);
        assert_eq!(kg.relationships[0].target, key("Person", "Bob"));
    }
}
