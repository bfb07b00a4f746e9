//! Structured-output schemas for extraction calls
//!
//! Each schema is a plain JSON Schema object handed to the provider's
//! structured-output API, paired with a serde struct the answer deserializes
//! into.

use serde::Deserialize;
use serde_json::{json, Value};

/// Answer shape for atomic-fact extraction from a paragraph.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AtomicFactBlock {
    #[serde(default)]
    pub atomic_fact: Vec<String>,
}

/// Schema for [`AtomicFactBlock`].
pub fn atomic_fact_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "atomic_fact": {
                "type": "array",
                "description": "Self-contained factual sentences derived from the paragraph",
                "items": {"type": "string"},
            },
        },
        "required": ["atomic_fact"],
        "additionalProperties": false,
    })
}

/// One extracted entity mention.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(default)]
    pub label: String,
}

/// One extracted relationship mention. Validity times are optional ISO
/// dates resolved against the observation date.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedRelationship {
    pub source_name: String,
    #[serde(default)]
    pub source_label: String,
    pub target_name: String,
    #[serde(default)]
    pub target_label: String,
    #[serde(default)]
    pub predicate: String,
    #[serde(default)]
    pub t_start: Option<String>,
    #[serde(default)]
    pub t_end: Option<String>,
}

/// Answer shape for entity/relationship extraction from one atomic fact.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FactGraphBlock {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
}

/// Schema for [`FactGraphBlock`].
pub fn fact_graph_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "label": {"type": "string", "description": "Coarse entity category"},
                    },
                    "required": ["name", "label"],
                    "additionalProperties": false,
                },
            },
            "relationships": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "source_name": {"type": "string"},
                        "source_label": {"type": "string"},
                        "target_name": {"type": "string"},
                        "target_label": {"type": "string"},
                        "predicate": {"type": "string"},
                        "t_start": {"type": ["string", "null"], "description": "Validity start, ISO date"},
                        "t_end": {"type": ["string", "null"], "description": "Validity end, ISO date"},
                    },
                    "required": ["source_name", "source_label", "target_name", "target_label", "predicate"],
                    "additionalProperties": false,
                },
            },
        },
        "required": ["entities", "relationships"],
        "additionalProperties": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_fact_block_deserializes_with_defaults() {
        let block: AtomicFactBlock = serde_json::from_value(json!({})).unwrap();
        assert!(block.atomic_fact.is_empty());

        let block: AtomicFactBlock =
            serde_json::from_value(json!({"atomic_fact": ["a", "b"]})).unwrap();
        assert_eq!(block.atomic_fact, vec!["a", "b"]);
    }

    #[test]
    fn fact_graph_block_deserializes_partial_answers() {
        let block: FactGraphBlock = serde_json::from_value(json!({
            "entities": [{"name": "Alice", "label": "Person"}],
            "relationships": [{
                "source_name": "Alice", "source_label": "Person",
                "target_name": "Acme", "target_label": "Organization",
                "predicate": "works_at",
            }],
        }))
        .unwrap();
        assert_eq!(block.entities.len(), 1);
        assert_eq!(block.relationships[0].predicate, "works_at");
        assert!(block.relationships[0].t_start.is_none());
    }

    #[test]
    fn schemas_are_objects_with_required_lists() {
        for schema in [atomic_fact_schema(), fact_graph_schema()] {
            assert_eq!(schema["type"], "object");
            assert!(schema["required"].is_array());
        }
    }
}
