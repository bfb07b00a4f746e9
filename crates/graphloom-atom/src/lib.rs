//! Graphloom Atom - knowledge graph construction from atomic facts
//!
//! Input: a list of atomic facts (single evidentiary sentences) and
//! optionally a prior graph. Output: a merged [`KnowledgeGraph`].
//!
//! The pipeline is: structured extraction of entities and relationships per
//! fact ([`schema`]), embedding of entity names and predicates through the
//! throttled parser, then similarity-driven de-duplication ([`merge`])
//! controlled by the thresholds in the `atom` config section.
//!
//! [`KnowledgeGraph`]: graphloom_core::domain::KnowledgeGraph

pub mod builder;
pub mod merge;
pub mod schema;
pub mod similarity;

pub use builder::{BuildError, BuildParams, GraphBuilder};
