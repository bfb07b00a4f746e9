//! Domain entities for the versioned knowledge graph
//!
//! Everything in this module is plain data: no I/O, no clocks, no providers.

pub mod errors;
pub mod graph;
pub mod state;

pub use errors::DomainError;
pub use graph::{Entity, EntityKey, KnowledgeGraph, Relationship};
pub use state::{KgState, KgStatus, TaskInfo, TaskType};
