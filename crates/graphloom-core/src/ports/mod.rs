//! Port definitions (trait seams implemented by adapter crates)

pub mod graph_db;
pub mod hooks;
pub mod language_model;

pub use graph_db::{GraphDatabase, Row, StoreError};
pub use hooks::{HookError, SourceHooks};
pub use language_model::{ChatModel, EmbeddingModel, LlmError};
