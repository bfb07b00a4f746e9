//! Graphloom Core - Domain logic and port definitions
//!
//! This crate contains the dependency-free heart of Graphloom:
//! - **Domain entities** - `KgState`, `TaskInfo`, `Entity`, `Relationship`, `KnowledgeGraph`
//! - **Typed configuration** - the full `config.yaml` schema with env indirection
//! - **Port definitions** - Traits implemented by adapter crates: `GraphDatabase`,
//!   `SourceHooks`, `ChatModel`, `EmbeddingModel`
//!
//! # Architecture
//!
//! Graphloom follows the ports & adapters pattern. This crate holds pure data
//! and trait seams; the `graphloom-neo4j`, `graphloom-llm` and
//! `graphloom-hooks` crates provide the adapters, and `graphloom-build`
//! orchestrates them.

pub mod config;
pub mod domain;
pub mod ports;
