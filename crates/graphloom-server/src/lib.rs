//! Graphloom Server - the HTTP API surface
//!
//! Routing, bearer authentication, the response envelope and the error
//! taxonomy live in [`api`]; [`resources`] wires configuration into the
//! adapter stack (Neo4j client, stores, hooks, throttled parser, build
//! service). The `graphloomd` binary in `main.rs` loads configuration, runs
//! startup recovery and serves until interrupted.

pub mod api;
pub mod models;
pub mod resources;
