//! # cidx-server
//!
//! The `cidxd` binary's library half: SQLite-backed registry, per-repo
//! index storage, the background job queue, the Axum REST facade, and
//! the `rmcp` MCP bridge. `cidx-core` owns the transport-agnostic
//! contracts this crate implements against concrete backends.

pub mod access;
pub mod api;
pub mod config;
pub mod db;
pub mod embedding;
pub mod jobs;
pub mod mcp;
pub mod ops;
pub mod query;
pub mod repo;
pub mod store;
