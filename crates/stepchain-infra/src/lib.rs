//! Infrastructure layer for stepchain.
//!
//! Contains the SQLite implementation of the `TaskRepository` trait defined in
//! `stepchain-core`, the `config.toml` loader, data directory resolution, and
//! `create_workflow`, which wires a step registry to its own database file.

pub mod config;
pub mod filesystem;
pub mod sqlite;
pub mod workflow;
