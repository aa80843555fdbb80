//! Shared domain types for stepchain.
//!
//! This crate contains the durable task model (`Task`, `HistoryEntry`,
//! `TaskStatus`), step addressing (`StepRef`), engine configuration, and the
//! error types shared by the core and infrastructure layers.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod task;
