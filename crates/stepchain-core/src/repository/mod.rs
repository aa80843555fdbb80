//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepchain-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` provides an in-process
//! implementation for tests and embedding.

pub mod memory;
pub mod task;
