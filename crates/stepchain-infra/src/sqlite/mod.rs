//! SQLite storage layer.
//!
//! The task repository backed by SQLite with WAL mode and split read/write
//! connection pools. Each workflow gets its own database file.

pub mod pool;
pub mod task;
