//! Step-chain engine and repository trait definitions for stepchain.
//!
//! This crate defines the "port" (`TaskRepository`) that the infrastructure
//! layer implements, plus everything that runs on top of it: the step
//! registry, task queue, and worker loop. It depends only on
//! `stepchain-types` -- never on `stepchain-infra` or any database crate.

pub mod repository;
pub mod workflow;
