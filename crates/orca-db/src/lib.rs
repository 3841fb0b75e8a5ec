//! Durable storage for Orca's task lifecycle engine.
//!
//! Three tables (`tasks`, `invocations`, `budget_events`) in a single SQLite
//! database, matching the data model owned exclusively by the task store:
//! the scheduler is the sole writer of run-driven status transitions, the
//! tracker sync is the sole writer of tracker-sourced fields, and budget
//! events are append-only.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use models::{Invocation, InvocationStatus, Phase, Task, TaskStatus};
