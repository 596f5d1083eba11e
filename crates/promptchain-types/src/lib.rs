//! Shared domain types for promptchain.
//!
//! Workflow definitions, executions and attempts, LLM request/response shapes,
//! lifecycle events, configuration, and the error types shared across crates.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod llm;
pub mod workflow;
