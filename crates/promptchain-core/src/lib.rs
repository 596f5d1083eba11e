//! Execution engine and repository trait definitions for promptchain.
//!
//! This crate defines the "ports" (`WorkflowRepository`, `LlmProvider`) that
//! the infrastructure layer implements. It depends only on `promptchain-types`
//! -- never on `promptchain-infra` or any database/IO crate.

pub mod event;
pub mod llm;
pub mod repository;
pub mod workflow;

#[cfg(test)]
mod testing;
