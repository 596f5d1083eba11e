//! Repository trait definitions (ports).
//!
//! `WorkflowRepository` is the storage interface that the infrastructure
//! layer (promptchain-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` ships a mutex-backed implementation
//! for tests and embedding.

pub mod memory;
pub mod workflow;
