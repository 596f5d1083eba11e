//! Infrastructure layer for promptchain.
//!
//! Contains implementations of the ports defined in `promptchain-core`:
//! SQLite storage for workflows and executions, the OpenAI-compatible
//! provider client, and the `config.toml` loader.

pub mod config;
pub mod llm;
pub mod sqlite;
