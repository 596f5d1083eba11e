//! LLM provider abstraction for promptchain.
//!
//! - `LlmProvider`: RPITIT trait the step runner calls once per attempt

pub mod provider;
