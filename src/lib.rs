//! Change intake: inbound change-request automation with bounded clarification.

pub mod clarification;
pub mod config;
pub mod error;
pub mod guardrail;
pub mod llm;
pub mod matcher;
pub mod pipeline;
pub mod store;
