//! Change-request processing pipeline.
//!
//! Every inbound message flows through:
//! 1. `MessageTransport::fetch_new()`: mailbox I/O
//! 2. `Guardrail::check()`: halts oversized batches before anything runs
//! 3. `Classifier::classify()`: help, don't help, or escalate
//! 4. `Extractor::extract()` plus bounded clarification with the sender
//! 5. `Matcher::resolve()` against `CatalogSearch` results
//! 6. `CatalogSearch::update()` and a before/after notification
//!
//! Anything that cannot be completed confidently is escalated to a human.

pub mod compose;
pub mod orchestrator;
pub mod retry;
pub mod runner;
pub mod transitions;
pub mod types;

pub use orchestrator::{Collaborators, CycleReport, Orchestrator};
pub use runner::spawn_engine;
