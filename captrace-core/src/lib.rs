//! Core library for the captrace ingestion pipeline.
//!
//! Watches investor folders, discovers PDF/Excel/CSV files, classifies and
//! parses them, extracts structured financial facts with a layered
//! extractor chain, persists everything transactionally, indexes text for
//! semantic retrieval, and reconciles values across documents.
//!
//! The [`pipeline::Engine`] is the assembled system; everything else is a
//! component it wires together. External capabilities (LLM provider, vector
//! index, filesystem) are injected at construction.

pub mod classify;
pub mod error;
pub mod extract;
pub mod fs;
pub mod index;
pub mod ledger;
pub mod llm;
pub mod metrics;
pub mod parse;
pub mod persist;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
pub mod resolve;
pub mod vector;
pub mod watch;

pub use error::{ErrorKind, PipelineError, Result};
pub use pipeline::{Engine, EngineStatus, ProcessResult, ProcessStatus, RescanStats};

// The shared domain model, re-exported for downstream crates.
pub use captrace_model as model;
