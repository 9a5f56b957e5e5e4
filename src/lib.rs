// Inkgate - Gated, versioned-state workflow engine
// Drives human-gated production cycles over frozen materials with a replayable audit log

pub mod audit;
pub mod cli;
pub mod context;
pub mod engine;
pub mod error;
pub mod gate;
pub mod models;
pub mod orchestrator;
pub mod proposal;
pub mod services;
pub mod state;
pub mod store;

pub use context::{ProjectId, RunContext, RunId};
pub use engine::{CycleOutcome, Engine, RunSummary};
pub use error::{EngineError, EngineResult, ErrorCategory, FailedPredicate};

pub use anyhow::{Context, Result};
