use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error taxonomy. Component boundaries prefer structured result values
/// (`DispatchResult`, `InjectionOutcome`, `MonitorOutcome`); these variants
/// cover the cases that do propagate as errors.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum CoreError {
    #[error("script execution error: {0}")]
    Script(String),
    #[error("unknown target: {0}")]
    TargetNotFound(String),
    #[error("extraction returned no text from {0}")]
    EmptyExtraction(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("clipboard error: {0}")]
    Clipboard(String),
    #[error("not enough responses to compare ({0})")]
    NotEnoughResponses(usize),
    #[error("other error: {0}")]
    Other(String),
}
