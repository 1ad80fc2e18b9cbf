use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

use crate::retry::GuardError;

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentError {
    #[error("device error: {0}")]
    Device(String),
    #[error("screen capture failed: {0}")]
    Capture(String),
    #[error("{message} (after {attempts} attempts)")]
    RetriesExhausted { attempts: u32, message: String },
    #[error("remote call failed: {0}")]
    FatalRemote(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("config error: {0}")]
    Config(String),
}

impl AgentError {
    /// Terminal outcome of a guarded remote call.
    pub fn from_guard<E: Display>(call: &str, err: GuardError<E>) -> Self {
        match err {
            GuardError::Fatal { error } => Self::FatalRemote(format!("{call}: {error:#}")),
            GuardError::Exhausted { attempts, last } => Self::RetriesExhausted {
                attempts,
                message: format!("{call}: {last:#}"),
            },
        }
    }

    /// Remote-call failures end the task and leave a failure marker.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::FatalRemote(_) | Self::RetriesExhausted { .. })
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("json: {err}"))
    }
}
