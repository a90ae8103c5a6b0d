use std::io;
use thiserror::Error;

use crate::action::Action;

pub type Result<T> = std::result::Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error("unknown action: {0:?}")]
    UnknownAction(String),

    #[error("invalid action set: {0}")]
    InvalidActionSet(String),

    #[error("snapshot action set {stored:?} does not match configured action set {configured:?}")]
    ActionSetMismatch {
        stored: Vec<Action>,
        configured: Vec<Action>,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serde JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Store helpers report through anyhow; the chain is kept as data.
    #[error("snapshot store error: {0:#}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for PolicyError {
    fn from(err: anyhow::Error) -> Self {
        PolicyError::Store(err)
    }
}
