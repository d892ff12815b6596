//! Model errors

use crate::signal::SignalId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Decode error: {0}")]
    Decode(#[from] postcard::Error),
    #[error("Signal already registered under another protocol: {0}")]
    DuplicateSignal(SignalId),
}
