use thiserror::Error;

use crate::Blob;

/// A rejected push hands the blob back so the caller can divert or drop it.
#[derive(Error, Debug)]
pub enum PushError {
    #[error("queue at capacity")]
    Full(Blob),
}

impl PushError {
    pub fn into_blob(self) -> Blob {
        match self {
            PushError::Full(blob) => blob,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    #[error("queue empty")]
    Empty,
    #[error("queue cancelled")]
    Cancelled,
}
