//! Error types for the download bridge.
//!
//! [`SubmissionError`] is returned synchronously from a submit call.
//! [`DownloadError`] is the single tagged error a caller's result sink
//! receives, whether the failure happened at submit time or later.

use crate::transfer::TransferError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid header `{name}`: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("enqueue failed: {0}")]
    Enqueue(#[from] TransferError),
}

/// Failure delivered to a caller's result sink.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadError {
    /// The request never reached the transfer service.
    #[error("{message}")]
    Submission { message: String },

    /// The transfer service reported the transfer as failed.
    #[error("transfer failed with reason {reason}")]
    Transfer { reason: i32 },

    /// The caller's own success handler failed while consuming the result.
    #[error("{message}")]
    Handler { message: String },

    #[error("status query failed: {message}")]
    StatusQuery { message: String },

    #[error("invalid action `{action}`")]
    InvalidAction { action: String },
}

impl DownloadError {
    /// Wire payload for the calling layer: the reason code for transfer
    /// failures, the message string for everything else.
    pub fn payload(&self) -> Value {
        match self {
            Self::Transfer { reason } => Value::from(*reason),
            other => Value::from(other.to_string()),
        }
    }
}

impl From<&SubmissionError> for DownloadError {
    fn from(error: &SubmissionError) -> Self {
        Self::Submission {
            message: error.to_string(),
        }
    }
}
