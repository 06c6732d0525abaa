//! Serializable projection of [`super::Error`], for reports that cross a
//! process or file boundary (e.g. a machine-readable failure summary written
//! alongside the human-readable log).

use crate::errors::Error;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tag {
    MalformedModel,
    UnknownTarget,
    AgentFailure,
    TransferFailure,
    LockConflict,
    PartialRollbackFailure,
    Command,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub struct ErrorReport {
    tag: Tag,
    message: String,
}

impl From<&Error> for ErrorReport {
    fn from(error: &Error) -> Self {
        let tag = match error {
            Error::MalformedModel(_) => Tag::MalformedModel,
            Error::UnknownTarget { .. } => Tag::UnknownTarget,
            Error::AgentFailure { .. } => Tag::AgentFailure,
            Error::TransferFailure { .. } => Tag::TransferFailure,
            Error::LockConflict { .. } => Tag::LockConflict,
            Error::PartialRollbackFailure { .. } => Tag::PartialRollbackFailure,
            Error::Command(_) => Tag::Command,
        };

        ErrorReport {
            tag,
            message: error.to_string(),
        }
    }
}
