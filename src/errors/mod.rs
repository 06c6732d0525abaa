pub mod io;

use crate::agent::command::CommandError;
use thiserror::Error;

/// The six error kinds a deployment transaction can fail with, plus the
/// underlying process-execution failure they all ultimately bottom out on.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed model: {0}")]
    MalformedModel(String),

    #[error("unknown target: {target}")]
    UnknownTarget { target: String },

    #[error("agent operation '{verb}' failed on target '{target}' with exit code {exit_code}")]
    AgentFailure {
        verb: String,
        target: String,
        exit_code: i32,
    },

    #[error("transfer of {paths:?} to target '{target}' failed")]
    TransferFailure { paths: Vec<String>, target: String },

    #[error("target '{target}' refused to lock")]
    LockConflict { target: String },

    #[error("rollback itself failed after {stage}: system is in an indeterminate state ({causes:?})")]
    PartialRollbackFailure { stage: String, causes: Vec<String> },

    #[error(transparent)]
    Command(#[from] CommandError),
}

impl Error {
    pub fn malformed_model(message: impl Into<String>) -> Error {
        Error::MalformedModel(message.into())
    }

    pub fn unknown_target(target: impl Into<String>) -> Error {
        Error::UnknownTarget { target: target.into() }
    }

    pub fn agent_failure(verb: impl Into<String>, target: impl Into<String>, exit_code: i32) -> Error {
        Error::AgentFailure {
            verb: verb.into(),
            target: target.into(),
            exit_code,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_carry_the_offending_identifiers() {
        let err = Error::unknown_target("web1");
        assert!(err.to_string().contains("web1"));

        let err = Error::agent_failure("activate", "web1", 17);
        assert!(err.to_string().contains("activate"));
        assert!(err.to_string().contains("17"));
    }
}
