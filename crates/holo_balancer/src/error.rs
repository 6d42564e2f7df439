//! Caller-visible outcomes of scheduler requests.

use crate::types::ShardId;

/// Coarse classification of a [`SchedulerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Never admitted: the scheduler was not running.
    Rejected,
    /// Admitted, then cancelled by `stop()`/`interrupt()`.
    Cancelled,
    /// The namespace lock could not be taken within the bounded attempt.
    LockBusy,
    /// The target shard is unknown to the shard registry.
    TargetNotFound,
    /// The remote call failed before a reply was received.
    Transport,
    /// The remote node replied with an error.
    Remote,
    /// The remote reply could not be interpreted.
    InvalidResponse,
    /// The write-ahead record could not be written.
    Persistence,
}

/// Terminal failure delivered to the caller of a `request_*` operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Request rejected - balancer scheduler is stopped")]
    Stopped,

    #[error("Request cancelled - balancer scheduler is stopping")]
    Cancelled,

    #[error("Failed to acquire dist lock {resource} locally")]
    LockBusy { resource: String },

    #[error("Shard {shard} not found")]
    ShardNotFound { shard: ShardId },

    /// Transport failures are surfaced with the transport's own message.
    #[error("{message}")]
    Transport { message: String },

    #[error("remote command failed: {message}")]
    Remote { code: Option<i32>, message: String },

    #[error("invalid remote response: {message}")]
    InvalidResponse { message: String },

    #[error("failed to persist balancer command: {message}")]
    Persistence { message: String },
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Stopped => ErrorKind::Rejected,
            SchedulerError::Cancelled => ErrorKind::Cancelled,
            SchedulerError::LockBusy { .. } => ErrorKind::LockBusy,
            SchedulerError::ShardNotFound { .. } => ErrorKind::TargetNotFound,
            SchedulerError::Transport { .. } => ErrorKind::Transport,
            SchedulerError::Remote { .. } => ErrorKind::Remote,
            SchedulerError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            SchedulerError::Persistence { .. } => ErrorKind::Persistence,
        }
    }

    pub(crate) fn persistence(err: &anyhow::Error) -> Self {
        SchedulerError::Persistence {
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        SchedulerError::InvalidResponse {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_operator_facing_wording() {
        assert_eq!(
            SchedulerError::Stopped.to_string(),
            "Request rejected - balancer scheduler is stopped"
        );
        assert_eq!(
            SchedulerError::Cancelled.to_string(),
            "Request cancelled - balancer scheduler is stopping"
        );
        assert_eq!(
            SchedulerError::LockBusy {
                resource: "testDb.testColl".into()
            }
            .to_string(),
            "Failed to acquire dist lock testDb.testColl locally"
        );
        assert_eq!(
            SchedulerError::ShardNotFound {
                shard: ShardId::new("nonexistent")
            }
            .to_string(),
            "Shard nonexistent not found"
        );
        assert_eq!(
            SchedulerError::Transport {
                message: "Mock error: network timed out".into()
            }
            .to_string(),
            "Mock error: network timed out"
        );
    }

    #[test]
    fn kinds_separate_lock_failures_from_remote_failures() {
        let lock = SchedulerError::LockBusy {
            resource: "db.c".into(),
        };
        let remote = SchedulerError::Remote {
            code: Some(11600),
            message: "interrupted".into(),
        };
        assert_eq!(lock.kind(), ErrorKind::LockBusy);
        assert_eq!(remote.kind(), ErrorKind::Remote);
        assert_ne!(lock.kind(), remote.kind());
    }
}
