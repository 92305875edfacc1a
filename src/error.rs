use thiserror::Error;

use crate::scheduler::JobId;

#[derive(Error, Debug)]
pub enum JobdError {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Tag not found: {0}")]
    TagNotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Unable to modify a running job")]
    JobRunning(JobId),

    #[error("Unable to modify a completed job without restart flag")]
    JobFinished(JobId),

    #[error("Server is in readonly mode")]
    ReadOnly,

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Job table is full ({0} jobs)")]
    JobTableFull(usize),

    #[error("Malformed request: {0}")]
    Decode(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Replay of journal record {index} ({verb}) failed: {reason}")]
    Replay {
        index: usize,
        verb: String,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error reply received by a client.
    #[error("{category}: {detail}")]
    Remote { category: String, detail: String },
}

impl JobdError {
    /// Category token sent to clients in the error reply.
    pub fn category(&self) -> &'static str {
        match self {
            JobdError::PermissionDenied => "NOPERM",
            JobdError::JobNotFound(_) => "NOJOB",
            JobdError::QueueNotFound(_) => "NOQUEUE",
            JobdError::ResourceNotFound(_) => "NORES",
            JobdError::TagNotFound(_) => "NOTAG",
            JobdError::InvalidArgument(_)
            | JobdError::JobRunning(_)
            | JobdError::JobFinished(_) => "INVARG",
            JobdError::ReadOnly => "READONLY",
            JobdError::AlreadyExists(_) => "EXISTS",
            JobdError::JobTableFull(_) => "NOSPACE",
            JobdError::Decode(_)
            | JobdError::Journal(_)
            | JobdError::Replay { .. }
            | JobdError::Io(_) => "INTERNAL",
            JobdError::Remote { .. } => "REMOTE",
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        JobdError::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, JobdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_and_finished_map_to_invarg() {
        assert_eq!(JobdError::JobRunning(JobId(1)).category(), "INVARG");
        assert_eq!(JobdError::JobFinished(JobId(1)).category(), "INVARG");
        assert_eq!(JobdError::invalid("bad").category(), "INVARG");
    }

    #[test]
    fn lookup_failures_have_distinct_categories() {
        assert_eq!(JobdError::JobNotFound(JobId(7)).category(), "NOJOB");
        assert_eq!(JobdError::QueueNotFound("q".into()).category(), "NOQUEUE");
        assert_eq!(JobdError::ResourceNotFound("gpu".into()).category(), "NORES");
        assert_eq!(JobdError::TagNotFound("env".into()).category(), "NOTAG");
    }

    #[test]
    fn job_not_found_message_includes_id() {
        assert_eq!(JobdError::JobNotFound(JobId(42)).to_string(), "Job not found: 42");
    }
}
