//! Wire protocol types for parent-worker communication.
//!
//! A single pipe pair per worker process: the parent writes requests to the
//! child's stdin and reads responses from its stdout. The worker handles one
//! job at a time, so every `verify` is answered before the next is sent.

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};
use crate::verifier::{Identity, Outcome, VerificationError, VerifyRequest};
use crate::version::WorkerVersion;

/// Messages from parent to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Verify { id: JobId, request: VerifyRequest },

    Shutdown,
}

impl From<Job> for WorkerRequest {
    fn from(job: Job) -> Self {
        Self::Verify {
            id: job.id,
            request: job.request,
        }
    }
}

/// Messages from worker to parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// First message after start; the worker accepts jobs from here on.
    Ready {
        #[serde(flatten)]
        version: WorkerVersion,
    },

    Verified { id: JobId, identity: Identity },

    Failed { id: JobId, error: VerificationError },

    ShuttingDown,
}

impl WorkerResponse {
    pub fn from_outcome(id: JobId, outcome: Outcome) -> Self {
        match outcome {
            Ok(identity) => Self::Verified { id, identity },
            Err(error) => Self::Failed { id, error },
        }
    }

    /// The job result carried by this message, if any.
    pub fn into_outcome(self) -> Option<(JobId, Outcome)> {
        match self {
            Self::Verified { id, identity } => Some((id, Ok(identity))),
            Self::Failed { id, error } => Some((id, Err(error))),
            Self::Ready { .. } | Self::ShuttingDown => None,
        }
    }
}
