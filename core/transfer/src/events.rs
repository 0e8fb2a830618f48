//! Progress events published by the coordinator.

use skyshard_common::{AccountId, JobId};

/// Lifecycle notifications for transfer jobs.
///
/// `Progress` values are strictly increasing within one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Queued {
        job_id: JobId,
        account_id: AccountId,
        file_name: String,
    },
    Started {
        job_id: JobId,
        attempt: u32,
    },
    Progress {
        job_id: JobId,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    Retrying {
        job_id: JobId,
        retry: u32,
        error: String,
    },
    /// A file did not fit its planned account on the live check.
    Deferred {
        file_name: String,
        account_id: AccountId,
    },
    Completed {
        job_id: JobId,
        remote_id: String,
    },
    Paused {
        job_id: JobId,
    },
    Failed {
        job_id: JobId,
        error: String,
    },
}

impl TransferEvent {
    /// Job the event belongs to, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            TransferEvent::Queued { job_id, .. }
            | TransferEvent::Started { job_id, .. }
            | TransferEvent::Progress { job_id, .. }
            | TransferEvent::Retrying { job_id, .. }
            | TransferEvent::Completed { job_id, .. }
            | TransferEvent::Paused { job_id }
            | TransferEvent::Failed { job_id, .. } => Some(job_id),
            TransferEvent::Deferred { .. } => None,
        }
    }
}
