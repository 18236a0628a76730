//! Result collector: drains the result queue and wakes the matching caller.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::job::JobId;
use crate::pending::PendingJobs;
use crate::verifier::Outcome;

pub type ResultSender = mpsc::UnboundedSender<(JobId, Outcome)>;
pub type ResultReceiver = mpsc::UnboundedReceiver<(JobId, Outcome)>;

/// Run the collector loop on the current thread.
///
/// Returns once every [`ResultSender`] has been dropped and the queue is
/// drained, which happens after the last worker exits.
pub fn run_collector(mut results: ResultReceiver, pending: Arc<PendingJobs>) {
    tracing::debug!("Result collector started");
    let mut delivered: u64 = 0;
    while let Some((job_id, outcome)) = results.blocking_recv() {
        let ok = outcome.is_ok();
        if pending.resolve(job_id, outcome) {
            delivered += 1;
            tracing::trace!(%job_id, ok, "Delivered result");
        }
    }
    tracing::debug!(delivered, "Result collector exiting");
}
