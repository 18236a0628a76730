//! Registry of callers waiting on a job result.
//!
//! Each submitted job owns one oneshot slot keyed by its [`JobId`]. The
//! collector removes the slot before sending into it, so a result is
//! delivered at most once and an id is free again only after delivery.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::job::JobId;
use crate::verifier::Outcome;

#[derive(Default)]
pub struct PendingJobs {
    waiters: DashMap<JobId, oneshot::Sender<Outcome>>,
}

impl PendingJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait slot under a fresh id that is not currently pending.
    pub fn register(&self) -> (JobId, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        loop {
            let id = JobId::new();
            if let Entry::Vacant(slot) = self.waiters.entry(id) {
                slot.insert(tx);
                return (id, rx);
            }
        }
    }

    /// Deliver an outcome to the caller waiting on `id`.
    ///
    /// Returns `false` when nobody is registered for `id` (unknown, already
    /// delivered, or abandoned). That case is not an error.
    pub fn resolve(&self, id: JobId, outcome: Outcome) -> bool {
        let Some((_, tx)) = self.waiters.remove(&id) else {
            tracing::debug!(job_id = %id, "Discarding result for job with no waiter");
            return false;
        };
        if tx.send(outcome).is_err() {
            tracing::debug!(job_id = %id, "Caller stopped waiting before result arrived");
        }
        true
    }

    /// Drop the registration for a job that never made it onto the queue.
    pub fn abandon(&self, id: JobId) {
        self.waiters.remove(&id);
    }

    /// Drop every registration; waiting callers observe a closed slot.
    ///
    /// Returns how many waits were dropped.
    pub fn clear(&self) -> usize {
        let ids: Vec<JobId> = self.waiters.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.waiters.remove(id).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::{Identity, VerificationError};

    fn identity(email: &str) -> Identity {
        Identity {
            email: email.to_string(),
            audience: "https://rp.example".to_string(),
            issuer: "example.com".to_string(),
            expires: None,
        }
    }

    #[test]
    fn resolve_wakes_registered_waiter() {
        let pending = PendingJobs::new();
        let (id, rx) = pending.register();
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve(id, Ok(identity("a@example.com"))));
        assert!(pending.is_empty());

        let outcome = rx.blocking_recv().unwrap();
        assert_eq!(outcome.unwrap().email, "a@example.com");
    }

    #[test]
    fn second_resolve_is_discarded() {
        let pending = PendingJobs::new();
        let (id, rx) = pending.register();

        assert!(pending.resolve(id, Ok(identity("first@example.com"))));
        assert!(!pending.resolve(
            id,
            Err(VerificationError::Other("late duplicate".to_string()))
        ));

        assert_eq!(rx.blocking_recv().unwrap().unwrap().email, "first@example.com");
    }

    #[test]
    fn unknown_id_is_ignored() {
        let pending = PendingJobs::new();
        assert!(!pending.resolve(JobId::new(), Ok(identity("x@example.com"))));
    }

    #[test]
    fn resolve_after_caller_gave_up_does_not_panic() {
        let pending = PendingJobs::new();
        let (id, rx) = pending.register();
        drop(rx);
        assert!(pending.resolve(id, Ok(identity("gone@example.com"))));
    }

    #[test]
    fn clear_closes_waiting_slots() {
        let pending = PendingJobs::new();
        let (_a, rx_a) = pending.register();
        let (_b, rx_b) = pending.register();

        assert_eq!(pending.clear(), 2);
        assert!(pending.is_empty());
        assert!(rx_a.blocking_recv().is_err());
        assert!(rx_b.blocking_recv().is_err());
    }

    #[test]
    fn abandon_removes_registration() {
        let pending = PendingJobs::new();
        let (id, _rx) = pending.register();
        pending.abandon(id);
        assert!(!pending.resolve(id, Ok(identity("x@example.com"))));
    }
}
