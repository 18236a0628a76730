//! Worker loops.
//!
//! Two entry points, both plain functions taking exactly what they need:
//! - [`run_worker_loop`]: an in-process worker thread fed from the shared
//!   work queue.
//! - [`run_worker`] / [`serve_worker`]: the child side of a worker
//!   subprocess, fed over stdin/stdout. The parent side is in process.rs.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::bridge::codec::{FrameReader, FrameWriter};
use crate::bridge::protocol::{WorkerRequest, WorkerResponse};
use crate::collector::ResultSender;
use crate::job::WorkItem;
use crate::verifier::{VerificationError, Verifier};
use crate::version::WorkerVersion;

pub type WorkSender = mpsc::UnboundedSender<WorkItem>;

/// Receiving end of the work queue, shared by every executor.
///
/// Whichever worker holds the lock takes the next item; the others wait on
/// the lock instead of the channel.
pub type SharedWorkQueue = Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>;

pub fn work_queue() -> (WorkSender, SharedWorkQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Arc::new(Mutex::new(rx)))
}

/// Block until the next work item. `None` once every sender is gone.
pub(crate) fn next_work_item(queue: &SharedWorkQueue) -> Option<WorkItem> {
    let mut rx = match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Work queue lock poisoned - recovering");
            poisoned.into_inner()
        }
    };
    rx.blocking_recv()
}

/// Run an in-process worker until it pops a shutdown sentinel.
///
/// A verification error is a result like any other; only the sentinel, a
/// closed work queue, or a closed result queue ends the loop.
pub fn run_worker_loop<V>(
    index: usize,
    verifier: Arc<V>,
    work: SharedWorkQueue,
    results: ResultSender,
) where
    V: Verifier + ?Sized,
{
    tracing::debug!(worker = index, "Worker started");
    let mut handled: u64 = 0;

    loop {
        match next_work_item(&work) {
            Some(WorkItem::Job(job)) => {
                tracing::trace!(worker = index, job_id = %job.id, "Job received");
                let outcome = verifier.verify(&job.request);
                if let Err(ref error) = outcome {
                    tracing::debug!(worker = index, job_id = %job.id, %error, "Verification failed");
                }
                handled += 1;
                if results.send((job.id, outcome)).is_err() {
                    tracing::warn!(worker = index, "Result queue closed, exiting");
                    break;
                }
            }
            Some(WorkItem::Shutdown) => {
                tracing::trace!(worker = index, "Shutdown sentinel received");
                break;
            }
            None => {
                tracing::debug!(worker = index, "Work queue closed");
                break;
            }
        }
    }

    tracing::debug!(worker = index, handled, "Worker exiting");
}

/// Serve verification requests on stdin/stdout until told to shut down.
///
/// Call this from the worker binary's `main`. Nothing else may write to
/// stdout; logs belong on stderr.
pub fn run_worker<V: Verifier>(verifier: V) -> io::Result<()> {
    serve_worker(&verifier, io::stdin().lock(), io::stdout().lock())
}

/// Child-side worker loop over arbitrary pipes.
pub fn serve_worker<V, R, W>(verifier: &V, reader: R, writer: W) -> io::Result<()>
where
    V: Verifier + ?Sized,
    R: Read,
    W: Write,
{
    let mut requests = FrameReader::<R, WorkerRequest>::new(reader);
    let mut responses = FrameWriter::<W, WorkerResponse>::new(writer);

    let version = WorkerVersion::current();
    tracing::info!(pid = version.pid, vouch = %version.vouch, "Worker process ready");
    responses.send(WorkerResponse::Ready { version })?;

    loop {
        match requests.read() {
            Ok(Some(WorkerRequest::Verify { id, request })) => {
                tracing::trace!(job_id = %id, "Verify request received");
                let outcome = verifier.verify(&request);
                if let Err(e) = responses.encode(WorkerResponse::from_outcome(id, outcome)) {
                    tracing::warn!(job_id = %id, error = %e, "Reply not sendable");
                    responses.encode(WorkerResponse::Failed {
                        id,
                        error: VerificationError::Other(format!("reply not sendable: {e}")),
                    })?;
                }
                responses.write_encoded()?;
            }
            Ok(Some(WorkerRequest::Shutdown)) => {
                tracing::info!("Shutdown requested");
                let _ = responses.send(WorkerResponse::ShuttingDown);
                break;
            }
            Ok(None) => {
                tracing::error!("Request pipe closed (parent died?), exiting");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "Request pipe error");
                return Err(e);
            }
        }
    }

    tracing::info!("Worker process exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::MAX_FRAME_BYTES;
    use crate::job::{Job, JobId};
    use crate::verifier::{Identity, Outcome, VerifyRequest};

    fn echo(request: &VerifyRequest) -> Outcome {
        match request.assertion.strip_prefix("fail:") {
            Some(reason) => Err(VerificationError::InvalidSignature(reason.to_string())),
            None => Ok(Identity {
                email: request.assertion.clone(),
                audience: request.audience.clone().unwrap_or_default(),
                issuer: "example.com".to_string(),
                expires: None,
            }),
        }
    }

    fn job(assertion: &str) -> Job {
        Job {
            id: JobId::new(),
            request: VerifyRequest::new(assertion),
        }
    }

    #[test]
    fn thread_worker_survives_failures_and_stops_on_sentinel() {
        let (work_tx, work) = work_queue();
        let (result_tx, mut results) = mpsc::unbounded_channel();

        let ok = job("alice@example.com");
        let bad = job("fail:bad signature");
        let after = job("carol@example.com");
        let ids = [ok.id, bad.id, after.id];

        work_tx.send(WorkItem::Job(ok)).unwrap();
        work_tx.send(WorkItem::Job(bad)).unwrap();
        work_tx.send(WorkItem::Job(after)).unwrap();
        work_tx.send(WorkItem::Shutdown).unwrap();
        work_tx.send(WorkItem::Job(job("never@example.com"))).unwrap();

        let verifier = Arc::new(echo);
        let handle = std::thread::spawn(move || run_worker_loop(0, verifier, work, result_tx));
        handle.join().unwrap();

        let (id, outcome) = results.blocking_recv().unwrap();
        assert_eq!(id, ids[0]);
        assert_eq!(outcome.unwrap().email, "alice@example.com");

        let (id, outcome) = results.blocking_recv().unwrap();
        assert_eq!(id, ids[1]);
        assert_eq!(
            outcome,
            Err(VerificationError::InvalidSignature("bad signature".into()))
        );

        let (id, outcome) = results.blocking_recv().unwrap();
        assert_eq!(id, ids[2]);
        assert!(outcome.is_ok());

        // The job queued behind the sentinel was left alone.
        assert!(results.blocking_recv().is_none());
    }

    #[test]
    fn thread_worker_exits_when_queue_closes() {
        let (work_tx, work) = work_queue();
        let (result_tx, _results) = mpsc::unbounded_channel();
        drop(work_tx);

        let verifier = Arc::new(echo);
        run_worker_loop(3, verifier, work, result_tx);
    }

    #[test]
    fn process_worker_answers_each_request_then_shuts_down() {
        let ok = JobId::new();
        let bad = JobId::new();

        let mut input = FrameWriter::<_, WorkerRequest>::new(Vec::new());
        input
            .send(WorkerRequest::Verify {
                id: ok,
                request: VerifyRequest::new("dave@example.com").with_audience("https://rp"),
            })
            .unwrap();
        input
            .send(WorkerRequest::Verify {
                id: bad,
                request: VerifyRequest::new("fail:expired cert"),
            })
            .unwrap();
        input.send(WorkerRequest::Shutdown).unwrap();
        let input = input.into_inner();

        let mut output = Vec::new();
        serve_worker(&echo, input.as_slice(), &mut output).unwrap();

        let mut responses = FrameReader::<_, WorkerResponse>::new(output.as_slice());
        match responses.read().unwrap() {
            Some(WorkerResponse::Ready { version }) => assert!(version.matches_parent()),
            other => panic!("expected ready, got {other:?}"),
        }
        match responses.read().unwrap() {
            Some(WorkerResponse::Verified { id, identity }) => {
                assert_eq!(id, ok);
                assert_eq!(identity.email, "dave@example.com");
                assert_eq!(identity.audience, "https://rp");
            }
            other => panic!("expected verified, got {other:?}"),
        }
        match responses.read().unwrap() {
            Some(WorkerResponse::Failed { id, error }) => {
                assert_eq!(id, bad);
                assert_eq!(
                    error,
                    VerificationError::InvalidSignature("expired cert".into())
                );
            }
            other => panic!("expected failed, got {other:?}"),
        }
        assert!(matches!(
            responses.read().unwrap(),
            Some(WorkerResponse::ShuttingDown)
        ));
        assert!(responses.read().unwrap().is_none());
    }

    #[test]
    fn process_worker_fails_oversized_reply_and_keeps_serving() {
        fn bloated(request: &VerifyRequest) -> Outcome {
            let mut identity = echo(request)?;
            if identity.email == "big@example.com" {
                identity.issuer = "x".repeat(MAX_FRAME_BYTES);
            }
            Ok(identity)
        }

        let big = JobId::new();
        let small = JobId::new();
        let mut input = FrameWriter::<_, WorkerRequest>::new(Vec::new());
        input
            .send(WorkerRequest::Verify {
                id: big,
                request: VerifyRequest::new("big@example.com"),
            })
            .unwrap();
        input
            .send(WorkerRequest::Verify {
                id: small,
                request: VerifyRequest::new("small@example.com"),
            })
            .unwrap();
        let input = input.into_inner();

        let mut output = Vec::new();
        serve_worker(&bloated, input.as_slice(), &mut output).unwrap();

        let mut responses = FrameReader::<_, WorkerResponse>::new(output.as_slice());
        assert!(matches!(
            responses.read().unwrap(),
            Some(WorkerResponse::Ready { .. })
        ));
        match responses.read().unwrap() {
            Some(WorkerResponse::Failed { id, error }) => {
                assert_eq!(id, big);
                assert!(matches!(error, VerificationError::Other(_)));
            }
            other => panic!("expected failed, got {other:?}"),
        }
        match responses.read().unwrap() {
            Some(WorkerResponse::Verified { id, identity }) => {
                assert_eq!(id, small);
                assert_eq!(identity.email, "small@example.com");
            }
            other => panic!("expected verified, got {other:?}"),
        }
    }

    #[test]
    fn process_worker_exits_quietly_when_parent_goes_away() {
        let mut output = Vec::new();
        serve_worker(&echo, io::empty(), &mut output).unwrap();

        let mut responses = FrameReader::<_, WorkerResponse>::new(output.as_slice());
        assert!(matches!(
            responses.read().unwrap(),
            Some(WorkerResponse::Ready { .. })
        ));
        assert!(responses.read().unwrap().is_none());
    }
}
