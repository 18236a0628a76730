//! Worker subprocesses: spawning, the ready handshake, and the bridge thread.
//!
//! Each worker process is driven by exactly one bridge thread in the parent.
//! The bridge pops jobs from the shared work queue, forwards them over the
//! child's stdin and pushes the reply read from its stdout onto the result
//! queue. A child that dies takes only its own in-flight job with it.

use std::ffi::OsString;
use std::io;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use crate::bridge::codec::{FrameReader, FrameWriter};
use crate::bridge::protocol::{WorkerRequest, WorkerResponse};
use crate::collector::ResultSender;
use crate::job::{Job, JobId, WorkItem};
use crate::pool::PoolError;
use crate::verifier::{Outcome, VerificationError};
use crate::version::{VERSION, WorkerVersion};
use crate::worker::{SharedWorkQueue, next_work_item};

/// Environment variable carrying the worker's index into the child.
pub const WORKER_INDEX_ENV: &str = "VOUCH_WORKER_INDEX";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// The returned child must have piped stdin and stdout.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, index: usize) -> Result<Child, SpawnError>;
}

/// Spawns a worker binary that calls [`crate::run_worker`].
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, index: usize) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_INDEX_ENV, index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        Ok(child)
    }
}

/// A running worker process that has completed the ready handshake.
pub struct WorkerProcess {
    index: usize,
    child: Child,
    requests: FrameWriter<ChildStdin, WorkerRequest>,
    responses: FrameReader<ChildStdout, WorkerResponse>,
    version: WorkerVersion,
}

impl WorkerProcess {
    /// Spawn worker `index` and block until it reports ready.
    pub fn start(index: usize, spawner: &dyn WorkerSpawner) -> Result<Self, PoolError> {
        tracing::debug!(worker = index, "Spawning worker subprocess");
        let mut child = spawner.spawn(index)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            reap(index, &mut child);
            return Err(PoolError::Handshake(format!(
                "worker {index}: stdin/stdout not captured"
            )));
        };

        let mut responses = FrameReader::new(stdout);
        let version = match wait_for_ready(index, &mut responses) {
            Ok(version) => version,
            Err(e) => {
                reap(index, &mut child);
                return Err(e);
            }
        };

        if !version.matches_parent() {
            tracing::warn!(
                worker = index,
                worker_version = %version.vouch,
                parent_version = VERSION,
                "Worker was built against a different vouch version"
            );
        }
        tracing::info!(worker = index, pid = version.pid, "Worker process ready");

        Ok(Self {
            index,
            child,
            requests: FrameWriter::new(stdin),
            responses,
            version,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn version(&self) -> &WorkerVersion {
        &self.version
    }

    /// Run one job in the worker and wait for its reply.
    ///
    /// A request that cannot be framed fails the job without reaching the
    /// worker. Any error means the worker is gone or no longer speaks the
    /// protocol.
    pub fn call(&mut self, job: Job) -> io::Result<(JobId, Outcome)> {
        let id = job.id;
        if let Err(e) = self.requests.encode(WorkerRequest::from(job)) {
            tracing::debug!(worker = self.index, job_id = %id, error = %e, "Request not sendable");
            return Ok((
                id,
                Err(VerificationError::Malformed(format!("request not sendable: {e}"))),
            ));
        }
        self.requests.write_encoded()?;

        loop {
            let Some(response) = self.responses.read()? else {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("worker exited while running job {id}"),
                ));
            };
            match response {
                WorkerResponse::ShuttingDown => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("worker shut down while running job {id}"),
                    ));
                }
                WorkerResponse::Ready { .. } => {
                    tracing::warn!(worker = self.index, "Unexpected ready from running worker");
                }
                response => {
                    if let Some((got, outcome)) = response.into_outcome() {
                        if got != id {
                            tracing::warn!(worker = self.index, expected = %id, %got, "Reply for a different job");
                        }
                        return Ok((got, outcome));
                    }
                }
            }
        }
    }

    /// Ask the worker to exit and wait for it.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.requests.send(WorkerRequest::Shutdown) {
            tracing::debug!(worker = self.index, error = %e, "Worker already gone at shutdown");
        } else {
            loop {
                match self.responses.read() {
                    Ok(Some(WorkerResponse::ShuttingDown)) | Ok(None) | Err(_) => break,
                    Ok(Some(other)) => {
                        tracing::debug!(worker = self.index, ?other, "Ignoring message during shutdown");
                    }
                }
            }
        }

        match self.child.wait() {
            Ok(status) => tracing::debug!(worker = self.index, %status, "Worker process exited"),
            Err(e) => tracing::warn!(worker = self.index, error = %e, "Failed to wait for worker"),
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            reap(self.index, &mut self.child);
        }
    }
}

fn wait_for_ready(
    index: usize,
    responses: &mut FrameReader<ChildStdout, WorkerResponse>,
) -> Result<WorkerVersion, PoolError> {
    loop {
        match responses.read() {
            Ok(Some(WorkerResponse::Ready { version })) => return Ok(version),
            Ok(Some(WorkerResponse::ShuttingDown)) | Ok(None) => {
                return Err(PoolError::Handshake(format!(
                    "worker {index} exited before reporting ready"
                )));
            }
            Ok(Some(other)) => {
                tracing::warn!(worker = index, ?other, "Unexpected message during handshake");
            }
            Err(e) => {
                return Err(PoolError::Handshake(format!(
                    "worker {index}: control channel error: {e}"
                )));
            }
        }
    }
}

fn reap(index: usize, child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!(worker = index, error = %e, "Kill failed (already exited?)");
    }
    if let Err(e) = child.wait() {
        tracing::debug!(worker = index, error = %e, "Wait after kill failed");
    }
}

/// Feed one worker process from the shared work queue until shutdown.
///
/// Losing the process ends the bridge. The job it was running is not
/// retried; its caller stays blocked until the pool is closed.
pub fn run_process_bridge(mut process: WorkerProcess, work: SharedWorkQueue, results: ResultSender) {
    let index = process.index;
    let pid = process.version.pid;
    tracing::debug!(worker = index, pid, "Bridge started");

    loop {
        match next_work_item(&work) {
            Some(WorkItem::Job(job)) => {
                let job_id = job.id;
                tracing::trace!(worker = index, %job_id, "Forwarding job to worker");
                match process.call(job) {
                    Ok(result) => {
                        if results.send(result).is_err() {
                            tracing::warn!(worker = index, "Result queue closed, exiting");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            worker = index,
                            pid,
                            %job_id,
                            error = %e,
                            "Worker process lost; job will not complete"
                        );
                        return;
                    }
                }
            }
            Some(WorkItem::Shutdown) | None => break,
        }
    }

    process.shutdown();
    tracing::debug!(worker = index, pid, "Bridge exiting");
}
