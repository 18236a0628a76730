//! vouch: worker pool for identity-assertion verification.

mod logging;
mod pending;
mod version;

pub mod bridge;
pub mod cache;
pub mod collector;
pub mod job;
pub mod pool;
pub mod process;
pub mod trust;
pub mod verifier;
pub mod worker;

pub use cache::{CacheConfig, TtlCache};
pub use job::JobId;
pub use logging::init_tracing;
pub use pool::{PoolConfig, PoolError, SubmitError, VerifierPool};
pub use process::{CommandSpawner, SpawnError, WorkerSpawner};
pub use trust::{DocumentFetcher, TrustDocument, TrustDocuments};
pub use verifier::{Identity, Outcome, VerificationError, Verifier, VerifyRequest};
pub use version::{VERSION, WorkerVersion};
pub use worker::{run_worker, serve_worker};
