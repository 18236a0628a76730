//! IPC bridge between the pool (parent) and worker subprocesses.
//!
//! - **protocol**: Message types (WorkerRequest/WorkerResponse)
//! - **codec**: JSON framing codec plus blocking readers/writers over pipes

pub mod codec;
pub mod protocol;
