//! Version information for vouch.

/// Vouch version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version reported by a worker process during the ready handshake.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WorkerVersion {
    /// Vouch library version the worker binary was built against.
    pub vouch: String,
    /// OS process id of the worker.
    pub pid: u32,
}

impl WorkerVersion {
    /// Version info for the current process.
    pub fn current() -> Self {
        Self {
            vouch: VERSION.to_string(),
            pid: std::process::id(),
        }
    }

    pub fn matches_parent(&self) -> bool {
        self.vouch == VERSION
    }
}
