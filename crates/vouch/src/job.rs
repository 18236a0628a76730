//! Jobs flowing through the work queue.

use serde::{Deserialize, Serialize};

use crate::verifier::VerifyRequest;

/// Correlation id for one submitted job.
///
/// UUID v4 so that ids are never confused with worker indices and cannot
/// collide across pools sharing a worker binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub request: VerifyRequest,
}

/// Entry on the work queue.
#[derive(Debug)]
pub enum WorkItem {
    Job(Job),
    /// Sentinel: the worker that pops this exits its loop.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn parse_display_agree() {
        let id = JobId::parse("0d7f3a52-4d8b-4b55-9a0e-1f7c0c6f2a11").unwrap();
        assert_eq!(id.to_string(), "0d7f3a52-4d8b-4b55-9a0e-1f7c0c6f2a11");
        assert!(JobId::parse("not-a-uuid").is_err());
    }
}
