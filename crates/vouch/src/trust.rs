//! Cached access to issuers' trust (support) documents.
//!
//! Fetching is delegated to a [`DocumentFetcher`]; this module only owns the
//! caching contract around it. The fetch always runs outside the cache lock.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheConfig, TtlCache};
use crate::verifier::VerificationError;

/// An issuer's published support document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustDocument {
    #[serde(rename = "public-key")]
    pub public_key: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning: Option<String>,
    /// The issuer has switched off support for the protocol.
    #[serde(default)]
    pub disabled: bool,
}

/// Retrieves a trust document for a hostname, typically over the network.
pub trait DocumentFetcher: Send + Sync {
    fn fetch(&self, hostname: &str) -> Result<TrustDocument, VerificationError>;
}

impl<F> DocumentFetcher for F
where
    F: Fn(&str) -> Result<TrustDocument, VerificationError> + Send + Sync,
{
    fn fetch(&self, hostname: &str) -> Result<TrustDocument, VerificationError> {
        self(hostname)
    }
}

/// Trust documents keyed by lowercase hostname, cached for a fixed TTL.
///
/// Build one per process; it owns its cache lock.
pub struct TrustDocuments<F> {
    fetcher: F,
    cache: TtlCache<String, Arc<TrustDocument>>,
    ttl: Duration,
}

impl<F: DocumentFetcher> TrustDocuments<F> {
    pub fn new(fetcher: F, config: &CacheConfig) -> Self {
        Self {
            fetcher,
            cache: TtlCache::from_config(config),
            ttl: config.ttl,
        }
    }

    /// Return the trust document for `hostname`.
    ///
    /// Failed fetches are not cached; the next call tries again.
    pub fn get(&self, hostname: &str) -> Result<Arc<TrustDocument>, VerificationError> {
        let hostname = hostname.trim().to_ascii_lowercase();
        if hostname.is_empty() {
            return Err(VerificationError::Malformed("empty issuer hostname".to_string()));
        }

        if let Some(document) = self.cache.get(hostname.as_str()) {
            tracing::trace!(%hostname, "Trust document cache hit");
            return Self::check_enabled(&hostname, document);
        }

        tracing::debug!(%hostname, "Fetching trust document");
        let document = Arc::new(self.fetcher.fetch(&hostname)?);
        self.cache
            .put(hostname.clone(), Arc::clone(&document), self.ttl);

        Self::check_enabled(&hostname, document)
    }

    /// Drop a cached document, e.g. after a key rotation was detected.
    pub fn invalidate(&self, hostname: &str) {
        self.cache.remove(hostname.trim().to_ascii_lowercase().as_str());
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn check_enabled(
        hostname: &str,
        document: Arc<TrustDocument>,
    ) -> Result<Arc<TrustDocument>, VerificationError> {
        if document.disabled {
            return Err(VerificationError::Trust(format!(
                "{hostname} has disabled its support document"
            )));
        }
        Ok(document)
    }
}
