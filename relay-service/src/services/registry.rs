//! In-memory registry of file references issued by this process.
//!
//! When enabled, inference only accepts a `fileUri`/`mimeType` pair that a
//! recent upload produced. Entries expire after a fixed TTL.

use crate::services::ingress::StoredObjectRef;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown file reference: {0}")]
    Unknown(String),

    #[error("File reference expired: {0}")]
    Expired(String),

    #[error("MIME type mismatch for {uri}: uploaded as {expected}, got {actual}")]
    MimeMismatch {
        uri: String,
        expected: String,
        actual: String,
    },
}

#[derive(Debug)]
struct Entry {
    mime_type: String,
    expires_at: Instant,
}

#[derive(Clone, Debug)]
pub struct ReferenceRegistry {
    entries: Arc<DashMap<String, Entry>>,
    ttl: Duration,
}

impl ReferenceRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record a freshly uploaded reference, replacing any previous entry.
    pub fn register(&self, reference: &StoredObjectRef) {
        self.entries.insert(
            reference.uri.clone(),
            Entry {
                mime_type: reference.mime_type.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Check that `uri` was issued here, is still live, and was uploaded as `mime_type`.
    pub fn verify(&self, uri: &str, mime_type: &str) -> Result<(), RegistryError> {
        let expired = {
            let entry = self
                .entries
                .get(uri)
                .ok_or_else(|| RegistryError::Unknown(uri.to_string()))?;

            if entry.expires_at <= Instant::now() {
                true
            } else if entry.mime_type != mime_type {
                return Err(RegistryError::MimeMismatch {
                    uri: uri.to_string(),
                    expected: entry.mime_type.clone(),
                    actual: mime_type.to_string(),
                });
            } else {
                false
            }
        };

        if expired {
            // The read guard is gone; removing while holding it would deadlock the shard.
            self.entries.remove(uri);
            return Err(RegistryError::Expired(uri.to_string()));
        }

        Ok(())
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Purge expired entries every `interval` until `shutdown` fires.
    pub fn spawn_janitor(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = registry.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, remaining = registry.len(), "Purged expired file references");
                        }
                    }
                }
            }
        })
    }
}
