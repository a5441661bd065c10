//! Candidate registration under the election root

use crate::candidate::{CandidateId, ElectionRoot};
use crate::config::RetryConfig;
use crate::error::{ElectionError, Result, ServiceError};
use crate::retry::with_retry;
use crate::service::{CoordinationService, CreateMode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Creates the shared election root and registers this process as a candidate
pub struct CandidateRegistrar {
    service: Arc<dyn CoordinationService>,
    prefix: String,
    retry: RetryConfig,
}

impl CandidateRegistrar {
    pub fn new<T: Into<String>>(
        service: Arc<dyn CoordinationService>,
        prefix: T,
        retry: RetryConfig,
    ) -> Self {
        Self {
            service,
            prefix: prefix.into(),
            retry,
        }
    }

    /// Create the root (and any missing ancestors) as persistent nodes.
    ///
    /// A node that already exists, including one created concurrently by
    /// another candidate, counts as success.
    pub async fn ensure_root(&self, root: &ElectionRoot) -> Result<()> {
        for path in root.ancestry() {
            let present = with_retry(&self.retry, "exists", || {
                self.service.exists(&path, None)
            })
            .await
            .map_err(|e| ElectionError::registration(&path, e))?;

            if present.is_some() {
                tracing::debug!("Election path {} already exists", path);
                continue;
            }

            match with_retry(&self.retry, "create_node", || {
                self.service.create_node(&path, CreateMode::Persistent)
            })
            .await
            {
                Ok(_) => tracing::info!("Created election path {}", path),
                Err(ServiceError::NodeExists(_)) => {
                    tracing::debug!("Election path {} was created concurrently", path)
                }
                Err(e) => return Err(ElectionError::registration(&path, e)),
            }
        }

        Ok(())
    }

    /// Register a session-scoped, sequence-numbered candidate entry.
    ///
    /// The root must exist. A connection failure during the create leaves its
    /// outcome unknown, so before creating again the registrar adopts any
    /// entry this session already owns. A session never holds two entries.
    pub async fn register(&self, root: &ElectionRoot) -> Result<CandidateId> {
        let base = root.child_path(&self.prefix);
        let ambiguous = AtomicBool::new(false);

        let created = with_retry(&self.retry, "register", || async {
            if ambiguous.load(Ordering::SeqCst) {
                if let Some(existing) = self.find_own_entry(root).await? {
                    tracing::info!("Adopting entry {} created before connection loss", existing);
                    return Ok(existing);
                }
            }

            self.service
                .create_node(&base, CreateMode::EphemeralSequential)
                .await
                .map_err(|e| {
                    if e.is_transient() {
                        ambiguous.store(true, Ordering::SeqCst);
                    }
                    e
                })
        })
        .await
        .map_err(|e| ElectionError::registration(&base, e))?;

        let candidate = CandidateId::from_path(root, &self.prefix, &created)?;
        tracing::info!(
            session = %self.service.session_id(),
            "Registered candidate {}",
            candidate
        );
        Ok(candidate)
    }

    /// Remove our own entry. An entry that is already gone is not an error.
    pub async fn deregister(&self, candidate: &CandidateId) -> Result<()> {
        match with_retry(&self.retry, "delete", || self.service.delete(candidate.path())).await {
            Ok(()) => {
                tracing::info!("Deregistered candidate {}", candidate);
                Ok(())
            }
            Err(ServiceError::NoNode(_)) => {
                tracing::debug!("Candidate {} was already removed", candidate);
                Ok(())
            }
            Err(e) => Err(ElectionError::shutdown(candidate.path(), e)),
        }
    }

    /// Path of a candidate entry owned by this session, if any
    async fn find_own_entry(&self, root: &ElectionRoot) -> std::result::Result<Option<String>, ServiceError> {
        let session = self.service.session_id();
        let children = self.service.get_children(root.as_str(), None).await?;

        for name in children {
            let Ok(candidate) = CandidateId::from_child(root, &self.prefix, &name) else {
                continue;
            };

            let stat = self.service.exists(candidate.path(), None).await?;
            if stat.and_then(|s| s.ephemeral_owner) == Some(session) {
                return Ok(Some(candidate.path().to_string()));
            }
        }

        Ok(None)
    }
}
