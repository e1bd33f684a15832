//! Client half of the epoch gate: what a replica does after a relay closes
//! its connection with an epoch rejection.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tandem_core::{DocumentIdentity, IdentityError, DEFAULT_EPOCH};
use tandem_storage::{EpochLedger, ReplicaCache, StorageError};
use thiserror::Error;
use tracing::{error, info, warn};

pub const MAX_RESET_ATTEMPTS: u32 = 2;
pub const CACHE_DELETE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EpochError {
    #[error(
        "epoch reset for {doc_key} failed {attempts} times; manual intervention required"
    )]
    ResetExhausted { doc_key: String, attempts: u32 },
    #[error("epoch ledger error: {0}")]
    Ledger(#[from] StorageError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("cache reset failed: {0}")]
    CacheReset(String),
    #[error("epoch ledger task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Local cache wiped; reconnect at this identity.
    Resync(DocumentIdentity),
    /// Cache could not be wiped in time; reconnect at this identity and let
    /// the next rejection try again.
    Retry(DocumentIdentity),
    /// Last resort: drop the in-memory replica and restart from `entry`.
    HardReset { entry: DocumentIdentity },
}

impl RecoveryOutcome {
    pub fn next_identity(&self) -> &DocumentIdentity {
        match self {
            RecoveryOutcome::Resync(identity) | RecoveryOutcome::Retry(identity) => identity,
            RecoveryOutcome::HardReset { entry } => entry,
        }
    }
}

/// Process-wide epoch state, passed explicitly to whoever handles rejections.
/// Counters and the dispatch log live in the epoch ledger so they survive
/// restarts.
#[derive(Clone)]
pub struct EpochRecoveryStore {
    ledger: Arc<Mutex<EpochLedger>>,
    cache_path: PathBuf,
    delete_timeout: Duration,
    entry: Option<DocumentIdentity>,
}

impl EpochRecoveryStore {
    pub fn new(ledger: EpochLedger, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(ledger)),
            cache_path: cache_path.into(),
            delete_timeout: CACHE_DELETE_TIMEOUT,
            entry: None,
        }
    }

    pub fn open(ledger_path: &Path, cache_path: impl Into<PathBuf>) -> Result<Self, EpochError> {
        Ok(Self::new(EpochLedger::open(ledger_path)?, cache_path))
    }

    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    /// Known-good document a hard reset falls back to. Without one, a hard
    /// reset restarts the rejected document itself.
    pub fn with_entry(mut self, entry: DocumentIdentity) -> Self {
        self.entry = Some(entry);
        self
    }

    async fn with_ledger<T, F>(&self, f: F) -> Result<T, EpochError>
    where
        T: Send + 'static,
        F: FnOnce(&EpochLedger) -> Result<T, StorageError> + Send + 'static,
    {
        let ledger = self.ledger.clone();
        tokio::task::spawn_blocking(move || {
            let ledger = ledger
                .lock()
                .map_err(|_| EpochError::Task("epoch ledger lock poisoned".to_string()))?;
            f(&ledger).map_err(EpochError::from)
        })
        .await
        .map_err(|err| EpochError::Task(err.to_string()))?
    }

    pub async fn current_epoch(&self) -> Result<u32, EpochError> {
        let stored = self.with_ledger(|ledger| ledger.current_epoch()).await?;
        Ok(stored.unwrap_or(DEFAULT_EPOCH).max(DEFAULT_EPOCH))
    }

    pub async fn reset_attempts(&self, doc_key: &str) -> Result<u32, EpochError> {
        let doc_key = doc_key.to_string();
        self.with_ledger(move |ledger| ledger.reset_attempts(&doc_key))
            .await
    }

    /// Claims a user turn for dispatch. False when it was claimed before,
    /// by this process or an earlier one.
    pub async fn record_dispatch(&self, doc_key: &str, message_id: &str) -> Result<bool, EpochError> {
        let doc_key = doc_key.to_string();
        let message_id = message_id.to_string();
        self.with_ledger(move |ledger| ledger.record_dispatch(&doc_key, &message_id))
            .await
    }

    pub async fn dispatch_count(&self, doc_key: &str) -> Result<u64, EpochError> {
        let doc_key = doc_key.to_string();
        self.with_ledger(move |ledger| ledger.dispatch_count(&doc_key))
            .await
    }

    /// Identity for `namespace:key` at the current epoch.
    pub async fn identity_for(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<DocumentIdentity, EpochError> {
        let epoch = self.current_epoch().await?;
        Ok(DocumentIdentity::build(namespace, key, epoch)?)
    }

    async fn raise_current_epoch(&self, required_epoch: u32) -> Result<u32, EpochError> {
        self.with_ledger(move |ledger| {
            let stored = ledger.current_epoch()?;
            let next = stored
                .unwrap_or(DEFAULT_EPOCH)
                .max(DEFAULT_EPOCH)
                .max(required_epoch);
            if stored != Some(next) {
                ledger.set_current_epoch(next)?;
            }
            Ok(next)
        })
        .await
    }

    /// Wipes every cached epoch of `doc_key`, waiting at most the delete
    /// timeout for other connections to release the cache.
    async fn delete_cache(&self, doc_key: &str) -> Result<usize, String> {
        let path = self.cache_path.clone();
        let timeout = self.delete_timeout;
        let doc_key = doc_key.to_string();
        let task = tokio::task::spawn_blocking(move || {
            let mut cache = ReplicaCache::open_with_busy_timeout(&path, timeout)?;
            cache.delete_document(&doc_key)
        });
        match tokio::time::timeout(timeout + Duration::from_millis(250), task).await {
            Ok(Ok(Ok(removed))) => Ok(removed),
            Ok(Ok(Err(err))) => Err(err.to_string()),
            Ok(Err(err)) => Err(format!("cache task failed: {err}")),
            Err(_) => Err("cache delete timed out".to_string()),
        }
    }

    /// Recovery after an epoch rejection for `identity`.
    pub async fn handle_rejection(
        &self,
        identity: &DocumentIdentity,
        required_epoch: u32,
    ) -> Result<RecoveryOutcome, EpochError> {
        let doc_key = identity.doc_key();
        let previous = self.reset_attempts(&doc_key).await?;
        if previous >= MAX_RESET_ATTEMPTS {
            error!(
                event = "epoch_reset_exhausted",
                doc_key = %doc_key,
                attempts = previous,
                "manual intervention required"
            );
            return Err(EpochError::ResetExhausted {
                doc_key,
                attempts: previous,
            });
        }
        let attempts = {
            let doc_key = doc_key.clone();
            self.with_ledger(move |ledger| ledger.increment_reset_attempts(&doc_key))
                .await?
        };

        let epoch = self.raise_current_epoch(required_epoch).await?;
        let next = identity.with_epoch(epoch)?;
        info!(
            event = "epoch_reset_start",
            doc_key = %doc_key,
            from_epoch = identity.epoch(),
            to_epoch = epoch,
            attempt = attempts
        );

        match self.delete_cache(&doc_key).await {
            Ok(removed) => {
                let key = doc_key.clone();
                self.with_ledger(move |ledger| ledger.clear_reset_attempts(&key))
                    .await?;
                info!(
                    event = "epoch_reset_done",
                    doc_key = %doc_key,
                    epoch = epoch,
                    removed = removed
                );
                Ok(RecoveryOutcome::Resync(next))
            }
            Err(reason) if attempts >= MAX_RESET_ATTEMPTS => {
                let entry = match &self.entry {
                    Some(entry) => entry.with_epoch(epoch)?,
                    None => next,
                };
                warn!(
                    event = "epoch_hard_reset",
                    doc_key = %doc_key,
                    entry = %entry,
                    reason = %reason
                );
                Ok(RecoveryOutcome::HardReset { entry })
            }
            Err(reason) => {
                warn!(
                    event = "epoch_reset_retry",
                    doc_key = %doc_key,
                    attempt = attempts,
                    reason = %reason
                );
                Ok(RecoveryOutcome::Retry(next))
            }
        }
    }

    /// Operator-driven reset: wipe the cache and forget failed attempts.
    pub async fn manual_reset(&self, doc_key: &str) -> Result<usize, EpochError> {
        let removed = self
            .delete_cache(doc_key)
            .await
            .map_err(EpochError::CacheReset)?;
        let key = doc_key.to_string();
        self.with_ledger(move |ledger| ledger.clear_reset_attempts(&key))
            .await?;
        info!(event = "manual_reset", doc_key = %doc_key, removed = removed);
        Ok(removed)
    }
}
