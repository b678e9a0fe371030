//! Threshold-share persistence and the auto-unseal sequence.
//!
//! Shares are persisted one per index, counted contiguously from 1. Auto
//! unseal draws one random permutation of all share indices per call and
//! submits the first threshold-many, skipping gaps, so a stale share at a
//! fixed position cannot wedge every attempt.

use std::path::Path;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use tokio::fs;
use tracing::{info, warn};

use crate::error::{StoreError, UnsealError};
use crate::store::Store;

use super::VaultClient;

pub struct UnsealCoordinator {
    store: Arc<Store>,
    client: VaultClient,
}

impl UnsealCoordinator {
    pub fn new(store: Arc<Store>, client: VaultClient) -> Self {
        Self { store, client }
    }

    /// Persist one share under its 1-based index. Re-submission overwrites.
    pub async fn record_share(&self, index: usize, share: &str) -> Result<(), StoreError> {
        self.store.put_seal_share(index, share).await
    }

    /// First unpopulated share slot, counting from 1.
    pub async fn next_share_index(&self) -> Result<usize, StoreError> {
        let mut index = 1;
        while self.store.seal_share(index).await?.is_some() {
            index += 1;
        }
        Ok(index)
    }

    /// Load newline-delimited shares from `path`, numbering them 1..k in
    /// file order. All-or-nothing: if any share fails to persist, the shares
    /// from this load are dropped and the error returned.
    pub async fn bulk_load(&self, path: &Path) -> Result<usize, UnsealError> {
        let meta = fs::metadata(path).await?;
        if meta.is_dir() {
            return Err(UnsealError::KeyFileIsDir(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path).await?;

        let mut count = 0;
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Err(e) = self.record_share(count + 1, line).await {
                if let Err(drop_err) = self.drop_shares().await {
                    warn!(error = %drop_err, "failed dropping partially loaded shares");
                }
                return Err(e.into());
            }
            count += 1;
        }
        info!(count, "loaded seal-key shares");
        Ok(count)
    }

    /// True iff shares 1..=n are all populated. Shares load contiguously
    /// from index 1, so counting the low slots is sufficient by convention.
    pub async fn have_enough_shares(&self, n: u32) -> bool {
        for index in 1..=n {
            if !matches!(self.store.seal_share(index as usize).await, Ok(Some(_))) {
                return false;
            }
        }
        true
    }

    /// Submit persisted shares until the backend unseals.
    ///
    /// One random permutation of all indices per call; the first
    /// threshold-many are the candidates. Missing shares and per-call vault
    /// errors are logged and skipped; the error return means the backend
    /// still reports sealed after every candidate was tried.
    pub async fn auto_unseal(&self) -> Result<(), UnsealError> {
        let status = self.client.seal_status().await?;
        if !status.sealed {
            return Ok(());
        }
        info!(
            threshold = status.t,
            total = status.n,
            progress = status.progress,
            "backend sealed, starting unseal"
        );

        let mut indices: Vec<u32> = (1..=status.n).collect();
        indices.shuffle(&mut OsRng);

        let mut submitted = 0;
        for &index in indices.iter().take(status.t as usize) {
            let share = match self.store.seal_share(index as usize).await {
                Ok(Some(share)) => share,
                Ok(None) => {
                    warn!(index, "no persisted share at index, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(index, error = %e, "share lookup failed, skipping");
                    continue;
                }
            };
            match self.client.unseal(&share).await {
                Ok(status) => {
                    submitted += 1;
                    if !status.sealed {
                        info!(submitted, "backend unsealed");
                        return Ok(());
                    }
                }
                Err(e) => warn!(index, error = %e, "unseal submission failed"),
            }
        }

        let status = self.client.seal_status().await?;
        if status.sealed {
            Err(UnsealError::StillSealed { submitted })
        } else {
            Ok(())
        }
    }

    /// Delete every persisted share; errors if shares remain detectable.
    pub async fn drop_shares(&self) -> Result<(), UnsealError> {
        self.store.drop_seal_shares().await?;
        if self.have_enough_shares(1).await {
            return Err(UnsealError::SharesNotDropped);
        }
        Ok(())
    }
}
