//! Garbage collection of expired entries.
//!
//! The backend drops leaves on its own when their TTL runs out, but the index
//! keeps listing them. The collector walks every indexed data leaf, checks
//! its metadata record, and deletes leaves whose record is gone or expired.
//!
//! Best effort only: a leaf written while a pass is running can be collected
//! if its metadata hasn't landed yet, and a leaf deleted by another process
//! mid-pass is cleaned up on a later one.

use tracing::{debug, info};

use crate::backend::BlobBackend;
use crate::cache::EntryStore;
use crate::error::Result;
use crate::tree::flatten;

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Data leaves examined.
    pub scanned: usize,
    /// Data leaves deleted.
    pub collected: usize,
}

impl<B: BlobBackend> EntryStore<B> {
    /// Delete every indexed data leaf whose metadata is missing or expired.
    ///
    /// Does nothing when metadata is disabled, since expiry can't be known.
    pub async fn collect_garbage(&self) -> Result<GcReport> {
        let mut report = GcReport::default();
        if !self.config().metadata_enabled {
            debug!("Metadata disabled, skipping garbage collection");
            return Ok(report);
        }

        let global = self.config().global_root.clone();
        let delimiter = self.config().delimiter;
        let known = flatten(&self.list(Some(global.as_str())).await?, delimiter);

        for sub in known.into_keys() {
            let path = format!("{}{}{}", global, delimiter, sub);
            report.scanned += 1;

            let now = self.clock().unix_now();
            let live = self
                .read_meta(&path)
                .await?
                .record()
                .map_or(false, |record| !record.is_expired(now));
            if !live {
                debug!(path = %path, "Collecting expired entry");
                self.delete(&path).await?;
                report.collected += 1;
            }
        }

        info!(
            scanned = report.scanned,
            collected = report.collected,
            "Garbage collection pass complete"
        );
        Ok(report)
    }
}
