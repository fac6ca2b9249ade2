//! Sharded tick persistence
//!
//! One SQLite file per `(year, quarter, provider)`, one `weekNN` table per ISO
//! week inside it.

pub mod procedures;
pub mod tick_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{error::Result, models::Quotation};

pub use procedures::{ContributionRow, StoredQuotation};
pub use tick_store::{BackupOutcome, BackupTally, Contribution, ShardedTickStore};

/// Read side used by the hourly cache.
#[async_trait]
pub trait QuotationSource: Send + Sync {
    /// Every stored quotation whose timestamp falls in the hour starting at `hour_utc`.
    async fn quotations_for_hour(&self, hour_utc: DateTime<Utc>) -> Result<Vec<Quotation>>;
}

/// Write side used by the ingestion pipeline.
#[async_trait]
pub trait QuotationSink: Send + Sync {
    /// Persist a batch, returning the number of rows written.
    async fn save_quotations(&self, batch: Vec<Quotation>) -> Result<usize>;
}
