//! Week-sharded quotation store
//!
//! Writes are grouped by ISO week and committed one transaction per week
//! table. A week's batch is validated against its Monday-Sunday window before
//! anything touches disk, so a bad quotation rejects the whole group.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use rusqlite::TransactionBehavior;
use serde::Serialize;
use tracing::{debug, error, info};

use super::{procedures, QuotationSink, QuotationSource};
use crate::{
    alert::{report, OperatorAlert},
    calendar::{hour_number, one_hour, shard_name, truncate_to_hour, WeekKey},
    clock::Clock,
    config::{BackupConfig, DeploymentMode, TickHubConfig},
    error::{Result, TickHubError},
    models::Quotation,
};

/// Widest contributions query, in hours.
const MAX_CONTRIBUTION_HOURS: i64 = 24 * 366;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackupOutcome {
    Success,
    Failure,
    NoActionRequired,
    ActionNotPossible,
}

impl BackupOutcome {
    pub fn from_return_code(code: i32) -> Result<Self> {
        match code {
            procedures::BACKUP_FAILURE => Ok(Self::Failure),
            procedures::BACKUP_NO_ACTION_REQUIRED => Ok(Self::NoActionRequired),
            procedures::BACKUP_SUCCESS => Ok(Self::Success),
            other => Err(TickHubError::Persistence(format!(
                "unexpected backup return code {other}"
            ))),
        }
    }
}

/// Outcome counts over every `(year, quarter)` cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackupTally {
    pub success: usize,
    pub failure: usize,
    pub no_action_required: usize,
    pub action_not_possible: usize,
}

impl BackupTally {
    pub fn record(&mut self, outcome: BackupOutcome) {
        match outcome {
            BackupOutcome::Success => self.success += 1,
            BackupOutcome::Failure => self.failure += 1,
            BackupOutcome::NoActionRequired => self.no_action_required += 1,
            BackupOutcome::ActionNotPossible => self.action_not_possible += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.failure + self.no_action_required + self.action_not_possible
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    pub hour: DateTime<Utc>,
    pub has_contribution: bool,
}

#[derive(Clone)]
pub struct ShardedTickStore {
    data_dir: PathBuf,
    provider: String,
    mode: DeploymentMode,
    start_year: i32,
    backup: BackupConfig,
    clock: Arc<dyn Clock>,
    alert: Arc<dyn OperatorAlert>,
}

impl ShardedTickStore {
    pub fn new(
        config: &TickHubConfig,
        clock: Arc<dyn Clock>,
        alert: Arc<dyn OperatorAlert>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        info!(
            data_dir = %config.data_dir.display(),
            provider = %config.provider,
            "📊 Sharded tick store ready"
        );

        Ok(Self {
            data_dir: config.data_dir.clone(),
            provider: config.provider.clone(),
            mode: config.mode,
            start_year: config.start_year,
            backup: config.backup.clone(),
            clock,
            alert,
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// File backing the quarter database `{year}.{quarter}.{provider}`.
    pub fn quarter_path(&self, year: i32, quarter: u32) -> PathBuf {
        self.data_dir
            .join(format!("{}.db", shard_name(year, quarter, &self.provider)))
    }

    pub fn shard_path(&self, key: WeekKey) -> PathBuf {
        self.quarter_path(key.year, key.quarter())
    }

    fn fail(&self, context: &str, err: TickHubError) -> TickHubError {
        report(self.alert.as_ref(), context, &err);
        err
    }

    /// Persist quotations, one transaction per ISO week. Returns rows written.
    pub async fn save_data(&self, quotations: Vec<Quotation>) -> Result<usize> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save_data_blocking(quotations)).await?
    }

    pub fn save_data_blocking(&self, quotations: Vec<Quotation>) -> Result<usize> {
        if quotations.is_empty() {
            return Ok(0);
        }

        let mut groups: BTreeMap<WeekKey, Vec<Quotation>> = BTreeMap::new();
        for q in quotations {
            groups
                .entry(WeekKey::from_timestamp(q.timestamp_utc))
                .or_default()
                .push(q);
        }

        let mut written = 0usize;
        for (key, group) in groups {
            written += self.save_week(key, group)?;
        }
        Ok(written)
    }

    /// Write one week's quotations in a single transaction named `week:{NN}`.
    pub fn save_week(&self, key: WeekKey, mut group: Vec<Quotation>) -> Result<usize> {
        group.sort_by_key(|q| q.timestamp_utc);

        if let Some(outside) = group.iter().find(|q| !key.contains(q.timestamp_utc)) {
            let err = TickHubError::CalendarViolation {
                year: key.year,
                week: key.week,
                timestamp: outside.timestamp_utc,
            };
            return Err(self.fail("Batch rejected: quotation outside its week shard", err));
        }

        let path = self.shard_path(key);
        let table = key.table_name();
        let hours: Vec<i64> = {
            let mut hours: Vec<i64> = group.iter().map(|q| hour_number(q.timestamp_utc)).collect();
            hours.dedup();
            hours
        };

        let mut conn = procedures::open_quarter_database(&path)
            .map_err(|e| self.fail("Cannot open quarter database", e))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.fail("Cannot begin transaction", e.into()))?;
        let savepoint = format!("week:{:02}", key.week);

        let outcome = (|| -> Result<usize> {
            tx.execute_batch(&format!("SAVEPOINT \"{savepoint}\""))?;
            let rows = procedures::insert_quotations(&tx, &table, &group)?;
            if rows != group.len() {
                return Err(TickHubError::Persistence(format!(
                    "{table}: inserted {rows} rows, expected {}",
                    group.len()
                )));
            }
            procedures::update_ticks_contributions(&tx, &hours, true)?;
            tx.execute_batch(&format!("RELEASE \"{savepoint}\""))?;
            Ok(rows)
        })();

        match outcome {
            Ok(rows) => {
                tx.commit()
                    .map_err(|e| self.fail("Commit failed", e.into()))?;
                debug!(shard = %path.display(), table = %table, rows, "💾 Week batch committed");
                Ok(rows)
            }
            Err(err) => match tx.rollback() {
                Ok(()) => Err(self.fail("Week batch rolled back", err)),
                Err(rollback_err) => {
                    error!(
                        shard = %path.display(),
                        table = %table,
                        "🛑 Rollback failed; shard state is unknown"
                    );
                    Err(self.fail(
                        "Rollback failed",
                        TickHubError::Persistence(format!(
                            "rollback of {savepoint} failed ({rollback_err}) after: {err}"
                        )),
                    ))
                }
            },
        }
    }

    /// Quotations stored for the hour containing `hour_key`, with fresh local ids.
    pub async fn get_data(&self, hour_key: DateTime<Utc>) -> Result<Vec<Quotation>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.get_data_blocking(hour_key)).await?
    }

    pub fn get_data_blocking(&self, hour_key: DateTime<Utc>) -> Result<Vec<Quotation>> {
        let hour = truncate_to_hour(hour_key);
        let key = WeekKey::from_timestamp(hour);
        let path = self.shard_path(key);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let conn = procedures::open_existing_quarter_database(&path)
            .map_err(|e| self.fail("Cannot open quarter database", e))?;
        let rows = procedures::get_quotations_by_week_and_day_and_hour(
            &conn,
            key.week,
            hour.weekday().number_from_monday(),
            hour.hour(),
        )
        .map_err(|e| self.fail("Hourly read failed", e))?;

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| Quotation::new(i as i64 + 1, row.symbol, row.datetime, row.ask, row.bid))
            .collect())
    }

    /// Back up every quarter database from the start year through the current year.
    pub async fn backup(&self) -> Result<BackupTally> {
        let current_year = self.clock.now().year();
        let cells: Vec<(i32, u32)> = (self.start_year..=current_year)
            .flat_map(|year| (1..=4).map(move |quarter| (year, quarter)))
            .collect();

        let mut tally = BackupTally::default();
        if !self.mode.allows_mutation() {
            for _ in &cells {
                tally.record(BackupOutcome::ActionNotPossible);
            }
            info!(mode = ?self.mode, cells = cells.len(), "⏭️ Backup not permitted in this mode");
            return Ok(tally);
        }

        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            for (year, quarter) in cells {
                let outcome = store.backup_quarter(year, quarter)?;
                tally.record(outcome);
            }
            info!(?tally, "🗄️ Backup sweep finished");
            Ok::<_, TickHubError>(tally)
        })
        .await?
    }

    fn backup_quarter(&self, year: i32, quarter: u32) -> Result<BackupOutcome> {
        let path = self.quarter_path(year, quarter);
        if !path.exists() {
            return Ok(BackupOutcome::NoActionRequired);
        }

        let conn = procedures::open_existing_quarter_database(&path)
            .map_err(|e| self.fail("Cannot open quarter database for backup", e))?;
        let code = procedures::backup_provider_database(
            &conn,
            &path,
            &self.backup.drive,
            &self.backup.folder,
        );
        let outcome = BackupOutcome::from_return_code(code)
            .map_err(|e| self.fail("Backup procedure misbehaved", e))?;
        debug!(year, quarter, ?outcome, "Quarter backup");
        Ok(outcome)
    }

    /// Hourly contribution flags for `[start, end]`; hours never written read as false.
    pub async fn get_contributions(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Contribution>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.get_contributions_blocking(start, end)).await?
    }

    pub fn get_contributions_blocking(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Contribution>> {
        if start > end {
            return Err(TickHubError::Range(format!("{start} is after {end}")));
        }
        let first = truncate_to_hour(start);
        let last = truncate_to_hour(end);
        if hour_number(last) - hour_number(first) >= MAX_CONTRIBUTION_HOURS {
            return Err(TickHubError::Range(format!(
                "contribution queries are limited to {MAX_CONTRIBUTION_HOURS} hours"
            )));
        }

        let mut hours = Vec::new();
        let mut quarters: BTreeMap<(i32, u32), (DateTime<Utc>, DateTime<Utc>)> = BTreeMap::new();
        let mut hour = first;
        while hour <= last {
            let key = WeekKey::from_timestamp(hour);
            quarters
                .entry((key.year, key.quarter()))
                .and_modify(|span| span.1 = hour)
                .or_insert((hour, hour));
            hours.push(hour);
            hour += one_hour();
        }

        let mut flagged = BTreeMap::new();
        for ((year, quarter), (from, to)) in quarters {
            let path = self.quarter_path(year, quarter);
            if !path.exists() {
                continue;
            }
            let conn = procedures::open_existing_quarter_database(&path)
                .map_err(|e| self.fail("Cannot open quarter database", e))?;
            for row in procedures::get_ticks_contributions(&conn, from, to)? {
                flagged.insert(row.hour, row.has_contribution);
            }
        }

        Ok(hours
            .into_iter()
            .map(|hour| Contribution {
                hour,
                has_contribution: flagged.get(&hour_number(hour)).copied().unwrap_or(false),
            })
            .collect())
    }
}

#[async_trait]
impl QuotationSource for ShardedTickStore {
    async fn quotations_for_hour(&self, hour_utc: DateTime<Utc>) -> Result<Vec<Quotation>> {
        self.get_data(hour_utc).await
    }
}

#[async_trait]
impl QuotationSink for ShardedTickStore {
    async fn save_quotations(&self, batch: Vec<Quotation>) -> Result<usize> {
        self.save_data(batch).await
    }
}
