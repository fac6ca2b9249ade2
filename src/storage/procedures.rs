//! Database-side operations on a quarter database.
//!
//! Each function keeps the contract of the stored procedure it is named
//! after: same inputs, same result shape, same return codes. Callers own the
//! connection and any enclosing transaction.

use std::path::Path;

use chrono::{DateTime, Datelike, Timelike, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, warn};

use crate::{
    calendar::{hour_from_number, hour_number, is_valid_table_name, table_name},
    error::{Result, TickHubError},
    models::Quotation,
};

pub const BACKUP_FAILURE: i32 = -1;
pub const BACKUP_NO_ACTION_REQUIRED: i32 = 0;
pub const BACKUP_SUCCESS: i32 = 1;

const QUARTER_SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS contributions (
    hour_number INTEGER PRIMARY KEY,
    datetime_us INTEGER NOT NULL,
    has_contribution INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
) WITHOUT ROWID;

INSERT OR IGNORE INTO metadata (key, value) VALUES ('write_generation', 0);
"#;

/// A row as returned by [`get_quotations_by_week_and_day_and_hour`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredQuotation {
    pub symbol: String,
    pub datetime: DateTime<Utc>,
    pub ask: f64,
    pub bid: f64,
}

/// A row as returned by [`get_ticks_contributions`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContributionRow {
    pub hour: i64,
    pub datetime: DateTime<Utc>,
    pub has_contribution: bool,
}

/// Open (creating if needed) a quarter database and apply its schema.
pub fn open_quarter_database(path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(QUARTER_SCHEMA_SQL)?;
    Ok(conn)
}

/// Open an existing quarter database without creating it.
pub fn open_existing_quarter_database(path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

fn checked_table(name: &str) -> Result<&str> {
    if is_valid_table_name(name) {
        Ok(name)
    } else {
        Err(TickHubError::InvalidInput(format!(
            "'{name}' is not a week table"
        )))
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn ensure_week_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            symbol TEXT NOT NULL,
            datetime_us INTEGER NOT NULL,
            ask REAL NOT NULL,
            bid REAL NOT NULL,
            day_of_week INTEGER NOT NULL,
            hour_of_day INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_day_hour
            ON {table}(day_of_week, hour_of_day, datetime_us);"
    ))?;
    Ok(())
}

/// `InsertQuotations(tableName, quotations) -> rowCount`
pub fn insert_quotations(conn: &Connection, table_name: &str, quotations: &[Quotation]) -> Result<usize> {
    let table = checked_table(table_name)?;
    ensure_week_table(conn, table)?;

    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO {table} (symbol, datetime_us, ask, bid, day_of_week, hour_of_day)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
    ))?;

    let mut rows = 0usize;
    for q in quotations {
        rows += stmt.execute(params![
            &q.symbol,
            q.timestamp_utc.timestamp_micros(),
            q.ask,
            q.bid,
            q.timestamp_utc.weekday().number_from_monday(),
            q.timestamp_utc.hour(),
        ])?;
    }

    conn.execute(
        "UPDATE metadata SET value = value + 1 WHERE key = 'write_generation'",
        [],
    )?;

    debug!(table, rows, "📦 Inserted quotations");
    Ok(rows)
}

/// `GetQuotationsByWeekAndDayAndHour(week, dayOfWeek, hourOfDay)`
///
/// `day_of_week` is ISO numbering (Monday = 1). Rows come back in insertion order.
pub fn get_quotations_by_week_and_day_and_hour(
    conn: &Connection,
    week: u32,
    day_of_week: u32,
    hour_of_day: u32,
) -> Result<Vec<StoredQuotation>> {
    let name = table_name(week);
    let table = checked_table(&name)?;
    if !table_exists(conn, table)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT symbol, datetime_us, ask, bid FROM {table}
         WHERE day_of_week = ?1 AND hour_of_day = ?2
         ORDER BY datetime_us, rowid"
    ))?;

    let rows = stmt.query_map(params![day_of_week, hour_of_day], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (symbol, datetime_us, ask, bid) = row?;
        let datetime = DateTime::from_timestamp_micros(datetime_us).ok_or_else(|| {
            TickHubError::Persistence(format!("corrupt timestamp {datetime_us} in {table}"))
        })?;
        out.push(StoredQuotation {
            symbol,
            datetime,
            ask,
            bid,
        });
    }
    Ok(out)
}

/// `BackupProviderDatabase(drive, folder) -> {-1, 0, 1}`
///
/// Copies the database at `source` into `{drive}/{folder}/{file}.bak` using
/// `VACUUM INTO`. Returns 0 when the existing copy already covers every write.
pub fn backup_provider_database(conn: &Connection, source: &Path, drive: &Path, folder: &str) -> i32 {
    let Some(file_name) = source.file_name() else {
        warn!(source = %source.display(), "Backup source has no file name");
        return BACKUP_FAILURE;
    };

    let target_dir = drive.join(folder);
    if let Err(e) = std::fs::create_dir_all(&target_dir) {
        warn!(dir = %target_dir.display(), "Cannot create backup folder: {}", e);
        return BACKUP_FAILURE;
    }
    let target = target_dir.join(format!("{}.bak", file_name.to_string_lossy()));

    let write_generation = match read_metadata(conn, "write_generation") {
        Ok(v) => v.unwrap_or(0),
        Err(e) => {
            warn!("Cannot read write generation: {}", e);
            return BACKUP_FAILURE;
        }
    };
    let backup_generation = read_metadata(conn, "backup_generation").ok().flatten();

    if target.exists() && backup_generation.is_some_and(|g| g >= write_generation) {
        return BACKUP_NO_ACTION_REQUIRED;
    }

    let staging = target_dir.join(format!("{}.bak.tmp", file_name.to_string_lossy()));
    let _ = std::fs::remove_file(&staging);

    if let Err(e) = conn.execute(
        "VACUUM INTO ?1",
        params![staging.to_string_lossy().to_string()],
    ) {
        warn!(target = %staging.display(), "VACUUM INTO failed: {}", e);
        let _ = std::fs::remove_file(&staging);
        return BACKUP_FAILURE;
    }

    if let Err(e) = std::fs::rename(&staging, &target) {
        warn!(target = %target.display(), "Cannot move backup into place: {}", e);
        return BACKUP_FAILURE;
    }

    if let Err(e) = conn.execute(
        "INSERT INTO metadata (key, value) VALUES ('backup_generation', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![write_generation],
    ) {
        warn!("Backup written but generation not recorded: {}", e);
    }

    BACKUP_SUCCESS
}

fn read_metadata(conn: &Connection, key: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

/// `GetTicksContributions(startDate, endDate)`; both ends inclusive, by hour.
pub fn get_ticks_contributions(
    conn: &Connection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<ContributionRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT hour_number, datetime_us, has_contribution FROM contributions
         WHERE hour_number BETWEEN ?1 AND ?2
         ORDER BY hour_number",
    )?;

    let rows = stmt.query_map(params![hour_number(start), hour_number(end)], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, bool>(2)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (hour, datetime_us, has_contribution) = row?;
        let datetime = DateTime::from_timestamp_micros(datetime_us).ok_or_else(|| {
            TickHubError::Persistence(format!("corrupt contribution hour {hour}"))
        })?;
        out.push(ContributionRow {
            hour,
            datetime,
            has_contribution,
        });
    }
    Ok(out)
}

/// `UpdateTicksContributions(hourNumbers, status)`
pub fn update_ticks_contributions(conn: &Connection, hour_numbers: &[i64], status: bool) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO contributions (hour_number, datetime_us, has_contribution)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(hour_number) DO UPDATE SET has_contribution = excluded.has_contribution",
    )?;

    let mut updated = 0usize;
    for &hour in hour_numbers {
        let datetime = hour_from_number(hour)
            .ok_or_else(|| TickHubError::InvalidInput(format!("hour {hour} out of range")))?;
        updated += stmt.execute(params![hour, datetime.timestamp_micros(), status])?;
    }
    Ok(updated)
}
