//! Error taxonomy shared by the cache, store, ingestion pipeline and server.

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TickHubError>;

#[derive(Debug, Error)]
pub enum TickHubError {
    /// Missing or invalid startup settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid or oversized historical query.
    #[error("range error: {0}")]
    Range(String),

    /// The hourly cache lost a bucket it was supposed to hold. Always a bug.
    #[error("cache invariant violated: {0}")]
    ConcurrencyViolation(String),

    #[error("symbol {0} already has a connected producer")]
    ConnectionConflict(String),

    #[error("symbol {0} has no connected producer")]
    NotConnected(String),

    #[error("symbol {0} is not served by this provider")]
    UnknownSymbol(String),

    #[error("timed out after {attempts} attempts waiting for the {symbol} connection slot")]
    Timeout { symbol: String, attempts: u32 },

    #[error("quotation at {timestamp} lies outside {year}-W{week:02}")]
    CalendarViolation {
        year: i32,
        week: u32,
        timestamp: DateTime<Utc>,
    },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TickHubError {
    /// Errors that leave the process in a state only a restart can repair.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyViolation(_) | Self::Persistence(_) | Self::Sqlite(_) | Self::Io(_)
        )
    }
}

impl From<tokio::task::JoinError> for TickHubError {
    fn from(err: tokio::task::JoinError) -> Self {
        TickHubError::Persistence(format!("blocking task failed: {err}"))
    }
}
