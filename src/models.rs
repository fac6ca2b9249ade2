use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TickHubError};

/// A single price quotation for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quotation {
    pub id: i64,
    pub symbol: String,
    pub timestamp_utc: DateTime<Utc>,
    pub ask: f64,
    pub bid: f64,
}

impl Quotation {
    pub fn new(
        id: i64,
        symbol: impl Into<String>,
        timestamp_utc: DateTime<Utc>,
        ask: f64,
        bid: f64,
    ) -> Self {
        Self {
            id,
            symbol: symbol.into(),
            timestamp_utc,
            ask,
            bid,
        }
    }

    pub fn to_record(&self) -> QuotationRecord {
        QuotationRecord {
            id: self.id,
            symbol: self.symbol.clone(),
            datetime_utc: format_timestamp(self.timestamp_utc),
            ask: self.ask,
            bid: self.bid,
        }
    }
}

/// Wire shape of a quotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotationRecord {
    pub id: i64,
    pub symbol: String,
    pub datetime_utc: String,
    pub ask: f64,
    pub bid: f64,
}

/// Inbound request on the `DataProvider` stream. Only the first message of a
/// connection is honoured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DataRequest {
    HistoricalData { start_time: DateTime<Utc> },
    BufferedData,
    LiveData,
    StopData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    NoData,
    ServerError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default)]
    pub quotations: Vec<QuotationRecord>,
}

impl DataResponse {
    pub fn ok(quotations: &[Quotation]) -> Self {
        Self {
            status: ResponseStatus::Ok,
            details: None,
            quotations: quotations.iter().map(Quotation::to_record).collect(),
        }
    }

    pub fn no_data(details: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::NoData,
            details: Some(details.into()),
            quotations: Vec::new(),
        }
    }

    pub fn server_error(details: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::ServerError,
            details: Some(details.into()),
            quotations: Vec::new(),
        }
    }
}

/// `Init` call from a producer process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub id: i64,
    pub symbol: String,
    pub datetime: String,
    pub ask: f64,
    pub bid: f64,
    #[serde(default)]
    pub origin: String,
}

/// `Tick` call from a producer process. The timestamp stays raw until the
/// symbol's consumer task parses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRequest {
    pub id: i64,
    pub symbol: String,
    pub datetime: String,
    pub ask: f64,
    pub bid: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeInitRequest {
    pub reason: i32,
}

const PRODUCER_FORMATS: [&str; 2] = ["%Y.%m.%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse a producer timestamp. Accepts RFC 3339 or the naive
/// `YYYY.MM.DD HH:MM:SS[.fff]` form, which is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    PRODUCER_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| TickHubError::InvalidInput(format!("unparseable timestamp '{raw}'")))
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_formats() {
        let expected: DateTime<Utc> = "2024-01-01T00:00:01Z".parse().unwrap();
        assert_eq!(parse_timestamp("2024-01-01T00:00:01Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2024.01.01 00:00:01").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-01 00:00:01").unwrap(), expected);
        assert_eq!(
            parse_timestamp("2024-01-01T02:00:01+02:00").unwrap(),
            expected
        );
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(TickHubError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_request_wire_shape() {
        let req: DataRequest = serde_json::from_str(
            r#"{"code":"historical_data","start_time":"2024-01-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            DataRequest::HistoricalData {
                start_time: "2024-01-01T10:00:00Z".parse().unwrap()
            }
        );
        let live: DataRequest = serde_json::from_str(r#"{"code":"live_data"}"#).unwrap();
        assert_eq!(live, DataRequest::LiveData);
    }

    #[test]
    fn test_response_records() {
        let q = Quotation::new(
            7,
            "EURUSD",
            "2024-01-01T00:00:00.000001Z".parse().unwrap(),
            1.1002,
            1.1000,
        );
        let resp = DataResponse::ok(&[q]);
        assert_eq!(resp.status, ResponseStatus::Ok);
        assert_eq!(resp.quotations[0].datetime_utc, "2024-01-01T00:00:00.000001Z");

        let json = serde_json::to_value(DataResponse::no_data("empty hour")).unwrap();
        assert_eq!(json["status"], "no_data");
        assert_eq!(json["quotations"].as_array().unwrap().len(), 0);
    }
}
