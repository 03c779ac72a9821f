use crate::domain::account::AccountId;
use crate::domain::progress::Stage;
use crate::error::{Result, TenantError};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::Read;

/// One stage transition reported by the onboarding pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageEvent {
    pub account: AccountId,
    pub stage: Stage,
    /// RFC 3339; an empty field means "when processed".
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Reads stage events from a CSV source with an `account, stage, timestamp` header.
///
/// Whitespace is trimmed and the timestamp column may be omitted.
pub struct StageEventReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> StageEventReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes events; a malformed row yields an error without ending the stream.
    pub fn events(self) -> impl Iterator<Item = Result<StageEvent>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(TenantError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_reader_valid_stream() {
        let data = "account, stage, timestamp\n\
                    7, fetch_started, 2024-03-01T09:30:00Z\n\
                    7, fetch_completed,\n";
        let events: Vec<Result<StageEvent>> = StageEventReader::new(data.as_bytes()).events().collect();

        assert_eq!(events.len(), 2);
        let first = events[0].as_ref().unwrap();
        assert_eq!(first.account, AccountId(7));
        assert_eq!(first.stage, Stage::FetchStarted);
        assert_eq!(
            first.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap())
        );
        assert_eq!(events[1].as_ref().unwrap().timestamp, None);
    }

    #[test]
    fn test_reader_malformed_line() {
        let data = "account, stage, timestamp\n7, fetching,\n8, fetch_started,";
        let events: Vec<Result<StageEvent>> = StageEventReader::new(data.as_bytes()).events().collect();

        assert!(events[0].is_err());
        assert_eq!(events[1].as_ref().unwrap().account, AccountId(8));
    }
}
