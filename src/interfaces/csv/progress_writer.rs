use crate::domain::progress::{ProgressRecord, ProgressSchema};
use crate::error::Result;
use chrono::SecondsFormat;
use std::io::Write;

/// Writes progress rows as CSV, one timestamp column per schema column.
pub struct ProgressWriter<W: Write> {
    writer: csv::Writer<W>,
    schema: ProgressSchema,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(sink: W, schema: ProgressSchema) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
            schema,
        }
    }

    pub fn write_progress<I>(&mut self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = ProgressRecord>,
    {
        let mut header = vec!["account".to_string(), "current_status".to_string()];
        header.extend(self.schema.columns().map(|(_, column)| column.to_string()));
        self.writer.write_record(&header)?;

        for row in rows {
            let mut record = vec![row.account_id.to_string(), row.current_status.to_string()];
            record.extend(self.schema.columns().map(|(stage, _)| {
                row.entered_at(stage)
                    .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_default()
            }));
            self.writer.write_record(&record)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::AccountId;
    use crate::domain::progress::Stage;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_writes_schema_columns() {
        let mut row = ProgressRecord::new(AccountId(7), Stage::FetchCompleted);
        row.stage_timestamps.insert(
            Stage::FetchCompleted,
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
        );

        let mut out = Vec::new();
        ProgressWriter::new(&mut out, ProgressSchema::current())
            .write_progress([row])
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("account,current_status,fetch_started,fetch_completed,consistency_started,consistency_completed")
        );
        assert_eq!(lines.next(), Some("7,fetch_completed,,2024-03-01T09:30:00Z,,"));
    }
}
