#![allow(dead_code)]

use std::io::Write;
use tempfile::NamedTempFile;
use tenantcore::domain::account::{AccountId, AccountRecord, InstallationKey};

pub fn account(account_id: i64, app_id: i64, install_id: i64) -> AccountRecord {
    AccountRecord::new(InstallationKey {
        account_id: AccountId(account_id),
        ..InstallationKey::by_installation(app_id, install_id)
    })
}

/// Writes a stage-event CSV with the standard header followed by `rows`.
pub fn events_csv(rows: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    writeln!(file, "account, stage, timestamp").unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
    file.flush().unwrap();
    file
}
