use crate::domain::account::{AccountId, AccountRecord, InstallPair, InstallationKey};
use crate::domain::ports::{AccountStore, ProgressStore, ProgressTx, ProgressTxBox};
use crate::domain::progress::{ProgressRecord, ProgressSchema, Stage};
use crate::error::{Result, TenantError};
use crate::infrastructure::in_memory::{AccountLocks, HeldLocks, apply_stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options, WriteBatch};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Column Family for account records, keyed by account id.
pub const CF_ACCOUNTS: &str = "accounts";
/// Column Family mapping installation pairs to account ids.
pub const CF_INSTALLATIONS: &str = "installations";
/// Column Family for progress rows, keyed by account id.
pub const CF_PROGRESS: &str = "progress";

const STATUS_COLUMN: &str = "current_status";

/// A persistent store implementation using RocksDB.
///
/// Serves both the account lookup port and the progress port. Progress rows are
/// JSON objects whose timestamp fields are named after the schema's columns.
/// Progress transactions lock each account they touch in-process and commit as
/// one `WriteBatch`.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<DB>,
    schema: ProgressSchema,
    locks: AccountLocks,
}

fn account_key(id: AccountId) -> [u8; 8] {
    id.0.to_be_bytes()
}

fn installation_key(pair: InstallPair) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&pair.app_id.0.to_be_bytes());
    key[8..].copy_from_slice(&pair.install_id.0.to_be_bytes());
    key
}

impl RocksDbStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families exist.
    pub fn open<P: AsRef<Path>>(path: P, schema: ProgressSchema) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [CF_ACCOUNTS, CF_INSTALLATIONS, CF_PROGRESS]
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            schema,
            locks: AccountLocks::default(),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| TenantError::storage(format!("{name} column family not found")))
    }

    /// Writes an account record and its installation index entry.
    pub fn put_account(&self, record: &AccountRecord) -> Result<()> {
        record.key.validate()?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_ACCOUNTS)?,
            account_key(record.account_id()),
            serde_json::to_vec(record)?,
        );
        if let Some(pair) = record.key.installation() {
            batch.put_cf(
                self.cf(CF_INSTALLATIONS)?,
                installation_key(pair),
                account_key(record.account_id()),
            );
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn read_account(&self, id: AccountId) -> Result<Option<AccountRecord>> {
        match self.db.get_cf(self.cf(CF_ACCOUNTS)?, account_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_progress(&self, account_id: AccountId) -> Result<ProgressRecord> {
        let bytes = self
            .db
            .get_cf(self.cf(CF_PROGRESS)?, account_key(account_id))?
            .ok_or(TenantError::NotFound)?;
        decode_progress(&self.schema, account_id, &bytes)
    }

    /// Every progress row, ordered by account id.
    pub fn all_progress(&self) -> Result<Vec<ProgressRecord>> {
        let mut rows = Vec::new();
        for item in self
            .db
            .iterator_cf(self.cf(CF_PROGRESS)?, rocksdb::IteratorMode::Start)
        {
            let (key, value) = item?;
            let raw: [u8; 8] = key.as_ref().try_into().map_err(|_| {
                TenantError::storage(format!("malformed progress key of {} bytes", key.len()))
            })?;
            rows.push(decode_progress(
                &self.schema,
                AccountId(i64::from_be_bytes(raw)),
                &value,
            )?);
        }
        rows.sort_by_key(|r| r.account_id);
        Ok(rows)
    }
}

fn encode_progress(schema: &ProgressSchema, record: &ProgressRecord) -> Result<Vec<u8>> {
    let mut row = Map::new();
    row.insert(
        STATUS_COLUMN.to_string(),
        serde_json::to_value(record.current_status)?,
    );
    for (stage, column) in schema.columns() {
        if let Some(ts) = record.entered_at(stage) {
            row.insert(column.to_string(), serde_json::to_value(ts)?);
        }
    }
    Ok(serde_json::to_vec(&row)?)
}

fn decode_progress(
    schema: &ProgressSchema,
    account_id: AccountId,
    bytes: &[u8],
) -> Result<ProgressRecord> {
    let mut row: Map<String, Value> = serde_json::from_slice(bytes)?;
    let status = row
        .remove(STATUS_COLUMN)
        .ok_or_else(|| TenantError::storage(format!("progress row {account_id} has no status")))?;
    let mut record = ProgressRecord::new(account_id, serde_json::from_value(status)?);
    for (column, value) in row {
        // Columns dropped from the schema are ignored.
        if let Some(stage) = schema.stage_for_column(&column) {
            record
                .stage_timestamps
                .insert(stage, serde_json::from_value(value)?);
        }
    }
    Ok(record)
}

#[async_trait]
impl AccountStore for RocksDbStore {
    async fn get_account_by_id(&self, key: &InstallationKey) -> Result<AccountRecord> {
        key.validate()?;
        if let Some(id) = key.account()
            && let Some(record) = self.read_account(id)?
        {
            return Ok(record);
        }
        if let Some(pair) = key.installation()
            && let Some(raw) = self
                .db
                .get_cf(self.cf(CF_INSTALLATIONS)?, installation_key(pair))?
        {
            let raw: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                TenantError::storage(format!("malformed installation index for {key}"))
            })?;
            if let Some(record) = self.read_account(AccountId(i64::from_be_bytes(raw)))? {
                return Ok(record);
            }
        }
        Err(TenantError::NotFound)
    }
}

#[async_trait]
impl ProgressStore for RocksDbStore {
    async fn begin(&self) -> Result<ProgressTxBox> {
        Ok(Box::new(RocksDbProgressTx {
            store: self.clone(),
            locks: HeldLocks::new(self.locks.clone()),
            pending: HashMap::new(),
        }))
    }

    async fn get_progress(&self, account_id: AccountId) -> Result<ProgressRecord> {
        self.read_progress(account_id)
    }
}

struct RocksDbProgressTx {
    store: RocksDbStore,
    locks: HeldLocks,
    pending: HashMap<AccountId, ProgressRecord>,
}

#[async_trait]
impl ProgressTx for RocksDbProgressTx {
    async fn get_progress(&mut self, account_id: AccountId) -> Result<ProgressRecord> {
        self.locks.acquire(account_id).await;
        match self.pending.get(&account_id) {
            Some(record) => Ok(record.clone()),
            None => self.store.read_progress(account_id),
        }
    }

    async fn upsert_progress(
        &mut self,
        account_id: AccountId,
        stage: Stage,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let current = match self.get_progress(account_id).await {
            Ok(record) => Some(record),
            Err(TenantError::NotFound) => None,
            Err(err) => return Err(err),
        };
        let record = apply_stage(&self.store.schema, current, account_id, stage, timestamp);
        self.pending.insert(account_id, record);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let cf = self.store.cf(CF_PROGRESS)?;
        let mut batch = WriteBatch::default();
        for (account_id, record) in &self.pending {
            batch.put_cf(
                cf,
                account_key(*account_id),
                encode_progress(&self.store.schema, record)?,
            );
        }
        self.store.db.write(batch)?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn record(account: i64, app: i64, install: i64) -> AccountRecord {
        AccountRecord::new(InstallationKey {
            account_id: AccountId(account),
            ..InstallationKey::by_installation(app, install)
        })
    }

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDbStore::open(dir.path(), ProgressSchema::current())
            .expect("Failed to open RocksDB");

        assert!(store.db.cf_handle(CF_ACCOUNTS).is_some());
        assert!(store.db.cf_handle(CF_INSTALLATIONS).is_some());
        assert!(store.db.cf_handle(CF_PROGRESS).is_some());
    }

    #[tokio::test]
    async fn test_rocksdb_account_lookup_modes() {
        let dir = tempdir().unwrap();
        let store = RocksDbStore::open(dir.path(), ProgressSchema::current()).unwrap();
        let mut acc = record(42, 1, 2);
        acc.name = "acme".into();
        store.put_account(&acc).unwrap();

        let by_acc = store
            .get_account_by_id(&InstallationKey::by_account(42))
            .await
            .unwrap();
        let by_inst = store
            .get_account_by_id(&InstallationKey::by_installation(1, 2))
            .await
            .unwrap();
        assert_eq!(by_acc, acc);
        assert_eq!(by_inst, acc);

        let missing = store
            .get_account_by_id(&InstallationKey::by_installation(1, 3))
            .await;
        assert!(matches!(missing, Err(TenantError::NotFound)));
    }

    #[tokio::test]
    async fn test_rocksdb_progress_survives_reopen() {
        let dir = tempdir().unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        {
            let store = RocksDbStore::open(dir.path(), ProgressSchema::current()).unwrap();
            let mut tx = store.begin().await.unwrap();
            tx.upsert_progress(AccountId(7), Stage::FetchCompleted, ts)
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }

        let store = RocksDbStore::open(dir.path(), ProgressSchema::current()).unwrap();
        let row = store.get_progress(AccountId(7)).await.unwrap();
        assert_eq!(row.current_status, Stage::FetchCompleted);
        assert_eq!(row.entered_at(Stage::FetchCompleted), Some(ts));
        assert_eq!(store.all_progress().unwrap(), vec![row]);
    }

    #[tokio::test]
    async fn test_rocksdb_rollback_discards_writes() {
        let dir = tempdir().unwrap();
        let store = RocksDbStore::open(dir.path(), ProgressSchema::current()).unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_progress(AccountId(7), Stage::FetchStarted, Utc::now())
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(matches!(
            store.get_progress(AccountId(7)).await,
            Err(TenantError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_rocksdb_transactions_on_other_accounts_do_not_wait() {
        let dir = tempdir().unwrap();
        let store = RocksDbStore::open(dir.path(), ProgressSchema::current()).unwrap();
        let mut held = store.begin().await.unwrap();
        held.upsert_progress(AccountId(1), Stage::FetchStarted, Utc::now())
            .await
            .unwrap();

        let mut other = store.begin().await.unwrap();
        tokio::time::timeout(
            std::time::Duration::from_millis(100),
            other.upsert_progress(AccountId(2), Stage::FetchCompleted, Utc::now()),
        )
        .await
        .expect("different account must not wait")
        .unwrap();
        other.commit().await.unwrap();
        held.commit().await.unwrap();

        assert_eq!(store.all_progress().unwrap().len(), 2);
    }

    #[test]
    fn test_progress_row_uses_schema_columns() {
        let schema = ProgressSchema::new([(Stage::FetchStarted, "fetch_begin")]);
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let mut row = ProgressRecord::new(AccountId(1), Stage::FetchStarted);
        row.stage_timestamps.insert(Stage::FetchStarted, ts);

        let bytes = encode_progress(&schema, &row).unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["current_status"], "fetch_started");
        assert!(json.get("fetch_begin").is_some());

        assert_eq!(decode_progress(&schema, AccountId(1), &bytes).unwrap(), row);
    }
}
