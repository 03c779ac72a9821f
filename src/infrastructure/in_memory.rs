use crate::domain::account::{AccountId, AccountRecord, InstallPair, InstallationKey};
use crate::domain::ports::{AccountStore, ProgressStore, ProgressTx, ProgressTxBox};
use crate::domain::progress::{ProgressRecord, ProgressSchema, Stage};
use crate::error::{Result, TenantError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Failures queued by tests and handed out one per call.
#[derive(Default, Clone)]
struct FailureQueue(Arc<std::sync::Mutex<VecDeque<String>>>);

impl FailureQueue {
    fn push(&self, message: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message.to_string());
    }

    fn check(&self) -> Result<()> {
        match self.0.lock().unwrap_or_else(PoisonError::into_inner).pop_front() {
            Some(message) => Err(TenantError::storage(message)),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct AccountTables {
    accounts: HashMap<AccountId, AccountRecord>,
    installations: HashMap<InstallPair, AccountId>,
}

/// A thread-safe in-memory account database.
///
/// Looks records up by account id first, then by installation pair. Counts every
/// lookup so callers can verify how often the database was consulted.
#[derive(Default, Clone)]
pub struct InMemoryAccountStore {
    tables: Arc<RwLock<AccountTables>>,
    calls: Arc<AtomicUsize>,
    failures: FailureQueue,
    latency: Arc<std::sync::Mutex<Option<Duration>>>,
}

impl InMemoryAccountStore {
    /// Creates a new, empty in-memory account store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record, indexing it by both of its keys.
    pub async fn insert(&self, record: AccountRecord) {
        let mut tables = self.tables.write().await;
        if let Some(pair) = record.key.installation() {
            tables.installations.insert(pair, record.account_id());
        }
        tables.accounts.insert(record.account_id(), record);
    }

    pub async fn remove(&self, account_id: AccountId) -> Option<AccountRecord> {
        let mut tables = self.tables.write().await;
        let record = tables.accounts.remove(&account_id)?;
        if let Some(pair) = record.key.installation() {
            tables.installations.remove(&pair);
        }
        Some(record)
    }

    /// Number of `get_account_by_id` calls served so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes the next lookup fail with a storage error.
    pub fn fail_next(&self, message: &str) {
        self.failures.push(message);
    }

    /// Delays every subsequent lookup.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_account_by_id(&self, key: &InstallationKey) -> Result<AccountRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.failures.check()?;
        key.validate()?;

        let tables = self.tables.read().await;
        let by_account = key.account().and_then(|id| tables.accounts.get(&id));
        let found = by_account.or_else(|| {
            key.installation()
                .and_then(|pair| tables.installations.get(&pair))
                .and_then(|id| tables.accounts.get(id))
        });
        found.cloned().ok_or(TenantError::NotFound)
    }
}

/// Applies one stage transition to a row according to `schema`.
pub(crate) fn apply_stage(
    schema: &ProgressSchema,
    current: Option<ProgressRecord>,
    account_id: AccountId,
    stage: Stage,
    timestamp: DateTime<Utc>,
) -> ProgressRecord {
    let mut record = current.unwrap_or_else(|| ProgressRecord::new(account_id, stage));
    record.current_status = stage;
    if schema.column(stage).is_some() {
        record.stage_timestamps.insert(stage, timestamp);
    }
    record
}

/// Per-account row locks shared by every transaction of one store.
#[derive(Default, Clone)]
pub(crate) struct AccountLocks(Arc<std::sync::Mutex<HashMap<AccountId, Arc<Mutex<()>>>>>);

impl AccountLocks {
    async fn lock(&self, account_id: AccountId) -> OwnedMutexGuard<()> {
        let row = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(account_id)
            .or_default()
            .clone();
        row.lock_owned().await
    }
}

/// Row locks taken by one transaction, released when it ends.
///
/// An account is locked on first touch, so transactions on different accounts
/// never wait for each other.
pub(crate) struct HeldLocks {
    locks: AccountLocks,
    held: HashMap<AccountId, OwnedMutexGuard<()>>,
}

impl HeldLocks {
    pub(crate) fn new(locks: AccountLocks) -> Self {
        Self {
            locks,
            held: HashMap::new(),
        }
    }

    pub(crate) async fn acquire(&mut self, account_id: AccountId) {
        if !self.held.contains_key(&account_id) {
            let guard = self.locks.lock(account_id).await;
            self.held.insert(account_id, guard);
        }
    }
}

/// A thread-safe in-memory progress table with per-account serialisable transactions.
///
/// A transaction locks each account it reads or writes; its writes are buffered
/// and applied on commit, or discarded on rollback or drop.
#[derive(Clone)]
pub struct InMemoryProgressStore {
    rows: Arc<RwLock<HashMap<AccountId, ProgressRecord>>>,
    locks: AccountLocks,
    schema: ProgressSchema,
    mutations: Arc<AtomicUsize>,
    read_failures: FailureQueue,
    upsert_failures: FailureQueue,
    begin_latency: Arc<std::sync::Mutex<Option<Duration>>>,
}

impl InMemoryProgressStore {
    /// Creates an empty store using the current schema revision.
    pub fn new() -> Self {
        Self::with_schema(ProgressSchema::current())
    }

    pub fn with_schema(schema: ProgressSchema) -> Self {
        Self {
            rows: Arc::default(),
            locks: AccountLocks::default(),
            schema,
            mutations: Arc::default(),
            read_failures: FailureQueue::default(),
            upsert_failures: FailureQueue::default(),
            begin_latency: Arc::default(),
        }
    }

    /// Number of row writes committed so far.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Makes the next transactional `get_progress` fail with a storage error.
    pub fn fail_next_read(&self, message: &str) {
        self.read_failures.push(message);
    }

    /// Makes the next `upsert_progress` fail with a storage error.
    pub fn fail_next_upsert(&self, message: &str) {
        self.upsert_failures.push(message);
    }

    /// Delays every subsequent `begin`.
    pub fn set_begin_latency(&self, latency: Duration) {
        *self.begin_latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
    }

    pub async fn all_progress(&self) -> Vec<ProgressRecord> {
        let mut rows: Vec<_> = self.rows.read().await.values().cloned().collect();
        rows.sort_by_key(|r| r.account_id);
        rows
    }
}

impl Default for InMemoryProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn begin(&self) -> Result<ProgressTxBox> {
        let latency = *self.begin_latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(Box::new(InMemoryProgressTx {
            store: self.clone(),
            locks: HeldLocks::new(self.locks.clone()),
            pending: HashMap::new(),
        }))
    }

    async fn get_progress(&self, account_id: AccountId) -> Result<ProgressRecord> {
        let rows = self.rows.read().await;
        rows.get(&account_id).cloned().ok_or(TenantError::NotFound)
    }
}

struct InMemoryProgressTx {
    store: InMemoryProgressStore,
    locks: HeldLocks,
    pending: HashMap<AccountId, ProgressRecord>,
}

#[async_trait]
impl ProgressTx for InMemoryProgressTx {
    async fn get_progress(&mut self, account_id: AccountId) -> Result<ProgressRecord> {
        self.locks.acquire(account_id).await;
        self.store.read_failures.check()?;
        if let Some(record) = self.pending.get(&account_id) {
            return Ok(record.clone());
        }
        self.store.get_progress(account_id).await
    }

    async fn upsert_progress(
        &mut self,
        account_id: AccountId,
        stage: Stage,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.store.upsert_failures.check()?;
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
        let this = *self;
        let mut rows = this.store.rows.write().await;
        let written = this.pending.len();
        rows.extend(this.pending);
        this.store.mutations.fetch_add(written, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
