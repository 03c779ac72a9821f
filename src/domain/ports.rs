use super::account::{AccountId, AccountRecord, InstallationKey};
use super::progress::{ProgressRecord, Stage};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Lookup side of the account database.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Returns the account matching either identification mode of `key`.
    ///
    /// Implementations consider at least the account id and the installation pair,
    /// and return `TenantError::NotFound` when no record matches.
    async fn get_account_by_id(&self, key: &InstallationKey) -> Result<AccountRecord>;
}

/// Persistent per-account progress rows.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Opens a transaction. Dropping the returned handle without committing discards its writes.
    async fn begin(&self) -> Result<ProgressTxBox>;

    /// Reads a committed row outside of any transaction.
    async fn get_progress(&self, account_id: AccountId) -> Result<ProgressRecord>;
}

/// A transaction over the progress table.
#[async_trait]
pub trait ProgressTx: Send {
    /// Returns `TenantError::NotFound` when the account has no row.
    async fn get_progress(&mut self, account_id: AccountId) -> Result<ProgressRecord>;

    /// Inserts or updates the row: sets `current_status` to `stage` and, when the
    /// schema has a column for `stage`, that column to `timestamp`.
    async fn upsert_progress(
        &mut self,
        account_id: AccountId,
        stage: Stage,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

pub type AccountStoreBox = Box<dyn AccountStore>;
pub type ProgressStoreBox = Box<dyn ProgressStore>;
pub type ProgressTxBox = Box<dyn ProgressTx>;

#[async_trait]
impl<T: AccountStore + ?Sized> AccountStore for std::sync::Arc<T> {
    async fn get_account_by_id(&self, key: &InstallationKey) -> Result<AccountRecord> {
        (**self).get_account_by_id(key).await
    }
}

#[async_trait]
impl<T: ProgressStore + ?Sized> ProgressStore for std::sync::Arc<T> {
    async fn begin(&self) -> Result<ProgressTxBox> {
        (**self).begin().await
    }

    async fn get_progress(&self, account_id: AccountId) -> Result<ProgressRecord> {
        (**self).get_progress(account_id).await
    }
}
