use super::clock::{Clock, SystemClock};
use crate::domain::account::AccountId;
use crate::domain::context::RequestContext;
use crate::domain::ports::ProgressStoreBox;
use crate::domain::progress::{ProgressRecord, Stage};
use crate::error::{Result, TenantError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{Instrument, debug, info};

/// What an [`ProgressTracker::update_status`] call did to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Created,
    Updated { from: Stage },
    /// The account was already at the requested stage; nothing was written.
    Unchanged,
}

/// Records when each account entered each onboarding stage.
///
/// Writes are idempotent for a repeated stage. Transitions are not checked against
/// the stage order: moving "backwards" is accepted and overwrites that stage's timestamp.
/// Concurrent updates for one account are serialised by the store's transactions.
pub struct ProgressTracker {
    store: ProgressStoreBox,
    clock: Arc<dyn Clock>,
}

impl ProgressTracker {
    pub fn new(store: ProgressStoreBox) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Moves `account_id` to `stage`, stamping it with `timestamp` (or now, when `None`).
    pub async fn update_status(
        &self,
        ctx: &RequestContext,
        account_id: AccountId,
        timestamp: Option<DateTime<Utc>>,
        stage: Stage,
    ) -> Result<StatusChange> {
        let span = ctx.span("update_status");
        async move {
            // Dropping `tx` on any early return discards its writes.
            let mut tx = ctx.bound(self.store.begin()).await?;

            let current = ctx.bound(tx.get_progress(account_id)).await;
            let change = match current {
                Ok(current) if current.current_status == stage => {
                    ctx.bound(tx.rollback()).await?;
                    debug!(account = %account_id, %stage, "stage already recorded");
                    return Ok(StatusChange::Unchanged);
                }
                Ok(current) => StatusChange::Updated {
                    from: current.current_status,
                },
                Err(TenantError::NotFound) => StatusChange::Created,
                Err(err) => return Err(err),
            };

            let timestamp = timestamp.unwrap_or_else(|| self.clock.now());
            ctx.bound(tx.upsert_progress(account_id, stage, timestamp))
                .await?;
            ctx.bound(tx.commit()).await?;

            info!(account = %account_id, %stage, ?change, %timestamp, "stage recorded");
            Ok(change)
        }
        .instrument(span)
        .await
    }

    /// Returns `TenantError::NotFound` when the account has no progress yet.
    pub async fn get_status(
        &self,
        ctx: &RequestContext,
        account_id: AccountId,
    ) -> Result<ProgressRecord> {
        let span = ctx.span("get_status");
        ctx.bound(self.store.get_progress(account_id))
            .instrument(span)
            .await
    }
}
