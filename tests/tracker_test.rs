use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tenantcore::application::clock::ManualClock;
use tenantcore::application::tracker::{ProgressTracker, StatusChange};
use tenantcore::domain::account::AccountId;
use tenantcore::domain::context::RequestContext;
use tenantcore::domain::ports::ProgressStore;
use tenantcore::domain::progress::{ProgressSchema, Stage};
use tenantcore::error::TenantError;
use tenantcore::infrastructure::in_memory::InMemoryProgressStore;

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap()
}

fn tracker_with(schema: ProgressSchema) -> (Arc<InMemoryProgressStore>, ProgressTracker) {
    let store = Arc::new(InMemoryProgressStore::with_schema(schema));
    let tracker = ProgressTracker::new(Box::new(store.clone()))
        .with_clock(Arc::new(ManualClock::new(at(59))));
    (store, tracker)
}

#[tokio::test]
async fn test_full_pipeline_records_every_stage() {
    let (store, tracker) = tracker_with(ProgressSchema::current());
    let ctx = RequestContext::new();
    let acc = AccountId(11);

    let stages = [
        Stage::AccountCreated,
        Stage::FetchStarted,
        Stage::FetchCompleted,
        Stage::ConsistencyStarted,
        Stage::ConsistencyCompleted,
    ];
    for (minute, stage) in stages.into_iter().enumerate() {
        tracker
            .update_status(&ctx, acc, Some(at(minute as u32)), stage)
            .await
            .unwrap();
    }

    let status = tracker.get_status(&ctx, acc).await.unwrap();
    assert_eq!(status.current_status, Stage::ConsistencyCompleted);
    assert_eq!(status.stage_timestamps.len(), 4);
    assert_eq!(status.entered_at(Stage::FetchStarted), Some(at(1)));
    assert_eq!(status.entered_at(Stage::ConsistencyCompleted), Some(at(4)));
    assert_eq!(store.mutations(), 5);
}

#[tokio::test]
async fn test_redelivered_events_do_not_rewrite_timestamps() {
    let (store, tracker) = tracker_with(ProgressSchema::current());
    let ctx = RequestContext::new();
    let acc = AccountId(7);

    for minute in 0..3 {
        tracker
            .update_status(&ctx, acc, Some(at(minute)), Stage::FetchCompleted)
            .await
            .unwrap();
    }

    assert_eq!(store.mutations(), 1);
    let status = tracker.get_status(&ctx, acc).await.unwrap();
    assert_eq!(status.entered_at(Stage::FetchCompleted), Some(at(0)));
}

#[tokio::test]
async fn test_returning_to_a_stage_overwrites_its_timestamp() {
    let (_, tracker) = tracker_with(ProgressSchema::current());
    let ctx = RequestContext::new();
    let acc = AccountId(5);

    tracker.update_status(&ctx, acc, Some(at(1)), Stage::FetchStarted).await.unwrap();
    tracker.update_status(&ctx, acc, Some(at(2)), Stage::FetchCompleted).await.unwrap();
    let change = tracker
        .update_status(&ctx, acc, Some(at(3)), Stage::FetchStarted)
        .await
        .unwrap();

    assert_eq!(change, StatusChange::Updated { from: Stage::FetchCompleted });
    let status = tracker.get_status(&ctx, acc).await.unwrap();
    assert_eq!(status.entered_at(Stage::FetchStarted), Some(at(3)));
    assert_eq!(status.entered_at(Stage::FetchCompleted), Some(at(2)));
}

#[tokio::test]
async fn test_legacy_schema_keeps_precompute_columns() {
    let (_, tracker) = tracker_with(ProgressSchema::legacy());
    let ctx = RequestContext::new();

    tracker
        .update_status(&ctx, AccountId(1), None, Stage::PrecomputeCompleted)
        .await
        .unwrap();

    let status = tracker.get_status(&ctx, AccountId(1)).await.unwrap();
    assert_eq!(status.entered_at(Stage::PrecomputeCompleted), Some(at(59)));
}

#[tokio::test]
async fn test_concurrent_updates_for_one_account_are_serialised() {
    let store = Arc::new(InMemoryProgressStore::new());
    let tracker = Arc::new(ProgressTracker::new(Box::new(store.clone())));
    let acc = AccountId(3);

    let mut handles = Vec::new();
    for i in 0..16u32 {
        let tracker = tracker.clone();
        let stage = if i % 2 == 0 {
            Stage::FetchStarted
        } else {
            Stage::FetchCompleted
        };
        handles.push(tokio::spawn(async move {
            tracker
                .update_status(&RequestContext::new(), acc, Some(at(i)), stage)
                .await
                .unwrap()
        }));
    }
    let mut created = 0;
    for handle in handles {
        if handle.await.unwrap() == StatusChange::Created {
            created += 1;
        }
    }

    assert_eq!(created, 1);
    let rows = store.all_progress().await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].entered_at(rows[0].current_status).is_some());
}

#[tokio::test]
async fn test_updates_for_different_accounts_do_not_interfere() {
    let store = Arc::new(InMemoryProgressStore::new());
    let tracker = Arc::new(ProgressTracker::new(Box::new(store.clone())));

    let mut handles = Vec::new();
    for i in 1..=8u32 {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            tracker
                .update_status(
                    &RequestContext::new(),
                    AccountId(i64::from(i)),
                    Some(at(i)),
                    Stage::FetchStarted,
                )
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusChange::Created);
    }

    let rows = store.all_progress().await;
    assert_eq!(rows.len(), 8);
    for (i, row) in (1..=8u32).zip(&rows) {
        assert_eq!(row.entered_at(Stage::FetchStarted), Some(at(i)));
    }
}

#[tokio::test]
async fn test_open_transaction_blocks_only_its_own_account() {
    let (store, tracker) = tracker_with(ProgressSchema::current());
    let mut held = store.begin().await.unwrap();
    held.upsert_progress(AccountId(1), Stage::FetchStarted, at(0))
        .await
        .unwrap();

    let ctx = RequestContext::new().with_timeout(Duration::from_millis(200));
    let change = tracker
        .update_status(&ctx, AccountId(2), None, Stage::FetchStarted)
        .await
        .unwrap();
    assert_eq!(change, StatusChange::Created);

    let short = RequestContext::new().with_timeout(Duration::from_millis(50));
    let err = tracker
        .update_status(&short, AccountId(1), None, Stage::FetchCompleted)
        .await
        .unwrap_err();
    assert!(matches!(err, TenantError::DeadlineExceeded(_)));

    held.commit().await.unwrap();
    let status = tracker.get_status(&ctx, AccountId(1)).await.unwrap();
    assert_eq!(status.current_status, Stage::FetchStarted);
    assert_eq!(store.mutations(), 2);
}
