mod support;

use std::sync::Arc;
use std::time::Duration;

use caldir_sync::{
    Calendar, CalendarSyncState, EventStore, LocalStore, SourceError, SyncConfig, SyncEngine,
    SyncError, SyncMode,
};
use support::*;
use tokio_util::sync::CancellationToken;

fn engine_with(source: Arc<ScriptedSource>, store: Arc<dyn EventStore>) -> SyncEngine {
    SyncEngine::new(source, store, SyncConfig::default())
}

fn memory_store() -> Arc<LocalStore> {
    let store = Arc::new(LocalStore::in_memory());
    store.register_calendar(Calendar::new(CALENDAR)).unwrap();
    store
}

async fn run(engine: &SyncEngine) -> Result<caldir_sync::SyncReport, SyncError> {
    engine
        .run(&CalendarSyncState::new(CALENDAR), &CancellationToken::new())
        .await
}

fn full_sync_script() -> Vec<support::Step> {
    vec![
        more(
            vec![
                timed("a", utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0)),
                recurring("m", utc(2024, 1, 1, 8, 0), utc(2024, 1, 1, 8, 30), "FREQ=DAILY"),
            ],
            "p2",
        ),
        last(
            vec![
                exception(
                    "m_20240102T080000Z",
                    "m",
                    utc(2024, 1, 2, 8, 0),
                    utc(2024, 1, 2, 11, 0),
                    utc(2024, 1, 2, 11, 30),
                ),
                timed("b", utc(2024, 1, 3, 9, 0), utc(2024, 1, 3, 10, 0)),
            ],
            "sync-1",
        ),
    ]
}

#[tokio::test]
async fn replaying_full_sync_is_idempotent() {
    let store = memory_store();

    let once = engine_with(ScriptedSource::new(full_sync_script()), store.clone());
    run(&once).await.unwrap();
    let after_once = snapshot(&*store);

    // Forget the token so the replay is a full sync again.
    let mut batch = caldir_sync::WriteBatch::new();
    batch.clear_sync_token();
    store.apply(CALENDAR, batch).unwrap();

    let twice = engine_with(ScriptedSource::new(full_sync_script()), store.clone());
    let report = run(&twice).await.unwrap();

    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.reconciled, 0);
    assert_eq!(snapshot(&*store), after_once);
    assert_eq!(after_once.len(), 4);
}

#[tokio::test]
async fn incremental_run_presents_sync_token_then_page_tokens() {
    let store = memory_store();
    run(&engine_with(
        ScriptedSource::new(vec![last(vec![], "sync-1")]),
        store.clone(),
    ))
    .await
    .unwrap();

    let source = ScriptedSource::new(vec![
        more(vec![timed("a", utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0))], "p2"),
        last(vec![], "sync-2"),
    ]);
    let report = run(&engine_with(source.clone(), store.clone())).await.unwrap();

    assert_eq!(report.mode, SyncMode::Incremental);
    let requests = source.requests();
    assert_eq!(requests[0].sync_token.as_deref(), Some("sync-1"));
    assert_eq!(requests[0].page_token, None);
    assert!(requests[0].time_min.is_none());
    assert_eq!(requests[1].sync_token.as_deref(), Some("sync-1"));
    assert_eq!(requests[1].page_token.as_deref(), Some("p2"));
    assert_eq!(store.sync_token(CALENDAR).unwrap().as_deref(), Some("sync-2"));
}

#[tokio::test]
async fn interrupted_run_keeps_previous_token() {
    let store = memory_store();
    store.set_sync_token(CALENDAR, "sync-1").unwrap();

    let source = ScriptedSource::new(vec![
        more(vec![timed("a", utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0))], "p2"),
        more(vec![timed("b", utc(2024, 1, 2, 9, 0), utc(2024, 1, 2, 10, 0))], "p3"),
        Step::Fail(SourceError::Transport("connection reset".into())),
    ]);
    let err = run(&engine_with(source, store.clone())).await.unwrap_err();

    assert_eq!(err, SyncError::TransportFailure("connection reset".into()));
    assert!(err.is_retryable());
    // Pages 1 and 2 are committed, the token is not advanced.
    assert!(store.get_by_id(CALENDAR, "a").unwrap().is_some());
    assert!(store.get_by_id(CALENDAR, "b").unwrap().is_some());
    assert_eq!(store.sync_token(CALENDAR).unwrap().as_deref(), Some("sync-1"));
}

#[tokio::test]
async fn store_failure_aborts_page_without_partial_writes() {
    let store = FlakyStore::new();
    store.set_sync_token(CALENDAR, "sync-1").unwrap();
    store.fail_apply_after(2);

    let source = ScriptedSource::new(vec![
        more(vec![timed("a", utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0))], "p2"),
        last(
            vec![
                timed("b", utc(2024, 1, 2, 9, 0), utc(2024, 1, 2, 10, 0)),
                timed("c", utc(2024, 1, 3, 9, 0), utc(2024, 1, 3, 10, 0)),
            ],
            "sync-2",
        ),
    ]);
    let err = run(&engine_with(source, store.clone())).await.unwrap_err();

    assert!(matches!(err, SyncError::StoreUnavailable(_)));
    assert!(store.get_by_id(CALENDAR, "a").unwrap().is_some());
    assert!(store.get_by_id(CALENDAR, "b").unwrap().is_none());
    assert!(store.get_by_id(CALENDAR, "c").unwrap().is_none());
    assert_eq!(store.sync_token(CALENDAR).unwrap().as_deref(), Some("sync-1"));
}

#[tokio::test]
async fn rejected_token_falls_back_to_full_sync_in_same_run() {
    let store = memory_store();
    store.set_sync_token(CALENDAR, "expired").unwrap();

    let source = ScriptedSource::new(vec![
        Step::Fail(SourceError::TokenInvalid),
        last(vec![timed("a", utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0))], "fresh"),
    ]);
    let report = run(&engine_with(source.clone(), store.clone())).await.unwrap();

    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.full_sync_fallbacks, 1);
    assert_eq!(store.sync_token(CALENDAR).unwrap().as_deref(), Some("fresh"));

    let requests = source.requests();
    assert_eq!(requests[0].sync_token.as_deref(), Some("expired"));
    assert_eq!(requests[1].sync_token, None);
    assert!(requests[1].time_min.is_some());
}

#[tokio::test]
async fn token_rejected_mid_run_restarts_and_reconciles() {
    let store = memory_store();
    store.set_sync_token(CALENDAR, "sync-1").unwrap();
    store
        .upsert(
            CALENDAR,
            record(timed("departed", utc(2023, 12, 1, 9, 0), utc(2023, 12, 1, 10, 0))),
        )
        .unwrap();

    let source = ScriptedSource::new(vec![
        // Incremental page 1 lands, then the page token is rejected.
        more(vec![timed("partial", utc(2024, 1, 5, 9, 0), utc(2024, 1, 5, 10, 0))], "p2"),
        Step::Fail(SourceError::TokenInvalid),
        // The full sync restarts from scratch.
        last(vec![timed("a", utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0))], "fresh"),
    ]);
    let report = run(&engine_with(source, store.clone())).await.unwrap();

    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.reconciled, 2);
    let ids: Vec<_> = snapshot(&*store).into_iter().map(|r| r.id).collect();
    assert_eq!(ids, ["a"]);
}

#[tokio::test]
async fn cancelled_record_is_removed_from_record_table_and_indices() {
    let store = memory_store();
    run(&engine_with(
        ScriptedSource::new(vec![last(
            vec![timed("a", utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0))],
            "sync-1",
        )]),
        store.clone(),
    ))
    .await
    .unwrap();
    assert!(store.get_by_id(CALENDAR, "a").unwrap().is_some());

    let report = run(&engine_with(
        ScriptedSource::new(vec![last(vec![cancelled("a")], "sync-2")]),
        store.clone(),
    ))
    .await
    .unwrap();

    assert_eq!(report.removed, 1);
    assert!(store.get_by_id(CALENDAR, "a").unwrap().is_none());
    assert!(store
        .range_by_start(CALENDAR, utc(2024, 1, 1, 0, 0), utc(2024, 1, 2, 0, 0))
        .unwrap()
        .is_empty());
    assert!(store
        .range_by_end(CALENDAR, utc(2024, 1, 1, 0, 0), utc(2024, 1, 2, 0, 0))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn exception_without_master_is_retained_as_orphan() {
    let store = memory_store();
    let source = ScriptedSource::new(vec![last(
        vec![exception(
            "ghost_20240102T080000Z",
            "ghost",
            utc(2024, 1, 2, 8, 0),
            utc(2024, 1, 2, 9, 0),
            utc(2024, 1, 2, 10, 0),
        )],
        "sync-1",
    )]);
    let report = run(&engine_with(source, store.clone())).await.unwrap();

    assert_eq!(report.orphaned.len(), 1);
    assert_eq!(report.orphaned[0].master_id, "ghost");
    assert!(store.get_by_id(CALENDAR, "ghost_20240102T080000Z").unwrap().is_some());
    assert_eq!(store.sync_token(CALENDAR).unwrap().as_deref(), Some("sync-1"));
}

#[tokio::test]
async fn exception_for_stored_master_applies_immediately() {
    let store = memory_store();
    run(&engine_with(
        ScriptedSource::new(vec![last(
            vec![recurring("m", utc(2024, 1, 1, 8, 0), utc(2024, 1, 1, 8, 30), "FREQ=DAILY")],
            "sync-1",
        )]),
        store.clone(),
    ))
    .await
    .unwrap();

    let report = run(&engine_with(
        ScriptedSource::new(vec![last(
            vec![cancelled_exception("m_20240102T080000Z", "m", utc(2024, 1, 2, 8, 0))],
            "sync-2",
        )]),
        store.clone(),
    ))
    .await
    .unwrap();

    assert!(report.orphaned.is_empty());
    let overrides = store.exceptions_of(CALENDAR, "m").unwrap();
    assert_eq!(overrides.len(), 1);
    assert!(overrides[0].is_cancelled());
}

#[tokio::test]
async fn full_sync_removes_records_the_remote_no_longer_lists() {
    let store = memory_store();
    run(&engine_with(
        ScriptedSource::new(vec![last(
            vec![
                timed("keep", utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0)),
                timed("gone", utc(2024, 1, 2, 9, 0), utc(2024, 1, 2, 10, 0)),
            ],
            "sync-1",
        )]),
        store.clone(),
    ))
    .await
    .unwrap();

    let mut batch = caldir_sync::WriteBatch::new();
    batch.clear_sync_token();
    store.apply(CALENDAR, batch).unwrap();

    let report = run(&engine_with(
        ScriptedSource::new(vec![last(
            vec![timed("keep", utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0))],
            "sync-2",
        )]),
        store.clone(),
    ))
    .await
    .unwrap();

    assert_eq!(report.reconciled, 1);
    assert!(store.get_by_id(CALENDAR, "gone").unwrap().is_none());
    assert!(store.get_by_id(CALENDAR, "keep").unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn stalled_fetch_times_out_as_transport_failure() {
    let store = memory_store();
    store.set_sync_token(CALENDAR, "sync-1").unwrap();
    let config = SyncConfig {
        page_timeout: Duration::from_secs(5),
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(
        ScriptedSource::new(vec![
            more(vec![timed("a", utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0))], "p2"),
            Step::Stall,
        ]),
        store.clone(),
        config,
    );

    let err = run(&engine).await.unwrap_err();

    assert!(matches!(err, SyncError::TransportFailure(ref m) if m.contains("timed out")));
    assert!(err.is_retryable());
    assert_eq!(store.sync_token(CALENDAR).unwrap().as_deref(), Some("sync-1"));
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_between_pages() {
    let store = memory_store();
    let source = ScriptedSource::new(vec![
        more(vec![timed("a", utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0))], "p2"),
        Step::Delayed(
            Duration::from_secs(10),
            page(
                vec![timed("b", utc(2024, 1, 2, 9, 0), utc(2024, 1, 2, 10, 0))],
                None,
                Some("sync-1"),
            ),
        ),
    ]);
    let engine = engine_with(source, store.clone());
    let state = CalendarSyncState::new(CALENDAR);
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    };
    let (result, ()) = tokio::join!(engine.run(&state, &cancel), canceller);

    assert_eq!(result.unwrap_err(), SyncError::Cancelled);
    assert!(store.get_by_id(CALENDAR, "a").unwrap().is_some());
    assert!(store.get_by_id(CALENDAR, "b").unwrap().is_none());
    assert_eq!(store.sync_token(CALENDAR).unwrap(), None);
}

#[tokio::test]
async fn unregistered_calendar_fails_run() {
    let store: Arc<dyn EventStore> = Arc::new(LocalStore::in_memory());
    let engine = engine_with(ScriptedSource::new(vec![]), store);
    let err = run(&engine).await.unwrap_err();
    assert_eq!(err, SyncError::CalendarNotFound(CALENDAR.into()));
}
