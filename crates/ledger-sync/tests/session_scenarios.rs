use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use change_feed::{LocalChangeFeed, SubscribeStatus, TopicFilter};
use chrono::{NaiveDate, TimeZone, Utc};
use ledger_store::{EntityKind, InMemoryRowStore, Record, RecordDraft, RecordPatch, StoreCall};
use ledger_sync::{
    ConnectionState, DiagnosticEvent, FallbackReason, FetchOutcome, FetchTrigger,
    OwnerBoundSession, RecordingDiagnostics, SessionFactory, SessionSpec, StaticEnvironment,
    SyncError, SyncSession, WriteOp,
};
use tokio::sync::watch;
use tokio::time::sleep;

use ConnectionState::*;

const DESKTOP_UA: &str = "Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/125.0";
const TOPIC: &str = "ledger:expenses";

fn expense(id: &str, owner: &str, minute: u32) -> Record {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, minute, 0).unwrap();
    Record {
        id: id.into(),
        owner_id: owner.into(),
        category_ref: None,
        category_name: None,
        description: format!("expense {id}"),
        amount: 1_250,
        event_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        created_at: at,
        updated_at: at,
        kind: EntityKind::Expense,
    }
}

struct Harness {
    rows: Arc<InMemoryRowStore>,
    feed: Arc<LocalChangeFeed>,
    diagnostics: Arc<RecordingDiagnostics>,
    factory: SessionFactory,
}

impl Harness {
    fn new(feed: LocalChangeFeed, environment: StaticEnvironment) -> Self {
        let rows = InMemoryRowStore::new();
        let feed = Arc::new(feed);
        let diagnostics = RecordingDiagnostics::new();
        let factory = SessionFactory::new(rows.clone(), feed.clone())
            .with_environment(Arc::new(environment))
            .with_diagnostics(diagnostics.clone());
        Self {
            rows,
            feed,
            diagnostics,
            factory,
        }
    }

    /// Push path available and acknowledged as soon as the session subscribes.
    fn live() -> Self {
        Self::new(
            LocalChangeFeed::new(),
            StaticEnvironment::default().with_signature(DESKTOP_UA),
        )
    }

    /// Probe fails on storage, so sessions start in polling mode.
    fn degraded() -> Self {
        Self::new(
            LocalChangeFeed::new(),
            StaticEnvironment::restricted_storage().with_signature(DESKTOP_UA),
        )
    }

    fn open(&self, owner: &str) -> SyncSession {
        self.factory
            .open(SessionSpec::for_kind(EntityKind::Expense), owner)
    }

    fn transitions_to_polling(&self) -> usize {
        self.diagnostics.count(|e| {
            matches!(
                e,
                DiagnosticEvent::StateChanged {
                    to: ConnectionState::Polling,
                    ..
                }
            )
        })
    }
}

/// Lets spawned session tasks run without moving the clock meaningfully.
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn scenario_a_non_viable_probe_polls_from_the_start() {
    let harness = Harness::degraded();
    harness
        .rows
        .seed("expenses", vec![expense("e1", "u1", 0)])
        .await;

    let session = harness.open("u1");
    settle().await;

    assert_eq!(session.connection_state(), Polling);
    assert_eq!(session.state_history(), [Disconnected, Polling]);
    assert_eq!(harness.feed.total_subscriptions(), 0);
    assert!(session.is_polling_active());
    assert!(!session.has_live_channel());
    assert_eq!(session.records().len(), 1);
    assert!(!session.loading());
}

#[tokio::test(start_paused = true)]
async fn scenario_b_ack_within_guard_keeps_session_connected() {
    let harness = Harness::new(
        LocalChangeFeed::manual(),
        StaticEnvironment::default().with_signature(DESKTOP_UA),
    );
    let session = harness.open("u1");
    settle().await;
    assert_eq!(session.connection_state(), Connecting);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.feed.send_status(TOPIC, SubscribeStatus::Subscribed), 1);
    settle().await;
    assert_eq!(session.connection_state(), Connected);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(session.connection_state(), Connected);
    assert_eq!(session.state_history(), [Disconnected, Connecting, Connected]);
    assert!(session.has_live_channel());
    assert!(!session.is_polling_active());
    assert_eq!(harness.rows.query_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_guard_expiry_falls_back_once() {
    let harness = Harness::new(
        LocalChangeFeed::manual(),
        StaticEnvironment::default().with_signature(DESKTOP_UA),
    );
    let session = harness.open("u1");

    sleep(Duration::from_secs(14)).await;
    assert_eq!(session.connection_state(), Connecting);
    assert!(session.has_live_channel());

    sleep(Duration::from_secs(2)).await;
    assert_eq!(session.connection_state(), Polling);
    assert_eq!(session.state_history(), [Disconnected, Connecting, Polling]);
    assert_eq!(
        harness.diagnostics.count(|e| matches!(
            e,
            DiagnosticEvent::StateChanged {
                reason: Some(FallbackReason::GuardExpired),
                ..
            }
        )),
        1
    );
    assert_eq!(harness.feed.active_subscriptions(), 0);
    assert!(session.is_polling_active());

    // A late acknowledgement has nowhere to go.
    harness.feed.send_status(TOPIC, SubscribeStatus::Subscribed);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(session.connection_state(), Polling);
    assert_eq!(harness.transitions_to_polling(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_write_in_polling_mode_reconciles_once() {
    let harness = Harness::degraded();
    let session = harness.open("u1");
    settle().await;
    assert_eq!(harness.rows.query_count().await, 1);

    sleep(Duration::from_secs(2)).await;
    let created = session
        .create(RecordDraft::new(
            "groceries",
            4_200,
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
        ))
        .await
        .expect("create");
    assert_eq!(session.records()[0].id, created.id);

    sleep(Duration::from_millis(900)).await;
    assert_eq!(harness.rows.query_count().await, 1);

    sleep(Duration::from_millis(600)).await;
    assert_eq!(harness.rows.query_count().await, 2);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.rows.query_count().await, 2);
    assert_eq!(
        harness.diagnostics.count(|e| matches!(
            e,
            DiagnosticEvent::FetchCompleted {
                trigger: FetchTrigger::Reconcile,
                ..
            }
        )),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn scenario_e_delete_of_unknown_id_leaves_rows_alone() {
    let harness = Harness::live();
    harness
        .rows
        .seed(
            "expenses",
            vec![expense("e2", "u1", 2), expense("e1", "u1", 1)],
        )
        .await;
    let session = harness.open("u1");
    settle().await;
    assert_eq!(session.connection_state(), Connected);
    let before = session.records();

    session.delete("missing").await.expect("delete");

    assert!(harness.rows.calls().await.contains(&StoreCall::Delete {
        table: "expenses".into(),
        id: "missing".into(),
    }));
    assert_eq!(session.records(), before);

    // Connected sessions leave reconciliation to the push channel.
    sleep(Duration::from_secs(3)).await;
    assert_eq!(harness.rows.query_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_f_fresh_data_skips_poll_tick() {
    let harness = Harness::degraded();
    let session = harness.open("u1");
    settle().await;
    assert_eq!(harness.rows.query_count().await, 1);

    sleep(Duration::from_secs(5)).await;
    let outcome = session.refetch().await.expect("refetch");
    assert_eq!(outcome, FetchOutcome::Applied { rows: 0 });
    assert_eq!(harness.rows.query_count().await, 2);

    // Tick at 10s sees a fetch from 5s ago.
    sleep(Duration::from_millis(5_500)).await;
    assert_eq!(harness.rows.query_count().await, 2);
    assert_eq!(
        harness
            .diagnostics
            .count(|e| matches!(e, DiagnosticEvent::PollSkipped { .. })),
        1
    );

    // Tick at 20s sees a fetch from 15s ago.
    sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.rows.query_count().await, 3);
}

#[tokio::test(start_paused = true)]
async fn channel_failure_swaps_handle_for_timer() {
    let harness = Harness::live();
    let session = harness.open("u1");
    settle().await;
    assert_eq!(harness.feed.active_subscriptions(), 1);
    assert!(!session.is_polling_active());

    harness.feed.send_status(TOPIC, SubscribeStatus::ChannelError);
    settle().await;

    assert_eq!(session.connection_state(), Polling);
    assert_eq!(harness.feed.active_subscriptions(), 0);
    assert!(session.is_polling_active());
    assert!(!session.has_live_channel());
    assert_eq!(
        session.state_history(),
        [Disconnected, Connecting, Connected, Polling]
    );
}

#[tokio::test(start_paused = true)]
async fn refused_subscribe_falls_back_immediately() {
    let harness = Harness::live();
    harness.feed.refuse_subscriptions(true);
    let session = harness.open("u1");
    settle().await;

    assert_eq!(session.state_history(), [Disconnected, Connecting, Polling]);
    assert!(session.is_polling_active());
    assert_eq!(harness.feed.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn push_events_trigger_a_refresh_for_own_rows_only() {
    let harness = Harness::live();
    let session = harness.open("u1");
    settle().await;
    assert_eq!(harness.rows.query_count().await, 1);

    harness
        .rows
        .seed("expenses", vec![expense("pushed", "u1", 5)])
        .await;
    let payload = serde_json::json!({
        "operation": "insert",
        "table": "expenses",
        "row": expense("pushed", "u1", 5),
    });
    harness
        .feed
        .publish(TOPIC, Bytes::from(payload.to_string()));
    settle().await;
    assert_eq!(harness.rows.query_count().await, 2);
    assert_eq!(session.records()[0].id, "pushed");

    let foreign = serde_json::json!({
        "operation": "update",
        "table": "expenses",
        "row": expense("other", "u2", 1),
    });
    harness
        .feed
        .publish(TOPIC, Bytes::from(foreign.to_string()));
    harness
        .feed
        .publish(TOPIC, Bytes::from_static(b"not a change"));
    settle().await;
    assert_eq!(harness.rows.query_count().await, 2);
    assert_eq!(session.connection_state(), Connected);
    assert_eq!(
        harness
            .diagnostics
            .count(|e| matches!(e, DiagnosticEvent::ChangeRejected { .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn stale_fetch_result_is_discarded() {
    let harness = Harness::live();
    harness
        .rows
        .seed("expenses", vec![expense("old", "u1", 0)])
        .await;
    let session = harness.open("u1");
    settle().await;

    harness.rows.delay_next_query(Duration::from_secs(3)).await;
    let slow = session.refetch();
    let fast = async {
        sleep(Duration::from_secs(1)).await;
        harness
            .rows
            .seed("expenses", vec![expense("new", "u1", 1)])
            .await;
        session.refetch().await
    };
    let (slow, fast) = tokio::join!(slow, fast);

    assert_eq!(fast.unwrap(), FetchOutcome::Applied { rows: 1 });
    assert_eq!(slow.unwrap(), FetchOutcome::Discarded);
    let ids: Vec<_> = session.records().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, ["new"]);
}

#[tokio::test(start_paused = true)]
async fn two_fetches_leave_exactly_the_second_set() {
    let harness = Harness::live();
    let session = harness.open("u1");
    settle().await;
    harness
        .rows
        .seed(
            "expenses",
            vec![expense("a", "u1", 0), expense("b", "u1", 1)],
        )
        .await;
    session.refetch().await.unwrap();
    harness
        .rows
        .seed("expenses", vec![expense("c", "u1", 2)])
        .await;
    session.refetch().await.unwrap();

    let ids: Vec<_> = session.records().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, ["c"]);
}

#[tokio::test(start_paused = true)]
async fn failed_write_changes_nothing() {
    let harness = Harness::degraded();
    harness
        .rows
        .seed("expenses", vec![expense("e1", "u1", 0)])
        .await;
    let session = harness.open("u1");
    settle().await;
    let before = session.records();

    harness.rows.fail_next_writes(1).await;
    let err = session
        .update(
            "e1",
            RecordPatch {
                amount: Some(1),
                ..RecordPatch::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Write {
            op: WriteOp::Update,
            ..
        }
    ));
    assert!(err.is_user_visible());
    assert_eq!(session.records(), before);
    assert_eq!(session.connection_state(), Polling);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.rows.query_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn update_replaces_row_in_place() {
    let harness = Harness::live();
    harness
        .rows
        .seed(
            "expenses",
            vec![expense("e2", "u1", 2), expense("e1", "u1", 1)],
        )
        .await;
    let session = harness.open("u1");
    settle().await;

    let patch = RecordPatch {
        description: Some("rent".into()),
        ..RecordPatch::default()
    };
    session.update("e1", patch.clone()).await.unwrap();
    let once = session.records();
    session.update("e1", patch).await.unwrap();
    let twice = session.records();

    assert_eq!(once.len(), 2);
    assert_eq!(once[1].description, "rent");
    assert_eq!(
        once.iter().map(|r| &r.id).collect::<Vec<_>>(),
        twice.iter().map(|r| &r.id).collect::<Vec<_>>()
    );
}

#[tokio::test(start_paused = true)]
async fn background_fetch_failure_publishes_notice() {
    let harness = Harness::degraded();
    harness.rows.fail_next_queries(1).await;
    let session = harness.open("u1");
    let mut notices = session.notices();

    let notice = notices.recv().await.expect("notice");
    assert_eq!(notice.trigger, FetchTrigger::Initial);
    assert_eq!(session.connection_state(), Polling);
    assert!(session.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn teardown_releases_everything() {
    let harness = Harness::live();
    let session = harness.open("u1");
    settle().await;
    assert_eq!(harness.feed.active_subscriptions(), 1);

    session.teardown();
    session.teardown();

    assert_eq!(harness.feed.active_subscriptions(), 0);
    assert!(!session.is_polling_active());
    assert!(session.is_closed());
    assert!(matches!(
        session.refetch().await,
        Err(SyncError::SessionClosed)
    ));
    assert!(matches!(
        session.delete("e1").await,
        Err(SyncError::SessionClosed)
    ));

    sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.rows.query_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn teardown_of_connected_session_records_no_fallback() {
    let harness = Harness::live();
    let sessions: Vec<SyncSession> = (0..20).map(|i| harness.open(&format!("u{i}"))).collect();
    settle().await;
    assert!(sessions.iter().all(|s| s.connection_state() == Connected));

    for session in &sessions {
        session.teardown();
    }
    settle().await;

    for session in &sessions {
        assert_eq!(session.connection_state(), Connected);
        assert_eq!(session.state_history(), [Disconnected, Connecting, Connected]);
        assert!(!session.is_polling_active());
    }
    assert_eq!(harness.transitions_to_polling(), 0);
    assert_eq!(harness.feed.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn degraded_session_teardown_clears_timer() {
    let harness = Harness::degraded();
    let session = harness.open("u1");
    settle().await;
    assert!(session.is_polling_active());
    drop(session);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.rows.query_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn open_ledger_subscribes_each_kind_with_owner_filter() {
    let harness = Harness::live();
    let ledger = harness.factory.open_ledger("u1");
    settle().await;

    assert_eq!(harness.feed.active_subscriptions(), 3);
    for kind in EntityKind::ALL {
        let session = ledger.get(kind);
        assert_eq!(session.connection_state(), Connected);
        assert_eq!(
            harness.feed.filters_for(&session.spec().topic()),
            [TopicFilter::eq("owner_id", "u1")]
        );
    }

    ledger.teardown();
    assert_eq!(harness.feed.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn owner_change_rebinds_the_session() {
    let harness = Harness::live();
    let (owner_tx, owner_rx) = watch::channel(Some("u1".to_string()));
    let bound = OwnerBoundSession::spawn(
        harness.factory.clone(),
        SessionSpec::for_kind(EntityKind::Expense),
        owner_rx,
    );
    settle().await;
    let first = bound.current().expect("session for u1");
    assert_eq!(first.owner_id(), "u1");
    assert_eq!(harness.feed.active_subscriptions(), 1);

    owner_tx.send_replace(Some("u2".to_string()));
    settle().await;
    let second = bound.current().expect("session for u2");
    assert_eq!(second.owner_id(), "u2");
    assert!(first.is_closed());
    assert_eq!(harness.feed.active_subscriptions(), 1);
    assert_eq!(harness.feed.total_subscriptions(), 2);

    owner_tx.send_replace(None);
    settle().await;
    assert!(bound.current().is_none());
    assert!(second.is_closed());
    assert_eq!(harness.feed.active_subscriptions(), 0);

    bound.shutdown().await;
}
