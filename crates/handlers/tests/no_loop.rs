use concepts::storage::{DbPool, DbPoolCloseable, DocumentStore, DocumentUpdate};
use concepts::time::{ClockFn, TimeWindow};
use concepts::{ChangeRecord, DocumentPath, HandlerName};
use db_tests::Database;
use guard::dispatcher::{DispatchOutcome, Dispatcher};
use guard::tagger;
use rstest::rstest;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use test_utils::sim_clock::SimClock;
use test_utils::{document, set_up};
use tokio::sync::mpsc::UnboundedReceiver;

/// Deliveries per handler that wrote something.
#[derive(Default, Debug)]
struct Counts(BTreeMap<String, usize>);

impl Counts {
    fn get(&self, handler_name: &str) -> usize {
        self.0.get(handler_name).copied().unwrap_or_default()
    }

    fn record(&mut self, outcomes: Vec<(HandlerName, DispatchOutcome)>) {
        for (handler_name, outcome) in outcomes {
            assert_ne!(DispatchOutcome::Failed, outcome, "{handler_name} failed");
            if let DispatchOutcome::Applied(effects) = outcome
                && effects > 0
            {
                *self.0.entry(handler_name.to_string()).or_default() += 1;
            }
        }
    }
}

/// Dispatch every pending change `1 + redeliveries` times, including the changes
/// produced by the handlers themselves, until the feed is quiet.
async fn settle<C: ClockFn>(
    dispatcher: &Dispatcher<C>,
    feed: &mut UnboundedReceiver<ChangeRecord>,
    redeliveries: usize,
    counts: &mut Counts,
) -> usize {
    let mut seen = 0;
    while let Ok(change) = feed.try_recv() {
        seen += 1;
        assert!(seen < 1000, "runaway trigger loop");
        for _ in 0..=redeliveries {
            counts.record(dispatcher.dispatch(&change).await);
        }
    }
    seen
}

async fn client_update(
    store: &dyn DocumentStore,
    path: &DocumentPath,
    update: DocumentUpdate,
    sim_clock: &SimClock,
) {
    store
        .update(path, tagger::untag(update, sim_clock.now()), sim_clock.now())
        .await
        .unwrap();
}

#[rstest]
#[tokio::test]
async fn handlers_fire_at_most_once_per_client_write(
    #[values(Database::Memory, Database::Sqlite)] database: Database,
    #[values(0, 2)] redeliveries: usize,
) {
    set_up();
    let sim_clock = SimClock::default();
    let (_guard, db_pool) = database.set_up().await;
    let store = db_pool.document_store();
    let dispatcher =
        Dispatcher::new(tripwire_handlers::all().unwrap(), &db_pool, sim_clock.clone());
    let mut feed = store.subscribe();
    let mut counts = Counts::default();
    let user: DocumentPath = "tenants/t1/users/u1".parse().unwrap();

    store
        .create(
            &user,
            tagger::untag_document(
                document(json!({"displayName": "Ann", "status": "invited", "loginCount": 0})),
                sim_clock.now(),
            ),
            sim_clock.now(),
        )
        .await
        .unwrap();
    settle(&dispatcher, &mut feed, redeliveries, &mut counts).await;
    assert_eq!(1, counts.get(tripwire_handlers::activity_logger::NAME));

    const LOGINS: usize = 5;
    for idx in 0..LOGINS {
        sim_clock.move_time_forward(Duration::from_secs(60));
        client_update(
            store.as_ref(),
            &user,
            DocumentUpdate::default().set("lastSeen", format!("T{idx}")),
            &sim_clock,
        )
        .await;
        settle(&dispatcher, &mut feed, redeliveries, &mut counts).await;
    }
    client_update(
        store.as_ref(),
        &user,
        DocumentUpdate::default().set("status", "active"),
        &sim_clock,
    )
    .await;
    settle(&dispatcher, &mut feed, redeliveries, &mut counts).await;
    client_update(
        store.as_ref(),
        &user,
        DocumentUpdate::default()
            .set("displayName", "Anna")
            .set("lastSeen", "T-last"),
        &sim_clock,
    )
    .await;
    settle(&dispatcher, &mut feed, redeliveries, &mut counts).await;

    assert_eq!(LOGINS + 1, counts.get(tripwire_handlers::login_count::NAME));
    assert_eq!(1, counts.get(tripwire_handlers::activation_tracker::NAME));
    assert_eq!(2, counts.get(tripwire_handlers::activity_logger::NAME));

    let stored = store.get(&user).await.unwrap();
    assert_eq!(Some(&json!(LOGINS + 1)), stored.get("loginCount"));
    assert!(stored.contains_key("activatedAt"));
    let tenant = store.get(&"tenants/t1".parse().unwrap()).await.unwrap();
    assert_eq!(Some(&json!(1)), tenant.get("activeUserCount"));
    let failures = db_pool
        .error_sink()
        .list_failures(
            None,
            TimeWindow::trailing(sim_clock.now() + Duration::from_secs(1), Duration::MAX),
        )
        .await
        .unwrap();
    assert!(failures.is_empty(), "{failures:?}");
    db_pool.close().await;
}

#[rstest]
#[tokio::test]
async fn member_count_follows_membership(
    #[values(Database::Memory, Database::Sqlite)] database: Database,
) {
    set_up();
    let sim_clock = SimClock::default();
    let (_guard, db_pool) = database.set_up().await;
    let store = db_pool.document_store();
    let dispatcher =
        Dispatcher::new(tripwire_handlers::all().unwrap(), &db_pool, sim_clock.clone());
    let mut feed = store.subscribe();
    let mut counts = Counts::default();
    let team: DocumentPath = "tenants/t1/teams/a".parse().unwrap();

    for member in ["m1", "m2", "m3"] {
        store
            .create(
                &team.child("members", member).unwrap(),
                document(json!({"uid": member})),
                sim_clock.now(),
            )
            .await
            .unwrap();
    }
    store
        .delete(&team.child("members", "m2").unwrap(), sim_clock.now())
        .await
        .unwrap();
    // Renaming a member is not a membership change.
    store
        .update(
            &team.child("members", "m1").unwrap(),
            DocumentUpdate::default().set("nickname", "first"),
            sim_clock.now(),
        )
        .await
        .unwrap();
    settle(&dispatcher, &mut feed, 1, &mut counts).await;

    assert_eq!(4, counts.get(tripwire_handlers::member_count::NAME));
    assert_eq!(
        Some(&json!(2)),
        store.get(&team).await.unwrap().get("memberCount")
    );
    db_pool.close().await;
}
