// End-to-end fanout tests over the in-memory store
//
// A card operation commits events and outbox rows; the worker side then
// drains the outbox into notifications and webhook deliveries.
//
// Run with: cargo test -p eventline-worker --test fanout_pipeline

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use eventline_core::{
    actions, Board, Card, Cards, DelinquencyPolicy, DeliveryState, EventStore, EventTracker,
    FanoutConfig, FanoutKind, FanoutQueue, InMemoryStore, NotificationStore, RetryPolicy, User,
    Webhook, WebhookStore,
};
use eventline_worker::{
    execute, FanoutContext, HttpTransport, PollerConfig, WorkerPool, WorkerPoolConfig,
};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct World {
    store: InMemoryStore,
    cards: Cards,
    u1: User,
    u2: User,
    watcher: User,
    board: Board,
}

fn world() -> World {
    let store = InMemoryStore::new();
    let account_id = Uuid::now_v7();

    store.add_user(User::system(account_id));
    let u1 = store.add_user(User::member(account_id, "U1"));
    let u2 = store.add_user(User::member(account_id, "U2"));
    let watcher = store.add_user(User::member(account_id, "Watcher"));
    let board = store.add_board(
        Board::new(account_id, "Roadmap").with_watchers(vec![u1.id, watcher.id]),
    );

    let event_store: Arc<dyn EventStore> = Arc::new(store.clone());
    World {
        cards: Cards::new(event_store, Arc::new(EventTracker::default())),
        store,
        u1,
        u2,
        watcher,
        board,
    }
}

fn fanout_config(delinquency_threshold: u32) -> FanoutConfig {
    FanoutConfig {
        notify_retry: RetryPolicy::fixed(Duration::ZERO, 3),
        dispatch_retry: RetryPolicy::fixed(Duration::ZERO, 3),
        delivery_retry: RetryPolicy::fixed(Duration::ZERO, 3),
        delinquency: DelinquencyPolicy {
            threshold: delinquency_threshold,
            window: Duration::ZERO,
        },
        ..Default::default()
    }
}

fn context(store: &InMemoryStore, config: &FanoutConfig) -> FanoutContext {
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(5)).unwrap());
    FanoutContext::from_store(Arc::new(store.clone()), transport, config)
}

/// Claim and run tasks until nothing is claimable
async fn drain(store: &InMemoryStore, ctx: &FanoutContext, config: &FanoutConfig) -> usize {
    let mut runs = 0;
    loop {
        let tasks = store.claim("test", &FanoutKind::ALL, 50).await.unwrap();
        if tasks.is_empty() {
            return runs;
        }
        for task in tasks {
            execute(ctx, config, task).await;
            runs += 1;
        }
    }
}

async fn published_card(w: &World, title: &str) -> Card {
    let card = w.cards.create_draft(w.board.id, w.u1.id, title).await.unwrap();
    w.cards.publish(card.id, w.u1.id).await.unwrap()
}

async fn recipients_of(store: &InMemoryStore, event_id: Uuid) -> BTreeSet<Uuid> {
    store
        .notifications_for_event(event_id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.user_id)
        .collect()
}

#[tokio::test]
async fn test_close_notifies_watchers_and_delivers_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let w = world();
    let hook = w.store.add_webhook(
        Webhook::new(
            w.board.account_id,
            w.board.id,
            "CI",
            format!("{}/hook", server.uri()),
            [actions::CARD_CLOSED],
        )
        .unwrap(),
    );
    let config = fanout_config(10);
    let ctx = context(&w.store, &config);

    let card = published_card(&w, "Launch").await;
    w.cards.close(card.id, w.u1.id).await.unwrap();
    drain(&w.store, &ctx, &config).await;

    let close_event = w.store.events().pop().unwrap();
    assert_eq!(close_event.action, actions::CARD_CLOSED);

    // the creator never hears about their own action
    let expected: BTreeSet<Uuid> = [w.watcher.id].into_iter().collect();
    assert_eq!(recipients_of(&w.store, close_event.id).await, expected);

    let deliveries = w.store.deliveries_for_event(close_event.id).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].webhook_id, hook.id);
    assert_eq!(deliveries[0].state, DeliveryState::Succeeded);
    assert_eq!(deliveries[0].response_code, Some(200));

    // the published event is not subscribed
    assert_eq!(w.store.delivery_count(), 1);

    let comments = w.store.comments_for_card(card.id);
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].body, "U1 moved this to Done.");

    let stats = w.store.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.dead, 0);
}

#[tokio::test]
async fn test_assignment_notifies_only_assignees() {
    let w = world();
    let config = fanout_config(10);
    let ctx = context(&w.store, &config);

    let card = published_card(&w, "Launch").await;
    w.cards.assign(card.id, w.u1.id, &[w.u2.id]).await.unwrap();
    drain(&w.store, &ctx, &config).await;

    let assigned = w.store.events().pop().unwrap();
    assert_eq!(assigned.action, actions::CARD_ASSIGNED);

    let expected: BTreeSet<Uuid> = [w.u2.id].into_iter().collect();
    assert_eq!(recipients_of(&w.store, assigned.id).await, expected);
}

#[tokio::test]
async fn test_drafts_fan_out_nothing() {
    let w = world();
    let config = fanout_config(10);
    let ctx = context(&w.store, &config);

    let card = w.cards.create_draft(w.board.id, w.u1.id, "Sketch").await.unwrap();
    w.cards.rename(card.id, w.u1.id, "Sketch v2").await.unwrap();

    assert_eq!(drain(&w.store, &ctx, &config).await, 0);
    assert!(w.store.events().is_empty());
    assert_eq!(w.store.notification_count(), 0);
}

#[tokio::test]
async fn test_retried_notify_does_not_duplicate() {
    let w = world();
    w.store.add_board(w.board.clone().with_watchers(vec![w.u1.id, w.watcher.id, w.u2.id]));
    let config = fanout_config(10);
    let ctx = context(&w.store, &config);

    let card = published_card(&w, "Launch").await;
    w.store.fail_notifications_after(1);

    // published, then the notify task fails halfway and runs again
    let runs = drain(&w.store, &ctx, &config).await;
    assert_eq!(runs, 3);

    let published = w.store.events().pop().unwrap();
    assert_eq!(published.eventable.id, card.id);

    let expected: BTreeSet<Uuid> = [w.watcher.id, w.u2.id].into_iter().collect();
    let notifications = w.store.notifications_for_event(published.id).await.unwrap();
    assert_eq!(notifications.len(), 2);
    assert_eq!(recipients_of(&w.store, published.id).await, expected);

    let stats = w.store.stats().await.unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.dead, 0);
}

#[tokio::test]
async fn test_failing_endpoint_is_deactivated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let w = world();
    let hook = w.store.add_webhook(
        Webhook::new(
            w.board.account_id,
            w.board.id,
            "CI",
            format!("{}/hook", server.uri()),
            [actions::CARD_CLOSED],
        )
        .unwrap(),
    );
    let config = fanout_config(1);
    let ctx = context(&w.store, &config);

    let card = published_card(&w, "Launch").await;
    w.cards.close(card.id, w.u1.id).await.unwrap();
    drain(&w.store, &ctx, &config).await;

    let close_event = w.store.events().pop().unwrap();
    let deliveries = w.store.deliveries_for_event(close_event.id).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].state, DeliveryState::Failed);
    assert_eq!(deliveries[0].response_code, Some(500));

    // an HTTP failure is an outcome, not a task failure
    assert_eq!(w.store.stats().await.unwrap().dead, 0);

    let stored = w.store.find_webhook(hook.id).await.unwrap().unwrap();
    assert!(!stored.active);

    // later events skip the inactive webhook
    w.cards.reopen(card.id, w.u1.id).await.unwrap();
    w.cards.close(card.id, w.u1.id).await.unwrap();
    drain(&w.store, &ctx, &config).await;
    assert_eq!(w.store.delivery_count(), 1);
}

#[tokio::test]
async fn test_worker_pool_drains_outbox() {
    let w = world();
    let config = fanout_config(10);
    let ctx = context(&w.store, &config);

    let pool = WorkerPool::new(
        ctx,
        WorkerPoolConfig::default()
            .with_worker_id("pool-test")
            .with_max_concurrency(4)
            .with_poller(
                PollerConfig::default()
                    .with_min_interval(Duration::from_millis(5))
                    .with_max_interval(Duration::from_millis(20)),
            )
            .with_fanout(config),
    );
    pool.start().unwrap();

    let card = published_card(&w, "Launch").await;
    w.cards.close(card.id, w.u1.id).await.unwrap();

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if w.store.stats().await.unwrap().completed == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "pool did not drain the outbox");

    pool.shutdown().await.unwrap();
    assert_eq!(w.store.notification_count(), 2);
}
