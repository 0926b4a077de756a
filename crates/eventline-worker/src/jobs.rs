// Fanout job handlers
//
// One handler per outbox task kind. Handlers are idempotent: notify and
// dispatch go through keyed "insert if absent" writes, and deliver skips
// deliveries that already finished. A missing subject (deleted card) is a
// no-op, not a failure.

use std::sync::Arc;

use chrono::Utc;
use eventline_core::{
    AudienceResolver, DelinquencyPolicy, Delivery, EventStore, FanoutConfig, FanoutKind,
    FanoutQueue, FanoutTask, NotificationStore, NotifierRegistry, Result, WebhookDispatcher,
    WebhookPayload, WebhookStore,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::transport::WebhookTransport;

/// What a handler did with its task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Notified { recipients: usize },
    Dispatched { deliveries: usize },
    Delivered { delivery_id: Uuid, succeeded: bool },
    /// Subject no longer exists or was already handled
    Skipped,
}

/// Everything fanout handlers need, behind the store traits
#[derive(Clone)]
pub struct FanoutContext {
    pub events: Arc<dyn EventStore>,
    pub audience: Arc<dyn AudienceResolver>,
    pub notifications: Arc<dyn NotificationStore>,
    pub webhooks: Arc<dyn WebhookStore>,
    pub queue: Arc<dyn FanoutQueue>,
    pub registry: Arc<NotifierRegistry>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub transport: Arc<dyn WebhookTransport>,
    pub delinquency: DelinquencyPolicy,
}

impl FanoutContext {
    /// Build a context where one store backs every trait
    pub fn from_store<S>(
        store: Arc<S>,
        transport: Arc<dyn WebhookTransport>,
        config: &FanoutConfig,
    ) -> Self
    where
        S: EventStore
            + AudienceResolver
            + NotificationStore
            + WebhookStore
            + FanoutQueue
            + 'static,
    {
        Self {
            events: store.clone(),
            audience: store.clone(),
            notifications: store.clone(),
            webhooks: store.clone(),
            queue: store,
            registry: Arc::new(NotifierRegistry::default()),
            dispatcher: Arc::new(config.dispatcher()),
            transport,
            delinquency: config.delinquency.clone(),
        }
    }

    pub fn with_registry(mut self, registry: NotifierRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Run the handler for a claimed task
    pub async fn run(&self, task: &FanoutTask) -> Result<JobOutcome> {
        match task.kind {
            FanoutKind::Notify => self.notify(task.subject_id).await,
            FanoutKind::DispatchWebhooks => self.dispatch(task.subject_id).await,
            FanoutKind::DeliverWebhook => self.deliver(task.subject_id).await,
        }
    }

    /// Write one notification per recipient of the event
    #[instrument(skip(self))]
    pub async fn notify(&self, event_id: Uuid) -> Result<JobOutcome> {
        let Some(event) = self.events.find_event(event_id).await? else {
            warn!("event is gone, skipping notifications");
            return Ok(JobOutcome::Skipped);
        };

        let notifications = self
            .registry
            .notify_recipients(&event, self.audience.as_ref(), self.notifications.as_ref())
            .await?;

        Ok(JobOutcome::Notified {
            recipients: notifications.len(),
        })
    }

    /// Create deliveries for matching webhook subscriptions
    #[instrument(skip(self))]
    pub async fn dispatch(&self, event_id: Uuid) -> Result<JobOutcome> {
        let Some(event) = self.events.find_event(event_id).await? else {
            warn!("event is gone, skipping webhook dispatch");
            return Ok(JobOutcome::Skipped);
        };

        let deliveries = self
            .dispatcher
            .dispatch_webhooks(&event, self.webhooks.as_ref(), self.queue.as_ref())
            .await?;

        Ok(JobOutcome::Dispatched {
            deliveries: deliveries.len(),
        })
    }

    /// Send one delivery and fold its outcome into the delinquency tracker
    ///
    /// HTTP failures are recorded and the task completes; only storage
    /// errors propagate and trigger a retry.
    #[instrument(skip(self))]
    pub async fn deliver(&self, delivery_id: Uuid) -> Result<JobOutcome> {
        let Some(mut delivery) = self.webhooks.find_delivery(delivery_id).await? else {
            warn!("delivery is gone, skipping");
            return Ok(JobOutcome::Skipped);
        };
        if delivery.state.is_finished() {
            debug!(state = delivery.state.as_str(), "delivery already finished");
            return Ok(JobOutcome::Skipped);
        }

        let Some(webhook) = self.webhooks.find_webhook(delivery.webhook_id).await? else {
            warn!(webhook_id = %delivery.webhook_id, "webhook is gone, skipping delivery");
            return Ok(JobOutcome::Skipped);
        };
        if !webhook.active {
            debug!(webhook_id = %webhook.id, "webhook is inactive, skipping delivery");
            delivery.skip("webhook is inactive");
            self.webhooks.update_delivery(&delivery).await?;
            return Ok(JobOutcome::Skipped);
        }

        let Some(event) = self.events.find_event(delivery.event_id).await? else {
            warn!(event_id = %delivery.event_id, "event is gone, skipping delivery");
            return Ok(JobOutcome::Skipped);
        };
        let board = self.audience.find_board(event.board_id).await?;
        let creator = self.audience.find_user(event.creator_id).await?;
        let payload = WebhookPayload::new(&event, board.as_ref(), creator.as_ref());

        delivery.start();
        self.webhooks.update_delivery(&delivery).await?;

        let outcome = self.transport.deliver(&webhook, &delivery, &payload).await;
        delivery.finish(&outcome);
        self.webhooks.update_delivery(&delivery).await?;

        self.track_delinquency(&delivery, &outcome).await?;

        Ok(JobOutcome::Delivered {
            delivery_id: delivery.id,
            succeeded: outcome.is_success(),
        })
    }

    async fn track_delinquency(
        &self,
        delivery: &Delivery,
        outcome: &eventline_core::DeliveryOutcome,
    ) -> Result<()> {
        let now = Utc::now();
        let tracker = self
            .webhooks
            .record_delivery_outcome(delivery.webhook_id, outcome, now)
            .await?;

        if tracker.is_delinquent(&self.delinquency, now) {
            self.webhooks.deactivate_webhook(delivery.webhook_id).await?;
            info!(
                webhook_id = %delivery.webhook_id,
                consecutive_failures = tracker.consecutive_failures,
                "deactivated delinquent webhook"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use eventline_core::{
        actions, Board, Card, DeliveryOutcome, DeliveryState, Event, EventableRef,
        InMemoryStore, Particulars, Transaction, User, Webhook,
    };
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Barrier;

    /// Transport that replays a fixed outcome and records what it sent
    struct Recorder {
        outcome: DeliveryOutcome,
        sent: Mutex<Vec<WebhookPayload>>,
    }

    impl Recorder {
        fn new(outcome: DeliveryOutcome) -> Self {
            Self {
                outcome,
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    /// Transport that holds every request until `parties` are in flight
    struct Gate {
        barrier: Barrier,
        outcome: DeliveryOutcome,
    }

    #[async_trait]
    impl WebhookTransport for Gate {
        async fn deliver(
            &self,
            _webhook: &Webhook,
            _delivery: &Delivery,
            _payload: &WebhookPayload,
        ) -> DeliveryOutcome {
            self.barrier.wait().await;
            self.outcome.clone()
        }
    }

    #[async_trait]
    impl WebhookTransport for Recorder {
        async fn deliver(
            &self,
            _webhook: &Webhook,
            _delivery: &Delivery,
            payload: &WebhookPayload,
        ) -> DeliveryOutcome {
            self.sent.lock().unwrap().push(payload.clone());
            self.outcome.clone()
        }
    }

    struct Fixture {
        store: InMemoryStore,
        board: Board,
        actor: User,
        event: Event,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let account_id = Uuid::now_v7();
        let actor = store.add_user(User::member(account_id, "Ada"));
        let board = store.add_board(Board::new(account_id, "Roadmap"));
        let card = store.add_card(Card::draft(account_id, board.id, actor.id, "Launch"));

        let event = Event::new(
            account_id,
            board.id,
            actor.id,
            EventableRef::card(card.id),
            actions::CARD_CLOSED,
            Particulars::new(),
        );
        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&event).await.unwrap();
        tx.commit().await.unwrap();

        Fixture {
            store,
            board,
            actor,
            event,
        }
    }

    fn context(store: &InMemoryStore, transport: Arc<Recorder>, threshold: u32) -> FanoutContext {
        let mut config = FanoutConfig::default();
        config.delinquency = DelinquencyPolicy {
            threshold,
            window: Duration::ZERO,
        };
        FanoutContext::from_store(Arc::new(store.clone()), transport, &config)
    }

    fn webhook(f: &Fixture) -> Webhook {
        f.store.add_webhook(
            Webhook::new(
                f.board.account_id,
                f.board.id,
                "CI",
                "https://example.com/hook",
                [actions::CARD_CLOSED],
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_deliver_success_records_state_and_payload() {
        let f = fixture().await;
        let hook = webhook(&f);
        let transport = Arc::new(Recorder::new(DeliveryOutcome::Responded { status: 204 }));
        let ctx = context(&f.store, transport.clone(), 10);

        let delivery = f.store.ensure_delivery(hook.id, f.event.id).await.unwrap();
        let outcome = ctx.deliver(delivery.id).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Delivered {
                delivery_id: delivery.id,
                succeeded: true
            }
        );

        let stored = f.store.find_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::Succeeded);
        assert_eq!(stored.response_code, Some(204));

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].action, actions::CARD_CLOSED);
        assert_eq!(sent[0].board.name.as_deref(), Some("Roadmap"));
        assert_eq!(sent[0].creator.name.as_deref(), Some(f.actor.name.as_str()));
    }

    #[tokio::test]
    async fn test_deliver_is_skipped_once_finished() {
        let f = fixture().await;
        let hook = webhook(&f);
        let transport = Arc::new(Recorder::new(DeliveryOutcome::Responded { status: 200 }));
        let ctx = context(&f.store, transport.clone(), 10);

        let delivery = f.store.ensure_delivery(hook.id, f.event.id).await.unwrap();
        ctx.deliver(delivery.id).await.unwrap();
        assert_eq!(ctx.deliver(delivery.id).await.unwrap(), JobOutcome::Skipped);
        assert_eq!(transport.sent(), 1);
    }

    #[tokio::test]
    async fn test_failures_deactivate_delinquent_webhook() {
        let f = fixture().await;
        let hook = webhook(&f);
        let transport = Arc::new(Recorder::new(DeliveryOutcome::Errored(
            "failed to connect".to_string(),
        )));
        let ctx = context(&f.store, transport, 2);

        let first = f.store.ensure_delivery(hook.id, f.event.id).await.unwrap();
        ctx.deliver(first.id).await.unwrap();
        assert!(f.store.find_webhook(hook.id).await.unwrap().unwrap().active);

        let second_event = Event::new(
            f.board.account_id,
            f.board.id,
            f.actor.id,
            f.event.eventable,
            actions::CARD_CLOSED,
            Particulars::new(),
        );
        let mut tx = f.store.begin().await.unwrap();
        tx.insert_event(&second_event).await.unwrap();
        tx.commit().await.unwrap();

        let second = f
            .store
            .ensure_delivery(hook.id, second_event.id)
            .await
            .unwrap();
        ctx.deliver(second.id).await.unwrap();

        let stored = f.store.find_delivery(second.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::Errored);
        assert_eq!(stored.error.as_deref(), Some("failed to connect"));
        assert!(!f.store.find_webhook(hook.id).await.unwrap().unwrap().active);
    }

    async fn another_event(f: &Fixture) -> Event {
        let event = Event::new(
            f.board.account_id,
            f.board.id,
            f.actor.id,
            f.event.eventable,
            actions::CARD_CLOSED,
            Particulars::new(),
        );
        let mut tx = f.store.begin().await.unwrap();
        tx.insert_event(&event).await.unwrap();
        tx.commit().await.unwrap();
        event
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_all_counted() {
        let f = fixture().await;
        let hook = webhook(&f);
        let transport = Arc::new(Gate {
            barrier: Barrier::new(2),
            outcome: DeliveryOutcome::Responded { status: 500 },
        });
        let mut config = FanoutConfig::default();
        config.delinquency = DelinquencyPolicy {
            threshold: 2,
            window: Duration::ZERO,
        };
        let ctx = FanoutContext::from_store(Arc::new(f.store.clone()), transport, &config);

        let second_event = another_event(&f).await;
        let first = f.store.ensure_delivery(hook.id, f.event.id).await.unwrap();
        let second = f.store.ensure_delivery(hook.id, second_event.id).await.unwrap();

        let (a, b) = tokio::join!(ctx.deliver(first.id), ctx.deliver(second.id));
        a.unwrap();
        b.unwrap();

        let tracker = f.store.delinquency(hook.id).await.unwrap();
        assert_eq!(tracker.consecutive_failures, 2);
        assert!(!f.store.find_webhook(hook.id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_inactive_webhook_marks_delivery_skipped() {
        let f = fixture().await;
        let hook = webhook(&f);
        let transport = Arc::new(Recorder::new(DeliveryOutcome::Responded { status: 200 }));
        let ctx = context(&f.store, transport.clone(), 10);

        let delivery = f.store.ensure_delivery(hook.id, f.event.id).await.unwrap();
        f.store.deactivate_webhook(hook.id).await.unwrap();

        assert_eq!(ctx.deliver(delivery.id).await.unwrap(), JobOutcome::Skipped);
        assert_eq!(transport.sent(), 0);

        let stored = f.store.find_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::Skipped);
        assert_eq!(stored.error.as_deref(), Some("webhook is inactive"));
    }

    #[tokio::test]
    async fn test_missing_subjects_are_skipped() {
        let f = fixture().await;
        let transport = Arc::new(Recorder::new(DeliveryOutcome::Responded { status: 200 }));
        let ctx = context(&f.store, transport, 10);

        assert_eq!(ctx.notify(Uuid::now_v7()).await.unwrap(), JobOutcome::Skipped);
        assert_eq!(ctx.dispatch(Uuid::now_v7()).await.unwrap(), JobOutcome::Skipped);
        assert_eq!(ctx.deliver(Uuid::now_v7()).await.unwrap(), JobOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_dispatch_enqueues_delivery_tasks() {
        let f = fixture().await;
        webhook(&f);
        let transport = Arc::new(Recorder::new(DeliveryOutcome::Responded { status: 200 }));
        let ctx = context(&f.store, transport, 10);

        assert_eq!(
            ctx.dispatch(f.event.id).await.unwrap(),
            JobOutcome::Dispatched { deliveries: 1 }
        );
        assert_eq!(
            ctx.dispatch(f.event.id).await.unwrap(),
            JobOutcome::Dispatched { deliveries: 1 }
        );
        assert_eq!(f.store.delivery_count(), 1);

        let claimed = f
            .store
            .claim("w", &[FanoutKind::DeliverWebhook], 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }
}
