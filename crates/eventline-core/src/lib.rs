// Event tracking core
//
// This crate records domain events transactionally and fans them out to
// notifications, webhook deliveries and audit-trail comments.
//
// Key design decisions:
// - Uses traits (EventStore, Transaction, FanoutQueue, ...) for pluggable backends
// - Fanout is scheduled through a transactional outbox: task rows are written
//   with the event and only become claimable after commit
// - Every fanout side effect is keyed (event x user, webhook x event) so tasks
//   can be re-run after a crash
// - Strategy dispatch (notifiers, system comment renderers) goes through
//   registries populated at startup, with documented fallbacks
// - Domain entity types (Card, Comment, Board, User) are defined here

// Domain entity types
pub mod board;
pub mod card;
pub mod comment;
pub mod event;
pub mod notification;
pub mod user;

// Event tracking
pub mod eventable;
pub mod tracker;

// Fanout consumers
pub mod commenter;
pub mod delivery;
pub mod description;
pub mod notifier;
pub mod webhook;

// Outbox and retries
pub mod fanout;
pub mod retry;

pub mod config;
pub mod error;
pub mod memory;
pub mod traits;

pub use board::Board;
pub use card::{Card, CardStatus, Cards};
pub use comment::{Comment, Comments};
pub use commenter::{to_sentence, Names, Renderer, SystemCommenter};
pub use config::FanoutConfig;
pub use delivery::{
    DelinquencyPolicy, DelinquencyTracker, Delivery, DeliveryOutcome, DeliveryState,
};
pub use description::{describe, DescriptionContext};
pub use error::{EventlineError, Result};
pub use event::{
    actions, particulars, particulars_from, sort_chronologically, Event, EventQuery,
    EventRecord, EventScope, EventableKind, EventableRef, EventableSummary, Particulars,
    Preload,
};
pub use eventable::{Eventable, Reactions};
pub use fanout::{
    FanoutKind, FanoutTask, NewFanoutTask, QueueStats, TaskFailureOutcome, TaskStatus,
};
pub use memory::InMemoryStore;
pub use notification::{NewNotification, Notification};
pub use notifier::{
    AssignmentNotifier, BoardWatchersNotifier, CommentNotifier, Notifier, NotifierRegistry,
    PublicationNotifier, QuietNotifier,
};
pub use retry::RetryPolicy;
pub use tracker::EventTracker;
pub use traits::{
    AudienceResolver, EventStore, FanoutQueue, NotificationStore, Transaction, WebhookStore,
};
pub use user::{User, UserRole};
pub use webhook::{
    PayloadBoard, PayloadUser, Webhook, WebhookDispatcher, WebhookPayload, PERMITTED_ACTIONS,
};
