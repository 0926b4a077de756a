// PostgreSQL storage for Eventline
//
// `Database` implements every store trait from eventline-core over a single
// connection pool. Idempotency keys (event x user, webhook x event,
// kind x subject) are unique constraints in the schema.

mod event_store;
mod fanout_queue;
pub mod models;
mod notification_store;
pub mod repositories;
pub mod transaction;
mod webhook_store;

pub use repositories::Database;
pub use transaction::PgTransaction;
