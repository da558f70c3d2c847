//! Postgres backend for `memflow`: [`PgStore`], [`PgStreamBus`], and
//! [`PgJournal`] implementations of the core crate's backend-agnostic
//! traits, plus [`schema::ddl_for_namespace`] for provisioning and
//! [`housekeeping::prune`] for the `N.prune()` maintenance function.
//!
//! Grounded on `seesaw-job-postgres`'s `PgJobStore`: `FOR UPDATE SKIP
//! LOCKED` claiming, one connection pool per process, plain `sqlx::query`
//! with hand-written SQL rather than a query builder or an ORM — the same
//! texture carried over here across three traits instead of one.

mod housekeeping;
mod journal;
pub mod schema;
mod store;
mod stream;

pub use housekeeping::{prune, PruneOptions, PruneReport};
pub use journal::PgJournal;
pub use store::{PgStore, SCALAR_FIELD};
pub use stream::PgStreamBus;
