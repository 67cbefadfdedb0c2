//! Session registry, dedup cache, and SQLite transcript storage.
//!
//! The registry owns every session's state machine; nothing else mutates
//! session state directly.

pub mod dedup;
pub mod error;
pub mod registry;
pub mod sqlite_store;
pub mod state;

pub use {
    dedup::DedupCache,
    error::{Error, Result},
    registry::{Session, SessionRegistry},
    sqlite_store::SqliteMessageStore,
    state::{SessionEvent, SessionState, next_state},
};

/// Run database migrations for the transcript table.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
