use {switchboard_common::SessionId, thiserror::Error};

use crate::state::SessionState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("session not found: {session_id}")]
    NotFound { session_id: SessionId },

    #[error("invalid transition for session {session_id}: {event} not allowed from {from}")]
    InvalidTransition {
        session_id: SessionId,
        from: SessionState,
        event: &'static str,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
    #[must_use]
    pub fn not_found(session_id: &SessionId) -> Self {
        Self::NotFound {
            session_id: session_id.clone(),
        }
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
