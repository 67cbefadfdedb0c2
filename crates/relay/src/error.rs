use {
    switchboard_common::SessionId,
    switchboard_sessions::SessionState,
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] switchboard_sessions::Error),

    /// A backend call failed or timed out.
    #[error("{backend} backend: {source}")]
    Backend {
        backend: &'static str,
        #[source]
        source: switchboard_channels::Error,
    },

    #[error("no session for inbound reference {reference}")]
    UnknownSession { reference: String },

    #[error("handoff could not be established: {reason}")]
    HandoffEstablishFailed { reason: String },

    /// The session is not in a state that accepts client messages.
    #[error("session {session_id} cannot route messages while {state}")]
    NotRoutable {
        session_id: SessionId,
        state: SessionState,
    },

    #[error("message store: {0}")]
    Store(#[source] switchboard_channels::Error),
}

impl Error {
    #[must_use]
    pub fn backend(backend: &'static str, source: switchboard_channels::Error) -> Self {
        Self::Backend { backend, source }
    }

    #[must_use]
    pub fn handoff_failed(reason: impl std::fmt::Display) -> Self {
        Self::HandoffEstablishFailed {
            reason: reason.to_string(),
        }
    }

    /// `true` for the session-registry `NotFound` case.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Session(switchboard_sessions::Error::NotFound { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
