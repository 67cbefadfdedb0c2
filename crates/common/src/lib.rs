//! Shared types, error definitions, and utilities used across all switchboard crates.

pub mod error;
pub mod types;

pub use {
    error::{FromMessage, UnknownBackend},
    types::{
        Attachment, BackendKind, CanonicalMessage, ClientIdentity, Cursor, NoticeLevel, Origin,
        SessionId,
    },
};
