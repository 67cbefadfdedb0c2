//! Collaborator interfaces the relay core calls.
//!
//! Each upstream (assistant transport, agent transport, push fan-in,
//! transcript store) is a trait here; concrete HTTP clients live in their
//! own crates and the in-process implementations live next to the traits.

pub mod backend;
pub mod error;
pub mod push;
pub mod store;

pub use {
    backend::{
        AgentBackend, AssistantBackend, ContextPayload, ConversationRef, PollFilter, PollPage,
        Token, TranscriptEntry,
    },
    error::{BackendError, Error, Result, with_timeout},
    push::{BroadcastPushChannel, PushChannel, PushStream, routing_key},
    store::{InMemoryMessageStore, MessageStore, transcript_order},
};
