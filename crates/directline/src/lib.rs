//! Direct Line v3 client: the assistant side of a switchboard session.
//!
//! A session gets one Direct Line conversation. The relay mints a token
//! with the configured secret, starts a conversation with it, then posts
//! client text and polls activities with the conversation-scoped token.

mod client;
mod http;

pub use client::DirectLineClient;
