//! Gateway: the HTTP face of the relay.
//!
//! Clients open sessions, post messages, read history, and follow their
//! feed over server-sent events. Backends that can push deliver to the
//! webhook routes. All relay logic lives in `switchboard-relay`; handlers
//! here only translate HTTP to [`switchboard_relay::Switchboard`] calls.

pub mod error;
pub mod routes;
pub mod server;
pub mod state;
pub mod webhook;
