//! ServiceNow Virtual Agent client: the live-agent side of a session.
//!
//! Sessions are opened and messages posted through the bot-integration
//! endpoint; agent replies are read back from the `sys_cs_message` table.

mod client;
mod http;
mod query;

pub use client::ServiceNowClient;
