//! Session relay core.
//!
//! Every inbound message, pushed or polled, goes through one path:
//! [`normalize`] turns the raw payload into a canonical message,
//! [`ingest`] binds it to a session, stores it and drops duplicates, and
//! [`publisher`] fans it out in timestamp order. [`reconciler`] runs the
//! poll loops, [`handoff`] moves sessions from the assistant to a live
//! agent, and [`Switchboard`] ties it all together.

pub mod error;
pub mod fanin;
pub mod handoff;
pub mod ingest;
pub mod normalize;
pub mod orphan;
pub mod poll;
pub mod publisher;
pub mod reconciler;
pub mod switchboard;

pub use {
    error::{Error, Result},
    handoff::{HandoffDetector, HandoffOutcome, extract_agent_session, is_trigger},
    ingest::{ControlEvent, IngestOutcome, Ingestor},
    normalize::{Normalized, NormalizedMessage, Normalizer, SkipReason},
    publisher::{MessageStream, PublishOutcome, Publisher},
    reconciler::{BackoffPolicy, Reconciler},
    switchboard::{Collaborators, RelayStats, Switchboard},
};
