//! Push fan-in: one subscription per (session, backend reference), feeding
//! the ingestor until the session's token is cancelled.

use std::sync::Arc;

use {
    futures::StreamExt,
    switchboard_channels::{PushChannel, routing_key},
    switchboard_common::{BackendKind, SessionId},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    error::{Error, Result},
    ingest::Ingestor,
};

/// Subscribe to `reference`'s routing key and spawn the forwarding task.
/// A failed ingest is logged and skipped; the poll path is the backstop.
pub async fn attach(
    push: &Arc<dyn PushChannel>,
    ingestor: &Arc<Ingestor>,
    backend: BackendKind,
    session_id: &SessionId,
    reference: &str,
    token: CancellationToken,
) -> Result<()> {
    let key = routing_key(reference);
    let mut stream = push
        .subscribe(&key)
        .await
        .map_err(|e| Error::backend("push", e))?;
    debug!(session_id = %session_id, backend = %backend, routing_key = %key, "push subscription attached");

    let ingestor = Arc::clone(ingestor);
    let session_id = session_id.clone();
    tokio::spawn(async move {
        loop {
            let raw = tokio::select! {
                () = token.cancelled() => break,
                next = stream.next() => match next {
                    Some(raw) => raw,
                    None => break,
                },
            };
            if let Err(e) = ingestor.ingest(backend, &raw, Some(&session_id)).await {
                warn!(session_id = %session_id, backend = %backend, error = %e, "push ingest failed");
            }
        }
        debug!(session_id = %session_id, routing_key = %key, "push subscription closed");
    });
    Ok(())
}
