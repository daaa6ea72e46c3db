//! One long-lived WebSocket client: decode request frames, drive session
//! operations, and batch server events into periodic update frames.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::deltautil::delta_to_string;
use crate::ot::{Event, ServerUpdate};
use crate::protocol::{Request, Selection, Update};
use crate::session::{Session, META_FILE_ID};

const DRAIN_TIMEOUT_FLOOR: Duration = Duration::from_millis(10);
const DRAIN_TIMEOUT_CEILING: Duration = Duration::from_secs(10);

/// A selection waiting to be delivered exactly once. Selections into
/// freshly created windows wait until the window's content update has
/// been flushed so the client can apply them.
struct PendingSelection {
    selection: Selection,
    wait_for_update: bool,
}

pub async fn serve(
    socket: WebSocket,
    session: Arc<Session>,
    client_id: Uuid,
    mut events: mpsc::UnboundedReceiver<Event>,
    mut flush: mpsc::Receiver<()>,
) -> Result<()> {
    debug!(%client_id, "serving connection");
    let (mut sink, mut stream) = socket.split();

    let mut buffered: HashMap<u32, ServerUpdate> = HashMap::new();
    let mut pending: Option<PendingSelection> = None;
    let mut timeout = DRAIN_TIMEOUT_FLOOR;
    let mut deadline = tokio::time::Instant::now() + timeout;

    loop {
        // Events only buffer; frames go out on the drain timer, after a
        // request, or on a flush signal.
        let mut drain = true;
        tokio::select! {
            message = stream.next() => {
                let Some(message) = message else {
                    return Ok(());
                };
                match message.context("websocket receive failed")? {
                    Message::Text(payload) => {
                        match serde_json::from_str::<Request>(payload.as_str()) {
                            Ok(request) => {
                                if let Some(selection) =
                                    handle_request(&session, client_id, request).await
                                {
                                    pending = Some(selection);
                                }
                            }
                            Err(error) => {
                                warn!(%error, "error unmarshaling message");
                            }
                        }
                        timeout = DRAIN_TIMEOUT_FLOOR;
                        deadline = tokio::time::Instant::now() + timeout;
                    }
                    Message::Close(_) => return Ok(()),
                    _ => drain = false,
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    // The OT server shut down; nothing more to deliver.
                    return Ok(());
                };
                for update in event.updates {
                    buffered.insert(update.id, update);
                }
                drain = false;
            }
            _ = flush.recv() => {
                timeout = DRAIN_TIMEOUT_FLOOR;
                deadline = tokio::time::Instant::now() + timeout;
            }
            _ = tokio::time::sleep_until(deadline) => {
                timeout = (timeout * 2).min(DRAIN_TIMEOUT_CEILING);
                deadline = tokio::time::Instant::now() + timeout;
            }
        }
        if !drain {
            continue;
        }

        let frame = build_frame(&session, &mut buffered, &mut pending).await;
        if let Some(frame) = frame {
            let encoded =
                serde_json::to_string(&frame).context("failed to serialize update frame")?;
            sink.send(Message::Text(encoded.into()))
                .await
                .context("websocket send failed")?;
        }
    }
}

async fn handle_request(
    session: &Arc<Session>,
    client_id: Uuid,
    request: Request,
) -> Option<PendingSelection> {
    if !request.acks.is_empty() {
        session.server.acks(client_id, request.acks).await;
    }
    if !request.changes.is_empty() {
        if let Err(error) = session.apply_changes(client_id, request.changes).await {
            warn!(%error, "error applying changes");
        }
    }
    let action = request.action?;
    match session.execute(client_id, &action).await {
        Ok((Some(selection), created)) => Some(PendingSelection {
            selection,
            wait_for_update: created,
        }),
        Ok((None, _)) => None,
        Err(error) => {
            warn!(%error, "error executing action");
            None
        }
    }
}

/// Drain buffered updates into one frame. Returns `None` when there is
/// nothing to send this tick.
async fn build_frame(
    session: &Arc<Session>,
    buffered: &mut HashMap<u32, ServerUpdate>,
    pending: &mut Option<PendingSelection>,
) -> Option<Update> {
    let updates: HashMap<u32, ServerUpdate> = std::mem::take(buffered);

    let selection = match pending.take() {
        Some(entry) => {
            if !entry.wait_for_update || updates.contains_key(&entry.selection.id) {
                Some(entry.selection)
            } else {
                // Not flushed yet: hold it for a later frame.
                *pending = Some(entry);
                None
            }
        }
        None => None,
    };

    if updates.is_empty() && selection.is_none() {
        return None;
    }

    let hashes = if session.config.verify_content && !updates.is_empty() {
        Some(content_hashes(session, &updates).await)
    } else {
        None
    };

    Some(Update {
        updates,
        hashes,
        selection,
    })
}

/// SHA-256 over each updated document's current committed text, skipped
/// when the document has moved past the buffered version. Non-metafile
/// documents get a trailing newline to match the editor's convention.
async fn content_hashes(
    session: &Arc<Session>,
    updates: &HashMap<u32, ServerUpdate>,
) -> HashMap<u32, String> {
    let mut hashes = HashMap::new();
    for (file_id, update) in updates {
        let Some(latest) = session.server.content(*file_id).await else {
            continue;
        };
        if latest.version != update.version {
            continue;
        }
        let mut content = delta_to_string(&latest.delta, false);
        if *file_id != META_FILE_ID {
            content.push('\n');
        }
        hashes.insert(*file_id, sha256_hex(content.as_bytes()));
    }
    hashes
}

fn sha256_hex(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
