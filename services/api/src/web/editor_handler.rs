//! services/api/src/web/editor_handler.rs
//!
//! This is the main entry point and control loop for a lesson item editor
//! connection. It owns the editor's selection state and delegates remote
//! mutations to background tasks.
//!
//! Everything sent to the client goes through the connection's [`Outbox`].
//! State snapshots are queued while the selection lock is held, so the last
//! snapshot the client receives always reflects the latest state.

use crate::error::ApiError;
use crate::web::{
    mutation_task::{mutation_process, send_message, send_state},
    protocol::{ClientMessage, ServerMessage},
    state::{AppState, EditorSession, Outbox},
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use driving_school_core::{ItemId, LessonId, PendingMutation, SelectionRejected, SelectionState};
use futures::{
    future,
    stream::{SplitSink, SplitStream, Stream, StreamExt},
    SinkExt,
};
use std::sync::Arc;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

/// The handler for upgrading HTTP requests to editor WebSocket connections.
pub async fn editor_ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Path(lesson_id): Path<i64>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, LessonId(lesson_id)))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, lesson_id: LessonId) {
    info!("New editor connection established for lesson: {}", lesson_id);

    let (sink, stream) = socket.split();
    let (outbox, outgoing) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_outbox(sink, outgoing));
    let mut incoming = client_messages(stream);

    match load_session(&app_state, lesson_id, &outbox, &mut incoming).await {
        Some(session) => run_session(session, &outbox, &mut incoming).await,
        None => info!("Editor connection for lesson {} closed before loading.", lesson_id),
    }

    // Once the last sender is gone the writer flushes what is left and stops.
    drop(outbox);
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Editor writer for lesson {} stopped: {:?}", lesson_id, e),
        Err(e) => error!("Editor writer for lesson {} panicked: {}", lesson_id, e),
    }
    info!("Editor connection for lesson {} closed.", lesson_id);
}

/// Serializes queued messages onto the socket, in queue order.
async fn write_outbox(
    mut sink: SplitSink<WebSocket, Message>,
    mut outgoing: UnboundedReceiver<ServerMessage>,
) -> Result<(), ApiError> {
    while let Some(msg) = outgoing.recv().await {
        let json = serde_json::to_string(&msg)
            .map_err(|e| ApiError::Internal(format!("Failed to serialize message: {}", e)))?;
        sink.send(Message::Text(json.into())).await?;
    }
    Ok(())
}

/// Decodes the client's text frames. Ends at a close frame or a socket error.
fn client_messages(stream: SplitStream<WebSocket>) -> impl Stream<Item = ClientMessage> + Unpin {
    stream
        .take_while(|frame| {
            let open = match frame {
                Ok(Message::Close(_)) => {
                    info!("Client sent close message.");
                    false
                }
                Err(e) => {
                    warn!("Editor connection error: {}", e);
                    false
                }
                Ok(_) => true,
            };
            future::ready(open)
        })
        .filter_map(|frame| {
            let msg = match frame {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(msg) => Some(msg),
                        Err(e) => {
                            warn!("Failed to deserialize client message: {}", e);
                            None
                        }
                    }
                }
                _ => None,
            };
            future::ready(msg)
        })
}

/// Loads the editor, reporting failures and waiting for `retry` until it succeeds.
///
/// Returns `None` if the client goes away first.
pub async fn load_session<S>(
    app_state: &AppState,
    lesson_id: LessonId,
    outbox: &Outbox,
    incoming: &mut S,
) -> Option<EditorSession>
where
    S: Stream<Item = ClientMessage> + Unpin,
{
    loop {
        let e = match EditorSession::new(app_state, lesson_id).await {
            Ok(session) => return Some(session),
            Err(e) => e,
        };
        error!("Failed to load editor: {}", e);
        let msg = ServerMessage::LoadFailed {
            lesson_id: lesson_id.0,
            message: e.to_string(),
        };
        if send_message(outbox, msg).is_err() {
            return None;
        }

        // Block editing until the client asks to retry.
        loop {
            match incoming.next().await {
                Some(ClientMessage::Retry) => break,
                Some(other) => {
                    warn!("Ignoring {:?} while the editor is not loaded.", other);
                    let msg = ServerMessage::Rejected {
                        reason: "Editor is not loaded".to_string(),
                    };
                    if send_message(outbox, msg).is_err() {
                        return None;
                    }
                }
                None => return None,
            }
        }
        info!("Retrying editor load for lesson {}.", lesson_id);
    }
}

/// Serves a loaded editor until the client stops sending.
///
/// Mutations still in flight when the client leaves are waited for, so every
/// optimistic change is either confirmed or rolled back before returning.
pub async fn run_session<S>(session: EditorSession, outbox: &Outbox, incoming: &mut S)
where
    S: Stream<Item = ClientMessage> + Unpin,
{
    if send_state(outbox, &*session.selection.lock().await).is_err() {
        return;
    }

    let mut mutations: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            // Reap finished mutation tasks so the set does not grow unbounded.
            Some(_) = mutations.join_next(), if !mutations.is_empty() => {}
            msg = incoming.next() => match msg {
                Some(msg) => handle_client_message(msg, &session, outbox, &mut mutations).await,
                None => {
                    info!("Client disconnected.");
                    break;
                }
            }
        }
    }

    if !mutations.is_empty() {
        info!(
            "Waiting for {} in-flight mutations on lesson {}.",
            mutations.len(),
            session.lesson_id
        );
    }
    while let Some(joined) = mutations.join_next().await {
        if let Err(e) = joined {
            error!("Mutation task failed: {}", e);
        }
    }
}

/// Helper function to handle the logic for different `ClientMessage` variants.
async fn handle_client_message(
    msg: ClientMessage,
    session: &EditorSession,
    outbox: &Outbox,
    mutations: &mut JoinSet<()>,
) {
    let result = match msg {
        ClientMessage::Select { item_id } => {
            let mut selection = session.selection.lock().await;
            let begun = selection.begin_select(ItemId(item_id));
            start_mutation(begun, &selection, session, outbox, mutations)
        }
        ClientMessage::Unselect { item_id } => {
            let mut selection = session.selection.lock().await;
            let begun = selection.begin_unselect(ItemId(item_id));
            start_mutation(begun, &selection, session, outbox, mutations)
        }
        ClientMessage::Backspace => {
            let mut selection = session.selection.lock().await;
            match selection.begin_remove_last() {
                // Nothing to remove; not reported to the client.
                Err(SelectionRejected::QueryNotEmpty | SelectionRejected::NothingSelected) => {
                    Ok(())
                }
                begun => start_mutation(begun, &selection, session, outbox, mutations),
            }
        }
        ClientMessage::SetQuery { query } => {
            let mut selection = session.selection.lock().await;
            selection.set_query(query.unwrap_or_default());
            send_state(outbox, &selection)
        }
        ClientMessage::Refresh => {
            let ticket = session.selection.lock().await.begin_refresh();
            let fetched = session.reconciler.fetch(session.lesson_id).await;
            let mut selection = session.selection.lock().await;
            match fetched {
                Ok(snapshot) => {
                    selection.resync(ticket, snapshot);
                    send_state(outbox, &selection)
                }
                Err(e) => {
                    selection.abandon_refresh(ticket);
                    error!("Failed to refresh editor: {}", e);
                    let msg = ServerMessage::Error {
                        message: e.to_string(),
                    };
                    send_message(outbox, msg)
                }
            }
        }
        ClientMessage::Retry => {
            warn!("Received Retry for an editor that is already loaded, which is ignored.");
            Ok(())
        }
    };

    report_send_failure(result);
}

/// Queues the optimistic state and hands the remote call to a background task.
///
/// `selection` is the locked state `begun` came from; the task cannot settle
/// before the lock is released, so the optimistic state is always queued first.
fn start_mutation(
    begun: Result<PendingMutation, SelectionRejected>,
    selection: &SelectionState,
    session: &EditorSession,
    outbox: &Outbox,
    mutations: &mut JoinSet<()>,
) -> Result<(), ApiError> {
    let mutation = match begun {
        Ok(mutation) => mutation,
        Err(rejected) => {
            warn!("Rejected editor action: {}", rejected);
            let msg = ServerMessage::Rejected {
                reason: rejected.to_string(),
            };
            return send_message(outbox, msg);
        }
    };
    info!(
        "Item {} {} applied locally, committing.",
        mutation.item().id,
        mutation.kind()
    );
    let sent = send_state(outbox, selection);

    let reconciler = session.reconciler.clone();
    let task_selection = session.selection.clone();
    let task_outbox = outbox.clone();
    mutations.spawn(async move {
        let result = mutation_process(reconciler, task_selection, task_outbox, mutation).await;
        report_send_failure(result);
    });

    sent
}

fn report_send_failure(result: Result<(), ApiError>) {
    match result {
        Ok(()) => {}
        // The client left; the state was still updated.
        Err(ApiError::ConnectionClosed) => debug!("Editor connection closed, message dropped."),
        Err(e) => error!("Failed to answer client message: {:?}", e),
    }
}
