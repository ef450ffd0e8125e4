//! services/api/src/web/mutation_task.rs
//!
//! This module contains the asynchronous "worker" function that carries one
//! optimistic selection change through to the store.

use crate::error::ApiError;
use crate::web::{
    protocol::{EditorSnapshot, ServerMessage},
    state::Outbox,
};
use driving_school_core::{AssociationReconciler, PendingMutation, SelectionState};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Commits `mutation`, settles the outcome into the editor and tells the client.
///
/// The selection lock is only held while settling, so mutations for other
/// items keep running while this one waits on the store. The resulting state
/// is queued before the lock is released.
pub async fn mutation_process(
    reconciler: AssociationReconciler,
    selection: Arc<Mutex<SelectionState>>,
    outbox: Outbox,
    mutation: PendingMutation,
) -> Result<(), ApiError> {
    let item_id = mutation.item().id;
    let kind = mutation.kind();

    let outcome = reconciler.commit(&mutation).await;

    let mut selection = selection.lock().await;
    match selection.settle(mutation, outcome) {
        Ok(()) => info!("Item {} {} confirmed.", item_id, kind),
        Err(e) => {
            error!("Item {} {} failed: {}", item_id, kind, e);
            send_message(
                &outbox,
                ServerMessage::MutationFailed {
                    item_id: item_id.0,
                    action: kind.to_string(),
                    message: e.to_string(),
                },
            )?;
        }
    }
    send_state(&outbox, &selection)
}

/// Queues one message for the client.
pub fn send_message(outbox: &Outbox, msg: ServerMessage) -> Result<(), ApiError> {
    outbox.send(msg).map_err(|_| ApiError::ConnectionClosed)
}

/// Queues the full editor state. Call it while holding the selection lock.
pub fn send_state(outbox: &Outbox, selection: &SelectionState) -> Result<(), ApiError> {
    send_message(outbox, ServerMessage::State(EditorSnapshot::from(selection)))
}
