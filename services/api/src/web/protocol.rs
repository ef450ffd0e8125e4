//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the browser's lesson item
//! editor and the API server.

use driving_school_core::{LessonItem, SelectionState};
use serde::{Deserialize, Serialize};

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// The user picked an item from the picklist.
    Select { item_id: i64 },

    /// The user removed a chip.
    Unselect { item_id: i64 },

    /// The search input changed. An absent query clears the filter.
    SetQuery {
        #[serde(default)]
        query: Option<String>,
    },

    /// Backspace was pressed in the search input.
    Backspace,

    /// Reload the catalog and associations from the store.
    Refresh,

    /// Try loading again after a `load_failed`.
    Retry,
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The full editor state. Sent after every change, optimistic or settled.
    State(EditorSnapshot),

    /// The editor could not be loaded. Editing stays blocked until a `retry` succeeds.
    LoadFailed { lesson_id: i64, message: String },

    /// A create/delete was refused by the store and the item was rolled back.
    MutationFailed {
        item_id: i64,
        action: String,
        message: String,
    },

    /// The request does not apply to the current state and was ignored.
    Rejected { reason: String },

    /// Reports a non-fatal error to the client.
    Error { message: String },
}

/// One item as rendered by the editor.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ItemView {
    pub id: i64,
    pub title: String,
    /// A change to this item is waiting for the store; its control should be disabled.
    pub pending: bool,
}

impl ItemView {
    fn new(item: &LessonItem, state: &SelectionState) -> Self {
        Self {
            id: item.id.0,
            title: item.title.clone(),
            pending: state.is_pending(item.id),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct EditorSnapshot {
    pub lesson_id: i64,
    /// Chips, in insertion order.
    pub selected: Vec<ItemView>,
    /// Unselected items matching `query`, sorted by id.
    pub picklist: Vec<ItemView>,
    pub query: String,
}

impl From<&SelectionState> for EditorSnapshot {
    fn from(state: &SelectionState) -> Self {
        Self {
            lesson_id: state.lesson_id().0,
            selected: state
                .selected()
                .iter()
                .map(|item| ItemView::new(item, state))
                .collect(),
            picklist: state
                .picklist()
                .into_iter()
                .map(|item| ItemView::new(item, state))
                .collect(),
            query: state.query().to_string(),
        }
    }
}
