//! services/api/src/web/state.rs
//!
//! Defines the application's shared and editor-specific states.

use crate::config::Config;
use crate::web::protocol::ServerMessage;
use driving_school_core::{
    AssociationReconciler, LessonId, LessonStore, LoadError, RelationStore, SelectionState,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Messages queued for one editor connection. A single writer task drains it
/// onto the socket, so the client sees them in the order they were queued.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub relations: Arc<dyn RelationStore>,
    pub lessons: Arc<dyn LessonStore>,
    pub config: Arc<Config>,
}

impl AppState {
    /// A reconciler bound to the relation store and the configured timeout.
    pub fn reconciler(&self) -> AssociationReconciler {
        AssociationReconciler::new(self.relations.clone())
            .with_timeout(self.config.mutation_timeout)
    }
}

//=========================================================================================
// EditorSession (Specific to One WebSocket Connection)
//=========================================================================================

/// The state for a single, active editor connection.
pub struct EditorSession {
    pub lesson_id: LessonId,
    pub reconciler: AssociationReconciler,
    /// Shared with in-flight mutation tasks, which settle into it.
    pub selection: Arc<Mutex<SelectionState>>,
}

impl EditorSession {
    /// Creates a new `EditorSession` by loading the lesson's items from the store.
    pub async fn new(app_state: &AppState, lesson_id: LessonId) -> Result<Self, LoadError> {
        let reconciler = app_state.reconciler();
        let selection = reconciler.initialize(lesson_id).await?;
        Ok(Self {
            lesson_id,
            reconciler,
            selection: Arc::new(Mutex::new(selection)),
        })
    }
}
