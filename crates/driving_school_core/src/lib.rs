pub mod domain;
pub mod picklist;
pub mod ports;
pub mod reconciler;

pub use domain::{
    Association, ItemId, Lesson, LessonField, LessonFieldValue, LessonId, LessonItem, LessonPatch,
    PatchError,
};
pub use ports::{LessonStore, PortError, PortResult, RelationStore};
pub use reconciler::{
    AssociationError, AssociationReconciler, EditorError, LoadError, MutationKind, PendingMutation,
    RefreshTicket, RemoteSnapshot, SelectionRejected, SelectionState,
};
