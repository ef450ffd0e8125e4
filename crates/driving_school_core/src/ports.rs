//! crates/driving_school_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the concrete data store behind them.

use crate::domain::{ItemId, Lesson, LessonId, LessonItem, LessonPatch};
use async_trait::async_trait;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// The remote many-to-many relation between lessons and catalog items.
#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Returns every catalog item.
    async fn list_catalog(&self) -> PortResult<Vec<LessonItem>>;

    /// Returns the items linked to `lesson_id`, in the order the links were created.
    async fn list_associations(&self, lesson_id: LessonId) -> PortResult<Vec<LessonItem>>;

    /// Links `item_id` to `lesson_id`. Fails with `Conflict` if the link exists.
    async fn create_association(&self, lesson_id: LessonId, item_id: ItemId) -> PortResult<()>;

    /// Removes the link. Fails with `NotFound` if there was none.
    async fn delete_association(&self, lesson_id: LessonId, item_id: ItemId) -> PortResult<()>;
}

#[async_trait]
pub trait LessonStore: Send + Sync {
    async fn get_lesson(&self, lesson_id: LessonId) -> PortResult<Lesson>;

    /// Writes the fields named in `patch` and returns the updated lesson.
    async fn update_lesson(&self, lesson_id: LessonId, patch: &LessonPatch) -> PortResult<Lesson>;
}
