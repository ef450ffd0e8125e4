//! crates/driving_school_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or serialization format.

use chrono::{NaiveDate, NaiveTime};
use std::fmt;
use uuid::Uuid;

/// Identifies a scheduled lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LessonId(pub i64);

impl fmt::Display for LessonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a catalog entry. Ordering follows the numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A catalog entry representing a teachable topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonItem {
    pub id: ItemId,
    pub title: String,
}

impl LessonItem {
    pub fn new(id: i64, title: impl Into<String>) -> Self {
        Self {
            id: ItemId(id),
            title: title.into(),
        }
    }
}

/// A scheduled teaching session belonging to a student profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Lesson {
    pub id: LessonId,
    pub profile_id: Uuid,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub duration_hours: f64,
}

// A link between exactly one lesson and one catalog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Association {
    pub lesson_id: LessonId,
    pub item_id: ItemId,
}

//=========================================================================================
// Lesson Editing
//=========================================================================================

/// Longest lesson the editor accepts, in hours.
pub const MAX_LESSON_HOURS: f64 = 12.0;

/// The closed set of lesson fields that may be written back to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LessonField {
    Date,
    Time,
    DurationHours,
}

impl LessonField {
    /// The column this field is persisted in.
    pub fn column(self) -> &'static str {
        match self {
            LessonField::Date => "date",
            LessonField::Time => "time",
            LessonField::DurationHours => "duration_hours",
        }
    }
}

/// A typed new value for one editable lesson field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LessonFieldValue {
    Date(NaiveDate),
    Time(NaiveTime),
    DurationHours(f64),
}

impl LessonFieldValue {
    pub fn field(&self) -> LessonField {
        match self {
            LessonFieldValue::Date(_) => LessonField::Date,
            LessonFieldValue::Time(_) => LessonField::Time,
            LessonFieldValue::DurationHours(_) => LessonField::DurationHours,
        }
    }
}

/// Reasons a [`LessonPatch`] is refused before reaching the store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatchError {
    #[error("Patch does not change any field")]
    Empty,
    #[error("Field '{}' appears more than once", .0.column())]
    DuplicateField(LessonField),
    #[error("Duration must be greater than 0 and at most {} hours, got {}", MAX_LESSON_HOURS, .0)]
    InvalidDuration(f64),
}

/// An edit to an existing lesson, restricted to [`LessonField`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LessonPatch {
    pub changes: Vec<LessonFieldValue>,
}

impl LessonPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, value: LessonFieldValue) -> Self {
        self.changes.push(value);
        self
    }

    /// Checks the patch is non-empty, names each field once and carries sane values.
    pub fn validate(&self) -> Result<(), PatchError> {
        if self.changes.is_empty() {
            return Err(PatchError::Empty);
        }
        let mut seen = Vec::with_capacity(self.changes.len());
        for change in &self.changes {
            let field = change.field();
            if seen.contains(&field) {
                return Err(PatchError::DuplicateField(field));
            }
            seen.push(field);
            if let LessonFieldValue::DurationHours(hours) = *change {
                if !hours.is_finite() || hours <= 0.0 || hours > MAX_LESSON_HOURS {
                    return Err(PatchError::InvalidDuration(hours));
                }
            }
        }
        Ok(())
    }

    /// Applies the patch to a local copy of a lesson.
    pub fn apply_to(&self, lesson: &mut Lesson) {
        for change in &self.changes {
            match *change {
                LessonFieldValue::Date(date) => lesson.date = date,
                LessonFieldValue::Time(time) => lesson.time = time,
                LessonFieldValue::DurationHours(hours) => lesson.duration_hours = hours,
            }
        }
    }
}
