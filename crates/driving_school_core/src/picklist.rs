//! crates/driving_school_core/src/picklist.rs
//!
//! Filtering of the catalog items a lesson does not yet use.

use crate::domain::LessonItem;

/// Returns the items matching `query`, sorted by id ascending.
///
/// A blank or absent query matches everything. Otherwise an item matches when
/// its title contains the query case-insensitively, or, for a purely numeric
/// query, when its id contains the query's digits.
pub fn filter<'a, I>(items: I, query: Option<&str>) -> Vec<&'a LessonItem>
where
    I: IntoIterator<Item = &'a LessonItem>,
{
    let needle = query.map(str::trim).unwrap_or_default().to_lowercase();
    let numeric = !needle.is_empty() && needle.chars().all(|c| c.is_ascii_digit());

    let mut matches: Vec<&LessonItem> = items
        .into_iter()
        .filter(|item| {
            needle.is_empty()
                || item.title.to_lowercase().contains(&needle)
                || (numeric && item.id.0.to_string().contains(&needle))
        })
        .collect();
    matches.sort_by_key(|item| item.id);
    matches
}
