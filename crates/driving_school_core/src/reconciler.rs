//! crates/driving_school_core/src/reconciler.rs
//!
//! Keeps the set of items selected for one lesson in step with the remote
//! lesson/item relation.
//!
//! Every user action is applied to the local [`SelectionState`] first, so the
//! editor can render it straight away, and only then sent to the store. The
//! outcome is fed back through [`SelectionState::settle`], which rolls back
//! the one affected item when the store refused the change.

use crate::domain::{ItemId, LessonId, LessonItem};
use crate::picklist;
use crate::ports::{PortError, RelationStore};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

//=========================================================================================
// Errors
//=========================================================================================

/// The catalog or the lesson's associations could not be fetched.
/// Editing must not start (or continue refreshing) until a retry succeeds.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Failed to load items for lesson {lesson_id}: {source}")]
pub struct LoadError {
    pub lesson_id: LessonId,
    #[source]
    pub source: PortError,
}

/// A single create or delete of an association failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AssociationError {
    #[error("Failed to {kind} item {item_id}: {source}")]
    Store {
        kind: MutationKind,
        item_id: ItemId,
        #[source]
        source: PortError,
    },
    #[error("Timed out after {after:?} trying to {kind} item {item_id}")]
    TimedOut {
        kind: MutationKind,
        item_id: ItemId,
        after: Duration,
    },
}

impl AssociationError {
    pub fn item_id(&self) -> ItemId {
        match self {
            AssociationError::Store { item_id, .. }
            | AssociationError::TimedOut { item_id, .. } => *item_id,
        }
    }
}

/// An action the current state does not allow. The state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionRejected {
    #[error("Item {0} is not available for selection")]
    NotAvailable(ItemId),
    #[error("Item {0} is not selected")]
    NotSelected(ItemId),
    #[error("Item {0} has a change in flight")]
    Pending(ItemId),
    #[error("Search query is not empty")]
    QueryNotEmpty,
    #[error("No item is selected")]
    NothingSelected,
}

/// Everything the one-shot reconciler operations can fail with.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EditorError {
    #[error(transparent)]
    Rejected(#[from] SelectionRejected),
    #[error(transparent)]
    Association(#[from] AssociationError),
}

//=========================================================================================
// Mutations
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Attach,
    Detach,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Attach => f.write_str("attach"),
            MutationKind::Detach => f.write_str("detach"),
        }
    }
}

/// An optimistic change that has been applied locally but not yet confirmed.
///
/// Must be handed back to [`SelectionState::settle`] exactly once.
#[derive(Debug)]
#[must_use = "a pending mutation must be committed and settled"]
pub struct PendingMutation {
    lesson_id: LessonId,
    item: LessonItem,
    kind: MutationKind,
}

impl PendingMutation {
    pub fn lesson_id(&self) -> LessonId {
        self.lesson_id
    }

    pub fn item(&self) -> &LessonItem {
        &self.item
    }

    pub fn kind(&self) -> MutationKind {
        self.kind
    }
}

/// Marks a refresh whose fetch is in flight.
///
/// Hand it back to [`SelectionState::resync`] with the fetched snapshot, or to
/// [`SelectionState::abandon_refresh`] if the fetch failed.
#[derive(Debug)]
#[must_use = "a refresh ticket must be resynced or abandoned"]
pub struct RefreshTicket {
    generation: u64,
}

/// What the store currently holds for one lesson.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub catalog: Vec<LessonItem>,
    /// Items linked to the lesson, in the order the store returned them.
    pub associated: Vec<LessonItem>,
}

//=========================================================================================
// SelectionState
//=========================================================================================

/// The editor's working set for one lesson.
///
/// `selected` keeps insertion order; `available` is keyed (and therefore
/// ordered) by item id. Every known item lives in exactly one of the two.
#[derive(Debug, Clone)]
pub struct SelectionState {
    lesson_id: LessonId,
    selected: Vec<LessonItem>,
    available: BTreeMap<ItemId, LessonItem>,
    query: String,
    pending: HashMap<ItemId, MutationKind>,
    /// Bumped on every settle.
    generation: u64,
    refreshes_in_flight: usize,
    /// Mutations confirmed while a refresh was fetching, tagged with the
    /// generation they settled in.
    confirmed: Vec<(u64, LessonItem, MutationKind)>,
}

impl SelectionState {
    pub fn from_snapshot(lesson_id: LessonId, snapshot: RemoteSnapshot) -> Self {
        let (selected, available) = partition(snapshot);
        Self {
            lesson_id,
            selected,
            available,
            query: String::new(),
            pending: HashMap::new(),
            generation: 0,
            refreshes_in_flight: 0,
            confirmed: Vec::new(),
        }
    }

    pub fn lesson_id(&self) -> LessonId {
        self.lesson_id
    }

    pub fn selected(&self) -> &[LessonItem] {
        &self.selected
    }

    /// Unselected items, sorted by id.
    pub fn available(&self) -> impl Iterator<Item = &LessonItem> + '_ {
        self.available.values()
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// The unselected items matching the current query, sorted by id.
    pub fn picklist(&self) -> Vec<&LessonItem> {
        picklist::filter(self.available.values(), Some(self.query.as_str()))
    }

    pub fn is_selected(&self, item_id: ItemId) -> bool {
        self.selected.iter().any(|item| item.id == item_id)
    }

    pub fn is_pending(&self, item_id: ItemId) -> bool {
        self.pending.contains_key(&item_id)
    }

    /// Ids of the items with a mutation in flight, sorted.
    pub fn pending_items(&self) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self.pending.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn set_query(&mut self, query: impl Into<String>) {
        self.query = query.into();
    }

    /// Moves an available item to the end of `selected` and marks it pending.
    pub fn begin_select(&mut self, item_id: ItemId) -> Result<PendingMutation, SelectionRejected> {
        if self.is_pending(item_id) {
            return Err(SelectionRejected::Pending(item_id));
        }
        let item = self
            .available
            .remove(&item_id)
            .ok_or(SelectionRejected::NotAvailable(item_id))?;
        self.selected.push(item.clone());
        Ok(self.mark_pending(item, MutationKind::Attach))
    }

    /// Moves a selected item back to `available` and marks it pending.
    pub fn begin_unselect(
        &mut self,
        item_id: ItemId,
    ) -> Result<PendingMutation, SelectionRejected> {
        if self.is_pending(item_id) {
            return Err(SelectionRejected::Pending(item_id));
        }
        let position = self
            .selected
            .iter()
            .position(|item| item.id == item_id)
            .ok_or(SelectionRejected::NotSelected(item_id))?;
        let item = self.selected.remove(position);
        self.available.insert(item.id, item.clone());
        Ok(self.mark_pending(item, MutationKind::Detach))
    }

    /// Unselects the most recently added item, but only while the query is empty.
    pub fn begin_remove_last(&mut self) -> Result<PendingMutation, SelectionRejected> {
        if !self.query.is_empty() {
            return Err(SelectionRejected::QueryNotEmpty);
        }
        let last = self
            .selected
            .last()
            .map(|item| item.id)
            .ok_or(SelectionRejected::NothingSelected)?;
        self.begin_unselect(last)
    }

    /// Records the outcome of a committed mutation.
    ///
    /// On failure the item is put back where it was before the optimistic
    /// change and the error is returned for display.
    pub fn settle(
        &mut self,
        mutation: PendingMutation,
        outcome: Result<(), AssociationError>,
    ) -> Result<(), AssociationError> {
        let PendingMutation { item, kind, .. } = mutation;
        self.pending.remove(&item.id);
        self.generation += 1;

        match &outcome {
            Ok(()) if self.refreshes_in_flight > 0 => {
                self.confirmed.push((self.generation, item, kind));
            }
            Ok(()) => {}
            Err(e) => {
                warn!(
                    "Rolling back {} of item {} on lesson {}: {}",
                    kind, item.id, self.lesson_id, e
                );
                match kind {
                    MutationKind::Attach => self.move_to_available(item.id, item),
                    MutationKind::Detach => self.move_to_selected(item.id, item),
                }
            }
        }
        outcome
    }

    /// Starts a refresh. The snapshot fetched afterwards may predate mutations
    /// that settle before it is applied; the ticket lets `resync` replay them.
    pub fn begin_refresh(&mut self) -> RefreshTicket {
        self.refreshes_in_flight += 1;
        RefreshTicket {
            generation: self.generation,
        }
    }

    /// Drops a refresh whose fetch failed. The state is left as it was.
    pub fn abandon_refresh(&mut self, _ticket: RefreshTicket) {
        self.finish_refresh();
    }

    /// Re-seeds the state from a snapshot fetched after `ticket` was issued.
    ///
    /// Mutations confirmed since the ticket are re-applied on top of the
    /// snapshot, and items with a mutation still in flight keep their
    /// optimistic placement.
    pub fn resync(&mut self, ticket: RefreshTicket, snapshot: RemoteSnapshot) {
        let (selected, available) = partition(snapshot);
        self.selected = selected;
        self.available = available;

        let since: Vec<(LessonItem, MutationKind)> = self
            .confirmed
            .iter()
            .filter(|(generation, _, _)| *generation > ticket.generation)
            .map(|(_, item, kind)| (item.clone(), *kind))
            .collect();
        for (item, kind) in since {
            match kind {
                MutationKind::Attach => self.move_to_selected(item.id, item),
                MutationKind::Detach => self.move_to_available(item.id, item),
            }
        }

        let in_flight: Vec<(ItemId, MutationKind)> =
            self.pending.iter().map(|(id, kind)| (*id, *kind)).collect();
        for (item_id, kind) in in_flight {
            match kind {
                MutationKind::Attach => {
                    if let Some(item) = self.available.remove(&item_id) {
                        self.selected.push(item);
                    }
                }
                MutationKind::Detach => {
                    if let Some(position) = self.selected.iter().position(|i| i.id == item_id) {
                        let item = self.selected.remove(position);
                        self.available.insert(item_id, item);
                    }
                }
            }
        }
        self.finish_refresh();
    }

    fn finish_refresh(&mut self) {
        self.refreshes_in_flight = self.refreshes_in_flight.saturating_sub(1);
        if self.refreshes_in_flight == 0 {
            self.confirmed.clear();
        }
    }

    fn mark_pending(&mut self, item: LessonItem, kind: MutationKind) -> PendingMutation {
        self.pending.insert(item.id, kind);
        PendingMutation {
            lesson_id: self.lesson_id,
            item,
            kind,
        }
    }

    fn move_to_available(&mut self, item_id: ItemId, item: LessonItem) {
        self.selected.retain(|i| i.id != item_id);
        self.available.insert(item_id, item);
    }

    fn move_to_selected(&mut self, item_id: ItemId, item: LessonItem) {
        self.available.remove(&item_id);
        if !self.is_selected(item_id) {
            self.selected.push(item);
        }
    }
}

/// Splits a snapshot into (selected, available). Duplicate links collapse to one.
fn partition(snapshot: RemoteSnapshot) -> (Vec<LessonItem>, BTreeMap<ItemId, LessonItem>) {
    let mut available: BTreeMap<ItemId, LessonItem> = snapshot
        .catalog
        .into_iter()
        .map(|item| (item.id, item))
        .collect();

    let mut selected: Vec<LessonItem> = Vec::with_capacity(snapshot.associated.len());
    for item in snapshot.associated {
        if selected.iter().any(|s| s.id == item.id) {
            continue;
        }
        available.remove(&item.id);
        selected.push(item);
    }
    (selected, available)
}

//=========================================================================================
// AssociationReconciler
//=========================================================================================

/// Drives [`SelectionState`] against a [`RelationStore`].
#[derive(Clone)]
pub struct AssociationReconciler {
    store: Arc<dyn RelationStore>,
    timeout: Option<Duration>,
}

impl AssociationReconciler {
    pub fn new(store: Arc<dyn RelationStore>) -> Self {
        Self {
            store,
            timeout: None,
        }
    }

    /// Bounds every remote mutation. `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetches the catalog and the lesson's associations concurrently.
    pub async fn fetch(&self, lesson_id: LessonId) -> Result<RemoteSnapshot, LoadError> {
        let (catalog, associated) = futures::try_join!(
            self.store.list_catalog(),
            self.store.list_associations(lesson_id)
        )
        .map_err(|source| LoadError { lesson_id, source })?;
        debug!(
            "Loaded {} catalog items, {} associated with lesson {}",
            catalog.len(),
            associated.len(),
            lesson_id
        );
        Ok(RemoteSnapshot {
            catalog,
            associated,
        })
    }

    /// Builds the editor state for `lesson_id` from the store.
    pub async fn initialize(&self, lesson_id: LessonId) -> Result<SelectionState, LoadError> {
        let snapshot = self.fetch(lesson_id).await?;
        Ok(SelectionState::from_snapshot(lesson_id, snapshot))
    }

    /// Refetches and re-seeds `state`. On failure `state` is left as it was.
    pub async fn refresh(&self, state: &mut SelectionState) -> Result<(), LoadError> {
        let ticket = state.begin_refresh();
        match self.fetch(state.lesson_id()).await {
            Ok(snapshot) => {
                state.resync(ticket, snapshot);
                Ok(())
            }
            Err(e) => {
                state.abandon_refresh(ticket);
                Err(e)
            }
        }
    }

    /// Sends one optimistic change to the store.
    pub async fn commit(&self, mutation: &PendingMutation) -> Result<(), AssociationError> {
        let (lesson_id, item_id, kind) = (mutation.lesson_id, mutation.item.id, mutation.kind);
        debug!("Committing {} of item {} on lesson {}", kind, item_id, lesson_id);

        let call = async {
            match kind {
                MutationKind::Attach => self.store.create_association(lesson_id, item_id).await,
                MutationKind::Detach => self.store.delete_association(lesson_id, item_id).await,
            }
        };
        let result = match self.timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .map_err(|_| AssociationError::TimedOut {
                    kind,
                    item_id,
                    after,
                })?,
            None => call.await,
        };
        result.map_err(|source| AssociationError::Store {
            kind,
            item_id,
            source,
        })
    }

    /// Selects an item, waits for the store and rolls back on failure.
    pub async fn select(
        &self,
        state: &mut SelectionState,
        item_id: ItemId,
    ) -> Result<(), EditorError> {
        let mutation = state.begin_select(item_id)?;
        self.run(state, mutation).await
    }

    /// Unselects an item, waits for the store and rolls back on failure.
    pub async fn unselect(
        &self,
        state: &mut SelectionState,
        item_id: ItemId,
    ) -> Result<(), EditorError> {
        let mutation = state.begin_unselect(item_id)?;
        self.run(state, mutation).await
    }

    /// Backspace in an empty search box: unselects the last selected item.
    pub async fn remove_last_on_empty_backspace(
        &self,
        state: &mut SelectionState,
    ) -> Result<(), EditorError> {
        let mutation = state.begin_remove_last()?;
        self.run(state, mutation).await
    }

    async fn run(
        &self,
        state: &mut SelectionState,
        mutation: PendingMutation,
    ) -> Result<(), EditorError> {
        let outcome = self.commit(&mutation).await;
        state.settle(mutation, outcome)?;
        Ok(())
    }
}
