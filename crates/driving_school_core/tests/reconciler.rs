//! Tests for the association reconciler against an in-memory relation store.
//!
//! The store double keeps links in a plain vector and can be told to fail or
//! hang specific calls, which is enough to drive every rollback path.

use async_trait::async_trait;
use driving_school_core::{
    AssociationError, AssociationReconciler, EditorError, ItemId, LessonId, LessonItem,
    MutationKind, PortError, PortResult, RelationStore, SelectionRejected, SelectionState,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LESSON: LessonId = LessonId(42);

#[derive(Default)]
struct Inner {
    catalog: Vec<LessonItem>,
    links: Vec<(LessonId, ItemId)>,
    fail_create: HashSet<ItemId>,
    fail_delete: HashSet<ItemId>,
    fail_loads: bool,
    hang_mutations: bool,
    calls: Vec<String>,
}

#[derive(Default)]
struct FakeStore {
    inner: Mutex<Inner>,
}

impl FakeStore {
    fn with_catalog(items: &[(i64, &str)]) -> Arc<Self> {
        let store = Self::default();
        store.inner.lock().unwrap().catalog =
            items.iter().map(|(id, title)| LessonItem::new(*id, *title)).collect();
        Arc::new(store)
    }

    fn link(&self, item: i64) {
        self.inner.lock().unwrap().links.push((LESSON, ItemId(item)));
    }

    fn unlink(&self, item: i64) {
        self.inner.lock().unwrap().links.retain(|l| *l != (LESSON, ItemId(item)));
    }

    fn fail_create(&self, item: i64) {
        self.inner.lock().unwrap().fail_create.insert(ItemId(item));
    }

    fn fail_delete(&self, item: i64) {
        self.inner.lock().unwrap().fail_delete.insert(ItemId(item));
    }

    fn set_fail_loads(&self, fail: bool) {
        self.inner.lock().unwrap().fail_loads = fail;
    }

    fn hang_mutations(&self) {
        self.inner.lock().unwrap().hang_mutations = true;
    }

    fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn linked_ids(&self) -> Vec<i64> {
        let inner = self.inner.lock().unwrap();
        inner
            .links
            .iter()
            .filter(|(lesson, _)| *lesson == LESSON)
            .map(|(_, item)| item.0)
            .collect()
    }
}

#[async_trait]
impl RelationStore for FakeStore {
    async fn list_catalog(&self) -> PortResult<Vec<LessonItem>> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_loads {
            return Err(PortError::Unexpected("catalog unavailable".to_string()));
        }
        Ok(inner.catalog.clone())
    }

    async fn list_associations(&self, lesson_id: LessonId) -> PortResult<Vec<LessonItem>> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_loads {
            return Err(PortError::Unexpected("associations unavailable".to_string()));
        }
        Ok(inner
            .links
            .iter()
            .filter(|(lesson, _)| *lesson == lesson_id)
            .filter_map(|(_, item)| inner.catalog.iter().find(|c| c.id == *item).cloned())
            .collect())
    }

    async fn create_association(&self, lesson_id: LessonId, item_id: ItemId) -> PortResult<()> {
        let hang = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(format!("create({lesson_id},{item_id})"));
            inner.hang_mutations
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_create.contains(&item_id) {
            return Err(PortError::Unexpected("network down".to_string()));
        }
        if inner.links.contains(&(lesson_id, item_id)) {
            return Err(PortError::Conflict(format!("{lesson_id}/{item_id}")));
        }
        inner.links.push((lesson_id, item_id));
        Ok(())
    }

    async fn delete_association(&self, lesson_id: LessonId, item_id: ItemId) -> PortResult<()> {
        let hang = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(format!("delete({lesson_id},{item_id})"));
            inner.hang_mutations
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_delete.contains(&item_id) {
            return Err(PortError::Unexpected("network down".to_string()));
        }
        let before = inner.links.len();
        inner.links.retain(|l| *l != (lesson_id, item_id));
        if inner.links.len() == before {
            return Err(PortError::NotFound(format!("{lesson_id}/{item_id}")));
        }
        Ok(())
    }
}

//=========================================================================================
// Helpers
//=========================================================================================

fn abc() -> Arc<FakeStore> {
    FakeStore::with_catalog(&[(1, "A"), (2, "B"), (3, "C")])
}

fn selected_ids(state: &SelectionState) -> Vec<i64> {
    state.selected().iter().map(|i| i.id.0).collect()
}

fn available_ids(state: &SelectionState) -> BTreeSet<i64> {
    state.available().map(|i| i.id.0).collect()
}

/// Every catalog item sits in exactly one of the two lists.
fn assert_partition(state: &SelectionState, catalog: &[i64]) {
    let selected: BTreeSet<i64> = selected_ids(state).into_iter().collect();
    let available = available_ids(state);
    assert_eq!(selected.len(), state.selected().len(), "duplicate in selected");
    assert!(selected.is_disjoint(&available));
    let union: BTreeSet<i64> = selected.union(&available).copied().collect();
    assert_eq!(union, catalog.iter().copied().collect::<BTreeSet<_>>());
}

//=========================================================================================
// Initialization
//=========================================================================================

#[tokio::test]
async fn initialize_with_no_associations_puts_everything_in_available() {
    let store = abc();
    let reconciler = AssociationReconciler::new(store.clone());

    let state = reconciler.initialize(LESSON).await.unwrap();

    assert!(state.selected().is_empty());
    assert_eq!(available_ids(&state), BTreeSet::from([1, 2, 3]));
    assert_eq!(state.lesson_id(), LESSON);
}

#[tokio::test]
async fn initialize_keeps_store_order_for_selected() {
    let store = abc();
    store.link(3);
    store.link(1);
    let reconciler = AssociationReconciler::new(store.clone());

    let state = reconciler.initialize(LESSON).await.unwrap();

    assert_eq!(selected_ids(&state), vec![3, 1]);
    assert_eq!(available_ids(&state), BTreeSet::from([2]));
}

#[tokio::test]
async fn failed_load_reports_load_error_and_retry_succeeds() {
    let store = abc();
    store.set_fail_loads(true);
    let reconciler = AssociationReconciler::new(store.clone());

    let err = reconciler.initialize(LESSON).await.unwrap_err();
    assert_eq!(err.lesson_id, LESSON);
    assert!(matches!(err.source, PortError::Unexpected(_)));

    store.set_fail_loads(false);
    let state = reconciler.initialize(LESSON).await.unwrap();
    assert_eq!(available_ids(&state), BTreeSet::from([1, 2, 3]));
}

//=========================================================================================
// Select / Unselect
//=========================================================================================

#[tokio::test]
async fn select_moves_item_to_end_and_creates_association() {
    let store = abc();
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    reconciler.select(&mut state, ItemId(2)).await.unwrap();

    assert_eq!(selected_ids(&state), vec![2]);
    assert_eq!(available_ids(&state), BTreeSet::from([1, 3]));
    assert_eq!(store.calls(), vec!["create(42,2)".to_string()]);
    assert_eq!(store.linked_ids(), vec![2]);
    assert!(!state.is_pending(ItemId(2)));
}

#[tokio::test]
async fn optimistic_select_is_visible_before_commit() {
    let store = abc();
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    let mutation = state.begin_select(ItemId(2)).unwrap();
    assert_eq!(mutation.kind(), MutationKind::Attach);
    assert_eq!(selected_ids(&state), vec![2]);
    assert!(state.is_pending(ItemId(2)));
    assert!(store.calls().is_empty());

    let outcome = reconciler.commit(&mutation).await;
    state.settle(mutation, outcome).unwrap();
    assert!(state.pending_items().is_empty());
}

#[tokio::test]
async fn failed_create_restores_state_before_the_call() {
    let store = abc();
    store.fail_create(2);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();
    let before_selected = selected_ids(&state);
    let before_available = available_ids(&state);

    let err = reconciler.select(&mut state, ItemId(2)).await.unwrap_err();

    match err {
        EditorError::Association(AssociationError::Store { kind, item_id, .. }) => {
            assert_eq!(kind, MutationKind::Attach);
            assert_eq!(item_id, ItemId(2));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(selected_ids(&state), before_selected);
    assert_eq!(available_ids(&state), before_available);
    assert!(!state.is_pending(ItemId(2)));
    assert!(store.linked_ids().is_empty());
}

#[tokio::test]
async fn failed_delete_puts_item_back_in_selected() {
    let store = abc();
    store.link(1);
    store.link(2);
    store.fail_delete(1);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    let err = reconciler.unselect(&mut state, ItemId(1)).await.unwrap_err();

    assert!(matches!(err, EditorError::Association(ref e) if e.item_id() == ItemId(1)));
    assert!(state.is_selected(ItemId(1)));
    assert!(!available_ids(&state).contains(&1));
    assert_partition(&state, &[1, 2, 3]);
}

#[tokio::test]
async fn second_unselect_is_rejected_without_change() {
    let store = abc();
    store.link(1);
    store.link(3);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    reconciler.unselect(&mut state, ItemId(3)).await.unwrap();
    let after_first = selected_ids(&state);

    let err = reconciler.unselect(&mut state, ItemId(3)).await.unwrap_err();

    assert_eq!(err, EditorError::Rejected(SelectionRejected::NotSelected(ItemId(3))));
    assert_eq!(selected_ids(&state), after_first);
    assert_eq!(store.calls().len(), 1);
}

#[tokio::test]
async fn selecting_an_already_selected_item_is_rejected() {
    let store = abc();
    store.link(2);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    let err = state.begin_select(ItemId(2)).unwrap_err();

    assert_eq!(err, SelectionRejected::NotAvailable(ItemId(2)));
    assert_eq!(selected_ids(&state), vec![2]);
}

#[tokio::test]
async fn select_then_unselect_restores_partition() {
    let store = abc();
    store.link(1);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();
    let before_selected = selected_ids(&state);
    let before_available = available_ids(&state);

    reconciler.select(&mut state, ItemId(3)).await.unwrap();
    reconciler.unselect(&mut state, ItemId(3)).await.unwrap();

    assert_eq!(selected_ids(&state), before_selected);
    assert_eq!(available_ids(&state), before_available);
    assert_eq!(store.linked_ids(), vec![1]);
}

#[tokio::test]
async fn partition_holds_across_mixed_successes_and_failures() {
    let store = FakeStore::with_catalog(&[(1, "A"), (2, "B"), (3, "C"), (4, "D"), (5, "E")]);
    store.link(4);
    store.fail_create(5);
    store.fail_delete(4);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();
    let catalog = [1, 2, 3, 4, 5];

    reconciler.select(&mut state, ItemId(2)).await.unwrap();
    assert_partition(&state, &catalog);
    let _ = reconciler.select(&mut state, ItemId(5)).await;
    assert_partition(&state, &catalog);
    let _ = reconciler.unselect(&mut state, ItemId(4)).await;
    assert_partition(&state, &catalog);
    reconciler.select(&mut state, ItemId(1)).await.unwrap();
    let _ = reconciler.unselect(&mut state, ItemId(9)).await;
    assert_partition(&state, &catalog);

    // A rolled-back detach re-appends the item.
    assert_eq!(selected_ids(&state), vec![2, 4, 1]);
}

//=========================================================================================
// Pending Items and Concurrency
//=========================================================================================

#[tokio::test]
async fn item_with_mutation_in_flight_rejects_another() {
    let store = abc();
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    let mutation = state.begin_select(ItemId(1)).unwrap();

    assert_eq!(
        state.begin_unselect(ItemId(1)).unwrap_err(),
        SelectionRejected::Pending(ItemId(1))
    );
    assert_eq!(
        state.begin_select(ItemId(1)).unwrap_err(),
        SelectionRejected::Pending(ItemId(1))
    );

    let outcome = reconciler.commit(&mutation).await;
    state.settle(mutation, outcome).unwrap();
    state.begin_unselect(ItemId(1)).map(drop).unwrap();
}

#[tokio::test]
async fn mutations_on_different_items_run_concurrently() {
    let store = abc();
    store.fail_create(3);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    let first = state.begin_select(ItemId(1)).unwrap();
    let second = state.begin_select(ItemId(3)).unwrap();
    assert_eq!(state.pending_items(), vec![ItemId(1), ItemId(3)]);

    let (a, b) = futures::join!(reconciler.commit(&first), reconciler.commit(&second));
    state.settle(second, b).unwrap_err();
    state.settle(first, a).unwrap();

    assert_eq!(selected_ids(&state), vec![1]);
    assert_eq!(available_ids(&state), BTreeSet::from([2, 3]));
    assert!(state.pending_items().is_empty());
}

#[tokio::test]
async fn hanging_mutation_times_out_and_rolls_back() {
    let store = abc();
    store.hang_mutations();
    let reconciler =
        AssociationReconciler::new(store.clone()).with_timeout(Some(Duration::from_millis(20)));
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    let err = reconciler.select(&mut state, ItemId(2)).await.unwrap_err();

    assert!(matches!(
        err,
        EditorError::Association(AssociationError::TimedOut { item_id: ItemId(2), .. })
    ));
    assert!(state.selected().is_empty());
    assert_eq!(available_ids(&state), BTreeSet::from([1, 2, 3]));
}

//=========================================================================================
// Backspace and Query
//=========================================================================================

#[tokio::test]
async fn backspace_on_empty_query_removes_last_inserted() {
    let store = abc();
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();
    reconciler.select(&mut state, ItemId(2)).await.unwrap();
    reconciler.select(&mut state, ItemId(3)).await.unwrap();

    reconciler.remove_last_on_empty_backspace(&mut state).await.unwrap();

    assert_eq!(selected_ids(&state), vec![2]);
    assert_eq!(store.linked_ids(), vec![2]);
}

#[tokio::test]
async fn backspace_is_ignored_while_typing_or_when_nothing_selected() {
    let store = abc();
    store.link(1);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    state.set_query("b");
    let err = reconciler.remove_last_on_empty_backspace(&mut state).await.unwrap_err();
    assert_eq!(err, EditorError::Rejected(SelectionRejected::QueryNotEmpty));
    assert_eq!(selected_ids(&state), vec![1]);

    state.set_query("");
    reconciler.remove_last_on_empty_backspace(&mut state).await.unwrap();
    let err = reconciler.remove_last_on_empty_backspace(&mut state).await.unwrap_err();
    assert_eq!(err, EditorError::Rejected(SelectionRejected::NothingSelected));
}

#[tokio::test]
async fn query_filters_picklist_only() {
    let store = FakeStore::with_catalog(&[(7, "Sorpasso"), (3, "Frenata"), (9, "Freno motore")]);
    store.link(9);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    state.set_query("fre");

    let picklist: Vec<i64> = state.picklist().iter().map(|i| i.id.0).collect();
    assert_eq!(picklist, vec![3]);
    assert_eq!(selected_ids(&state), vec![9]);
    assert_eq!(available_ids(&state), BTreeSet::from([3, 7]));
    assert!(store.calls().is_empty());
}

//=========================================================================================
// Refresh
//=========================================================================================

#[tokio::test]
async fn refresh_picks_up_external_changes() {
    let store = abc();
    store.link(1);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    store.unlink(1);
    store.link(3);
    reconciler.refresh(&mut state).await.unwrap();

    assert_eq!(selected_ids(&state), vec![3]);
    assert_partition(&state, &[1, 2, 3]);
}

#[tokio::test]
async fn refresh_keeps_optimistic_placement_of_pending_items() {
    let store = abc();
    store.link(1);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    let attach = state.begin_select(ItemId(2)).unwrap();
    let detach = state.begin_unselect(ItemId(1)).unwrap();
    reconciler.refresh(&mut state).await.unwrap();

    assert_eq!(selected_ids(&state), vec![2]);
    assert_partition(&state, &[1, 2, 3]);

    let a = reconciler.commit(&attach).await;
    let d = reconciler.commit(&detach).await;
    state.settle(attach, a).unwrap();
    state.settle(detach, d).unwrap();
    assert_eq!(store.linked_ids(), vec![2]);
}

#[tokio::test]
async fn failed_refresh_leaves_state_untouched() {
    let store = abc();
    store.link(2);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    store.set_fail_loads(true);
    store.unlink(2);
    assert!(reconciler.refresh(&mut state).await.is_err());

    assert_eq!(selected_ids(&state), vec![2]);
}

#[tokio::test]
async fn attach_confirmed_during_refresh_survives_stale_snapshot() {
    let store = abc();
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    let attach = state.begin_select(ItemId(2)).unwrap();
    let ticket = state.begin_refresh();
    // The fetch lands before the create does, so it still shows no links.
    let stale = reconciler.fetch(LESSON).await.unwrap();
    let outcome = reconciler.commit(&attach).await;
    state.settle(attach, outcome).unwrap();
    state.resync(ticket, stale);

    assert_eq!(selected_ids(&state), vec![2]);
    assert!(state.pending_items().is_empty());
    assert_partition(&state, &[1, 2, 3]);
    assert_eq!(store.linked_ids(), vec![2]);
}

#[tokio::test]
async fn detach_confirmed_during_refresh_survives_stale_snapshot() {
    let store = abc();
    store.link(1);
    store.link(3);
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    let detach = state.begin_unselect(ItemId(1)).unwrap();
    let ticket = state.begin_refresh();
    let stale = reconciler.fetch(LESSON).await.unwrap();
    let outcome = reconciler.commit(&detach).await;
    state.settle(detach, outcome).unwrap();
    state.resync(ticket, stale);

    assert_eq!(selected_ids(&state), vec![3]);
    assert_partition(&state, &[1, 2, 3]);
    assert_eq!(store.linked_ids(), vec![3]);
}

#[tokio::test]
async fn mutation_confirmed_before_refresh_started_is_not_replayed() {
    let store = abc();
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    reconciler.select(&mut state, ItemId(2)).await.unwrap();
    // Someone else removes the link; the refresh must show that.
    store.unlink(2);
    let ticket = state.begin_refresh();
    let fresh = reconciler.fetch(LESSON).await.unwrap();
    state.resync(ticket, fresh);

    assert!(selected_ids(&state).is_empty());
    assert_partition(&state, &[1, 2, 3]);
}

#[tokio::test]
async fn abandoned_refresh_stops_tracking_confirmed_mutations() {
    let store = abc();
    let reconciler = AssociationReconciler::new(store.clone());
    let mut state = reconciler.initialize(LESSON).await.unwrap();

    let attach = state.begin_select(ItemId(1)).unwrap();
    let ticket = state.begin_refresh();
    let outcome = reconciler.commit(&attach).await;
    state.settle(attach, outcome).unwrap();
    state.abandon_refresh(ticket);

    // A later refresh only trusts its own snapshot.
    store.unlink(1);
    reconciler.refresh(&mut state).await.unwrap();
    assert!(selected_ids(&state).is_empty());
    assert_partition(&state, &[1, 2, 3]);
}
