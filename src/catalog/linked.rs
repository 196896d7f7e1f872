//! Staged editing of a collection's linked collections.
//!
//! Changes are staged as two disjoint lists and only reach the store on
//! [`LinkedCollectionEditor::commit`], which removes before it adds, one store
//! call per id. Store operations are idempotent, so a commit that stops on a
//! failure can simply be run again: applied operations leave the staged lists
//! and only the remainder is retried.

use std::collections::BTreeSet;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, Span};

use crate::errors::AppError;

/// Store operations needed to edit collection links.
pub trait LinkStore {
    /// Ids currently linked from `parent_id`.
    fn linked_collection_ids(
        &self,
        parent_id: &str,
    ) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;

    /// Create the link; succeeds if it already exists.
    fn add_link(
        &self,
        parent_id: &str,
        linked_id: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Drop the link; succeeds if it does not exist.
    fn remove_link(
        &self,
        parent_id: &str,
        linked_id: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Staged link mutations not yet committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChanges {
    #[serde(default)]
    pub to_add: Vec<String>,
    #[serde(default)]
    pub to_remove: Vec<String>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// First id staged on both sides, if any.
    pub fn overlap(&self) -> Option<&str> {
        self.to_add
            .iter()
            .find(|id| self.to_remove.contains(id))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkOp {
    Add,
    Remove,
}

/// The store call a commit stopped on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedLinkOp {
    pub op: LinkOp,
    pub collection_id: String,
    pub message: String,
}

/// Outcome of a commit: what was applied and what is still staged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub removed: Vec<String>,
    pub added: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<FailedLinkOp>,
    /// Changes left staged; empty when the commit completed.
    pub pending: PendingChanges,
}

impl CommitReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }
}

type ChangeObserver = Box<dyn FnMut(&PendingChanges) + Send>;

/// Editor for the links of one parent collection.
pub struct LinkedCollectionEditor {
    parent_id: String,
    original: BTreeSet<String>,
    pending: PendingChanges,
    observer: Option<ChangeObserver>,
    span: Span,
}

impl std::fmt::Debug for LinkedCollectionEditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedCollectionEditor")
            .field("parent_id", &self.parent_id)
            .field("original", &self.original)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl LinkedCollectionEditor {
    /// Start from a known snapshot of linked ids.
    pub fn new(
        parent_id: impl Into<String>,
        original: impl IntoIterator<Item = String>,
        span: Span,
    ) -> Self {
        Self {
            parent_id: parent_id.into(),
            original: original.into_iter().collect(),
            pending: PendingChanges::default(),
            observer: None,
            span,
        }
    }

    /// Fetch the current links with a single store read.
    pub async fn load<S: LinkStore>(
        store: &S,
        parent_id: &str,
        span: Span,
    ) -> Result<Self, AppError> {
        let original = store
            .linked_collection_ids(parent_id)
            .instrument(span.clone())
            .await?;
        span.in_scope(|| tracing::debug!(count = original.len(), "Loaded linked collections"));
        Ok(Self::new(parent_id, original, span))
    }

    /// Register a callback run synchronously after every staged change.
    pub fn on_changes(mut self, observer: impl FnMut(&PendingChanges) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn pending_changes(&self) -> &PendingChanges {
        &self.pending
    }

    /// Effective link state: staged add, then staged remove, then the snapshot.
    pub fn is_linked(&self, target: &str) -> bool {
        if self.pending.to_add.iter().any(|id| id == target) {
            return true;
        }
        if self.pending.to_remove.iter().any(|id| id == target) {
            return false;
        }
        self.original.contains(target)
    }

    /// Effective set of linked ids.
    pub fn linked_ids(&self) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = self
            .original
            .iter()
            .filter(|id| !self.pending.to_remove.contains(id))
            .cloned()
            .collect();
        ids.extend(self.pending.to_add.iter().cloned());
        ids
    }

    /// Flip the effective state of `target`, returning the new state.
    pub fn toggle(&mut self, target: &str) -> Result<bool, AppError> {
        if self.is_linked(target) {
            self.stage_remove(target)?;
            Ok(false)
        } else {
            self.stage_add(target)?;
            Ok(true)
        }
    }

    /// Stage a link to `target`, unstaging any pending removal of it.
    pub fn stage_add(&mut self, target: &str) -> Result<(), AppError> {
        self.check_target(target)?;
        self.pending.to_remove.retain(|id| id != target);
        if !self.pending.to_add.iter().any(|id| id == target) {
            self.pending.to_add.push(target.to_string());
        }
        self.notify();
        Ok(())
    }

    /// Stage removal of the link to `target`, unstaging any pending add of it.
    pub fn stage_remove(&mut self, target: &str) -> Result<(), AppError> {
        self.check_target(target)?;
        self.pending.to_add.retain(|id| id != target);
        if !self.pending.to_remove.iter().any(|id| id == target) {
            self.pending.to_remove.push(target.to_string());
        }
        self.notify();
        Ok(())
    }

    /// Apply staged changes: every removal first, then every addition.
    ///
    /// Stops on the first failing call. Calls already made are not undone;
    /// they are folded into the snapshot and dropped from the staged lists.
    pub async fn commit<S: LinkStore>(&mut self, store: &S) -> CommitReport {
        let span = self.span.clone();
        let report = self.apply(store).instrument(span).await;
        self.notify();
        report
    }

    async fn apply<S: LinkStore>(&mut self, store: &S) -> CommitReport {
        let mut report = CommitReport::default();

        for id in self.pending.to_remove.clone() {
            if let Err(e) = store.remove_link(&self.parent_id, &id).await {
                tracing::warn!(
                    collection_id = %id,
                    error = %e,
                    "Link removal failed; stopping commit"
                );
                report.failed = Some(FailedLinkOp {
                    op: LinkOp::Remove,
                    collection_id: id,
                    message: e.message(),
                });
                report.pending = self.pending.clone();
                return report;
            }
            self.original.remove(&id);
            self.pending.to_remove.retain(|x| x != &id);
            report.removed.push(id);
        }

        for id in self.pending.to_add.clone() {
            if let Err(e) = store.add_link(&self.parent_id, &id).await {
                tracing::warn!(
                    collection_id = %id,
                    error = %e,
                    "Link creation failed; stopping commit"
                );
                report.failed = Some(FailedLinkOp {
                    op: LinkOp::Add,
                    collection_id: id,
                    message: e.message(),
                });
                report.pending = self.pending.clone();
                return report;
            }
            self.original.insert(id.clone());
            self.pending.to_add.retain(|x| x != &id);
            report.added.push(id);
        }

        tracing::info!(
            removed = report.removed.len(),
            added = report.added.len(),
            "Committed linked collection changes"
        );
        report
    }

    fn check_target(&self, target: &str) -> Result<(), AppError> {
        if target.trim().is_empty() {
            return Err(AppError::Validation(
                "Linked collection id is required".to_string(),
            ));
        }
        if target == self.parent_id {
            return Err(AppError::Validation(
                "A collection cannot be linked to itself".to_string(),
            ));
        }
        Ok(())
    }

    fn notify(&mut self) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&self.pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// In-memory store that records calls and can fail a chosen one.
    #[derive(Default)]
    struct FakeStore {
        links: Mutex<BTreeSet<(String, String)>>,
        calls: Mutex<Vec<String>>,
        fail_on: Mutex<Option<String>>,
    }

    impl FakeStore {
        fn with_links(parent: &str, linked: &[&str]) -> Self {
            let store = Self::default();
            {
                let mut links = store.links.lock().unwrap();
                for id in linked {
                    links.insert((parent.to_string(), id.to_string()));
                }
            }
            store
        }

        fn fail_on(&self, call: &str) {
            *self.fail_on.lock().unwrap() = Some(call.to_string());
        }

        fn clear_failure(&self) {
            *self.fail_on.lock().unwrap() = None;
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn linked(&self, parent: &str) -> Vec<String> {
            self.links
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| p == parent)
                .map(|(_, l)| l.clone())
                .collect()
        }

        fn record(&self, call: String) -> Result<(), AppError> {
            self.calls.lock().unwrap().push(call.clone());
            if self.fail_on.lock().unwrap().as_deref() == Some(call.as_str()) {
                return Err(AppError::Database("connection reset".to_string()));
            }
            Ok(())
        }
    }

    impl LinkStore for FakeStore {
        async fn linked_collection_ids(&self, parent_id: &str) -> Result<Vec<String>, AppError> {
            self.record(format!("list({})", parent_id))?;
            Ok(self.linked(parent_id))
        }

        async fn add_link(&self, parent_id: &str, linked_id: &str) -> Result<(), AppError> {
            self.record(format!("add({})", linked_id))?;
            self.links
                .lock()
                .unwrap()
                .insert((parent_id.to_string(), linked_id.to_string()));
            Ok(())
        }

        async fn remove_link(&self, parent_id: &str, linked_id: &str) -> Result<(), AppError> {
            self.record(format!("remove({})", linked_id))?;
            self.links
                .lock()
                .unwrap()
                .remove(&(parent_id.to_string(), linked_id.to_string()));
            Ok(())
        }
    }

    fn editor(original: &[&str]) -> LinkedCollectionEditor {
        LinkedCollectionEditor::new(
            "parent",
            original.iter().map(|s| s.to_string()),
            Span::none(),
        )
    }

    fn disjoint(pending: &PendingChanges) -> bool {
        pending.overlap().is_none()
    }

    #[test]
    fn test_is_linked_precedence() {
        let mut ed = editor(&["a", "b"]);
        assert!(ed.is_linked("a"));
        assert!(!ed.is_linked("x"));

        ed.stage_remove("a").unwrap();
        ed.stage_add("x").unwrap();
        assert!(!ed.is_linked("a"));
        assert!(ed.is_linked("x"));
        assert!(ed.is_linked("b"));
    }

    #[test]
    fn test_add_then_remove_nets_to_removal() {
        let mut ed = editor(&[]);
        ed.stage_add("x").unwrap();
        ed.stage_remove("x").unwrap();

        assert!(ed.pending_changes().to_add.is_empty());
        assert_eq!(ed.pending_changes().to_remove, vec!["x".to_string()]);
        assert!(!ed.is_linked("x"));
    }

    #[test]
    fn test_last_toggle_decides_state() {
        let mut ed = editor(&["a"]);

        let states: Vec<bool> = (0..5).map(|_| ed.toggle("a").unwrap()).collect();
        assert_eq!(states, vec![false, true, false, true, false]);
        assert!(!ed.is_linked("a"));

        ed.toggle("b").unwrap();
        ed.toggle("c").unwrap();
        ed.toggle("b").unwrap();
        assert!(!ed.is_linked("a"));
        assert!(!ed.is_linked("b"));
        assert!(ed.is_linked("c"));
    }

    #[test]
    fn test_staged_lists_stay_disjoint() {
        let mut ed = editor(&["a", "c"]);
        for target in ["a", "b", "a", "c", "b", "d", "a", "d", "c", "b"] {
            ed.toggle(target).unwrap();
            assert!(disjoint(ed.pending_changes()), "overlap after toggling {}", target);
        }
    }

    #[test]
    fn test_self_link_rejected() {
        let mut ed = editor(&[]);
        assert!(matches!(ed.toggle("parent"), Err(AppError::Validation(_))));
        assert!(matches!(ed.stage_add(" "), Err(AppError::Validation(_))));
        assert!(ed.pending_changes().is_empty());
    }

    #[test]
    fn test_observer_sees_every_change() {
        let seen: Arc<Mutex<Vec<PendingChanges>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let mut ed = editor(&["a"]).on_changes(move |p| sink.lock().unwrap().push(p.clone()));

        ed.toggle("a").unwrap();
        ed.toggle("b").unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].to_remove, vec!["a".to_string()]);
        assert_eq!(seen[1].to_add, vec!["b".to_string()]);
    }

    #[test]
    fn test_linked_ids_reflect_staging() {
        let mut ed = editor(&["a", "b"]);
        ed.stage_remove("a").unwrap();
        ed.stage_add("c").unwrap();
        let ids: Vec<String> = ed.linked_ids().into_iter().collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_load_reads_store_once() {
        let store = FakeStore::with_links("parent", &["a", "b"]);
        let ed = LinkedCollectionEditor::load(&store, "parent", Span::none())
            .await
            .unwrap();

        assert!(ed.is_linked("a"));
        assert!(ed.is_linked("b"));
        assert_eq!(store.calls(), vec!["list(parent)".to_string()]);
    }

    #[tokio::test]
    async fn test_commit_removes_before_adds() {
        let store = FakeStore::with_links("parent", &["c"]);
        let mut ed = editor(&["c"]);
        ed.stage_add("a").unwrap();
        ed.stage_add("b").unwrap();
        ed.stage_remove("c").unwrap();

        let report = ed.commit(&store).await;

        assert!(report.is_complete());
        assert_eq!(store.calls(), vec!["remove(c)", "add(a)", "add(b)"]);
        assert_eq!(report.removed, vec!["c".to_string()]);
        assert_eq!(report.added, vec!["a".to_string(), "b".to_string()]);
        assert!(report.pending.is_empty());
        assert!(ed.pending_changes().is_empty());
        assert_eq!(store.linked("parent"), vec!["a".to_string(), "b".to_string()]);
        assert!(ed.is_linked("a") && !ed.is_linked("c"));
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_remainder_staged() {
        let store = FakeStore::with_links("parent", &["c", "d"]);
        let mut ed = editor(&["c", "d"]);
        ed.stage_remove("c").unwrap();
        ed.stage_remove("d").unwrap();
        ed.stage_add("a").unwrap();
        store.fail_on("remove(d)");

        let report = ed.commit(&store).await;

        assert!(!report.is_complete());
        let failed = report.failed.clone().unwrap();
        assert_eq!(failed.op, LinkOp::Remove);
        assert_eq!(failed.collection_id, "d");
        assert_eq!(report.removed, vec!["c".to_string()]);
        assert!(report.added.is_empty());
        assert_eq!(report.pending.to_remove, vec!["d".to_string()]);
        assert_eq!(report.pending.to_add, vec!["a".to_string()]);
        // The applied removal stays applied.
        assert_eq!(store.linked("parent"), vec!["d".to_string()]);

        store.clear_failure();
        let retry = ed.commit(&store).await;

        assert!(retry.is_complete());
        assert_eq!(retry.removed, vec!["d".to_string()]);
        assert_eq!(retry.added, vec!["a".to_string()]);
        assert_eq!(store.linked("parent"), vec!["a".to_string()]);
        assert_eq!(
            store.calls(),
            vec!["remove(c)", "remove(d)", "remove(d)", "add(a)"]
        );
    }

    #[tokio::test]
    async fn test_empty_commit_makes_no_calls() {
        let store = FakeStore::default();
        let mut ed = editor(&["a"]);
        let report = ed.commit(&store).await;
        assert!(report.is_complete());
        assert!(store.calls().is_empty());
    }
}
