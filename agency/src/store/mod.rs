//! The hierarchical key/value store replicated by the agency.
//!
//! A store is an ordered tree of nodes addressed by `/`-separated paths.
//! Each agent owns two long-lived instances: the spearhead, which reflects
//! every write the leader has accepted but not yet committed, and the read
//! DB, which reflects committed state only. A third, transient instance
//! holds non-replicated scratch state.
//!
//! The store has no persistence of its own; durability comes entirely from
//! the replicated log and the snapshots cut from it.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::Index;
use crate::MessageSummary;
use crate::Term;

/// A single operation against one path of the tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Op {
    /// Set the node to the given value, creating intermediate nodes.
    Set { new: Value },
    /// Remove the node and its sub-tree.
    Delete,
    /// Append to the array at the path, creating it if needed.
    Push { new: Value },
    /// Prepend to the array at the path, creating it if needed.
    Prepend { new: Value },
    /// Remove the last element of the array at the path.
    Pop,
    /// Remove the first element of the array at the path.
    Shift,
    /// Increment the numeric value at the path by one, from zero if unset.
    Increment,
    /// Decrement the numeric value at the path by one, from zero if unset.
    Decrement,
}

/// A per-path condition which must hold for a transaction to apply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Precondition {
    /// The node exists and equals the given value.
    OldEquals(Value),
    /// The node is absent or differs from the given value.
    OldNot(Value),
    /// Whether the node must be absent (`true`) or present (`false`).
    OldEmpty(bool),
    /// Whether the node must be an array.
    IsArray(bool),
}

/// An atomic unit of change: a set of preconditions and a set of mutations.
///
/// Preconditions are evaluated against the current tree first; only if all
/// of them hold are the operations applied. The optional `client_id` is an
/// idempotency key under which the entry can later be looked up through
/// `inquire`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub ops: BTreeMap<String, Op>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub preconditions: BTreeMap<String, Precondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Transaction {
    /// A transaction setting a single path.
    pub fn set<P: Into<String>>(path: P, value: Value) -> Self {
        Self::default().with_op(path, Op::Set { new: value })
    }

    /// A transaction deleting a single path.
    pub fn delete<P: Into<String>>(path: P) -> Self {
        Self::default().with_op(path, Op::Delete)
    }

    /// Add an operation.
    pub fn with_op<P: Into<String>>(mut self, path: P, op: Op) -> Self {
        self.ops.insert(normalize(&path.into()), op);
        self
    }

    /// Add a precondition.
    pub fn with_precondition<P: Into<String>>(mut self, path: P, pre: Precondition) -> Self {
        self.preconditions.insert(normalize(&path.into()), pre);
        self
    }

    /// Attach an idempotency key.
    pub fn with_client_id<S: Into<String>>(mut self, id: S) -> Self {
        self.client_id = Some(id.into());
        self
    }
}

impl MessageSummary for Transaction {
    fn summary(&self) -> String {
        format!(
            "ops=[{}] pre={} client_id={:?}",
            self.ops.keys().cloned().collect::<Vec<_>>().join(","),
            self.preconditions.len(),
            self.client_id
        )
    }
}

/// The outcome of applying a single transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckResult {
    /// Whether the transaction was applied.
    pub successful: bool,
    /// The paths whose preconditions did not hold.
    pub failed_keys: Vec<String>,
}

impl CheckResult {
    fn ok() -> Self {
        Self {
            successful: true,
            failed_keys: Vec::new(),
        }
    }
}

/// A notification sent to path observers when committed entries touch their
/// prefix.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeNotice {
    /// The registered prefix that matched.
    pub prefix: String,
    /// The path that was written.
    pub path: String,
    /// The commit index the change became visible at.
    pub commit_index: Index,
    /// The term under which the change was committed.
    pub term: Term,
}

/// The hierarchical key/value tree.
pub struct Store {
    /// The tree itself; always a JSON object at the root.
    tree: Value,
    /// Change observers, as `(prefix, channel)` pairs.
    observers: Vec<(String, mpsc::UnboundedSender<ChangeNotice>)>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            tree: json!({}),
            observers: Vec::new(),
        }
    }

    /// Reset to the empty tree. Observers stay registered.
    pub fn clear(&mut self) {
        self.tree = json!({});
    }

    /// A serializable image of the full tree, for snapshots.
    pub fn image(&self) -> Value {
        self.tree.clone()
    }

    /// Replace the tree with a snapshot image.
    pub fn restore(&mut self, image: Value) {
        self.tree = match image {
            obj @ Value::Object(_) => obj,
            other => json!({ "value": other }),
        };
    }

    /// Make this store an exact copy of another one's tree. Observers are
    /// not carried over.
    pub fn assign_from(&mut self, other: &Store) {
        self.tree = other.tree.clone();
    }

    /// Register an observer for a path prefix.
    pub fn observe<P: Into<String>>(&mut self, prefix: P, tx: mpsc::UnboundedSender<ChangeNotice>) {
        self.observers.push((normalize(&prefix.into()), tx));
    }

    /// Look up the node at the given path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut node = &self.tree;
        for part in parts(path) {
            node = node.as_object()?.get(part)?;
        }
        Some(node)
    }

    /// Evaluate a read projection.
    ///
    /// Returns one success flag per requested path, and a tree containing
    /// every found sub-tree at its original position.
    pub fn read(&self, paths: &[String]) -> (Vec<bool>, Value) {
        let mut out = json!({});
        let mut success = Vec::with_capacity(paths.len());
        for path in paths {
            match self.get(path) {
                Some(node) => {
                    let node = node.clone();
                    graft(&mut out, path, node);
                    success.push(true);
                }
                None => success.push(false),
            }
        }
        (success, out)
    }

    /// Atomically evaluate a transaction's preconditions and, if they all
    /// hold, apply its operations.
    pub fn apply_transaction(&mut self, trx: &Transaction) -> CheckResult {
        let mut failed_keys = Vec::new();
        for (path, pre) in trx.preconditions.iter() {
            if !self.check(path, pre) {
                failed_keys.push(path.clone());
            }
        }
        if !failed_keys.is_empty() {
            return CheckResult {
                successful: false,
                failed_keys,
            };
        }
        for (path, op) in trx.ops.iter() {
            self.apply_op(path, op);
        }
        CheckResult::ok()
    }

    /// Apply a batch of transactions, returning one success flag each.
    pub fn apply_transactions(&mut self, trxs: &[Transaction]) -> Vec<bool> {
        trxs.iter().map(|trx| self.apply_transaction(trx).successful).collect()
    }

    /// Apply committed log entries in index order.
    ///
    /// Entries have already passed their preconditions on the spearhead at
    /// the leader that accepted them, and replay is deterministic, so the
    /// operations are applied unconditionally here. When `notify` is set,
    /// registered observers receive one notice per matching written path.
    pub fn apply_log_entries(&mut self, payloads: &[Transaction], commit_index: Index, term: Term, notify: bool) {
        for trx in payloads {
            for (path, op) in trx.ops.iter() {
                self.apply_op(path, op);
                if notify {
                    self.notify_observers(path, commit_index, term);
                }
            }
        }
    }

    fn notify_observers(&mut self, path: &str, commit_index: Index, term: Term) {
        // Dead receivers are pruned as they are discovered.
        self.observers.retain(|(prefix, tx)| {
            if !path.starts_with(prefix.as_str()) {
                return true;
            }
            tx.send(ChangeNotice {
                prefix: prefix.clone(),
                path: path.to_string(),
                commit_index,
                term,
            })
            .is_ok()
        });
    }

    fn check(&self, path: &str, pre: &Precondition) -> bool {
        let node = self.get(path);
        match pre {
            Precondition::OldEquals(want) => node == Some(want),
            Precondition::OldNot(unwanted) => node != Some(unwanted),
            Precondition::OldEmpty(empty) => node.is_none() == *empty,
            Precondition::IsArray(want) => node.map(Value::is_array).unwrap_or(false) == *want,
        }
    }

    fn apply_op(&mut self, path: &str, op: &Op) {
        match op {
            Op::Set { new } => *self.make_path(path) = new.clone(),
            Op::Delete => self.delete(path),
            Op::Push { new } => {
                let node = self.make_path(path);
                match node.as_array_mut() {
                    Some(arr) => arr.push(new.clone()),
                    None => *node = json!([new]),
                }
            }
            Op::Prepend { new } => {
                let node = self.make_path(path);
                match node.as_array_mut() {
                    Some(arr) => arr.insert(0, new.clone()),
                    None => *node = json!([new]),
                }
            }
            Op::Pop => {
                let node = self.make_path(path);
                match node.as_array_mut() {
                    Some(arr) => {
                        arr.pop();
                    }
                    None => *node = json!([]),
                }
            }
            Op::Shift => {
                let node = self.make_path(path);
                match node.as_array_mut() {
                    Some(arr) => {
                        if !arr.is_empty() {
                            arr.remove(0);
                        }
                    }
                    None => *node = json!([]),
                }
            }
            Op::Increment => self.step_counter(path, 1),
            Op::Decrement => self.step_counter(path, -1),
        }
    }

    fn step_counter(&mut self, path: &str, step: i64) {
        let node = self.make_path(path);
        let old = node.as_i64().unwrap_or(0);
        *node = json!(old + step);
    }

    /// Walk to the node at `path`, creating intermediate objects and
    /// replacing scalars standing in the way.
    fn make_path(&mut self, path: &str) -> &mut Value {
        let mut node = &mut self.tree;
        for part in parts(path) {
            if !node.is_object() {
                *node = json!({});
            }
            node = node
                .as_object_mut()
                .expect("checked to be an object above")
                .entry(part.to_string())
                .or_insert_with(|| json!({}));
        }
        node
    }

    fn delete(&mut self, path: &str) {
        let parts: Vec<&str> = parts(path).collect();
        if parts.is_empty() {
            self.tree = json!({});
            return;
        }
        let mut node = &mut self.tree;
        for part in &parts[..parts.len() - 1] {
            match node.as_object_mut().and_then(|m| m.get_mut(*part)) {
                Some(next) => node = next,
                None => return,
            }
        }
        if let Some(map) = node.as_object_mut() {
            map.remove(parts[parts.len() - 1]);
        }
    }
}

/// Split a path into its non-empty segments.
fn parts(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|p| !p.is_empty())
}

/// Normalize a path to the canonical `/a/b/c` form.
pub fn normalize(path: &str) -> String {
    let joined: Vec<&str> = parts(path).collect();
    format!("/{}", joined.join("/"))
}

/// Insert `node` into `out` at the nested position named by `path`.
fn graft(out: &mut Value, path: &str, node: Value) {
    let parts: Vec<&str> = parts(path).collect();
    if parts.is_empty() {
        *out = node;
        return;
    }
    let mut slot = out;
    for part in &parts[..parts.len() - 1] {
        if !slot.is_object() {
            *slot = json!({});
        }
        slot = slot
            .as_object_mut()
            .expect("checked to be an object above")
            .entry(part.to_string())
            .or_insert_with(|| json!({}));
    }
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut()
        .expect("checked to be an object above")
        .insert(parts[parts.len() - 1].to_string(), node);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_nested_paths() {
        let mut store = Store::new();
        let res = store.apply_transaction(&Transaction::set("/a/b/c", json!(42)));
        assert!(res.successful);
        assert_eq!(store.get("/a/b/c"), Some(&json!(42)));
        assert_eq!(store.get("/a/b"), Some(&json!({"c": 42})));
        assert_eq!(store.get("/a/missing"), None);
    }

    #[test]
    fn set_replaces_scalars_in_the_way() {
        let mut store = Store::new();
        store.apply_transaction(&Transaction::set("/a", json!(1)));
        store.apply_transaction(&Transaction::set("/a/b", json!(2)));
        assert_eq!(store.get("/a"), Some(&json!({"b": 2})));
    }

    #[test]
    fn delete_removes_subtree() {
        let mut store = Store::new();
        store.apply_transaction(&Transaction::set("/x/y", json!(1)));
        store.apply_transaction(&Transaction::set("/x/z", json!(2)));
        store.apply_transaction(&Transaction::delete("/x/y"));
        assert_eq!(store.get("/x"), Some(&json!({"z": 2})));
        store.apply_transaction(&Transaction::delete("/x"));
        assert_eq!(store.get("/x"), None);
    }

    #[test]
    fn array_ops() {
        let mut store = Store::new();
        store.apply_transaction(&Transaction::default().with_op("/l", Op::Push { new: json!(1) }));
        store.apply_transaction(&Transaction::default().with_op("/l", Op::Push { new: json!(2) }));
        store.apply_transaction(&Transaction::default().with_op("/l", Op::Prepend { new: json!(0) }));
        assert_eq!(store.get("/l"), Some(&json!([0, 1, 2])));
        store.apply_transaction(&Transaction::default().with_op("/l", Op::Pop));
        store.apply_transaction(&Transaction::default().with_op("/l", Op::Shift));
        assert_eq!(store.get("/l"), Some(&json!([1])));
    }

    #[test]
    fn counters() {
        let mut store = Store::new();
        store.apply_transaction(&Transaction::default().with_op("/n", Op::Increment));
        store.apply_transaction(&Transaction::default().with_op("/n", Op::Increment));
        store.apply_transaction(&Transaction::default().with_op("/n", Op::Decrement));
        assert_eq!(store.get("/n"), Some(&json!(1)));
    }

    #[test]
    fn preconditions_guard_the_whole_transaction() {
        let mut store = Store::new();
        store.apply_transaction(&Transaction::set("/k", json!("v1")));

        let trx = Transaction::set("/k", json!("v2"))
            .with_precondition("/k", Precondition::OldEquals(json!("other")));
        let res = store.apply_transaction(&trx);
        assert!(!res.successful);
        assert_eq!(res.failed_keys, vec!["/k".to_string()]);
        assert_eq!(store.get("/k"), Some(&json!("v1")));

        let trx = Transaction::set("/k", json!("v2"))
            .with_precondition("/k", Precondition::OldEquals(json!("v1")))
            .with_precondition("/new", Precondition::OldEmpty(true));
        assert!(store.apply_transaction(&trx).successful);
        assert_eq!(store.get("/k"), Some(&json!("v2")));
    }

    #[test]
    fn is_array_precondition() {
        let mut store = Store::new();
        store.apply_transaction(&Transaction::default().with_op("/l", Op::Push { new: json!(1) }));
        let trx = Transaction::default()
            .with_op("/l", Op::Push { new: json!(2) })
            .with_precondition("/l", Precondition::IsArray(true));
        assert!(store.apply_transaction(&trx).successful);
        let trx = Transaction::set("/s", json!(1)).with_precondition("/s", Precondition::IsArray(true));
        assert!(!store.apply_transaction(&trx).successful);
    }

    #[test]
    fn read_projects_subtrees() {
        let mut store = Store::new();
        store.apply_transaction(&Transaction::set("/a/b", json!(1)));
        store.apply_transaction(&Transaction::set("/c", json!("x")));
        let (success, out) = store.read(&["/a/b".to_string(), "/c".to_string(), "/nope".to_string()]);
        assert_eq!(success, vec![true, true, false]);
        assert_eq!(out, json!({"a": {"b": 1}, "c": "x"}));
    }

    #[test]
    fn image_restore_round_trip() {
        let mut store = Store::new();
        store.apply_transaction(&Transaction::set("/a/b", json!([1, 2])));
        let image = store.image();

        let mut other = Store::new();
        other.restore(image);
        assert_eq!(other.get("/a/b"), Some(&json!([1, 2])));
    }

    #[test]
    fn observers_fire_on_committed_entries() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut store = Store::new();
        store.observe("/watched", tx);

        store.apply_log_entries(&[Transaction::set("/other", json!(1))], 1, 1, true);
        assert!(rx.try_recv().is_err());

        store.apply_log_entries(&[Transaction::set("/watched/leaf", json!(2))], 2, 1, true);
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.prefix, "/watched");
        assert_eq!(notice.path, "/watched/leaf");
        assert_eq!(notice.commit_index, 2);

        // notify = false keeps observers quiet.
        store.apply_log_entries(&[Transaction::set("/watched/leaf", json!(3))], 3, 1, false);
        assert!(rx.try_recv().is_err());
    }
}
