use std::collections::{BTreeMap, HashSet};

use crate::common::config::TxnId;
use crate::concurrency::txnid_set::TxnidSet;

/// Wait-for graph: an edge `a -> b` means transaction `a` waits for `b`.
///
/// Built transiently for one lock request and dropped afterwards.
#[derive(Debug, Default)]
pub struct Wfg {
    nodes: BTreeMap<TxnId, TxnidSet>,
}

impl Wfg {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// Adds `a -> b`, creating either node if needed.
    pub fn add_edge(&mut self, a_txnid: TxnId, b_txnid: TxnId) {
        self.nodes.entry(b_txnid).or_default();
        self.nodes.entry(a_txnid).or_default().add(b_txnid);
    }

    pub fn node_exists(&self, txnid: TxnId) -> bool {
        self.nodes.contains_key(&txnid)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// True if some path leads from `txnid` back to itself.
    pub fn cycle_exists_from_txnid(&self, txnid: TxnId) -> bool {
        let mut visited = HashSet::new();
        self.cycle_exists_from_node(txnid, txnid, &mut visited)
    }

    fn cycle_exists_from_node(
        &self,
        target: TxnId,
        head: TxnId,
        visited: &mut HashSet<TxnId>,
    ) -> bool {
        if !visited.insert(head) {
            return false;
        }
        let Some(edges) = self.nodes.get(&head) else {
            return false;
        };
        edges
            .iter()
            .any(|next| next == target || self.cycle_exists_from_node(target, next, visited))
    }

    /// Calls `f` on every node in txnid order; stops early when `f` returns false.
    pub fn apply_nodes<F: FnMut(TxnId) -> bool>(&self, mut f: F) {
        for &txnid in self.nodes.keys() {
            if !f(txnid) {
                break;
            }
        }
    }

    /// Calls `f` on every out-edge of `txnid`; stops early when `f` returns false.
    pub fn apply_edges<F: FnMut(TxnId, TxnId) -> bool>(&self, txnid: TxnId, mut f: F) {
        if let Some(edges) = self.nodes.get(&txnid) {
            for other in edges.iter() {
                if !f(txnid, other) {
                    break;
                }
            }
        }
    }

    /// All edges rendered as `a -> b`, for logging.
    pub fn edge_list(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.apply_nodes(|txnid| {
            self.apply_edges(txnid, |a, b| {
                out.push(format!("{} -> {}", a, b));
                true
            });
            true
        });
        out
    }
}
