use crate::common::config::TxnId;

/// Sorted, deduplicated set of transaction ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnidSet {
    txnids: Vec<TxnId>,
}

impl TxnidSet {
    pub fn new() -> Self {
        Self { txnids: Vec::new() }
    }

    /// Adds `txnid`; adding an existing member is a no-op.
    pub fn add(&mut self, txnid: TxnId) {
        if let Err(idx) = self.txnids.binary_search(&txnid) {
            self.txnids.insert(idx, txnid);
        }
    }

    pub fn remove(&mut self, txnid: TxnId) {
        if let Ok(idx) = self.txnids.binary_search(&txnid) {
            self.txnids.remove(idx);
        }
    }

    pub fn contains(&self, txnid: TxnId) -> bool {
        self.txnids.binary_search(&txnid).is_ok()
    }

    pub fn size(&self) -> usize {
        self.txnids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txnids.is_empty()
    }

    /// The `i`th smallest member.
    pub fn get(&self, i: usize) -> Option<TxnId> {
        self.txnids.get(i).copied()
    }

    pub fn clear(&mut self) {
        self.txnids.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = TxnId> + '_ {
        self.txnids.iter().copied()
    }
}

impl FromIterator<TxnId> for TxnidSet {
    fn from_iter<I: IntoIterator<Item = TxnId>>(iter: I) -> Self {
        let mut txnids: Vec<TxnId> = iter.into_iter().collect();
        txnids.sort_unstable();
        txnids.dedup();
        Self { txnids }
    }
}
