//! Transaction manager for the memory engine
//!
//! XIDs are allocated from a single counter; a committed watermark advances
//! as transactions commit. Visibility checks run against a point-in-time
//! view captured once per storage operation.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::storage::engine::{Isolation, TxnContext};

/// First XID handed out; 0 and 1 are reserved as "always committed".
const FIRST_XID: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEntry {
    pub table: String,
    pub pk: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReadEntry {
    pub table: String,
    pub pk: Vec<u8>,
    /// Latest committed creator observed when the row was read for update.
    pub create_xid: u64,
}

#[derive(Debug)]
struct ActiveTxn {
    snapshot: u64,
    isolation: Isolation,
    write_set: Vec<WriteEntry>,
    read_set: Vec<ReadEntry>,
}

#[derive(Debug, Default)]
struct TxnInner {
    watermark: u64,
    active: BTreeMap<u64, ActiveTxn>,
    aborted: HashSet<u64>,
}

/// Point-in-time visibility view for one storage operation.
#[derive(Debug, Clone)]
pub struct VisibilityView {
    pub xid: u64,
    pub snapshot: u64,
    active: HashSet<u64>,
    aborted: HashSet<u64>,
}

impl VisibilityView {
    fn xid_committed(&self, xid: u64) -> bool {
        xid < FIRST_XID || (!self.active.contains(&xid) && !self.aborted.contains(&xid))
    }

    /// Snapshot rule: `create_xid <= snapshot` and committed, not hidden by a
    /// committed delete at or below the snapshot. A transaction's own writes
    /// are visible to itself only.
    pub fn visible(&self, create_xid: u64, delete_xid: Option<u64>) -> bool {
        let created_visible = if create_xid == self.xid {
            true
        } else {
            create_xid <= self.snapshot && self.xid_committed(create_xid)
        };
        if !created_visible {
            return false;
        }
        match delete_xid {
            None => true,
            Some(d) if d == self.xid => false,
            Some(d) => !(d <= self.snapshot && self.xid_committed(d)),
        }
    }

    /// Write-write conflict: another transaction touched this version and is
    /// either still in flight or committed past our snapshot.
    pub fn conflicts(&self, other_xid: u64) -> bool {
        if other_xid == self.xid {
            return false;
        }
        if self.active.contains(&other_xid) {
            return true;
        }
        other_xid > self.snapshot && self.xid_committed(other_xid)
    }
}

/// Allocates XIDs, tracks active transactions and their read/write sets.
pub struct TransactionManager {
    next_xid: AtomicU64,
    inner: Mutex<TxnInner>,
    max_active: usize,
}

impl TransactionManager {
    pub fn new(max_active: usize) -> Self {
        Self {
            next_xid: AtomicU64::new(FIRST_XID),
            inner: Mutex::new(TxnInner {
                watermark: FIRST_XID - 1,
                ..Default::default()
            }),
            max_active,
        }
    }

    pub fn begin(&self, isolation: Isolation) -> Result<TxnContext> {
        let mut inner = self.inner.lock().unwrap();
        if inner.active.len() >= self.max_active {
            return Err(Error::Storage(format!(
                "too many active transactions (max {})",
                self.max_active
            )));
        }
        let xid = self.next_xid.fetch_add(1, Ordering::SeqCst);
        let snapshot = inner.watermark;
        inner.active.insert(
            xid,
            ActiveTxn {
                snapshot,
                isolation,
                write_set: Vec::new(),
                read_set: Vec::new(),
            },
        );
        Ok(TxnContext {
            xid,
            snapshot,
            isolation,
        })
    }

    /// Capture a visibility view for one operation. Read-committed contexts
    /// see the current watermark instead of their start snapshot.
    pub fn view(&self, txn: &TxnContext) -> VisibilityView {
        let inner = self.inner.lock().unwrap();
        let snapshot = match txn.isolation {
            Isolation::Snapshot => txn.snapshot,
            Isolation::ReadCommitted => inner.watermark,
        };
        VisibilityView {
            xid: txn.xid,
            snapshot,
            active: inner.active.keys().copied().collect(),
            aborted: inner.aborted.clone(),
        }
    }

    pub fn record_write(&self, xid: u64, entry: WriteEntry) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(txn) = inner.active.get_mut(&xid) {
            if !txn.write_set.contains(&entry) {
                txn.write_set.push(entry);
            }
        }
    }

    pub fn record_read(&self, xid: u64, entry: ReadEntry) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(txn) = inner.active.get_mut(&xid) {
            txn.read_set.push(entry);
        }
    }

    /// Read set to validate at commit.
    pub fn take_read_set(&self, xid: u64) -> Vec<ReadEntry> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .active
            .get_mut(&xid)
            .map(|t| std::mem::take(&mut t.read_set))
            .unwrap_or_default()
    }

    /// Mark committed and advance the watermark.
    pub fn mark_committed(&self, xid: u64) -> Vec<WriteEntry> {
        let mut inner = self.inner.lock().unwrap();
        let writes = inner
            .active
            .remove(&xid)
            .map(|t| t.write_set)
            .unwrap_or_default();
        if xid > inner.watermark {
            inner.watermark = xid;
        }
        writes
    }

    /// Mark aborted; the caller undoes the returned writes.
    pub fn mark_aborted(&self, xid: u64) -> Vec<WriteEntry> {
        let mut inner = self.inner.lock().unwrap();
        let writes = inner
            .active
            .remove(&xid)
            .map(|t| t.write_set)
            .unwrap_or_default();
        inner.aborted.insert(xid);
        writes
    }

    pub fn watermark(&self) -> u64 {
        self.inner.lock().unwrap().watermark
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }

    /// Oldest snapshot any active transaction can see; the GC floor.
    pub fn oldest_active_snapshot(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .active
            .values()
            .map(|t| t.snapshot)
            .min()
            .unwrap_or(inner.watermark)
    }

    pub fn next_xid_value(&self) -> u64 {
        self.next_xid.load(Ordering::SeqCst)
    }

    /// Reset counters after an XID remapping sweep. Only legal with no
    /// active transactions; the caller holds the engine write lock.
    pub fn reset_after_remap(&self, new_watermark: u64) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.active.is_empty());
        inner.watermark = new_watermark;
        inner.aborted.clear();
        self.next_xid.store(new_watermark + 1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TransactionManager {
        TransactionManager::new(16)
    }

    #[test]
    fn test_own_writes_visible_only_to_self() {
        let m = manager();
        let a = m.begin(Isolation::Snapshot).unwrap();
        let b = m.begin(Isolation::Snapshot).unwrap();
        let view_a = m.view(&a);
        let view_b = m.view(&b);
        assert!(view_a.visible(a.xid, None));
        assert!(!view_b.visible(a.xid, None));
    }

    #[test]
    fn test_commit_advances_watermark_and_visibility() {
        let m = manager();
        let a = m.begin(Isolation::Snapshot).unwrap();
        m.mark_committed(a.xid);
        assert_eq!(m.watermark(), a.xid);

        // Snapshot taken before the commit still cannot see it...
        let b = m.begin(Isolation::Snapshot).unwrap();
        assert!(m.view(&b).visible(a.xid, None));
        // ...but a snapshot started earlier would not.
        let c = TxnContext {
            xid: 999,
            snapshot: a.xid - 1,
            isolation: Isolation::Snapshot,
        };
        let view = VisibilityView {
            xid: 999,
            snapshot: c.snapshot,
            active: Default::default(),
            aborted: Default::default(),
        };
        assert!(!view.visible(a.xid, None));
    }

    #[test]
    fn test_deleted_rows_hidden_after_commit() {
        let m = manager();
        let writer = m.begin(Isolation::Snapshot).unwrap();
        m.mark_committed(writer.xid);
        let deleter = m.begin(Isolation::Snapshot).unwrap();
        m.mark_committed(deleter.xid);

        let reader = m.begin(Isolation::Snapshot).unwrap();
        let view = m.view(&reader);
        // created by writer, deleted by deleter, both committed at or below
        // the reader snapshot
        assert!(!view.visible(writer.xid, Some(deleter.xid)));
        // delete above the snapshot keeps the row visible
        assert!(view.visible(writer.xid, Some(reader.xid + 10)));
    }

    #[test]
    fn test_aborted_writes_invisible() {
        let m = manager();
        let a = m.begin(Isolation::Snapshot).unwrap();
        m.mark_aborted(a.xid);
        let b = m.begin(Isolation::Snapshot).unwrap();
        // watermark never advanced, but even if xid were below snapshot the
        // aborted set blocks it
        assert!(!m.view(&b).visible(a.xid, None));
    }

    #[test]
    fn test_conflict_detection() {
        let m = manager();
        let a = m.begin(Isolation::Snapshot).unwrap();
        let b = m.begin(Isolation::Snapshot).unwrap();
        let view_b = m.view(&b);
        assert!(view_b.conflicts(a.xid));
        m.mark_committed(a.xid);
        // committed after b's snapshot still conflicts
        let view_b = m.view(&b);
        assert!(view_b.conflicts(a.xid));
    }

    #[test]
    fn test_max_active_enforced() {
        let m = TransactionManager::new(1);
        let _a = m.begin(Isolation::Snapshot).unwrap();
        assert!(m.begin(Isolation::Snapshot).is_err());
    }

    #[test]
    fn test_oldest_active_snapshot_floor() {
        let m = manager();
        let a = m.begin(Isolation::Snapshot).unwrap();
        m.mark_committed(a.xid);
        let b = m.begin(Isolation::Snapshot).unwrap();
        let _c = m.begin(Isolation::Snapshot).unwrap();
        assert_eq!(m.oldest_active_snapshot(), b.snapshot);
    }
}
