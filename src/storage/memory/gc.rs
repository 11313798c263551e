//! Version garbage collection and XID wrap handling
//!
//! A sweep removes versions whose committed delete sits below the oldest
//! active snapshot and whose stamp is older than the age threshold. When the
//! XID counter crosses the wrap threshold and no transactions are active,
//! all stored XIDs are remapped to a dense range above zero, preserving
//! their relative order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::MvccConfig;
use crate::storage::memory::MemoryEngine;

/// Result of one sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub versions_removed: usize,
    pub chains_removed: usize,
    pub remapped: bool,
}

/// One GC pass over every table.
pub fn sweep(engine: &MemoryEngine, age_threshold: Duration) -> SweepStats {
    let mut stats = SweepStats::default();
    let floor = engine.txns.oldest_active_snapshot();

    for (_name, handle) in engine.tables_snapshot() {
        let mut data = handle.write().unwrap();
        let mut emptied: Vec<Vec<u8>> = Vec::new();
        for (pk, chain) in data.chains.iter_mut() {
            let before = chain.len();
            chain.retain(|v| {
                let dead = match v.delete_xid {
                    Some(d) => d <= floor && v.stamp.elapsed() >= age_threshold,
                    None => false,
                };
                !dead
            });
            stats.versions_removed += before - chain.len();
            if chain.is_empty() {
                emptied.push(pk.clone());
            }
        }
        for pk in emptied {
            data.chains.remove(&pk);
            stats.chains_removed += 1;
        }
        if stats.versions_removed > 0 || stats.chains_removed > 0 {
            rebuild_indexes(&mut data);
        }
    }

    if engine.txns.next_xid_value() >= engine.wrap_threshold()
        && engine.txns.active_count() == 0
    {
        remap_xids(engine);
        stats.remapped = true;
    }
    stats
}

/// Rebuild secondary indexes from surviving versions. Runs under the table
/// write lock, so readers never observe a partial index.
fn rebuild_indexes(data: &mut crate::storage::memory::table::TableData) {
    let entries: Vec<(Vec<u8>, Vec<crate::storage::value::Row>)> = data
        .chains
        .iter()
        .map(|(pk, chain)| (pk.clone(), chain.iter().map(|v| v.row.clone()).collect()))
        .collect();
    for index in data.indexes.values_mut() {
        let desc = index.desc.clone();
        *index = crate::storage::memory::table::SecondaryIndex::new(desc);
        for (pk, rows) in &entries {
            for row in rows {
                let value_key = row.key_for(&index.desc.columns);
                index.add(value_key, pk.clone());
            }
        }
    }
}

/// Remap every stored XID to a dense range starting at 2, preserving order.
/// Requires no active transactions; all surviving XIDs are committed.
fn remap_xids(engine: &MemoryEngine) {
    let tables = engine.tables_snapshot();

    let mut xids: BTreeSet<u64> = BTreeSet::new();
    for (_, handle) in &tables {
        let data = handle.read().unwrap();
        for chain in data.chains.values() {
            for v in chain {
                xids.insert(v.create_xid);
                if let Some(d) = v.delete_xid {
                    xids.insert(d);
                }
            }
        }
    }

    let mapping: std::collections::HashMap<u64, u64> = xids
        .iter()
        .enumerate()
        .map(|(i, xid)| (*xid, i as u64 + 2))
        .collect();
    let new_watermark = mapping.values().copied().max().unwrap_or(1);

    for (_, handle) in &tables {
        let mut data = handle.write().unwrap();
        for chain in data.chains.values_mut() {
            for v in chain.iter_mut() {
                v.create_xid = mapping[&v.create_xid];
                if let Some(d) = v.delete_xid {
                    v.delete_xid = Some(mapping[&d]);
                }
            }
        }
    }

    engine.txns.reset_after_remap(new_watermark);
    tracing::info!(new_watermark, "XID remapping sweep complete");
}

/// Long-lived GC task; cancelled via the shutdown channel.
pub async fn run_gc(
    engine: Arc<MemoryEngine>,
    config: MvccConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.gc_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = sweep(&engine, config.gc_age_threshold);
                if stats.versions_removed > 0 || stats.remapped {
                    tracing::debug!(
                        removed = stats.versions_removed,
                        chains = stats.chains_removed,
                        remapped = stats.remapped,
                        "MVCC GC sweep"
                    );
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::debug!("MVCC GC task shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::{BinOp, Expr};
    use crate::storage::engine::{Isolation, ScanRequest, StorageEngine};
    use crate::storage::schema::{
        ColumnDescriptor, PersistencePolicy, SemanticType, TableDescriptor, TableEngine,
    };
    use crate::storage::value::{Row, Value};

    fn desc() -> TableDescriptor {
        TableDescriptor {
            name: "t".into(),
            columns: vec![ColumnDescriptor {
                name: "id".into(),
                data_type: SemanticType::Int,
                nullable: false,
                primary_key: true,
                auto_increment: false,
                default: None,
            }],
            primary_key: vec!["id".into()],
            indexes: vec![],
            persistence: PersistencePolicy::MemoryOnly,
            engine: TableEngine::Hybrid,
            fulltext: vec![],
        }
    }

    fn row(id: i64) -> Row {
        Row::from_pairs(vec![("id".into(), Value::Int(id))])
    }

    #[tokio::test]
    async fn test_sweep_removes_old_tombstones() {
        let engine = MemoryEngine::new(16, 1 << 40);
        engine.create_table(&desc()).await.unwrap();

        let txn = engine.begin(Isolation::Snapshot).unwrap();
        engine.insert(&txn, "t", vec![row(1), row(2)]).await.unwrap();
        engine.commit(&txn).unwrap();

        let txn = engine.begin(Isolation::Snapshot).unwrap();
        engine
            .delete(
                &txn,
                "t",
                Some(&Expr::binary(
                    Expr::column("id"),
                    BinOp::Eq,
                    Expr::Literal(Value::Int(1)),
                )),
            )
            .await
            .unwrap();
        engine.commit(&txn).unwrap();

        // Age threshold zero: the tombstoned version goes away immediately.
        let stats = sweep(&engine, Duration::from_secs(0));
        assert_eq!(stats.versions_removed, 1);
        assert_eq!(stats.chains_removed, 1);

        let reader = engine.begin(Isolation::Snapshot).unwrap();
        let rows = engine.scan(&reader, "t", &ScanRequest::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_respects_age_threshold() {
        let engine = MemoryEngine::new(16, 1 << 40);
        engine.create_table(&desc()).await.unwrap();
        let txn = engine.begin(Isolation::Snapshot).unwrap();
        engine.insert(&txn, "t", vec![row(1)]).await.unwrap();
        engine.commit(&txn).unwrap();
        let txn = engine.begin(Isolation::Snapshot).unwrap();
        engine.delete(&txn, "t", None).await.unwrap();
        engine.commit(&txn).unwrap();

        let stats = sweep(&engine, Duration::from_secs(3600));
        assert_eq!(stats.versions_removed, 0, "young tombstones survive");
    }

    #[tokio::test]
    async fn test_sweep_keeps_versions_visible_to_active_snapshot() {
        let engine = MemoryEngine::new(16, 1 << 40);
        engine.create_table(&desc()).await.unwrap();
        let txn = engine.begin(Isolation::Snapshot).unwrap();
        engine.insert(&txn, "t", vec![row(1)]).await.unwrap();
        engine.commit(&txn).unwrap();

        // An old reader pins the snapshot floor below the delete.
        let pinned = engine.begin(Isolation::Snapshot).unwrap();

        let deleter = engine.begin(Isolation::Snapshot).unwrap();
        engine.delete(&deleter, "t", None).await.unwrap();
        engine.commit(&deleter).unwrap();

        let stats = sweep(&engine, Duration::from_secs(0));
        assert_eq!(stats.versions_removed, 0);

        let rows = engine
            .scan(&pinned, "t", &ScanRequest::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1, "pinned snapshot still sees the row");
    }

    #[tokio::test]
    async fn test_xid_remap_preserves_visibility() {
        // Wrap threshold low enough that the first sweep triggers remapping.
        let engine = MemoryEngine::new(16, 3);
        engine.create_table(&desc()).await.unwrap();
        let txn = engine.begin(Isolation::Snapshot).unwrap();
        engine.insert(&txn, "t", vec![row(1), row(2)]).await.unwrap();
        engine.commit(&txn).unwrap();
        let txn = engine.begin(Isolation::Snapshot).unwrap();
        engine
            .delete(
                &txn,
                "t",
                Some(&Expr::binary(
                    Expr::column("id"),
                    BinOp::Eq,
                    Expr::Literal(Value::Int(2)),
                )),
            )
            .await
            .unwrap();
        engine.commit(&txn).unwrap();

        let stats = sweep(&engine, Duration::from_secs(3600));
        assert!(stats.remapped);

        // Post-remap transactions see exactly the same data.
        let reader = engine.begin(Isolation::Snapshot).unwrap();
        let rows = engine
            .scan(&reader, "t", &ScanRequest::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::Int(1)));

        // And new writes still work.
        let writer = engine.begin(Isolation::Snapshot).unwrap();
        engine.insert(&writer, "t", vec![row(3)]).await.unwrap();
        engine.commit(&writer).unwrap();
        let reader = engine.begin(Isolation::Snapshot).unwrap();
        let rows = engine
            .scan(&reader, "t", &ScanRequest::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }
}
