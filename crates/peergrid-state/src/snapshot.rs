//! Point-in-time snapshots for log compaction.
//!
//! A snapshot pins one read transaction across every table and records the
//! group's max watermark at that instant. Because readers are MVCC, writers
//! keep committing while a snapshot is walked; the snapshot keeps seeing the
//! state as of its start. It does retain the read version until closed, so
//! long-lived snapshots should be closed promptly.

use std::sync::mpsc::SyncSender;

use crate::error::StateResult;
use crate::kv::Txn;
use crate::store::{StateStore, TableId};
use crate::types::{DirEntry, HealthCheck, Node, NodeServices};

/// A consistent view of the whole store at one consensus index.
pub struct StateSnapshot<'a> {
    store: &'a StateStore,
    txn: Txn,
    last_index: u64,
}

impl StateStore {
    /// Open a snapshot spanning every table. Writes committed after this
    /// call are invisible to it.
    pub fn snapshot(&self) -> StateResult<StateSnapshot<'_>> {
        let txn = self.env.begin(true)?;
        let last_index = self.group_index(&txn, &TableId::ALL)?;
        Ok(StateSnapshot {
            store: self,
            txn,
            last_index,
        })
    }
}

impl StateSnapshot<'_> {
    /// The largest consensus index reflected in the snapshotted data.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// All nodes as of the snapshot.
    pub fn nodes(&self) -> StateResult<Vec<Node>> {
        self.store.nodes.get_txn(&self.txn, "id", &[])
    }

    /// One node's services as of the snapshot.
    pub fn node_services(&self, name: &str) -> StateResult<Option<NodeServices>> {
        self.store.parse_node_services(&self.txn, name)
    }

    /// One node's checks as of the snapshot.
    pub fn node_checks(&self, node: &str) -> StateResult<Vec<HealthCheck>> {
        self.store.checks.get_txn(&self.txn, "id", &[node])
    }

    /// Stream every KV entry in key order into `sender`, closing it on
    /// completion. Blocks while the channel is full, so run the consumer
    /// concurrently.
    pub fn kvs_dump(&self, sender: SyncSender<DirEntry>) -> StateResult<()> {
        self.store.kvs.stream_txn(&self.txn, sender, "id", &[])
    }

    /// Release the snapshot's read transaction.
    pub fn close(self) -> StateResult<()> {
        self.txn.abort()
    }
}
