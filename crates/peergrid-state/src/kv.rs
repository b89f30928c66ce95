//! Embedded key/value environment.
//!
//! Wraps [redb](https://docs.rs/redb): named tables are the sub-databases,
//! `begin_write` gives the single cluster-wide writer, and `begin_read`
//! gives MVCC readers pinned to the snapshot at their start. Commit is
//! atomic across every sub-database touched by one transaction.
//!
//! The environment is ephemeral. The on-disk variant lives in a temp
//! directory that is removed when the store is dropped, and write
//! transactions commit without fsync: the consensus log above this layer
//! replays all state on restart, so durability is its job, not ours.

use std::path::Path;

use redb::backends::InMemoryBackend;
use redb::{Database, Durability, ReadTransaction, ReadableDatabase, WriteTransaction};
use tempfile::TempDir;
use tracing::debug;

use crate::error::{map_err, StateError, StateResult};

/// Cache ceiling for the environment, sized per address width.
#[cfg(target_pointer_width = "64")]
const DB_MAX_CACHE_SIZE: usize = 32 * 1024 * 1024 * 1024;
#[cfg(not(target_pointer_width = "64"))]
const DB_MAX_CACHE_SIZE: usize = 512 * 1024 * 1024;

/// File name of the environment inside its temp directory.
const DB_FILE: &str = "state.redb";

/// Process-wide KV environment owning the backing database.
pub struct Env {
    db: Database,
    // Held so the directory outlives the database and is removed on drop.
    _dir: Option<TempDir>,
}

impl Env {
    /// Open a fresh environment in a new temporary directory. The
    /// directory and everything in it are removed when the env drops.
    pub fn open() -> StateResult<Self> {
        let dir = TempDir::with_prefix("peergrid-state").map_err(map_err!(Open))?;
        let path = dir.path().join(DB_FILE);
        let db = Database::builder()
            .set_cache_size(DB_MAX_CACHE_SIZE)
            .create(&path)
            .map_err(map_err!(Open))?;
        debug!(?path, "state environment opened");
        Ok(Self {
            db,
            _dir: Some(dir),
        })
    }

    /// Open an environment backed entirely by memory (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(map_err!(Open))?;
        debug!("in-memory state environment opened");
        Ok(Self { db, _dir: None })
    }

    /// Backing directory of an on-disk environment; `None` in memory.
    /// The directory and everything under it vanish when the env drops.
    pub fn path(&self) -> Option<&Path> {
        self._dir.as_ref().map(|dir| dir.path())
    }

    /// Start a transaction. Read transactions observe the snapshot as of
    /// this call and never block the writer; a write transaction blocks
    /// until it is the only one.
    pub fn begin(&self, readonly: bool) -> StateResult<Txn> {
        if readonly {
            let txn = self.db.begin_read().map_err(map_err!(Txn))?;
            Ok(Txn(TxnInner::Read(txn)))
        } else {
            let mut txn = self.db.begin_write().map_err(map_err!(Txn))?;
            txn.set_durability(Durability::None)
                .map_err(map_err!(Txn))?;
            Ok(Txn(TxnInner::Write(txn)))
        }
    }
}

/// An open transaction against the environment. Dropping an uncommitted
/// write transaction aborts it and discards all writes.
pub struct Txn(TxnInner);

enum TxnInner {
    Read(ReadTransaction),
    Write(WriteTransaction),
}

/// Borrowed view of a transaction, for operations that work on both kinds.
pub(crate) enum TxnRef<'a> {
    Read(&'a ReadTransaction),
    Write(&'a WriteTransaction),
}

impl Txn {
    pub fn readonly(&self) -> bool {
        matches!(self.0, TxnInner::Read(_))
    }

    /// Commit all writes atomically; for a read transaction this just
    /// releases the snapshot.
    pub fn commit(self) -> StateResult<()> {
        match self.0 {
            TxnInner::Read(txn) => txn.close().map_err(map_err!(Txn)),
            TxnInner::Write(txn) => txn.commit().map_err(map_err!(Txn)),
        }
    }

    /// Discard the transaction and all of its writes.
    pub fn abort(self) -> StateResult<()> {
        match self.0 {
            TxnInner::Read(txn) => txn.close().map_err(map_err!(Txn)),
            TxnInner::Write(txn) => txn.abort().map_err(map_err!(Txn)),
        }
    }

    pub(crate) fn inner(&self) -> TxnRef<'_> {
        match &self.0 {
            TxnInner::Read(txn) => TxnRef::Read(txn),
            TxnInner::Write(txn) => TxnRef::Write(txn),
        }
    }

    /// The underlying write transaction, or an error on a read-only one.
    pub(crate) fn write(&self) -> StateResult<&WriteTransaction> {
        match &self.0 {
            TxnInner::Write(txn) => Ok(txn),
            TxnInner::Read(_) => Err(StateError::ReadOnlyTxn),
        }
    }
}
