//! peergrid-state — the multi-version state store behind Peergrid's
//! replicated state machine.
//!
//! Backed by [redb](https://docs.rs/redb), which provides MVCC for free:
//! one serialized writer applies consensus-ordered commands atomically
//! across all logical tables, while any number of readers run against
//! consistent snapshots without ever blocking the writer.
//!
//! # Architecture
//!
//! The consensus layer above this crate delivers mutation commands carrying
//! monotonically increasing indexes. [`StateStore`] applies each command in
//! one write transaction spanning every table it touches, stamps the
//! touched tables' watermarks with the command index, and wakes one-shot
//! watchers after commit. Queries return the max watermark of their table
//! group alongside their results, which lets callers long-poll: watch the
//! group, query, and re-query when woken.
//!
//! Domain records are JSON-serialized into redb's `&[u8]` value columns.
//! Secondary and virtual (prefix) indexes are maintained per table by the
//! [`table`] layer. The whole environment is ephemeral (a temp directory,
//! commits without fsync, deleted on drop) because the consensus log
//! replays all state on restart.

pub mod codec;
pub mod error;
pub mod kv;
pub mod notify;
pub mod snapshot;
pub mod store;
pub mod table;
pub mod types;

pub use error::{StateError, StateResult};
pub use notify::NotifyGroup;
pub use snapshot::StateSnapshot;
pub use store::{StateStore, TableId};
pub use types::*;
