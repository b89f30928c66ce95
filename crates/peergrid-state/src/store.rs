//! StateStore — the replicated state machine's backing store.
//!
//! The store is manipulated by the consensus layer, which delivers mutation
//! commands in a single total order; every command carries the consensus
//! index it was committed at. Writes are serialized by the environment's
//! single-writer rule and applied atomically across all touched tables,
//! advancing each table's watermark to the command's index. Reads run in
//! MVCC snapshots and never block the writer; every query reports the max
//! watermark of its table group so callers can long-poll for change via
//! [`StateStore::watch`].

use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StateError, StateResult};
use crate::kv::{Env, Txn};
use crate::notify::NotifyGroup;
use crate::table::{self, IndexSchema, Table};
use crate::types::*;

/// Channel depth for streaming reads.
const STREAM_BUFFER: usize = 128;

/// Identifies one of the store's logical tables, for watch registration
/// and query-group declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableId {
    Nodes,
    Services,
    Checks,
    Kvs,
    Sessions,
    SessionChecks,
}

impl TableId {
    pub const ALL: [TableId; 6] = [
        TableId::Nodes,
        TableId::Services,
        TableId::Checks,
        TableId::Kvs,
        TableId::Sessions,
        TableId::SessionChecks,
    ];

    /// The table's sub-database name in the environment.
    pub fn table_name(self) -> &'static str {
        match self {
            TableId::Nodes => "nodes",
            TableId::Services => "services",
            TableId::Checks => "checks",
            TableId::Kvs => "kvs",
            TableId::Sessions => "sessions",
            TableId::SessionChecks => "sessionChecks",
        }
    }
}

/// Transactional multi-version store over the catalog, KV tree, and
/// session tables.
pub struct StateStore {
    pub(crate) env: Arc<Env>,
    pub(crate) nodes: Table<Node>,
    pub(crate) services: Table<ServiceNode>,
    pub(crate) checks: Table<HealthCheck>,
    pub(crate) kvs: Table<DirEntry>,
    pub(crate) sessions: Table<Session>,
    pub(crate) session_checks: Table<SessionCheck>,
    watch: HashMap<TableId, NotifyGroup>,
    query_tables: HashMap<&'static str, Vec<TableId>>,
}

impl StateStore {
    /// Create a store backed by a fresh temporary directory. The directory
    /// is removed when the store is dropped; upstream consensus replays
    /// state on restart.
    pub fn new() -> StateResult<Self> {
        Self::with_env(Env::open()?)
    }

    /// Create a store backed entirely by memory (for testing).
    pub fn new_in_memory() -> StateResult<Self> {
        Self::with_env(Env::open_in_memory()?)
    }

    /// Backing directory of an on-disk store; `None` in memory.
    pub fn path(&self) -> Option<&std::path::Path> {
        self.env.path()
    }

    fn with_env(env: Env) -> StateResult<Self> {
        let env = Arc::new(env);

        let nodes = Table::new(
            Arc::clone(&env),
            TableId::Nodes.table_name(),
            vec![IndexSchema::unique("id", vec![|n: &Node| n.node.as_str()])],
        );
        let services = Table::new(
            Arc::clone(&env),
            TableId::Services.table_name(),
            vec![
                IndexSchema::unique(
                    "id",
                    vec![
                        |s: &ServiceNode| s.node.as_str(),
                        |s: &ServiceNode| s.service_id.as_str(),
                    ],
                ),
                IndexSchema::non_unique("service", vec![|s: &ServiceNode| s.service_name.as_str()])
                    .allow_blank(),
            ],
        );
        let checks = Table::new(
            Arc::clone(&env),
            TableId::Checks.table_name(),
            vec![
                IndexSchema::unique(
                    "id",
                    vec![
                        |c: &HealthCheck| c.node.as_str(),
                        |c: &HealthCheck| c.check_id.as_str(),
                    ],
                ),
                IndexSchema::non_unique("status", vec![|c: &HealthCheck| c.status.as_str()]),
                IndexSchema::non_unique("service", vec![|c: &HealthCheck| c.service_name.as_str()])
                    .allow_blank(),
                IndexSchema::non_unique(
                    "node",
                    vec![
                        |c: &HealthCheck| c.node.as_str(),
                        |c: &HealthCheck| c.service_id.as_str(),
                    ],
                )
                .allow_blank(),
            ],
        );
        let kvs = Table::new(
            Arc::clone(&env),
            TableId::Kvs.table_name(),
            vec![
                IndexSchema::unique("id", vec![|d: &DirEntry| d.key.as_str()]),
                IndexSchema::virtual_prefix("id_prefix", "id"),
            ],
        );
        let sessions = Table::new(
            Arc::clone(&env),
            TableId::Sessions.table_name(),
            vec![
                IndexSchema::unique("id", vec![|s: &Session| s.id.as_str()]),
                IndexSchema::non_unique("node", vec![|s: &Session| s.node.as_str()]).allow_blank(),
            ],
        );
        let session_checks = Table::new(
            Arc::clone(&env),
            TableId::SessionChecks.table_name(),
            vec![IndexSchema::unique(
                "id",
                vec![
                    |s: &SessionCheck| s.node.as_str(),
                    |s: &SessionCheck| s.check_id.as_str(),
                    |s: &SessionCheck| s.session.as_str(),
                ],
            )],
        );

        let txn = env.begin(false)?;
        nodes.init(&txn)?;
        services.init(&txn)?;
        checks.init(&txn)?;
        kvs.init(&txn)?;
        sessions.init(&txn)?;
        session_checks.init(&txn)?;
        txn.commit()?;

        let mut watch = HashMap::new();
        for id in TableId::ALL {
            watch.insert(id, NotifyGroup::new());
        }

        let query_tables = HashMap::from([
            ("Nodes", vec![TableId::Nodes]),
            ("Services", vec![TableId::Services]),
            ("ServiceNodes", vec![TableId::Nodes, TableId::Services]),
            ("NodeServices", vec![TableId::Nodes, TableId::Services]),
            ("ChecksInState", vec![TableId::Checks]),
            ("NodeChecks", vec![TableId::Checks]),
            ("ServiceChecks", vec![TableId::Checks]),
            (
                "CheckServiceNodes",
                vec![TableId::Nodes, TableId::Services, TableId::Checks],
            ),
            (
                "NodeInfo",
                vec![TableId::Nodes, TableId::Services, TableId::Checks],
            ),
            (
                "NodeDump",
                vec![TableId::Nodes, TableId::Services, TableId::Checks],
            ),
            ("KVSGet", vec![TableId::Kvs]),
            ("KVSList", vec![TableId::Kvs]),
            ("KVSListKeys", vec![TableId::Kvs]),
        ]);

        debug!("state store initialized");
        Ok(Self {
            env,
            nodes,
            services,
            checks,
            kvs,
            sessions,
            session_checks,
            watch,
            query_tables,
        })
    }

    // ── Watch surface ──────────────────────────────────────────────

    /// Register `notify` as a one-shot subscriber on each table's notify
    /// group. Watch before querying: the returned query index plus a
    /// pre-registered watcher together guarantee no update is missed.
    pub fn watch(&self, tables: &[TableId], notify: &Sender<()>) {
        for id in tables {
            if let Some(group) = self.watch.get(id) {
                group.wait(notify.clone());
            }
        }
    }

    /// The canonical table group behind a named query, so watchers know
    /// which notify groups cover it. Unknown names return `None`.
    pub fn query_tables(&self, query: &str) -> Option<&[TableId]> {
        self.query_tables.get(query).map(|v| v.as_slice())
    }

    fn query_group(&self, query: &'static str) -> &[TableId] {
        self.query_tables
            .get(query)
            .map(|v| v.as_slice())
            .unwrap_or_else(|| panic!("query '{query}' has no table group"))
    }

    /// Fire the notify group of each touched table. Called strictly after
    /// a successful commit so subscribers observe committed state.
    fn notify(&self, tables: &[TableId]) {
        for id in tables {
            if let Some(group) = self.watch.get(id) {
                group.notify();
            }
        }
    }

    pub(crate) fn group_index(&self, txn: &Txn, tables: &[TableId]) -> StateResult<u64> {
        let mut max = 0;
        for id in tables {
            let meta = table::meta_db_name(id.table_name());
            max = max.max(table::read_last_index(txn, &meta)?);
        }
        Ok(max)
    }

    // ── Catalog writes ─────────────────────────────────────────────

    /// Register a node or update its address.
    pub fn ensure_node(&self, index: u64, node: &Node) -> StateResult<()> {
        let txn = self.env.begin(false)?;
        self.nodes.insert_txn(&txn, node)?;
        self.nodes.set_last_index_txn(&txn, index)?;
        txn.commit()?;
        self.notify(&[TableId::Nodes]);
        debug!(index, node = %node.node, "node registered");
        Ok(())
    }

    /// Register a service instance on a node, which must already exist.
    pub fn ensure_service(&self, index: u64, node: &str, service: &NodeService) -> StateResult<()> {
        let txn = self.env.begin(false)?;
        if self.nodes.get_txn(&txn, "id", &[node])?.is_empty() {
            return Err(StateError::MissingNode(node.to_string()));
        }

        let entry = ServiceNode {
            node: node.to_string(),
            address: String::new(),
            service_id: service.id.clone(),
            service_name: service.service.clone(),
            service_tags: service.tags.clone(),
            service_port: service.port,
        };
        self.services.insert_txn(&txn, &entry)?;
        self.services.set_last_index_txn(&txn, index)?;
        txn.commit()?;
        self.notify(&[TableId::Services]);
        debug!(index, node, service = %service.id, "service registered");
        Ok(())
    }

    /// Register a health check or update its state. The node must exist;
    /// if the check names a service, that service must exist on the node
    /// and the stored check adopts its service name.
    pub fn ensure_check(&self, index: u64, check: &HealthCheck) -> StateResult<()> {
        let mut check = check.clone();
        if check.status.is_empty() {
            check.status = HEALTH_UNKNOWN.to_string();
        }

        let txn = self.env.begin(false)?;
        if self.nodes.get_txn(&txn, "id", &[&check.node])?.is_empty() {
            return Err(StateError::MissingNode(check.node.clone()));
        }
        if !check.service_id.is_empty() {
            let services =
                self.services
                    .get_txn(&txn, "id", &[&check.node, &check.service_id])?;
            let Some(service) = services.first() else {
                return Err(StateError::MissingService(check.service_id.clone()));
            };
            check.service_name = service.service_name.clone();
        }

        self.checks.insert_txn(&txn, &check)?;
        self.checks.set_last_index_txn(&txn, index)?;
        txn.commit()?;
        self.notify(&[TableId::Checks]);
        debug!(index, node = %check.node, check = %check.check_id, status = %check.status, "check registered");
        Ok(())
    }

    /// Remove a service instance and every check attached to it.
    /// Watermarks advance only on tables that actually lost a row.
    pub fn delete_node_service(&self, index: u64, node: &str, id: &str) -> StateResult<()> {
        let txn = self.env.begin(false)?;
        let mut touched = Vec::new();
        if self.services.delete_txn(&txn, "id", &[node, id])? > 0 {
            self.services.set_last_index_txn(&txn, index)?;
            touched.push(TableId::Services);
        }
        if self.checks.delete_txn(&txn, "node", &[node, id])? > 0 {
            self.checks.set_last_index_txn(&txn, index)?;
            touched.push(TableId::Checks);
        }
        txn.commit()?;
        self.notify(&touched);
        debug!(index, node, service = id, "service deleted");
        Ok(())
    }

    /// Remove a node and cascade to all of its services and checks.
    pub fn delete_node(&self, index: u64, node: &str) -> StateResult<()> {
        let txn = self.env.begin(false)?;
        let mut touched = Vec::new();
        if self.services.delete_txn(&txn, "id", &[node])? > 0 {
            self.services.set_last_index_txn(&txn, index)?;
            touched.push(TableId::Services);
        }
        if self.checks.delete_txn(&txn, "id", &[node])? > 0 {
            self.checks.set_last_index_txn(&txn, index)?;
            touched.push(TableId::Checks);
        }
        if self.nodes.delete_txn(&txn, "id", &[node])? > 0 {
            self.nodes.set_last_index_txn(&txn, index)?;
            touched.push(TableId::Nodes);
        }
        txn.commit()?;
        self.notify(&touched);
        debug!(index, node, "node deleted");
        Ok(())
    }

    /// Remove a single health check.
    pub fn delete_node_check(&self, index: u64, node: &str, id: &str) -> StateResult<()> {
        let txn = self.env.begin(false)?;
        let mut touched = Vec::new();
        if self.checks.delete_txn(&txn, "id", &[node, id])? > 0 {
            self.checks.set_last_index_txn(&txn, index)?;
            touched.push(TableId::Checks);
        }
        txn.commit()?;
        self.notify(&touched);
        Ok(())
    }

    // ── Catalog reads ──────────────────────────────────────────────

    /// Look up one node. Not-found is `None`, never an error.
    pub fn get_node(&self, name: &str) -> StateResult<(u64, Option<Node>)> {
        let (index, mut rows) = self.nodes.get("id", &[name])?;
        Ok((index, rows.pop()))
    }

    /// All known nodes in name order.
    pub fn nodes(&self) -> StateResult<(u64, Vec<Node>)> {
        self.nodes.get("id", &[])
    }

    /// A node joined with all services registered on it, keyed by
    /// service id.
    pub fn node_services(&self, name: &str) -> StateResult<(u64, Option<NodeServices>)> {
        let txn = self.env.begin(true)?;
        let index = self.group_index(&txn, self.query_group("NodeServices"))?;
        let result = self.parse_node_services(&txn, name)?;
        Ok((index, result))
    }

    pub(crate) fn parse_node_services(
        &self,
        txn: &Txn,
        name: &str,
    ) -> StateResult<Option<NodeServices>> {
        let mut rows = self.nodes.get_txn(txn, "id", &[name])?;
        let Some(node) = rows.pop() else {
            return Ok(None);
        };
        let mut result = NodeServices {
            node,
            services: HashMap::new(),
        };
        for service in self.services.get_txn(txn, "id", &[name])? {
            result
                .services
                .insert(service.service_id.clone(), service.to_node_service());
        }
        Ok(Some(result))
    }

    /// Service names with the union of tags seen across their instances.
    pub fn services(&self) -> StateResult<(u64, HashMap<String, Vec<String>>)> {
        let (index, rows) = self.services.get("id", &[])?;
        let mut services: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let tags = services.entry(row.service_name).or_default();
            for tag in row.service_tags {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        Ok((index, services))
    }

    /// All instances of a service, each joined with its node's address.
    pub fn service_nodes(&self, service: &str) -> StateResult<(u64, Vec<ServiceNode>)> {
        let txn = self.env.begin(true)?;
        let index = self.group_index(&txn, self.query_group("ServiceNodes"))?;
        let rows = self.services.get_txn(&txn, "service", &[service])?;
        Ok((index, self.parse_service_nodes(&txn, rows)?))
    }

    /// Like [`StateStore::service_nodes`], keeping only instances that
    /// carry `tag`.
    pub fn service_tag_nodes(&self, service: &str, tag: &str) -> StateResult<(u64, Vec<ServiceNode>)> {
        let txn = self.env.begin(true)?;
        let index = self.group_index(&txn, self.query_group("ServiceNodes"))?;
        let rows = self.services.get_txn(&txn, "service", &[service])?;
        let rows = service_tag_filter(rows, tag);
        Ok((index, self.parse_service_nodes(&txn, rows)?))
    }

    fn parse_service_nodes(
        &self,
        txn: &Txn,
        rows: Vec<ServiceNode>,
    ) -> StateResult<Vec<ServiceNode>> {
        let mut out = Vec::with_capacity(rows.len());
        for mut service in rows {
            let mut nodes = self.nodes.get_txn(txn, "id", &[&service.node])?;
            let Some(node) = nodes.pop() else {
                warn!(node = %service.node, service = %service.service_id, "service row references missing node");
                continue;
            };
            service.address = node.address;
            out.push(service);
        }
        Ok(out)
    }

    /// All checks registered on a node.
    pub fn node_checks(&self, node: &str) -> StateResult<(u64, Vec<HealthCheck>)> {
        self.checks.get("id", &[node])
    }

    /// All checks attached to instances of a service.
    pub fn service_checks(&self, service: &str) -> StateResult<(u64, Vec<HealthCheck>)> {
        self.checks.get("service", &[service])
    }

    /// All checks currently in the given state.
    pub fn checks_in_state(&self, state: &str) -> StateResult<(u64, Vec<HealthCheck>)> {
        self.checks.get("status", &[state])
    }

    /// Instances of a service, each with its node and the checks that
    /// gate it: the service's own plus the node-wide ones.
    pub fn check_service_nodes(&self, service: &str) -> StateResult<(u64, Vec<CheckServiceNode>)> {
        let txn = self.env.begin(true)?;
        let index = self.group_index(&txn, self.query_group("CheckServiceNodes"))?;
        let rows = self.services.get_txn(&txn, "service", &[service])?;
        Ok((index, self.parse_check_service_nodes(&txn, rows)?))
    }

    /// Like [`StateStore::check_service_nodes`], keeping only instances
    /// that carry `tag`.
    pub fn check_service_tag_nodes(
        &self,
        service: &str,
        tag: &str,
    ) -> StateResult<(u64, Vec<CheckServiceNode>)> {
        let txn = self.env.begin(true)?;
        let index = self.group_index(&txn, self.query_group("CheckServiceNodes"))?;
        let rows = self.services.get_txn(&txn, "service", &[service])?;
        let rows = service_tag_filter(rows, tag);
        Ok((index, self.parse_check_service_nodes(&txn, rows)?))
    }

    fn parse_check_service_nodes(
        &self,
        txn: &Txn,
        rows: Vec<ServiceNode>,
    ) -> StateResult<Vec<CheckServiceNode>> {
        let mut out = Vec::with_capacity(rows.len());
        for service in rows {
            let mut nodes = self.nodes.get_txn(txn, "id", &[&service.node])?;
            let Some(node) = nodes.pop() else {
                warn!(node = %service.node, service = %service.service_id, "service row references missing node");
                continue;
            };
            let mut checks =
                self.checks
                    .get_txn(txn, "node", &[&service.node, &service.service_id])?;
            checks.extend(self.checks.get_txn(txn, "node", &[&service.node, ""])?);
            out.push(CheckServiceNode {
                node,
                service: service.to_node_service(),
                checks,
            });
        }
        Ok(out)
    }

    /// Full info for one node: its services and every check on it.
    pub fn node_info(&self, node: &str) -> StateResult<(u64, Vec<NodeInfo>)> {
        let txn = self.env.begin(true)?;
        let index = self.group_index(&txn, self.query_group("NodeInfo"))?;
        let rows = self.nodes.get_txn(&txn, "id", &[node])?;
        Ok((index, self.parse_node_info(&txn, rows)?))
    }

    /// [`StateStore::node_info`] over every node. Expensive; meant for
    /// operator-facing dumps rather than the hot path.
    pub fn node_dump(&self) -> StateResult<(u64, Vec<NodeInfo>)> {
        let txn = self.env.begin(true)?;
        let index = self.group_index(&txn, self.query_group("NodeDump"))?;
        let rows = self.nodes.get_txn(&txn, "id", &[])?;
        Ok((index, self.parse_node_info(&txn, rows)?))
    }

    fn parse_node_info(&self, txn: &Txn, nodes: Vec<Node>) -> StateResult<Vec<NodeInfo>> {
        let mut dump = Vec::with_capacity(nodes.len());
        for node in nodes {
            let services = self
                .services
                .get_txn(txn, "id", &[&node.node])?
                .iter()
                .map(ServiceNode::to_node_service)
                .collect();
            let checks = self.checks.get_txn(txn, "node", &[&node.node])?;
            dump.push(NodeInfo {
                node: node.node,
                address: node.address,
                services,
                checks,
            });
        }
        Ok(dump)
    }

    // ── Key/value writes ───────────────────────────────────────────

    /// Create or update a KV entry. The first write of a key fixes its
    /// create index; every write stamps the modify index.
    pub fn kvs_set(&self, index: u64, entry: &DirEntry) -> StateResult<()> {
        let txn = self.env.begin(false)?;
        let existing = self.kvs.get_txn(&txn, "id", &[&entry.key])?;

        let mut entry = entry.clone();
        entry.create_index = existing
            .first()
            .map(|prior| prior.create_index)
            .unwrap_or(index);
        entry.modify_index = index;

        self.kvs.insert_txn(&txn, &entry)?;
        self.kvs.set_last_index_txn(&txn, index)?;
        txn.commit()?;
        self.notify(&[TableId::Kvs]);
        Ok(())
    }

    /// Atomic check-and-set. `modify_index == 0` succeeds only when the
    /// key is absent; `modify_index > 0` succeeds only when the stored
    /// entry's modify index matches exactly. A failed check returns
    /// `Ok(false)` with no watermark change and no notification; `Err` is
    /// reserved for engine faults.
    pub fn kvs_check_and_set(&self, index: u64, entry: &DirEntry) -> StateResult<bool> {
        let txn = self.env.begin(false)?;
        let existing = self.kvs.get_txn(&txn, "id", &[&entry.key])?;
        let prior = existing.first();

        if entry.modify_index == 0 && prior.is_some() {
            return Ok(false);
        }
        if entry.modify_index > 0
            && prior.map(|p| p.modify_index) != Some(entry.modify_index)
        {
            return Ok(false);
        }

        let mut entry = entry.clone();
        entry.create_index = prior.map(|p| p.create_index).unwrap_or(index);
        entry.modify_index = index;

        self.kvs.insert_txn(&txn, &entry)?;
        self.kvs.set_last_index_txn(&txn, index)?;
        txn.commit()?;
        self.notify(&[TableId::Kvs]);
        Ok(true)
    }

    /// Remove a single key.
    pub fn kvs_delete(&self, index: u64, key: &str) -> StateResult<()> {
        self.kvs_delete_with_index(index, "id", &[key])
    }

    /// Remove every key under a prefix; an empty prefix clears the whole
    /// tree. The watermark advances only when something was removed.
    pub fn kvs_delete_tree(&self, index: u64, prefix: &str) -> StateResult<()> {
        if prefix.is_empty() {
            self.kvs_delete_with_index(index, "id", &[])
        } else {
            self.kvs_delete_with_index(index, "id_prefix", &[prefix])
        }
    }

    fn kvs_delete_with_index(
        &self,
        index: u64,
        table_index: &str,
        parts: &[&str],
    ) -> StateResult<()> {
        let txn = self.env.begin(false)?;
        let mut touched = Vec::new();
        if self.kvs.delete_txn(&txn, table_index, parts)? > 0 {
            self.kvs.set_last_index_txn(&txn, index)?;
            touched.push(TableId::Kvs);
        }
        txn.commit()?;
        self.notify(&touched);
        Ok(())
    }

    /// Re-insert an entry during restore. No precondition checks; the
    /// entry's own indexes are kept, and the watermark only ever moves
    /// forward so out-of-order replay cannot rewind it.
    pub fn kvs_restore(&self, entry: &DirEntry) -> StateResult<()> {
        let txn = self.env.begin(false)?;
        self.kvs.insert_txn(&txn, entry)?;
        self.kvs.set_max_last_index_txn(&txn, entry.modify_index)?;
        txn.commit()?;
        self.notify(&[TableId::Kvs]);
        Ok(())
    }

    // ── Key/value reads ────────────────────────────────────────────

    /// Point lookup of one key.
    pub fn kvs_get(&self, key: &str) -> StateResult<(u64, Option<DirEntry>)> {
        let (index, mut rows) = self.kvs.get("id", &[key])?;
        Ok((index, rows.pop()))
    }

    /// Every entry under a prefix, in key order.
    pub fn kvs_list(&self, prefix: &str) -> StateResult<(u64, Vec<DirEntry>)> {
        self.kvs.get("id_prefix", &[prefix])
    }

    /// Keys under `prefix`, collapsed at the first `seperator` found past
    /// the prefix: deeper entries are folded into their directory-like
    /// boundary, consecutive duplicates suppressed. An empty `seperator`
    /// lists every full key. Streams the scan so memory stays bounded by
    /// the result, not the tree.
    pub fn kvs_list_keys(&self, prefix: &str, seperator: &str) -> StateResult<(u64, Vec<String>)> {
        let txn = self.env.begin(true)?;
        let index = self.kvs.last_index_txn(&txn)?;

        let (sender, receiver) = sync_channel::<DirEntry>(STREAM_BUFFER);
        let keys = thread::scope(|scope| -> StateResult<Vec<String>> {
            let collector = scope.spawn(move || collapse_keys(receiver, prefix, seperator));
            self.kvs.stream_txn(&txn, sender, "id_prefix", &[prefix])?;
            Ok(collector.join().expect("key collector panicked"))
        })?;
        Ok((index, keys))
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Create a session on a node. Every referenced check must exist on
    /// that node and not be critical. On success `session.id` holds a
    /// fresh unique id and one cross-reference row exists per check.
    pub fn session_create(&self, index: u64, session: &mut Session) -> StateResult<()> {
        session.create_index = index;

        let txn = self.env.begin(false)?;
        if self.nodes.get_txn(&txn, "id", &[&session.node])?.is_empty() {
            return Err(StateError::MissingNode(session.node.clone()));
        }
        for check_id in &session.checks {
            let checks = self
                .checks
                .get_txn(&txn, "id", &[&session.node, check_id])?;
            let Some(check) = checks.first() else {
                return Err(StateError::MissingCheck(check_id.clone()));
            };
            if check.status == HEALTH_CRITICAL {
                return Err(StateError::CheckCritical(
                    check_id.clone(),
                    check.status.clone(),
                ));
            }
        }

        // Re-roll until the id is unique; collisions are astronomically
        // unlikely, so the loop is unbounded.
        loop {
            let id = Uuid::new_v4().to_string();
            if self.sessions.get_txn(&txn, "id", &[&id])?.is_empty() {
                session.id = id;
                break;
            }
        }

        self.sessions.insert_txn(&txn, session)?;
        for check_id in &session.checks {
            let cross_ref = SessionCheck {
                node: session.node.clone(),
                check_id: check_id.clone(),
                session: session.id.clone(),
            };
            self.session_checks.insert_txn(&txn, &cross_ref)?;
        }

        self.sessions.set_last_index_txn(&txn, index)?;
        self.session_checks.set_last_index_txn(&txn, index)?;
        txn.commit()?;
        self.notify(&[TableId::Sessions, TableId::SessionChecks]);
        debug!(index, node = %session.node, session = %session.id, "session created");
        Ok(())
    }

    /// Re-insert a session during restore, skipping precondition checks
    /// and keeping its recorded create index as the watermark floor.
    pub fn session_restore(&self, session: &Session) -> StateResult<()> {
        let txn = self.env.begin(false)?;
        self.sessions.insert_txn(&txn, session)?;
        for check_id in &session.checks {
            let cross_ref = SessionCheck {
                node: session.node.clone(),
                check_id: check_id.clone(),
                session: session.id.clone(),
            };
            self.session_checks.insert_txn(&txn, &cross_ref)?;
        }

        let index = session.create_index;
        self.sessions.set_max_last_index_txn(&txn, index)?;
        self.session_checks.set_max_last_index_txn(&txn, index)?;
        txn.commit()?;
        self.notify(&[TableId::Sessions, TableId::SessionChecks]);
        Ok(())
    }
}

/// Keep only the instances carrying `tag`.
fn service_tag_filter(rows: Vec<ServiceNode>, tag: &str) -> Vec<ServiceNode> {
    rows.into_iter()
        .filter(|s| s.service_tags.iter().any(|t| t == tag))
        .collect()
}

/// Fold streamed keys at the first separator past the prefix. The input
/// arrives in key order, so suppressing consecutive duplicates is enough
/// to deduplicate.
fn collapse_keys(receiver: Receiver<DirEntry>, prefix: &str, seperator: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut last: Option<String> = None;
    for entry in receiver {
        if seperator.is_empty() {
            keys.push(entry.key);
            continue;
        }
        let after = &entry.key[prefix.len()..];
        if let Some(pos) = after.find(seperator) {
            let to_sep = entry.key[..prefix.len() + pos + seperator.len()].to_string();
            if last.as_deref() != Some(to_sep.as_str()) {
                keys.push(to_sep.clone());
                last = Some(to_sep);
            }
        } else {
            keys.push(entry.key);
        }
    }
    keys
}
