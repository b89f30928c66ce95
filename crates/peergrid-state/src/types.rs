//! Domain types for the Peergrid state store.
//!
//! These types represent the replicated catalog (nodes, services, health
//! checks), the key/value tree, and coordination sessions. All of them are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Check has not reported yet.
pub const HEALTH_UNKNOWN: &str = "unknown";
/// Check is healthy.
pub const HEALTH_PASSING: &str = "passing";
/// Check is degraded but serviceable.
pub const HEALTH_WARNING: &str = "warning";
/// Check is failing; sessions may not attach to critical checks.
pub const HEALTH_CRITICAL: &str = "critical";

// ── Catalog ───────────────────────────────────────────────────────

/// A member node of the grid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub node: String,
    pub address: String,
}

/// A service as registered on a node, in caller-facing shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeService {
    pub id: String,
    pub service: String,
    pub tags: Vec<String>,
    pub port: u16,
}

/// A service row as stored: the node name denormalized next to the
/// service fields. `address` is blank at rest and joined in from the
/// nodes table at query time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceNode {
    pub node: String,
    pub address: String,
    pub service_id: String,
    pub service_name: String,
    pub service_tags: Vec<String>,
    pub service_port: u16,
}

impl ServiceNode {
    /// Caller-facing projection of the service fields.
    pub fn to_node_service(&self) -> NodeService {
        NodeService {
            id: self.service_id.clone(),
            service: self.service_name.clone(),
            tags: self.service_tags.clone(),
            port: self.service_port,
        }
    }
}

/// A health check registered on a node, optionally tied to a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    pub node: String,
    pub check_id: String,
    pub name: String,
    /// One of the `HEALTH_*` states; blank defaults to [`HEALTH_UNKNOWN`]
    /// when the check is registered.
    pub status: String,
    pub notes: String,
    /// Blank for node-wide checks.
    pub service_id: String,
    /// Overwritten from the services table when `service_id` is set.
    pub service_name: String,
}

// ── Key/value tree ────────────────────────────────────────────────

/// A single entry in the key/value tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirEntry {
    /// Consensus index of the write that first created this key.
    /// Preserved across updates.
    pub create_index: u64,
    /// Consensus index of the most recent write to this key. Also the
    /// constraint value for check-and-set.
    pub modify_index: u64,
    pub key: String,
    /// Opaque caller-owned bits carried with the entry.
    pub flags: u64,
    pub value: Vec<u8>,
}

// ── Sessions ──────────────────────────────────────────────────────

/// A coordination session tied to a node and a set of its health checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Consensus index at creation time.
    pub create_index: u64,
    /// Populated by `session_create`.
    pub id: String,
    pub name: String,
    pub node: String,
    /// Check ids on `node` whose health gates this session.
    pub checks: Vec<String>,
}

/// Cross-reference row linking a session to one of its attached checks,
/// so the mapping can be walked from either side.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionCheck {
    pub node: String,
    pub check_id: String,
    pub session: String,
}

// ── Query results ─────────────────────────────────────────────────

/// A node together with all services registered on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeServices {
    pub node: Node,
    /// Keyed by service id.
    pub services: HashMap<String, NodeService>,
}

/// One entry of a health-aware service query: the node, the service
/// instance on it, and the checks that apply (service-specific plus
/// node-wide).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckServiceNode {
    pub node: Node,
    pub service: NodeService,
    pub checks: Vec<HealthCheck>,
}

/// Full info about one node: its services and every check on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub node: String,
    pub address: String,
    pub services: Vec<NodeService>,
    pub checks: Vec<HealthCheck>,
}
