//! Registry change events
//!
//! Every write to the registry is fanned out as one of these events so the
//! partitioner and the node agents can converge without polling.

use crate::models::{AssignmentRecord, ReleaseAck};
use serde::{Deserialize, Serialize};

/// Registry change notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RegistryEvent {
    // ========================================================================
    // Pool events
    // ========================================================================
    /// A pool was created or its definition changed
    PoolUpserted { pool: String },

    /// A pool was deleted
    PoolDeleted { pool: String },

    // ========================================================================
    // Node events
    // ========================================================================
    /// A node joined or its labels changed
    NodeUpserted { node: String },

    /// A node left the cluster
    NodeDeleted { node: String },

    // ========================================================================
    // Assignment events
    // ========================================================================
    /// An assignment record was published
    AssignmentUpserted(AssignmentRecord),

    /// An assignment record was withdrawn
    AssignmentDeleted { pool: String, node: String },

    /// A node acknowledged that a draining assignment is empty
    ReleaseAcknowledged(ReleaseAck),
}

impl RegistryEvent {
    /// Pool the event is scoped to, `None` for node events
    pub fn pool(&self) -> Option<&str> {
        match self {
            RegistryEvent::PoolUpserted { pool }
            | RegistryEvent::PoolDeleted { pool }
            | RegistryEvent::AssignmentDeleted { pool, .. } => Some(pool),
            RegistryEvent::AssignmentUpserted(record) => Some(&record.pool),
            RegistryEvent::ReleaseAcknowledged(ack) => Some(&ack.pool),
            RegistryEvent::NodeUpserted { .. } | RegistryEvent::NodeDeleted { .. } => None,
        }
    }

    /// Node an assignment event concerns
    pub fn assignment_node(&self) -> Option<&str> {
        match self {
            RegistryEvent::AssignmentUpserted(record) => Some(&record.node),
            RegistryEvent::AssignmentDeleted { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            RegistryEvent::PoolUpserted { pool } => format!("pool {} upserted", pool),
            RegistryEvent::PoolDeleted { pool } => format!("pool {} deleted", pool),
            RegistryEvent::NodeUpserted { node } => format!("node {} upserted", node),
            RegistryEvent::NodeDeleted { node } => format!("node {} deleted", node),
            RegistryEvent::AssignmentUpserted(record) => format!(
                "assignment {}/{} {:?} generation {}",
                record.pool, record.node, record.state, record.generation
            ),
            RegistryEvent::AssignmentDeleted { pool, node } => {
                format!("assignment {}/{} deleted", pool, node)
            }
            RegistryEvent::ReleaseAcknowledged(ack) => format!(
                "release of {}/{} acknowledged at generation {}",
                ack.pool, ack.node, ack.generation
            ),
        }
    }
}
