//! Pool reconciliation
//!
//! [`plan`] is a pure function of the published state: the pool, the cluster
//! nodes, the pool's assignment records and release acknowledgements. It
//! never looks at anything cached, so retrying a failed reconcile is always
//! safe. [`PoolPartitioner`] reads that state fresh, plans, and publishes.

use super::policy::PartitionPolicy;
use crate::allocator::BlockCarver;
use crate::models::{AssignmentRecord, AssignmentState, NodeInfo, Pool, ReleaseAck};
use crate::registry::ClusterRegistry;
use crate::{Error, Result};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry writes needed to converge one pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Nodes whose record is deleted; applied before upserts
    pub deletes: Vec<String>,
    /// Records created or changed
    pub upserts: Vec<AssignmentRecord>,
    /// Member nodes no block could be carved for
    pub unplaced: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.upserts.is_empty()
    }
}

/// What happened to an existing record
enum Disposition {
    Keep(AssignmentRecord),
    Delete,
}

/// Compute the writes converging a pool onto its current membership
///
/// Existing records are visited in node order. A record is deleted when its
/// node left the cluster or when its draining release was acknowledged at
/// the current generation. A record whose node left the selector, or that is
/// no longer contained in the pool (or overlaps a record visited earlier),
/// drains first: its addresses stay owned until the node confirms they are
/// free, and the node gets no new block meanwhile. Kept records only change
/// state or pool metadata, never ranges. Member nodes without a record get a
/// new block carved from the remaining free space, in node order.
pub fn plan(
    pool: &Pool,
    nodes: &[NodeInfo],
    existing: &[AssignmentRecord],
    acks: &[ReleaseAck],
    policy: &PartitionPolicy,
) -> Result<ReconcilePlan> {
    let members: BTreeSet<String> = pool.node_selector.members(nodes).into_iter().collect();
    let cluster: BTreeSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    let acked: BTreeMap<&str, u64> = acks
        .iter()
        .filter(|a| a.pool == pool.name)
        .map(|a| (a.node.as_str(), a.generation))
        .collect();

    let mut existing: Vec<&AssignmentRecord> =
        existing.iter().filter(|r| r.pool == pool.name).collect();
    existing.sort_by(|a, b| a.node.cmp(&b.node));

    let meta = pool.meta();
    let mut carver = BlockCarver::new(pool.span);
    let mut result = ReconcilePlan::default();
    let mut placed = BTreeSet::new();
    let mut previous_generation = BTreeMap::new();

    for record in existing {
        previous_generation.insert(record.node.clone(), record.generation);

        let drained = record.state == AssignmentState::Draining
            && acked.get(record.node.as_str()) == Some(&record.generation);
        let fitting = fits(&carver, record);

        let disposition = if !cluster.contains(record.node.as_str()) {
            info!(pool = %pool.name, node = %record.node, "Node left the cluster, freeing assignment");
            Disposition::Delete
        } else if members.contains(&record.node) && fitting {
            match record.state {
                AssignmentState::Active => Disposition::Keep(record.clone()),
                AssignmentState::Draining => {
                    info!(pool = %pool.name, node = %record.node, "Node rejoined, reactivating assignment");
                    Disposition::Keep(record.transitioned(AssignmentState::Active))
                }
            }
        } else {
            match record.state {
                AssignmentState::Active if !fitting => {
                    warn!(
                        pool = %pool.name,
                        node = %record.node,
                        ranges = ?record.ranges,
                        "Assignment no longer fits the pool, draining"
                    );
                    Disposition::Keep(record.transitioned(AssignmentState::Draining))
                }
                AssignmentState::Active => {
                    info!(pool = %pool.name, node = %record.node, "Node left the selector, draining assignment");
                    Disposition::Keep(record.transitioned(AssignmentState::Draining))
                }
                AssignmentState::Draining if drained => {
                    info!(pool = %pool.name, node = %record.node, "Drained assignment released");
                    Disposition::Delete
                }
                AssignmentState::Draining => Disposition::Keep(record.clone()),
            }
        };

        match disposition {
            Disposition::Delete => result.deletes.push(record.node.clone()),
            Disposition::Keep(mut next) => {
                // a draining record that no longer fits still holds whatever
                // part of it remains inside the span until its release is acked
                for range in &next.ranges {
                    carver.occupy_free(range);
                }
                if next.pool_meta != meta {
                    next = AssignmentRecord {
                        pool_meta: meta.clone(),
                        generation: record.generation + 1,
                        updated_at: Utc::now(),
                        ..next
                    };
                }
                if &next != record {
                    result.upserts.push(next);
                }
                placed.insert(record.node.clone());
            }
        }
    }

    let needing: Vec<&String> = members.iter().filter(|n| !placed.contains(*n)).collect();
    let sizes = policy.block_sizes(pool, carver.free_len(), needing.len());
    for (node, size) in needing.into_iter().zip(sizes) {
        match carver.carve(size) {
            Some(ranges) => {
                let mut record = AssignmentRecord::new(&pool.name, node, ranges, meta.clone());
                if let Some(generation) = previous_generation.get(node) {
                    record.generation = generation + 1;
                }
                debug!(pool = %pool.name, node = %node, ranges = ?record.ranges, "Carved assignment");
                result.upserts.push(record);
            }
            None => result.unplaced.push(node.clone()),
        }
    }

    Ok(result)
}

/// Record ranges are inside the pool, pairwise disjoint and free
fn fits(carver: &BlockCarver, record: &AssignmentRecord) -> bool {
    let span = carver.span();
    let mut ranges = record.ranges.clone();
    ranges.sort();
    let disjoint = ranges.windows(2).all(|pair| !pair[0].overlaps(&pair[1]));
    !ranges.is_empty()
        && disjoint
        && ranges
            .iter()
            .all(|r| span.contains_range(r) && carver.overlapping(r).is_none())
}

/// Outcome of one successful reconcile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// The pool no longer exists and its records were removed
    pub pool_removed: bool,
}

/// Reads published state fresh and converges one pool at a time
pub struct PoolPartitioner {
    registry: Arc<dyn ClusterRegistry>,
    policy: PartitionPolicy,
}

impl PoolPartitioner {
    pub fn new(registry: Arc<dyn ClusterRegistry>, policy: PartitionPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> &PartitionPolicy {
        &self.policy
    }

    /// Converge one pool
    ///
    /// Records that could be placed are published even when some member nodes
    /// could not, the latter are then reported as `PoolExhausted`.
    pub async fn reconcile(&self, pool_name: &str) -> Result<ReconcileOutcome> {
        let Some(pool) = self.registry.get_pool(pool_name).await? else {
            return self.remove_pool(pool_name).await;
        };

        let nodes = self.registry.list_nodes().await?;
        let existing = self.registry.list_assignments(pool_name).await?;
        let acks = self.registry.release_acks(pool_name).await?;
        let plan = plan(&pool, &nodes, &existing, &acks, &self.policy)?;

        let known: BTreeSet<&str> = existing.iter().map(|r| r.node.as_str()).collect();
        let mut outcome = ReconcileOutcome {
            deleted: plan.deletes.len(),
            ..Default::default()
        };

        // deletes first so freed space is never published twice
        for node in &plan.deletes {
            self.registry.delete_assignment(pool_name, node).await?;
        }
        for record in &plan.upserts {
            // a withdrawn node's replacement counts as created
            if known.contains(record.node.as_str()) && !plan.deletes.contains(&record.node) {
                outcome.updated += 1;
            } else {
                outcome.created += 1;
            }
            self.registry.put_assignment(record.clone()).await?;
        }

        if !plan.is_empty() {
            info!(
                pool = %pool_name,
                created = outcome.created,
                updated = outcome.updated,
                deleted = outcome.deleted,
                "Reconciled pool"
            );
        }

        if !plan.unplaced.is_empty() {
            return Err(Error::PoolExhausted {
                pool: pool_name.to_string(),
                unplaced: plan.unplaced,
            });
        }
        Ok(outcome)
    }

    /// Delete every record of a pool that no longer exists
    async fn remove_pool(&self, pool_name: &str) -> Result<ReconcileOutcome> {
        let existing = self.registry.list_assignments(pool_name).await?;
        for record in &existing {
            self.registry.delete_assignment(pool_name, &record.node).await?;
        }
        if !existing.is_empty() {
            info!(pool = %pool_name, deleted = existing.len(), "Removed assignments of deleted pool");
        }
        Ok(ReconcileOutcome {
            deleted: existing.len(),
            pool_removed: true,
            ..Default::default()
        })
    }
}
