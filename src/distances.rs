//! Pairwise tree distances over a forest, computed in a single upward sweep.
//!
//! # Overview
//! Given a set of query ids, the engine folds per-subtree offspring-distance
//! maps up the tree in oldest-last order and emits every pairwise tree
//! distance between ancestors of the query set (the query nodes included).
//! When the whole query set shares one genesis root, the sweep stops at the
//! lowest node that is an ancestor of every query id and reports it as the
//! most recent common ancestor, together with its distances to the visited
//! portion of its subtree; a query set spanning several roots has no common
//! ancestor and no cross-root distances.
//!
//! # Algorithm
//! A keyed max-priority queue is seeded with the query ids. Popping the
//! largest pending id `n` runs three phases:
//!
//! 1. If the queue is empty after the pop and no root has been seen so far,
//!    every pending lineage has merged into `n`: it is the most recent
//!    common ancestor.
//! 2. The parent of `n` is enqueued (idempotently) only while the queue is
//!    still non-empty after the pop, so the common ancestor's own parent is
//!    never visited and the sweep ends at the lowest common ancestor rather
//!    than climbing to a root. A parent-less `n` marks the seen-root flag
//!    instead.
//! 3. The fold: `OD[n]` starts as `{n: 0}` and `(n,n) -> 0` is emitted.
//!    Every already-visited child `c` lifts its map across the parent edge
//!    (`dist + 1`), and every unordered pair of visited children joins
//!    through `n` (`dist1 + dist2 + 2`). Joined pairs are emitted but not
//!    propagated; lifted entries join `OD[n]`. Entries past `max_distance`
//!    are neither emitted nor propagated.
//!
//! Child maps are consumed by their unique parent's fold, so the engine
//! holds at most the active frontier of offspring maps at any moment.

use crate::error::{ForestError, Result};
use crate::forest::{Forest, NodeId};
use crate::queue::PendingQueue;
use itertools::Itertools;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

/// Knobs for a single distance computation.
#[derive(Debug, Clone)]
pub struct DistanceOptions {
    /// Prune every node the sweep does not touch. Survivors are exactly
    /// the visited set; callers that may later grow the forest above the
    /// reported ancestor must leave this off.
    pub remove_unreachable_nodes: bool,
    /// Edge-count ceiling; distances past the cap are neither recorded nor
    /// propagated. Unbounded by default.
    pub max_distance: usize,
}

impl Default for DistanceOptions {
    fn default() -> Self {
        DistanceOptions { remove_unreachable_nodes: false, max_distance: usize::MAX }
    }
}

/// Output of one distance computation.
///
/// Pairwise keys are canonical `(min_id, max_id)` tuples; the reverse
/// ordering is never present. Every visited node carries its `(n,n) -> 0`
/// entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistanceReport {
    /// Lowest node that is an ancestor of every query id, absent when the
    /// set spans several genesis roots.
    pub mrca: Option<NodeId>,
    pub pairwise: HashMap<(NodeId, NodeId), usize>,
    /// Distances from `mrca` down to every visited member of its subtree;
    /// empty when `mrca` is absent.
    pub mrca_distances: HashMap<NodeId, usize>,
}

/// Computes all pairwise distances reachable from `query_ids`.
///
/// Fails with `UnknownQueryId` before touching the forest. On success the
/// forest's cached ancestor is refreshed, and when
/// `remove_unreachable_nodes` is set the unvisited remainder is pruned.
///
/// An empty query set yields an empty report; combined with pruning it
/// therefore empties the forest.
pub fn compute_pairwise_distances(
    forest: &mut Forest,
    query_ids: &HashSet<NodeId>,
    options: &DistanceOptions,
) -> Result<DistanceReport> {
    for &id in query_ids {
        if !forest.contains(id) {
            return Err(ForestError::UnknownQueryId(id));
        }
    }

    let sweep = run_sweep(forest, query_ids, options.max_distance);
    log::debug!(
        "sweep visited {} nodes for {} query ids ({} pairwise entries)",
        sweep.visited.len(),
        query_ids.len(),
        sweep.pairwise.len()
    );

    if options.remove_unreachable_nodes {
        forest.prune_unvisited(&sweep.visited);
    }
    forest.set_mrca(sweep.mrca);

    Ok(DistanceReport {
        mrca: sweep.mrca,
        pairwise: sweep.pairwise,
        mrca_distances: sweep.mrca_distances,
    })
}

/// Runs independent computations across disjoint forests in parallel.
///
/// `forests[i]` is queried with `query_sets[i]` under the shared options;
/// the slices must match in length. Forests are disjoint, so the fan-out
/// needs no locking.
pub fn compute_pairwise_distances_batch(
    forests: &mut [Forest],
    query_sets: &[HashSet<NodeId>],
    options: &DistanceOptions,
) -> Result<Vec<DistanceReport>> {
    if forests.len() != query_sets.len() {
        return Err(ForestError::BatchShapeMismatch {
            forests: forests.len(),
            queries: query_sets.len(),
        });
    }

    forests
        .par_iter_mut()
        .zip(query_sets.par_iter())
        .map(|(forest, query_ids)| compute_pairwise_distances(forest, query_ids, options))
        .collect()
}

struct SweepOutcome {
    mrca: Option<NodeId>,
    pairwise: HashMap<(NodeId, NodeId), usize>,
    mrca_distances: HashMap<NodeId, usize>,
    visited: HashSet<NodeId>,
}

fn run_sweep(forest: &Forest, query_ids: &HashSet<NodeId>, max_distance: usize) -> SweepOutcome {
    let mut queue = PendingQueue::new();
    for &id in query_ids {
        queue.push(id);
    }

    let mut visited: HashSet<NodeId> = HashSet::new();
    // Offspring-distance maps of the active frontier: distance from a
    // visited node down to every visited member of its subtree.
    let mut offspring: HashMap<NodeId, HashMap<NodeId, usize>> = HashMap::new();
    let mut pairwise: HashMap<(NodeId, NodeId), usize> = HashMap::new();
    let mut mrca: Option<NodeId> = None;
    let mut root_seen = false;

    while let Some(current) = queue.pop() {
        // Phase 1: a pop that drains the queue before any root turned up
        // has merged every pending lineage, so it is the lowest common
        // ancestor of the query set.
        if queue.is_empty() && !root_seen {
            mrca = Some(current);
        }

        let node = forest.node(current).expect("swept ids come from the store");

        // Phase 2: climb, but only while other nodes remain pending. The
        // node that drained the queue keeps its parent out of the sweep,
        // which terminates at the lowest common ancestor instead of a root.
        match node.parent() {
            Some(parent) => {
                if !queue.is_empty() {
                    queue.push(parent);
                }
            }
            None => root_seen = true,
        }

        // Phase 3: fold the visited children into the current node.
        let mut fold: HashMap<NodeId, usize> = HashMap::new();
        fold.insert(current, 0);
        pairwise.insert((current, current), 0);

        let folded_children: Vec<NodeId> =
            node.children().iter().copied().filter(|c| visited.contains(c)).collect();

        // Cross parent edges: lift each child map by one.
        for &child in &folded_children {
            for (&descendant, &dist) in &offspring[&child] {
                let lifted = dist + 1;
                if lifted > max_distance {
                    continue;
                }
                fold.insert(descendant, lifted);
                pairwise.insert(ordered(current, descendant), lifted);
            }
        }

        // Cross sibling pairs: join through the current node. Joined pairs
        // are strict descendants on both sides and never propagate.
        for (&left, &right) in folded_children.iter().tuple_combinations::<(_, _)>() {
            for (&d1, &dist1) in &offspring[&left] {
                if dist1 > max_distance {
                    continue;
                }
                for (&d2, &dist2) in &offspring[&right] {
                    let joined = dist1 + dist2 + 2;
                    if joined > max_distance {
                        continue;
                    }
                    pairwise.insert(ordered(d1, d2), joined);
                }
            }
        }

        // Each child map is read exactly once, by its parent.
        for child in &folded_children {
            offspring.remove(child);
        }
        offspring.insert(current, fold);
        visited.insert(current);
    }

    let mrca_distances = mrca.and_then(|id| offspring.remove(&id)).unwrap_or_default();

    SweepOutcome { mrca, pairwise, mrca_distances, visited }
}

fn ordered(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
