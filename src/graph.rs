//! Parent/child relation between tracks.
//!
//! Stored as a mapping from child track to its set of parent tracks, the same
//! shape napari uses for its tracks `graph` argument. One parent with many
//! children is a split; many parents into one child is a merge.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::vertex::TrackId;

/// Directed track-level lineage relation (`parent -> child`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineageGraph {
    parents: BTreeMap<TrackId, BTreeSet<TrackId>>,
}

impl LineageGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from `child -> [parents]` pairs.
    pub fn from_pairs<I, P>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (TrackId, P)>,
        P: IntoIterator<Item = TrackId>,
    {
        let mut graph = Self::new();
        for (child, parents) in pairs {
            for parent in parents {
                graph.add_edge(child, parent);
            }
        }
        graph
    }

    /// Parents of `child` (empty if none).
    pub fn parents_of(&self, child: TrackId) -> impl Iterator<Item = TrackId> + '_ {
        self.parents.get(&child).into_iter().flatten().copied()
    }

    /// Parent set of `child`.
    #[must_use]
    pub fn parent_set(&self, child: TrackId) -> BTreeSet<TrackId> {
        self.parents_of(child).collect()
    }

    /// Children of `parent`, ascending.
    #[must_use]
    pub fn children_of(&self, parent: TrackId) -> Vec<TrackId> {
        self.parents
            .iter()
            .filter(|(_, ps)| ps.contains(&parent))
            .map(|(child, _)| *child)
            .collect()
    }

    /// Returns true if `child` has at least one parent.
    #[must_use]
    pub fn has_parents(&self, child: TrackId) -> bool {
        self.parents.get(&child).is_some_and(|ps| !ps.is_empty())
    }

    /// Returns true if `parent` has at least one child.
    #[must_use]
    pub fn has_children(&self, parent: TrackId) -> bool {
        self.parents.values().any(|ps| ps.contains(&parent))
    }

    /// Returns true if the `parent -> child` edge exists.
    #[must_use]
    pub fn contains_edge(&self, child: TrackId, parent: TrackId) -> bool {
        self.parents.get(&child).is_some_and(|ps| ps.contains(&parent))
    }

    /// Adds `parent -> child`. Returns false if it already existed.
    pub fn add_edge(&mut self, child: TrackId, parent: TrackId) -> bool {
        self.parents.entry(child).or_default().insert(parent)
    }

    /// Removes `parent -> child`. Returns false if it did not exist.
    pub fn remove_edge(&mut self, child: TrackId, parent: TrackId) -> bool {
        let Some(ps) = self.parents.get_mut(&child) else {
            return false;
        };
        let removed = ps.remove(&parent);
        if ps.is_empty() {
            self.parents.remove(&child);
        }
        removed
    }

    /// Removes every edge touching `track`.
    pub fn detach(&mut self, track: TrackId) {
        self.parents.remove(&track);
        self.parents.retain(|_, ps| {
            ps.remove(&track);
            !ps.is_empty()
        });
    }

    /// All edges as `(child, parent)`, sorted.
    pub fn edges(&self) -> impl Iterator<Item = (TrackId, TrackId)> + '_ {
        self.parents
            .iter()
            .flat_map(|(child, ps)| ps.iter().map(move |p| (*child, *p)))
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.parents.values().map(BTreeSet::len).sum()
    }

    /// Every track named by an edge.
    #[must_use]
    pub fn tracks(&self) -> BTreeSet<TrackId> {
        self.edges().flat_map(|(c, p)| [c, p]).collect()
    }

    /// Returns true if `descendant` is reachable from `ancestor` via child edges.
    #[must_use]
    pub fn is_descendant(&self, ancestor: TrackId, descendant: TrackId) -> bool {
        let mut stack = vec![ancestor];
        let mut seen = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            for child in self.children_of(node) {
                if child == descendant {
                    return true;
                }
                stack.push(child);
            }
        }
        false
    }

    /// Returns true if adding `parent -> child` would close a cycle.
    #[must_use]
    pub fn would_create_cycle(&self, child: TrackId, parent: TrackId) -> bool {
        child == parent || self.is_descendant(child, parent)
    }

    /// Returns a track on a cycle, if the graph has one.
    #[must_use]
    pub fn find_cycle(&self) -> Option<TrackId> {
        // Kahn's algorithm over the child->parent relation; leftovers are cyclic.
        let nodes = self.tracks();
        let mut indegree: BTreeMap<TrackId, usize> = nodes.iter().map(|n| (*n, 0)).collect();
        for (child, _) in self.edges() {
            *indegree.entry(child).or_default() += 1;
        }
        let mut ready: Vec<TrackId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        while let Some(node) = ready.pop() {
            for child in self.children_of(node) {
                if let Some(d) = indegree.get_mut(&child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(child);
                    }
                }
            }
            indegree.remove(&node);
        }
        indegree.into_keys().next()
    }

    /// Renames tracks through `rename`, dropping edges that become self-loops.
    #[must_use]
    pub fn relabel(&self, rename: impl Fn(TrackId) -> TrackId) -> Self {
        let mut out = Self::new();
        for (child, parent) in self.edges() {
            let (c, p) = (rename(child), rename(parent));
            if c != p {
                out.add_edge(c, p);
            }
        }
        out
    }
}
