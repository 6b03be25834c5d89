//! Working graph and the materializer.
//!
//! Key invariants:
//! - The working graph starts as a copy of the original store and only changes
//!   through [`WorkingGraph::apply`].
//! - `apply` is all-or-nothing: on error the graph is unchanged.
//! - Materialization replays implemented rounds in order and, within a round,
//!   applies corrections in canonical order (lost_vertex, new_vertex,
//!   lost_parent, new_parent, join), so the result depends only on the store
//!   and the implemented partition.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::correction::Correction;
use crate::error::ExecutionError;
use crate::graph::LineageGraph;
use crate::log::{CorrectionId, Fingerprint, LogSnapshot};
use crate::store::LineageStore;
use crate::table::TrackTable;
use crate::vertex::{Position, Slot, TrackId, Vertex};

/// Where a working vertex came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum VertexOrigin {
    /// Present in the original store on `track`.
    Original {
        /// Original track ID.
        track: TrackId,
    },
    /// Added by a `new_vertex` correction.
    Inserted,
}

/// A vertex of the working graph.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkingVertex {
    /// Current identity and position.
    pub vertex: Vertex,
    /// Provenance.
    pub origin: VertexOrigin,
}

impl WorkingVertex {
    /// Original track ID, for vertices that came from the store.
    #[must_use]
    pub fn original_track(&self) -> Option<TrackId> {
        match self.origin {
            VertexOrigin::Original { track } => Some(track),
            VertexOrigin::Inserted => None,
        }
    }
}

type TrackVertices = BTreeMap<i64, WorkingVertex>;

/// Corrected tracks and lineage relation.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingGraph {
    tracks: BTreeMap<TrackId, TrackVertices>,
    graph: LineageGraph,
    absorbed: BTreeMap<TrackId, TrackId>,
}

impl WorkingGraph {
    /// Starts from the original tracking result.
    #[must_use]
    pub fn from_store(store: &LineageStore) -> Self {
        let tracks = store
            .track_map()
            .iter()
            .map(|(id, vertices)| {
                let slots = vertices
                    .iter()
                    .map(|v| {
                        (
                            v.t,
                            WorkingVertex {
                                vertex: *v,
                                origin: VertexOrigin::Original { track: *id },
                            },
                        )
                    })
                    .collect();
                (*id, slots)
            })
            .collect();
        Self {
            tracks,
            graph: store.graph().clone(),
            absorbed: BTreeMap::new(),
        }
    }

    /// Applies one correction.
    ///
    /// # Errors
    /// The `ExecutionError` explaining why the correction is inconsistent with
    /// the current graph. The graph is left unchanged.
    pub fn apply(&mut self, correction: &Correction) -> Result<(), ExecutionError> {
        match *correction {
            Correction::LostVertex { track, position } => self.remove_vertex(track, position),
            Correction::NewVertex { track, position } => self.insert_vertex(track, position),
            Correction::LostParent { child, parent } => self.remove_parent(child, parent),
            Correction::NewParent { child, parent } => self.add_parent(child, parent),
            Correction::Join {
                first,
                second,
                adjacent,
            } => self.join(first, second, adjacent),
        }
    }

    fn ensure_live(&self, track: TrackId) -> Result<(), ExecutionError> {
        match self.absorbed.get(&track) {
            Some(into) => Err(ExecutionError::TrackAbsorbed { track, into: *into }),
            None => Ok(()),
        }
    }

    fn ensure_exists(&self, track: TrackId) -> Result<(), ExecutionError> {
        self.ensure_live(track)?;
        if self.tracks.contains_key(&track) {
            Ok(())
        } else {
            Err(ExecutionError::UnknownTrack { track })
        }
    }

    fn remove_vertex(&mut self, track: TrackId, position: Position) -> Result<(), ExecutionError> {
        self.ensure_live(track)?;
        let not_found = ExecutionError::VertexNotFound { track, t: position.t };
        let slots = self.tracks.get_mut(&track).ok_or_else(|| not_found.clone())?;
        match slots.get(&position.t) {
            Some(wv) if wv.vertex.position().same_as(&position) => {}
            _ => return Err(not_found),
        }
        slots.remove(&position.t);
        if slots.is_empty() {
            self.tracks.remove(&track);
            self.graph.detach(track);
            debug!(track = %track, "track emptied by lost_vertex");
        }
        Ok(())
    }

    fn insert_vertex(&mut self, track: TrackId, position: Position) -> Result<(), ExecutionError> {
        self.ensure_live(track)?;
        let slots = self.tracks.entry(track).or_default();
        if slots.contains_key(&position.t) {
            return Err(ExecutionError::VertexCollision { track, t: position.t });
        }
        slots.insert(
            position.t,
            WorkingVertex {
                vertex: Vertex::at(track, position),
                origin: VertexOrigin::Inserted,
            },
        );
        Ok(())
    }

    fn remove_parent(&mut self, child: TrackId, parent: TrackId) -> Result<(), ExecutionError> {
        self.ensure_live(child)?;
        self.ensure_live(parent)?;
        if self.graph.remove_edge(child, parent) {
            Ok(())
        } else {
            Err(ExecutionError::EdgeNotFound { child, parent })
        }
    }

    fn add_parent(&mut self, child: TrackId, parent: TrackId) -> Result<(), ExecutionError> {
        if child == parent {
            return Err(ExecutionError::CycleDetected { track: child });
        }
        self.ensure_exists(child)?;
        self.ensure_exists(parent)?;
        if self.graph.contains_edge(child, parent) {
            return Err(ExecutionError::EdgeExists { child, parent });
        }
        if self.graph.would_create_cycle(child, parent) {
            return Err(ExecutionError::CycleDetected { track: child });
        }
        self.graph.add_edge(child, parent);
        Ok(())
    }

    fn join(&mut self, first: TrackId, second: TrackId, adjacent: bool) -> Result<(), ExecutionError> {
        if first == second {
            return Err(ExecutionError::CycleDetected { track: first });
        }
        self.ensure_exists(first)?;
        self.ensure_exists(second)?;

        let (Some(absorbed), Some(survivor)) = (self.tracks.get(&first), self.tracks.get(&second)) else {
            return Err(ExecutionError::UnknownTrack { track: first });
        };
        if let Some(t) = absorbed.keys().find(|t| survivor.contains_key(t)) {
            return Err(ExecutionError::OutOfOrderMerge { track: second, t: *t });
        }
        if !adjacent {
            let last = absorbed.keys().next_back();
            let start = survivor.keys().next();
            if let (Some(last), Some(start)) = (last, start) {
                if last >= start {
                    return Err(ExecutionError::OutOfOrderMerge {
                        track: second,
                        t: *start,
                    });
                }
            }
        }

        let rename = |id: TrackId| if id == first { second } else { id };
        let relinked = self.graph.relabel(rename);
        if relinked.find_cycle().is_some() {
            return Err(ExecutionError::CycleDetected { track: second });
        }

        let moved = self.tracks.remove(&first).unwrap_or_default();
        let survivor = self.tracks.entry(second).or_default();
        for (t, mut wv) in moved {
            wv.vertex.track = second;
            survivor.insert(t, wv);
        }
        self.graph = relinked;
        for into in self.absorbed.values_mut() {
            *into = rename(*into);
        }
        self.absorbed.insert(first, second);
        Ok(())
    }

    /// Current ID of a track, following joins.
    #[must_use]
    pub fn resolve_track(&self, track: TrackId) -> TrackId {
        self.absorbed.get(&track).copied().unwrap_or(track)
    }

    /// Absorbed track -> surviving track, for every join applied.
    #[must_use]
    pub fn absorbed(&self) -> &BTreeMap<TrackId, TrackId> {
        &self.absorbed
    }

    /// The working lineage relation.
    #[must_use]
    pub fn graph(&self) -> &LineageGraph {
        &self.graph
    }

    /// IDs of the working tracks, ascending.
    pub fn track_ids(&self) -> impl Iterator<Item = TrackId> + '_ {
        self.tracks.keys().copied()
    }

    /// Vertices of one working track, time-ordered.
    pub fn track(&self, id: TrackId) -> impl Iterator<Item = &WorkingVertex> {
        self.tracks.get(&id).into_iter().flat_map(BTreeMap::values)
    }

    /// Number of vertices on one track.
    #[must_use]
    pub fn track_len(&self, id: TrackId) -> usize {
        self.tracks.get(&id).map_or(0, BTreeMap::len)
    }

    /// First and last frame of a working track.
    #[must_use]
    pub fn span(&self, id: TrackId) -> Option<(i64, i64)> {
        let slots = self.tracks.get(&id)?;
        Some((*slots.keys().next()?, *slots.keys().next_back()?))
    }

    /// The vertex occupying `slot`.
    #[must_use]
    pub fn get(&self, slot: Slot) -> Option<&WorkingVertex> {
        self.tracks.get(&slot.track)?.get(&slot.t)
    }

    /// Every vertex, ordered by `(track, t)`.
    pub fn vertices(&self) -> impl Iterator<Item = &WorkingVertex> {
        self.tracks.values().flat_map(BTreeMap::values)
    }

    /// Total number of vertices.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.tracks.values().map(BTreeMap::len).sum()
    }

    /// Number of tracks.
    #[must_use]
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// The working tracks as a table.
    #[must_use]
    pub fn to_table(&self) -> TrackTable {
        TrackTable::from_vertices(self.vertices().map(|wv| wv.vertex))
    }
}

/// Result of folding the implemented partition over the store.
#[derive(Debug, Clone)]
pub struct Materialized {
    /// The corrected graph.
    pub working: WorkingGraph,
    /// Implemented corrections that no longer applied, with the reason.
    pub skipped: Vec<(CorrectionId, ExecutionError)>,
    /// Fingerprint of the snapshot this was computed from.
    pub fingerprint: Fingerprint,
}

/// Folds `snapshot` over `store`.
///
/// Corrections that fail to apply (possible only when the implemented
/// partition was edited outside the resolver) are skipped and reported.
#[must_use]
pub fn materialize(store: &LineageStore, snapshot: &LogSnapshot) -> Materialized {
    let mut working = WorkingGraph::from_store(store);
    let mut skipped = Vec::new();
    for entry in snapshot.implemented() {
        if let Err(err) = working.apply(&entry.correction) {
            warn!(id = %entry.id, round = entry.round, error = %err, "implemented correction skipped");
            skipped.push((entry.id, err));
        }
    }
    debug!(
        vertices = working.vertex_count(),
        tracks = working.track_count(),
        skipped = skipped.len(),
        fingerprint = %snapshot.fingerprint(),
        "materialized"
    );
    Materialized {
        working,
        skipped,
        fingerprint: snapshot.fingerprint(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::log::CorrectionLog;
    use crate::volume::{ArrayLike, Volume};

    fn store(rows: &[(i64, i64)], edges: &[(i64, i64)]) -> LineageStore {
        let image: Arc<dyn ArrayLike> = Arc::new(Volume::<u8>::zeros(vec![10, 1, 4, 4]));
        let table = TrackTable::from_vertices(
            rows.iter()
                .map(|&(id, t)| Vertex::new(TrackId(id), t, 0.0, t as f64, id as f64)),
        );
        let graph = LineageGraph::from_pairs(edges.iter().map(|&(c, p)| (TrackId(c), [TrackId(p)])));
        LineageStore::load(table, image, None, Some(graph)).unwrap()
    }

    fn pos(track: i64, t: i64) -> Position {
        Position::new(t, 0.0, t as f64, track as f64)
    }

    #[test]
    fn lost_vertex_requires_exact_position() {
        let s = store(&[(1, 0), (1, 1)], &[]);
        let mut w = WorkingGraph::from_store(&s);
        let wrong = Position::new(1, 0.0, 9.0, 9.0);
        let err = w
            .apply(&Correction::LostVertex {
                track: TrackId(1),
                position: wrong,
            })
            .unwrap_err();
        assert_eq!(err, ExecutionError::VertexNotFound { track: TrackId(1), t: 1 });

        w.apply(&Correction::LostVertex {
            track: TrackId(1),
            position: pos(1, 1),
        })
        .unwrap();
        assert_eq!(w.span(TrackId(1)), Some((0, 0)));
    }

    #[test]
    fn removing_last_vertex_drops_track_and_edges() {
        let s = store(&[(1, 0), (2, 1)], &[(2, 1)]);
        let mut w = WorkingGraph::from_store(&s);
        w.apply(&Correction::LostVertex {
            track: TrackId(2),
            position: pos(2, 1),
        })
        .unwrap();
        assert_eq!(w.track_count(), 1);
        assert_eq!(w.graph().edge_count(), 0);
    }

    #[test]
    fn new_vertex_collides_on_occupied_slot() {
        let s = store(&[(1, 0)], &[]);
        let mut w = WorkingGraph::from_store(&s);
        let err = w
            .apply(&Correction::NewVertex {
                track: TrackId(1),
                position: Position::new(0, 0.0, 5.0, 5.0),
            })
            .unwrap_err();
        assert_eq!(err, ExecutionError::VertexCollision { track: TrackId(1), t: 0 });
    }

    #[test]
    fn new_parent_rejects_cycles() {
        let s = store(&[(1, 0), (2, 1), (3, 2)], &[(2, 1), (3, 2)]);
        let mut w = WorkingGraph::from_store(&s);
        let before = w.clone();
        for (child, parent) in [(1, 3), (3, 3)] {
            let err = w
                .apply(&Correction::NewParent {
                    child: TrackId(child),
                    parent: TrackId(parent),
                })
                .unwrap_err();
            assert!(matches!(err, ExecutionError::CycleDetected { .. }));
        }
        assert_eq!(w, before);
    }

    #[test]
    fn lost_parent_requires_edge() {
        let s = store(&[(1, 0), (2, 1)], &[]);
        let mut w = WorkingGraph::from_store(&s);
        let err = w
            .apply(&Correction::LostParent {
                child: TrackId(2),
                parent: TrackId(1),
            })
            .unwrap_err();
        assert!(matches!(err, ExecutionError::EdgeNotFound { .. }));
    }

    #[test]
    fn join_relabels_into_second() {
        let s = store(&[(5, 0), (5, 1), (9, 2), (9, 3), (7, 4)], &[(7, 9)]);
        let mut w = WorkingGraph::from_store(&s);
        w.apply(&Correction::Join {
            first: TrackId(5),
            second: TrackId(9),
            adjacent: false,
        })
        .unwrap();
        assert_eq!(w.span(TrackId(9)), Some((0, 3)));
        assert_eq!(w.track_len(TrackId(5)), 0);
        assert!(w.track(TrackId(9)).all(|wv| wv.vertex.track == TrackId(9)));
        assert_eq!(w.resolve_track(TrackId(5)), TrackId(9));
        assert!(w.graph().contains_edge(TrackId(7), TrackId(9)));

        let err = w
            .apply(&Correction::NewVertex {
                track: TrackId(5),
                position: pos(5, 8),
            })
            .unwrap_err();
        assert_eq!(
            err,
            ExecutionError::TrackAbsorbed {
                track: TrackId(5),
                into: TrackId(9)
            }
        );
    }

    #[test]
    fn join_checks_time_order() {
        let s = store(&[(5, 2), (5, 3), (9, 1), (9, 4)], &[]);
        let mut w = WorkingGraph::from_store(&s);
        let err = w
            .apply(&Correction::Join {
                first: TrackId(5),
                second: TrackId(9),
                adjacent: false,
            })
            .unwrap_err();
        assert!(matches!(err, ExecutionError::OutOfOrderMerge { .. }));

        w.apply(&Correction::Join {
            first: TrackId(5),
            second: TrackId(9),
            adjacent: true,
        })
        .unwrap();
        assert_eq!(w.track_len(TrackId(9)), 4);
    }

    #[test]
    fn join_rejects_shared_frames_even_when_adjacent() {
        let s = store(&[(5, 2), (9, 2)], &[]);
        let mut w = WorkingGraph::from_store(&s);
        let err = w
            .apply(&Correction::Join {
                first: TrackId(5),
                second: TrackId(9),
                adjacent: true,
            })
            .unwrap_err();
        assert_eq!(err, ExecutionError::OutOfOrderMerge { track: TrackId(9), t: 2 });
    }

    #[test]
    fn chained_joins_follow_the_survivor() {
        let s = store(&[(1, 0), (2, 1), (3, 2)], &[]);
        let mut w = WorkingGraph::from_store(&s);
        for (a, b) in [(1, 2), (2, 3)] {
            w.apply(&Correction::Join {
                first: TrackId(a),
                second: TrackId(b),
                adjacent: false,
            })
            .unwrap();
        }
        assert_eq!(w.resolve_track(TrackId(1)), TrackId(3));
        assert_eq!(w.track_len(TrackId(3)), 3);
    }

    #[test]
    fn materialize_reports_skipped_entries() {
        let s = store(&[(1, 0)], &[]);
        let mut log = CorrectionLog::new();
        let ok = log
            .propose_correction(Correction::NewVertex {
                track: TrackId(1),
                position: pos(1, 1),
            })
            .unwrap();
        let bad = log
            .propose_correction(Correction::LostParent {
                child: TrackId(1),
                parent: TrackId(4),
            })
            .unwrap();
        log.mark_implemented_round(&[ok, bad]).unwrap();

        let m = materialize(&s, &log.snapshot());
        assert_eq!(m.working.vertex_count(), 2);
        assert_eq!(m.skipped.len(), 1);
        assert_eq!(m.skipped[0].0, bad);
        assert_eq!(m.fingerprint, log.fingerprint());
    }

    #[test]
    fn rounds_apply_in_order() {
        // Round 0 removes the vertex, round 1 puts a different one back.
        let s = store(&[(1, 0), (1, 1)], &[]);
        let mut log = CorrectionLog::new();
        let lost = log
            .propose_correction(Correction::LostVertex {
                track: TrackId(1),
                position: pos(1, 1),
            })
            .unwrap();
        log.mark_implemented(lost).unwrap();
        let moved = Position::new(1, 0.0, 7.0, 7.0);
        let new = log
            .propose_correction(Correction::NewVertex {
                track: TrackId(1),
                position: moved,
            })
            .unwrap();
        log.mark_implemented(new).unwrap();

        let m = materialize(&s, &log.snapshot());
        assert!(m.skipped.is_empty());
        let wv = m.working.get(Slot::new(TrackId(1), 1)).unwrap();
        assert!(wv.vertex.position().same_as(&moved));
        assert_eq!(wv.origin, VertexOrigin::Inserted);
    }
}
