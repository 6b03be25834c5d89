//! Conflict resolver: picks the consistent subset of proposed corrections to
//! implement next.
//!
//! Resolution runs in two passes over the proposed partition:
//! 1. Conflict selection. Pairwise rules link mutually exclusive entries;
//!    union-find groups them and a greedy walk in priority order keeps an
//!    entry only if none of its conflicting neighbors was kept.
//! 2. Trial application. Survivors are applied, in materialization order, to
//!    the graph materialized from the implemented partition. Entries that do
//!    not apply (cycles, out-of-order joins, missing targets) are rejected.
//!
//! The passes repeat until a trial applies cleanly. A rejected entry leaves
//! the selection, so the neighbors it had beaten compete again.
//!
//! Everything not implemented stays proposed and is reported. The resolver
//! never drops an entry silently.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::correction::{Correction, CorrectionKey};
use crate::error::{ExecutionError, ProofResult};
use crate::log::{CorrectionId, CorrectionLog, LogEntry};
use crate::store::LineageStore;
use crate::vertex::{Slot, TrackId};
use crate::working::materialize;

/// Why two proposed corrections cannot both be implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRule {
    /// Same kind aimed at the same slot, edge or absorbed track.
    ///
    /// Fires even when both payloads are identical; the duplicate that loses
    /// stays proposed.
    SameTarget,
    /// A `lost_vertex` and a `new_vertex` on the same slot.
    VertexAddRemove,
    /// Two joins naming a common track.
    OverlappingJoin,
    /// `new_parent` and `lost_parent` on the same edge.
    ///
    /// Applies across batches, not only within one; the more recent batch
    /// wins.
    ParentFlip,
}

impl fmt::Display for ConflictRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SameTarget => "same target",
            Self::VertexAddRemove => "vertex added and removed",
            Self::OverlappingJoin => "overlapping join",
            Self::ParentFlip => "parent flip",
        };
        f.write_str(s)
    }
}

/// Returns the rule under which `a` and `b` conflict, if any.
#[must_use]
pub fn conflict_rule(a: &Correction, b: &Correction) -> Option<ConflictRule> {
    match (a, b) {
        (Correction::Join { .. }, Correction::Join { .. }) => {
            let shared = a.tracks().iter().any(|t| b.tracks().contains(t));
            shared.then_some(ConflictRule::OverlappingJoin)
        }
        _ if a.key() != b.key() => None,
        _ if a.kind() == b.kind() => Some(ConflictRule::SameTarget),
        (Correction::NewVertex { .. } | Correction::LostVertex { .. }, _) => {
            Some(ConflictRule::VertexAddRemove)
        }
        (Correction::NewParent { .. } | Correction::LostParent { .. }, _) => {
            Some(ConflictRule::ParentFlip)
        }
        _ => None,
    }
}

/// Why a proposed correction was not implemented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ConflictReason {
    /// Lost the tie-break against `winner`.
    LostTieBreak {
        /// Entry kept instead.
        winner: CorrectionId,
        /// Rule linking the two entries.
        rule: ConflictRule,
    },
    /// Does not apply to the working graph.
    Rejected {
        /// What went wrong.
        error: ExecutionError,
    },
}

/// A proposed correction left in the proposed partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedCorrection {
    /// Log entry.
    pub id: CorrectionId,
    /// The correction.
    pub correction: Correction,
    /// Why it was not implemented.
    pub reason: ConflictReason,
}

impl UnresolvedCorrection {
    /// The execution error, for rejected entries.
    #[must_use]
    pub fn error(&self) -> Option<&ExecutionError> {
        match &self.reason {
            ConflictReason::Rejected { error } => Some(error),
            ConflictReason::LostTieBreak { .. } => None,
        }
    }
}

/// Outcome of planning a resolution, before the log is touched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionPlan {
    /// Entries to implement, in materialization order.
    pub accepted: Vec<CorrectionId>,
    /// Entries left proposed.
    pub unresolved: Vec<UnresolvedCorrection>,
    /// Connected groups of mutually conflicting entries (size > 1).
    pub conflict_groups: Vec<Vec<CorrectionId>>,
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
    /// Round the accepted entries were implemented in, if any were.
    pub round: Option<u64>,
    /// Entries moved to the implemented partition.
    pub implemented: Vec<CorrectionId>,
    /// Entries left proposed.
    pub unresolved: Vec<UnresolvedCorrection>,
    /// Connected groups of mutually conflicting entries (size > 1).
    pub conflict_groups: Vec<Vec<CorrectionId>>,
}

impl ResolutionReport {
    /// Returns true if every proposed entry was implemented.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }

    /// Entries rejected with an execution error.
    pub fn rejected(&self) -> impl Iterator<Item = &UnresolvedCorrection> {
        self.unresolved.iter().filter(|u| u.error().is_some())
    }

    /// Entries that lost a tie-break.
    pub fn lost(&self) -> impl Iterator<Item = &UnresolvedCorrection> {
        self.unresolved.iter().filter(|u| u.error().is_none())
    }

    /// Looks up why `id` was left proposed.
    #[must_use]
    pub fn reason_for(&self, id: CorrectionId) -> Option<&ConflictReason> {
        self.unresolved.iter().find(|u| u.id == id).map(|u| &u.reason)
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

/// Buckets entries that could conflict so only bucket-mates are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Bucket {
    Slot(Slot),
    Edge(TrackId, TrackId),
    JoinTrack(TrackId),
}

fn buckets(correction: &Correction) -> Vec<Bucket> {
    match correction.key() {
        CorrectionKey::Slot { slot } => vec![Bucket::Slot(slot)],
        CorrectionKey::Edge { child, parent } => vec![Bucket::Edge(child, parent)],
        CorrectionKey::Join { .. } => correction.tracks().into_iter().map(Bucket::JoinTrack).collect(),
    }
}

/// Most recent batch first, then removals, then smaller subject, then newest entry.
fn priority(entry: &LogEntry) -> (Reverse<u64>, bool, TrackId, Reverse<CorrectionId>) {
    (
        Reverse(entry.batch),
        !entry.correction.kind().is_removal(),
        entry.correction.subject(),
        Reverse(entry.id),
    )
}

/// Greedy walk in priority order. Entry `i` is kept (`None`) unless a kept
/// neighbor beats it, in which case it holds `Some((winner, rule))`.
/// Rejected entries take no part and never beat anyone.
fn select(
    order: &[usize],
    neighbors: &[Vec<(usize, ConflictRule)>],
    rejected: &BTreeMap<usize, ExecutionError>,
) -> Vec<Option<(usize, ConflictRule)>> {
    let mut rank = vec![0; order.len()];
    for (r, &i) in order.iter().enumerate() {
        rank[i] = r;
    }
    let mut kept = vec![false; neighbors.len()];
    let mut beaten = vec![None; neighbors.len()];
    for &i in order {
        if rejected.contains_key(&i) {
            continue;
        }
        let winner = neighbors[i]
            .iter()
            .filter(|(j, _)| kept[*j])
            .min_by_key(|(j, _)| rank[*j]);
        match winner {
            Some(&winner) => beaten[i] = Some(winner),
            None => kept[i] = true,
        }
    }
    beaten
}

/// Computes which proposed corrections to implement next, without touching
/// the log.
#[must_use]
pub fn plan(store: &LineageStore, log: &CorrectionLog) -> ResolutionPlan {
    let proposed: Vec<&LogEntry> = log.proposed().collect();
    let n = proposed.len();

    let mut by_bucket: BTreeMap<Bucket, Vec<usize>> = BTreeMap::new();
    for (i, entry) in proposed.iter().enumerate() {
        for bucket in buckets(&entry.correction) {
            by_bucket.entry(bucket).or_default().push(i);
        }
    }

    let mut uf = UnionFind::new(n);
    let mut neighbors: Vec<Vec<(usize, ConflictRule)>> = vec![Vec::new(); n];
    for members in by_bucket.values() {
        for (k, &i) in members.iter().enumerate() {
            for &j in &members[k + 1..] {
                if neighbors[i].iter().any(|(m, _)| *m == j) {
                    continue;
                }
                if let Some(rule) = conflict_rule(&proposed[i].correction, &proposed[j].correction) {
                    neighbors[i].push((j, rule));
                    neighbors[j].push((i, rule));
                    uf.union(i, j);
                }
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<CorrectionId>> = BTreeMap::new();
    for i in 0..n {
        let root = uf.find(i);
        groups.entry(root).or_default().push(proposed[i].id);
    }
    let conflict_groups: Vec<Vec<CorrectionId>> = groups.into_values().filter(|g| g.len() > 1).collect();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| priority(proposed[i]));

    // Selection and trial repeat until no kept entry is rejected. A rejected
    // entry drops out of selection, so the neighbors it beat compete again.
    let base = materialize(store, &log.snapshot()).working;
    let mut rejected: BTreeMap<usize, ExecutionError> = BTreeMap::new();
    let (beaten, accepted) = loop {
        let beaten = select(&order, &neighbors, &rejected);
        let mut candidates: Vec<usize> = (0..n)
            .filter(|&i| beaten[i].is_none() && !rejected.contains_key(&i))
            .collect();
        candidates.sort_by(|&a, &b| {
            proposed[a]
                .correction
                .canonical_cmp(&proposed[b].correction)
                .then_with(|| proposed[a].id.cmp(&proposed[b].id))
        });

        let mut trial = base.clone();
        let mut accepted = Vec::with_capacity(candidates.len());
        let mut failed = false;
        for i in candidates {
            let entry = proposed[i];
            match trial.apply(&entry.correction) {
                Ok(()) => accepted.push(entry.id),
                Err(error) => {
                    warn!(id = %entry.id, kind = %entry.correction.kind(), error = %error, "correction rejected");
                    rejected.insert(i, error);
                    failed = true;
                }
            }
        }
        if !failed {
            break (beaten, accepted);
        }
    };

    let mut unresolved: Vec<UnresolvedCorrection> = Vec::new();
    for (i, lost) in beaten.iter().enumerate() {
        if let Some((j, rule)) = *lost {
            debug!(id = %proposed[i].id, winner = %proposed[j].id, rule = %rule, "lost tie-break");
            unresolved.push(UnresolvedCorrection {
                id: proposed[i].id,
                correction: proposed[i].correction,
                reason: ConflictReason::LostTieBreak {
                    winner: proposed[j].id,
                    rule,
                },
            });
        }
    }
    for (i, error) in rejected {
        unresolved.push(UnresolvedCorrection {
            id: proposed[i].id,
            correction: proposed[i].correction,
            reason: ConflictReason::Rejected { error },
        });
    }
    unresolved.sort_by_key(|u| u.id);

    ResolutionPlan {
        accepted,
        unresolved,
        conflict_groups,
    }
}

/// Implements the maximal consistent subset of the proposed partition as one
/// new round and reports the rest.
///
/// # Errors
/// Only internal log errors; conflicts and rejected corrections are part of
/// the report.
pub fn resolve(store: &LineageStore, log: &mut CorrectionLog) -> ProofResult<ResolutionReport> {
    let ResolutionPlan {
        accepted,
        unresolved,
        conflict_groups,
    } = plan(store, log);

    let implemented = log.mark_implemented_round(&accepted)?;
    let round = implemented
        .first()
        .and_then(|id| log.get(*id))
        .and_then(LogEntry::round);

    info!(
        implemented = implemented.len(),
        unresolved = unresolved.len(),
        groups = conflict_groups.len(),
        "resolution complete"
    );
    Ok(ResolutionReport {
        round,
        implemented,
        unresolved,
        conflict_groups,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::correction::CorrectionSet;
    use crate::graph::LineageGraph;
    use crate::table::TrackTable;
    use crate::vertex::{Position, Vertex};
    use crate::volume::{ArrayLike, Volume};

    fn store(rows: &[(i64, i64)], edges: &[(i64, i64)]) -> LineageStore {
        let image: Arc<dyn ArrayLike> = Arc::new(Volume::<u8>::zeros(vec![10, 1, 4, 4]));
        let table = TrackTable::from_vertices(
            rows.iter()
                .map(|&(id, t)| Vertex::new(TrackId(id), t, 0.0, 1.0, 1.0)),
        );
        let graph = LineageGraph::from_pairs(edges.iter().map(|&(c, p)| (TrackId(c), [TrackId(p)])));
        LineageStore::load(table, image, None, Some(graph)).unwrap()
    }

    fn new_vertex(track: i64, t: i64, y: f64) -> Correction {
        Correction::NewVertex {
            track: TrackId(track),
            position: Position::new(t, 0.0, y, y),
        }
    }

    #[test]
    fn test_conflict_rules() {
        let a = new_vertex(2, 6, 1.0);
        let b = new_vertex(2, 6, 2.0);
        assert_eq!(conflict_rule(&a, &b), Some(ConflictRule::SameTarget));
        assert_eq!(conflict_rule(&a, &new_vertex(2, 7, 1.0)), None);

        let lost = Correction::LostVertex {
            track: TrackId(2),
            position: Position::new(6, 0.0, 1.0, 1.0),
        };
        assert_eq!(conflict_rule(&a, &lost), Some(ConflictRule::VertexAddRemove));

        let add = Correction::NewParent {
            child: TrackId(3),
            parent: TrackId(1),
        };
        let cut = Correction::LostParent {
            child: TrackId(3),
            parent: TrackId(1),
        };
        assert_eq!(conflict_rule(&add, &cut), Some(ConflictRule::ParentFlip));

        let j1 = Correction::Join {
            first: TrackId(1),
            second: TrackId(2),
            adjacent: false,
        };
        let j2 = Correction::Join {
            first: TrackId(3),
            second: TrackId(2),
            adjacent: false,
        };
        assert_eq!(conflict_rule(&j1, &j2), Some(ConflictRule::OverlappingJoin));
        assert_eq!(conflict_rule(&j1, &add), None);
    }

    #[test]
    fn test_later_proposal_wins_same_slot() {
        let s = store(&[(2, 5)], &[]);
        let mut log = CorrectionLog::new();
        let early = log.propose_correction(new_vertex(2, 6, 1.0)).unwrap();
        let late = log.propose_correction(new_vertex(2, 6, 2.0)).unwrap();

        let report = resolve(&s, &mut log).unwrap();
        assert_eq!(report.implemented, vec![late]);
        assert_eq!(
            report.reason_for(early),
            Some(&ConflictReason::LostTieBreak {
                winner: late,
                rule: ConflictRule::SameTarget
            })
        );
        assert!(log.get(early).unwrap().is_proposed());
        assert_eq!(report.conflict_groups, vec![vec![early, late]]);
    }

    #[test]
    fn test_removal_wins_within_batch() {
        let s = store(&[(1, 0), (1, 1)], &[]);
        let mut log = CorrectionLog::new();
        let ids = log
            .bulk_update(
                CorrectionSet::new()
                    .with(new_vertex(1, 1, 5.0))
                    .with(Correction::LostVertex {
                        track: TrackId(1),
                        position: Position::new(1, 0.0, 1.0, 1.0),
                    }),
            )
            .unwrap();
        let report = resolve(&s, &mut log).unwrap();
        assert_eq!(report.implemented, vec![ids[1]]);

        // The insertion is retried on the next pass and now fits the slot.
        let report = resolve(&s, &mut log).unwrap();
        assert_eq!(report.implemented, vec![ids[0]]);
        assert_eq!(report.round, Some(1));
        assert_eq!(log.proposed_len(), 0);
    }

    #[test]
    fn test_self_parent_is_rejected() {
        let s = store(&[(3, 0)], &[]);
        let mut log = CorrectionLog::new();
        let id = log
            .propose_correction(Correction::NewParent {
                child: TrackId(3),
                parent: TrackId(3),
            })
            .unwrap();
        let report = resolve(&s, &mut log).unwrap();
        assert!(report.implemented.is_empty());
        assert_eq!(report.round, None);
        let rejected: Vec<_> = report.rejected().collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].id, id);
        assert_eq!(
            rejected[0].error(),
            Some(&ExecutionError::CycleDetected { track: TrackId(3) })
        );
    }

    #[test]
    fn test_trial_follows_materialization_order() {
        // lost_vertex empties track 1 before new_parent runs, so the edge is
        // rejected even though it was proposed first.
        let s = store(&[(1, 0), (2, 1)], &[]);
        let mut log = CorrectionLog::new();
        let edge = log
            .propose_correction(Correction::NewParent {
                child: TrackId(2),
                parent: TrackId(1),
            })
            .unwrap();
        let lost = log
            .propose_correction(Correction::LostVertex {
                track: TrackId(1),
                position: Position::new(0, 0.0, 1.0, 1.0),
            })
            .unwrap();
        let report = resolve(&s, &mut log).unwrap();
        assert_eq!(report.implemented, vec![lost]);
        assert_eq!(
            report.reason_for(edge),
            Some(&ConflictReason::Rejected {
                error: ExecutionError::UnknownTrack { track: TrackId(1) }
            })
        );

        let m = materialize(&s, &log.snapshot());
        assert!(m.skipped.is_empty());
    }

    #[test]
    fn test_rejected_winner_frees_its_loser() {
        let s = store(&[(1, 0)], &[]);
        let mut log = CorrectionLog::new();
        let ids = log
            .bulk_update(
                CorrectionSet::new()
                    .with(Correction::LostVertex {
                        track: TrackId(1),
                        position: Position::new(1, 0.0, 9.0, 9.0),
                    })
                    .with(new_vertex(1, 1, 1.0)),
            )
            .unwrap();
        let (missing, insert) = (ids[0], ids[1]);

        let report = resolve(&s, &mut log).unwrap();
        assert_eq!(report.implemented, vec![insert]);
        assert_eq!(
            report.reason_for(missing),
            Some(&ConflictReason::Rejected {
                error: ExecutionError::VertexNotFound { track: TrackId(1), t: 1 }
            })
        );
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.conflict_groups, vec![vec![missing, insert]]);

        let m = materialize(&s, &log.snapshot());
        assert!(m.skipped.is_empty());
        assert_eq!(m.working.vertex_count(), 2);
    }

    #[test]
    fn test_join_closing_a_cycle_is_rejected() {
        // 1 -> 3 -> 2 by lineage; joining 1 into 2 would make 2 its own ancestor.
        let s = store(&[(1, 0), (1, 1), (3, 2), (3, 3), (2, 4), (2, 5)], &[(3, 1), (2, 3)]);
        let mut log = CorrectionLog::new();
        let join = log
            .propose_correction(Correction::Join {
                first: TrackId(1),
                second: TrackId(2),
                adjacent: false,
            })
            .unwrap();

        let report = resolve(&s, &mut log).unwrap();
        assert!(report.implemented.is_empty());
        assert_eq!(
            report.reason_for(join),
            Some(&ConflictReason::Rejected {
                error: ExecutionError::CycleDetected { track: TrackId(2) }
            })
        );
        assert!(log.get(join).unwrap().is_proposed());

        let m = materialize(&s, &log.snapshot());
        assert_eq!(m.working.track_count(), 3);
        assert!(m.working.absorbed().is_empty());
    }

    #[test]
    fn test_plan_is_pure() {
        let s = store(&[(1, 0)], &[]);
        let mut log = CorrectionLog::new();
        log.propose_correction(new_vertex(1, 1, 1.0)).unwrap();
        let before = log.fingerprint();
        let p = plan(&s, &log);
        assert_eq!(p.accepted.len(), 1);
        assert_eq!(log.fingerprint(), before);
        assert_eq!(log.proposed_len(), 1);
    }

    #[test]
    fn test_every_proposal_is_accounted_for() {
        let s = store(&[(1, 0), (1, 1), (2, 3), (3, 4)], &[(3, 2)]);
        let mut log = CorrectionLog::new();
        log.propose_correction(new_vertex(1, 2, 1.0)).unwrap();
        log.propose_correction(new_vertex(1, 2, 3.0)).unwrap();
        log.propose_correction(Correction::Join {
            first: TrackId(1),
            second: TrackId(2),
            adjacent: false,
        })
        .unwrap();
        log.propose_correction(Correction::Join {
            first: TrackId(2),
            second: TrackId(3),
            adjacent: false,
        })
        .unwrap();
        log.propose_correction(Correction::LostParent {
            child: TrackId(3),
            parent: TrackId(2),
        })
        .unwrap();

        let report = resolve(&s, &mut log).unwrap();
        assert_eq!(report.implemented.len() + report.unresolved.len(), 5);
        assert_eq!(log.proposed_len(), report.unresolved.len());
    }
}
