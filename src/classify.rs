//! Error classifier.
//!
//! Labels every working vertex with exactly one [`ErrorCategory`], comparing
//! the working graph against the original store. Rules are evaluated in a
//! fixed priority order and the first match wins:
//!
//! 1. ID swap: the vertex moved to another track through a join, or its
//!    track's parents were replaced by different ones.
//! 2. Falsely untracked: an isolated single-vertex track that was also isolated
//!    and single-vertex in the original.
//! 3. False termination: an original lineage end that is no longer an end.
//! 4. True termination: a working lineage end.
//! 5. False start: an original lineage start that is no longer a start.
//! 6. True start: a working lineage start.
//! 7. Correct: everything else.
//!
//! A lineage end is the last vertex of a track with no children; a lineage
//! start is the first vertex of a track with no parents.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::LineageStore;
use crate::vertex::{Slot, TrackId};
use crate::working::{VertexOrigin, WorkingGraph, WorkingVertex};

/// The seven error-taxonomy labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Identity changed between original and working graph.
    IdSwap,
    /// Original ending that a correction continued.
    FalseTermination,
    /// Standing ending.
    TrueTermination,
    /// Original start that a correction extended backwards or linked.
    FalseStart,
    /// Standing start.
    TrueStart,
    /// Isolated single detection, unlinked in both graphs.
    FalselyUntracked,
    /// Interior vertex linked to its predecessor.
    Correct,
}

impl ErrorCategory {
    /// Every category.
    pub const ALL: [Self; 7] = [
        Self::IdSwap,
        Self::FalseTermination,
        Self::TrueTermination,
        Self::FalseStart,
        Self::TrueStart,
        Self::FalselyUntracked,
        Self::Correct,
    ];

    /// Human-readable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::IdSwap => "ID swaps",
            Self::FalseTermination => "False terminations",
            Self::TrueTermination => "True terminations",
            Self::FalseStart => "False starts",
            Self::TrueStart => "True starts",
            Self::FalselyUntracked => "Falsely untracked",
            Self::Correct => "Correct",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-category vertex counts. Always holds all seven categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorTally {
    counts: BTreeMap<ErrorCategory, usize>,
}

impl Default for ErrorTally {
    fn default() -> Self {
        Self {
            counts: ErrorCategory::ALL.into_iter().map(|c| (c, 0)).collect(),
        }
    }
}

impl ErrorTally {
    /// Count for one category.
    #[must_use]
    pub fn get(&self, category: ErrorCategory) -> usize {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    /// Sum over all categories.
    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// `(category, count)` pairs in category order.
    pub fn iter(&self) -> impl Iterator<Item = (ErrorCategory, usize)> + '_ {
        self.counts.iter().map(|(c, n)| (*c, *n))
    }

    fn bump(&mut self, category: ErrorCategory) {
        *self.counts.entry(category).or_insert(0) += 1;
    }
}

/// Classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Per-category counts.
    pub tally: ErrorTally,
    /// Per-vertex labels, if requested.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "label_pairs")]
    pub labels: Option<BTreeMap<Slot, ErrorCategory>>,
}

impl Classification {
    /// Label of the vertex at `slot`, if labels were recorded.
    #[must_use]
    pub fn label(&self, slot: Slot) -> Option<ErrorCategory> {
        self.labels.as_ref()?.get(&slot).copied()
    }

    /// Slots carrying `category`, if labels were recorded.
    #[must_use]
    pub fn slots_with(&self, category: ErrorCategory) -> Vec<Slot> {
        self.labels
            .iter()
            .flatten()
            .filter(|(_, c)| **c == category)
            .map(|(s, _)| *s)
            .collect()
    }
}

// JSON object keys must be strings, so labels travel as `[slot, category]` pairs.
mod label_pairs {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::ErrorCategory;
    use crate::vertex::Slot;

    pub fn serialize<S: Serializer>(
        labels: &Option<BTreeMap<Slot, ErrorCategory>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match labels {
            Some(map) => s.collect_seq(map.iter()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<BTreeMap<Slot, ErrorCategory>>, D::Error> {
        let pairs = Option::<Vec<(Slot, ErrorCategory)>>::deserialize(d)?;
        Ok(pairs.map(|p| p.into_iter().collect()))
    }
}

struct TrackShape {
    first: i64,
    last: i64,
    len: usize,
    has_parents: bool,
    has_children: bool,
}

impl TrackShape {
    fn is_isolated_single(&self) -> bool {
        self.len == 1 && !self.has_parents && !self.has_children
    }
}

fn original_shapes(store: &LineageStore) -> BTreeMap<TrackId, TrackShape> {
    store
        .track_map()
        .iter()
        .filter_map(|(id, vs)| {
            Some((
                *id,
                TrackShape {
                    first: vs.first()?.t,
                    last: vs.last()?.t,
                    len: vs.len(),
                    has_parents: store.graph().has_parents(*id),
                    has_children: store.graph().has_children(*id),
                },
            ))
        })
        .collect()
}

fn working_shapes(working: &WorkingGraph) -> BTreeMap<TrackId, TrackShape> {
    working
        .track_ids()
        .filter_map(|id| {
            let (first, last) = working.span(id)?;
            Some((
                id,
                TrackShape {
                    first,
                    last,
                    len: working.track_len(id),
                    has_parents: working.graph().has_parents(id),
                    has_children: working.graph().has_children(id),
                },
            ))
        })
        .collect()
}

/// Tracks whose original, non-empty parent set was replaced by a different
/// non-empty one.
fn relinked_tracks(store: &LineageStore, working: &WorkingGraph) -> BTreeSet<TrackId> {
    working
        .track_ids()
        .filter(|id| {
            let original: BTreeSet<TrackId> = store
                .graph()
                .parents_of(*id)
                .map(|p| working.resolve_track(p))
                .collect();
            let current = working.graph().parent_set(*id);
            !original.is_empty() && !current.is_empty() && original != current
        })
        .collect()
}

fn categorize(
    wv: &WorkingVertex,
    current: &TrackShape,
    original: &BTreeMap<TrackId, TrackShape>,
    relinked: &BTreeSet<TrackId>,
) -> ErrorCategory {
    let track = wv.vertex.track;
    let t = wv.vertex.t;
    let was = match wv.origin {
        VertexOrigin::Original { track: from } => Some((from, original.get(&from))),
        VertexOrigin::Inserted => None,
    };

    let moved = was.is_some_and(|(from, _)| from != track);
    if moved || (was.is_some() && relinked.contains(&track)) {
        return ErrorCategory::IdSwap;
    }

    let before = was.and_then(|(_, shape)| shape);
    if current.is_isolated_single() && before.is_some_and(TrackShape::is_isolated_single) {
        return ErrorCategory::FalselyUntracked;
    }

    let is_end = t == current.last && !current.has_children;
    let is_start = t == current.first && !current.has_parents;
    let was_end = before.is_some_and(|b| t == b.last && !b.has_children);
    let was_start = before.is_some_and(|b| t == b.first && !b.has_parents);

    if was_end && !is_end {
        ErrorCategory::FalseTermination
    } else if is_end {
        ErrorCategory::TrueTermination
    } else if was_start && !is_start {
        ErrorCategory::FalseStart
    } else if is_start {
        ErrorCategory::TrueStart
    } else {
        ErrorCategory::Correct
    }
}

/// Labels every vertex of `working` and tallies the labels.
///
/// The tally is always recomputed in full from the working graph.
#[must_use]
pub fn classify(store: &LineageStore, working: &WorkingGraph, record_labels: bool) -> Classification {
    let original = original_shapes(store);
    let current = working_shapes(working);
    let relinked = relinked_tracks(store, working);

    let mut tally = ErrorTally::default();
    let mut labels = record_labels.then(BTreeMap::new);
    for (id, shape) in &current {
        for wv in working.track(*id) {
            let category = categorize(wv, shape, &original, &relinked);
            tally.bump(category);
            if let Some(labels) = labels.as_mut() {
                labels.insert(wv.vertex.slot(), category);
            }
        }
    }

    debug!(
        vertices = tally.total(),
        id_swaps = tally.get(ErrorCategory::IdSwap),
        false_terminations = tally.get(ErrorCategory::FalseTermination),
        false_starts = tally.get(ErrorCategory::FalseStart),
        "classified"
    );
    Classification { tally, labels }
}
