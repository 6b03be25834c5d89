//! External collaborator seams: error scoring and autofix suggestion.
//!
//! Both collaborators are opaque to the core. The scorer reads the working
//! tracks and the image; the autofixer turns scores into a correction set that
//! re-enters the log through `bulk_update`.

use serde::{Deserialize, Serialize};

use crate::correction::CorrectionSet;
use crate::error::ProofResult;
use crate::table::TrackTable;
use crate::vertex::Position;
use crate::volume::ArrayLike;
use crate::working::WorkingGraph;

/// Anomaly score at one location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    /// Where the anomaly was detected.
    pub position: Position,
    /// Collaborator-defined score; higher is more suspicious.
    pub score: f64,
}

/// Per-location anomaly scores produced by an [`ErrorScorer`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScoreMap {
    scores: Vec<AnomalyScore>,
}

impl ScoreMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a score.
    pub fn push(&mut self, position: Position, score: f64) {
        self.scores.push(AnomalyScore { position, score });
    }

    /// Number of scored locations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Returns true if nothing was scored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Scores in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &AnomalyScore> {
        self.scores.iter()
    }

    /// Scores at or above `threshold`, highest first.
    #[must_use]
    pub fn above(&self, threshold: f64) -> Vec<AnomalyScore> {
        let mut hits: Vec<AnomalyScore> = self.scores.iter().filter(|s| s.score >= threshold).copied().collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits
    }
}

impl FromIterator<AnomalyScore> for ScoreMap {
    fn from_iter<I: IntoIterator<Item = AnomalyScore>>(iter: I) -> Self {
        Self {
            scores: iter.into_iter().collect(),
        }
    }
}

/// Scores working tracks against the image.
pub trait ErrorScorer: Send + Sync {
    /// Produces per-location anomaly scores.
    ///
    /// # Errors
    /// Collaborator-specific failures, typically `ExecutionError::Collaborator`.
    fn score(&self, tracks: &TrackTable, image: &dyn ArrayLike) -> ProofResult<ScoreMap>;
}

/// Turns anomaly scores into proposed corrections.
pub trait Autofixer: Send + Sync {
    /// Suggests corrections for the working graph.
    ///
    /// # Errors
    /// Collaborator-specific failures, typically `ExecutionError::Collaborator`.
    fn suggest(&self, scores: &ScoreMap, graph: &WorkingGraph) -> ProofResult<CorrectionSet>;
}

impl<F> ErrorScorer for F
where
    F: Fn(&TrackTable, &dyn ArrayLike) -> ProofResult<ScoreMap> + Send + Sync,
{
    fn score(&self, tracks: &TrackTable, image: &dyn ArrayLike) -> ProofResult<ScoreMap> {
        self(tracks, image)
    }
}

impl<F> Autofixer for F
where
    F: Fn(&ScoreMap, &WorkingGraph) -> ProofResult<CorrectionSet> + Send + Sync,
{
    fn suggest(&self, scores: &ScoreMap, graph: &WorkingGraph) -> ProofResult<CorrectionSet> {
        self(scores, graph)
    }
}
