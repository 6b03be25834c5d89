//! Correction log: append-only, two-partition store of proposed edits.
//!
//! Key invariants:
//! - Entries are never deleted. A correction is retracted by proposing its
//!   inverse.
//! - Every entry is in exactly one state: `Proposed` or `Implemented`.
//! - Entries move to `Implemented` in numbered rounds; materialization replays
//!   rounds in order.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::correction::{Correction, CorrectionKind, CorrectionSet};
use crate::error::{ExecutionError, ProofResult, ValidationError};
use crate::vertex::TrackId;

/// Default cap on outstanding proposals.
pub const DEFAULT_MAX_PROPOSED: usize = 100_000;

/// Stable identifier of a log entry (its position in the log).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrectionId(pub u64);

impl fmt::Display for CorrectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Partition an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum CorrectionState {
    /// Awaiting resolution.
    Proposed,
    /// Accepted and applied during materialization round `round`.
    Implemented {
        /// Implementation round.
        round: u64,
    },
}

/// One correction and its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Entry identity.
    pub id: CorrectionId,
    /// Insertion order. All entries of one `bulk_update` share a batch.
    pub batch: u64,
    /// The edit.
    pub correction: Correction,
    /// Current partition.
    pub state: CorrectionState,
    /// When the entry was proposed (or last overwritten).
    pub proposed_at: DateTime<Utc>,
    /// When the entry was implemented.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implemented_at: Option<DateTime<Utc>>,
}

impl LogEntry {
    /// Returns true while the entry awaits resolution.
    #[must_use]
    pub fn is_proposed(&self) -> bool {
        self.state == CorrectionState::Proposed
    }

    /// Implementation round, if implemented.
    #[must_use]
    pub fn round(&self) -> Option<u64> {
        match self.state {
            CorrectionState::Proposed => None,
            CorrectionState::Implemented { round } => Some(round),
        }
    }
}

/// Content hash of the implemented partition.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    fn of(implemented: &[ImplementedCorrection]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for entry in implemented {
            hasher.update(&entry.round.to_le_bytes());
            // Serializing a `Correction` cannot fail: it has no maps or
            // non-string keys.
            let bytes = serde_json::to_vec(&entry.correction).unwrap_or_default();
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
        Self(hasher.finalize())
    }

    /// Hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// An implemented correction as seen by the materializer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImplementedCorrection {
    /// Log entry it came from.
    pub id: CorrectionId,
    /// Implementation round.
    pub round: u64,
    /// The edit.
    pub correction: Correction,
}

/// Immutable capture of the implemented partition.
///
/// Materialization and classification run against a snapshot, never the live
/// log, so they can run off-thread while new proposals arrive.
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    implemented: Arc<[ImplementedCorrection]>,
    fingerprint: Fingerprint,
}

impl LogSnapshot {
    /// Implemented corrections ordered by round, then canonically.
    #[must_use]
    pub fn implemented(&self) -> &[ImplementedCorrection] {
        &self.implemented
    }

    /// Content hash of the captured partition.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Number of implemented corrections of `kind`.
    #[must_use]
    pub fn count(&self, kind: CorrectionKind) -> usize {
        self.implemented
            .iter()
            .filter(|c| c.correction.kind() == kind)
            .count()
    }

    /// Snapshot of an empty partition.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_implemented(Vec::new())
    }

    fn from_implemented(mut implemented: Vec<ImplementedCorrection>) -> Self {
        implemented.sort_by(|a, b| {
            a.round
                .cmp(&b.round)
                .then_with(|| a.correction.canonical_cmp(&b.correction))
        });
        let fingerprint = Fingerprint::of(&implemented);
        Self {
            implemented: implemented.into(),
            fingerprint,
        }
    }
}

/// Append-only log of proposed and implemented corrections.
#[derive(Debug, Clone)]
pub struct CorrectionLog {
    entries: Vec<LogEntry>,
    next_batch: u64,
    next_round: u64,
    proposed: usize,
    max_proposed: usize,
    snapshot: LogSnapshot,
}

impl Default for CorrectionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrectionLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_proposed(DEFAULT_MAX_PROPOSED)
    }

    /// Creates an empty log with a cap on outstanding proposals.
    #[must_use]
    pub fn with_max_proposed(max_proposed: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_batch: 0,
            next_round: 0,
            proposed: 0,
            max_proposed,
            snapshot: LogSnapshot::empty(),
        }
    }

    /// Proposes one correction from its wire triple.
    ///
    /// Checks payload shape only; graph consistency is the resolver's job.
    ///
    /// # Errors
    /// `InvalidKind`, `MalformedPayload`, or `TooManyProposals`. The log is
    /// unchanged on error.
    pub fn propose(&mut self, kind: &str, subject: TrackId, payload: &Value) -> ProofResult<CorrectionId> {
        let kind: CorrectionKind = kind.parse()?;
        let correction = Correction::from_payload(kind, subject, payload)?;
        self.propose_correction(correction)
    }

    /// Proposes an already-typed correction.
    ///
    /// # Errors
    /// `TooManyProposals` if the proposed partition is full.
    pub fn propose_correction(&mut self, correction: Correction) -> ProofResult<CorrectionId> {
        self.ensure_room(1)?;
        let batch = self.take_batch();
        let id = self.append(batch, correction);
        debug!(id = %id, kind = %correction.kind(), subject = %correction.subject(), "correction proposed");
        Ok(id)
    }

    /// Merges an external correction set into the proposed partition.
    ///
    /// Per kind and target key, the newest write wins: a proposed entry with
    /// the same key is overwritten in place and moved to this batch, otherwise
    /// a new entry is appended. Implemented entries are never touched.
    ///
    /// # Errors
    /// `TooManyProposals` if the update would overflow the proposed partition.
    pub fn bulk_update(&mut self, update: CorrectionSet) -> ProofResult<Vec<CorrectionId>> {
        let appended = update
            .iter()
            .filter(|c| self.latest_proposed_with_key(c).is_none())
            .count();
        self.ensure_room(appended)?;

        let batch = self.take_batch();
        let now = Utc::now();
        let mut ids = Vec::with_capacity(update.len());
        let mut overwritten = 0usize;
        for correction in update {
            if let Some(idx) = self.latest_proposed_with_key(&correction) {
                let entry = &mut self.entries[idx];
                entry.correction = correction;
                entry.batch = batch;
                entry.proposed_at = now;
                ids.push(entry.id);
                overwritten += 1;
            } else {
                ids.push(self.append(batch, correction));
            }
        }
        info!(batch, entries = ids.len(), overwritten, "bulk update merged");
        Ok(ids)
    }

    /// Moves one entry to the implemented partition in a round of its own.
    ///
    /// Idempotent: returns `Ok(false)` if the entry was already implemented.
    ///
    /// # Errors
    /// `CorrectionNotFound` for an unknown ID.
    pub fn mark_implemented(&mut self, id: CorrectionId) -> ProofResult<bool> {
        Ok(!self.mark_implemented_round(&[id])?.is_empty())
    }

    /// Marks the most recent entry of `kind` filed under `subject`.
    ///
    /// Only the newest entry for the pair is eligible. Returns `Ok(None)` if
    /// there is none or it is already implemented, so repeating a call is a
    /// no-op until a newer proposal arrives for the pair.
    ///
    /// # Errors
    /// Propagates [`CorrectionLog::mark_implemented`] errors.
    pub fn mark_subject_implemented(
        &mut self,
        kind: CorrectionKind,
        subject: TrackId,
    ) -> ProofResult<Option<CorrectionId>> {
        let latest = self
            .entries
            .iter()
            .filter(|e| e.correction.kind() == kind && e.correction.subject() == subject)
            .max_by_key(|e| (e.batch, e.id));
        match latest {
            Some(entry) if entry.is_proposed() => {
                let id = entry.id;
                self.mark_implemented(id)?;
                Ok(Some(id))
            }
            _ => Ok(None),
        }
    }

    /// Moves a group of entries to the implemented partition as one round.
    ///
    /// Already implemented IDs are skipped. Returns the IDs that changed state.
    ///
    /// # Errors
    /// `CorrectionNotFound` if any ID is unknown; nothing is marked then.
    pub fn mark_implemented_round(&mut self, ids: &[CorrectionId]) -> ProofResult<Vec<CorrectionId>> {
        for id in ids {
            self.index_of(*id)?;
        }

        let round = self.next_round;
        let now = Utc::now();
        let mut changed = Vec::new();
        for id in ids {
            let idx = self.index_of(*id)?;
            let entry = &mut self.entries[idx];
            if entry.is_proposed() {
                entry.state = CorrectionState::Implemented { round };
                entry.implemented_at = Some(now);
                changed.push(entry.id);
            }
        }

        if !changed.is_empty() {
            self.next_round += 1;
            self.proposed -= changed.len();
            self.refresh_snapshot();
            debug!(round, implemented = changed.len(), fingerprint = %self.snapshot.fingerprint, "round implemented");
        }
        Ok(changed)
    }

    /// Proposes the inverse of an implemented correction.
    ///
    /// # Errors
    /// `CorrectionNotFound`, `NotImplemented` if the entry is still proposed, or
    /// `NoInverse` for joins.
    pub fn retract(&mut self, id: CorrectionId) -> ProofResult<CorrectionId> {
        let entry = &self.entries[self.index_of(id)?];
        if entry.is_proposed() {
            return Err(ExecutionError::NotImplemented { id: id.0 }.into());
        }
        let inverse = entry.correction.inverse().ok_or_else(|| ExecutionError::NoInverse {
            kind: entry.correction.kind().to_string(),
        })?;
        self.propose_correction(inverse)
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, id: CorrectionId) -> Option<&LogEntry> {
        self.index_of(id).ok().map(|idx| &self.entries[idx])
    }

    /// Every entry in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries awaiting resolution.
    pub fn proposed(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|e| e.is_proposed())
    }

    /// Implemented entries.
    pub fn implemented(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|e| !e.is_proposed())
    }

    /// Proposed entries of one kind.
    pub fn proposed_of(&self, kind: CorrectionKind) -> impl Iterator<Item = &LogEntry> {
        self.proposed().filter(move |e| e.correction.kind() == kind)
    }

    /// Implemented entries of one kind.
    pub fn implemented_of(&self, kind: CorrectionKind) -> impl Iterator<Item = &LogEntry> {
        self.implemented().filter(move |e| e.correction.kind() == kind)
    }

    /// Number of proposed entries.
    #[must_use]
    pub fn proposed_len(&self) -> usize {
        self.proposed
    }

    /// Total number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was ever proposed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Captures the implemented partition.
    #[must_use]
    pub fn snapshot(&self) -> LogSnapshot {
        self.snapshot.clone()
    }

    /// Fingerprint of the implemented partition.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.snapshot.fingerprint
    }

    /// The log as the nested `{kind: {subject: payload}}` shape, split into
    /// proposed kinds plus an `implemented_corrections` partition.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let proposed: CorrectionSet = self.proposed().map(|e| e.correction).collect();
        let implemented: CorrectionSet = self.implemented().map(|e| e.correction).collect();
        let mut out = match proposed.to_value() {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        for kind in CorrectionKind::ALL {
            out.entry(kind.as_str().to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
        }
        out.insert("implemented_corrections".to_string(), implemented.to_value());
        Value::Object(out)
    }

    fn ensure_room(&self, additional: usize) -> Result<(), ValidationError> {
        if self.proposed + additional > self.max_proposed {
            return Err(ValidationError::TooManyProposals {
                max: self.max_proposed,
            });
        }
        Ok(())
    }

    fn take_batch(&mut self) -> u64 {
        let batch = self.next_batch;
        self.next_batch += 1;
        batch
    }

    fn append(&mut self, batch: u64, correction: Correction) -> CorrectionId {
        let id = CorrectionId(self.entries.len() as u64);
        self.entries.push(LogEntry {
            id,
            batch,
            correction,
            state: CorrectionState::Proposed,
            proposed_at: Utc::now(),
            implemented_at: None,
        });
        self.proposed += 1;
        id
    }

    fn latest_proposed_with_key(&self, correction: &Correction) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.is_proposed()
                    && e.correction.kind() == correction.kind()
                    && e.correction.key() == correction.key()
            })
            .max_by_key(|(_, e)| (e.batch, e.id))
            .map(|(idx, _)| idx)
    }

    fn index_of(&self, id: CorrectionId) -> Result<usize, ExecutionError> {
        usize::try_from(id.0)
            .ok()
            .filter(|idx| *idx < self.entries.len())
            .ok_or(ExecutionError::CorrectionNotFound { id: id.0 })
    }

    fn refresh_snapshot(&mut self) {
        let implemented = self
            .entries
            .iter()
            .filter_map(|e| {
                e.round().map(|round| ImplementedCorrection {
                    id: e.id,
                    round,
                    correction: e.correction,
                })
            })
            .collect();
        self.snapshot = LogSnapshot::from_implemented(implemented);
    }
}
