//! Review session facade.
//!
//! `TrackData` owns one lineage store and one correction log and exposes the
//! ingestion and read API used by editing surfaces. Derived state (working
//! graph, error tally) is cached against the fingerprint of the implemented
//! partition and recomputed lazily on read whenever the log changed.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::classify::{Classification, ErrorTally};
use crate::collaborator::{Autofixer, ErrorScorer, ScoreMap};
use crate::config::ReviewConfig;
use crate::correction::{Correction, CorrectionKind, CorrectionSet};
use crate::error::{ExecutionError, ProofResult};
use crate::graph::LineageGraph;
use crate::log::{CorrectionId, CorrectionLog, LogSnapshot};
use crate::recompute::{RecomputeHandle, Recomputed, Recomputer};
use crate::resolver::{resolve, ResolutionReport, UnresolvedCorrection};
use crate::store::LineageStore;
use crate::table::{TrackColumns, TrackTable};
use crate::vertex::TrackId;
use crate::volume::ArrayLike;
use crate::working::WorkingGraph;

enum TrackInput {
    Table(TrackTable),
    Columns(TrackColumns),
}

/// Builder for [`TrackData`].
pub struct TrackDataBuilder {
    tracks: TrackInput,
    image: Arc<dyn ArrayLike>,
    labels: Option<Arc<dyn ArrayLike>>,
    graph: Option<LineageGraph>,
    error_model: Option<Arc<dyn ErrorScorer>>,
    autofix_model: Option<Arc<dyn Autofixer>>,
    config: ReviewConfig,
}

impl TrackDataBuilder {
    /// Starts from raw columns; they are validated by [`TrackDataBuilder::build`].
    #[must_use]
    pub fn from_columns(columns: TrackColumns, image: Arc<dyn ArrayLike>) -> Self {
        Self::with_input(TrackInput::Columns(columns), image)
    }

    fn with_input(tracks: TrackInput, image: Arc<dyn ArrayLike>) -> Self {
        Self {
            tracks,
            image,
            labels: None,
            graph: None,
            error_model: None,
            autofix_model: None,
            config: ReviewConfig::default(),
        }
    }

    /// Sets the segmentation the tracks were produced from.
    #[must_use]
    pub fn labels(mut self, labels: Arc<dyn ArrayLike>) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Sets the parent/child graph.
    #[must_use]
    pub fn graph(mut self, graph: LineageGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Sets the error-scoring collaborator.
    #[must_use]
    pub fn error_model(mut self, model: Arc<dyn ErrorScorer>) -> Self {
        self.error_model = Some(model);
        self
    }

    /// Sets the autofix collaborator.
    #[must_use]
    pub fn autofix_model(mut self, model: Arc<dyn Autofixer>) -> Self {
        self.autofix_model = Some(model);
        self
    }

    /// Sets the session configuration.
    #[must_use]
    pub fn config(mut self, config: ReviewConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the inputs and opens the session.
    ///
    /// # Errors
    /// `Schema` or `DimensionMismatch` for bad inputs, `InvalidConfig` for a
    /// bad configuration.
    pub fn build(self) -> ProofResult<TrackData> {
        self.config.validate()?;
        let table = match self.tracks {
            TrackInput::Table(table) => table,
            TrackInput::Columns(columns) => TrackTable::from_columns(&columns)?,
        };
        let store = LineageStore::load(table, self.image, self.labels, self.graph)?;
        info!(
            vertices = store.vertex_count(),
            tracks = store.track_map().len(),
            error_model = self.error_model.is_some(),
            autofix_model = self.autofix_model.is_some(),
            "review session opened"
        );
        Ok(TrackData {
            store: Arc::new(store),
            log: CorrectionLog::with_max_proposed(self.config.max_proposed),
            config: self.config,
            error_model: self.error_model,
            autofix_model: self.autofix_model,
            cache: None,
            last_report: None,
            error_map: None,
            recomputer: None,
        })
    }
}

/// A review session over one tracking result.
pub struct TrackData {
    store: Arc<LineageStore>,
    log: CorrectionLog,
    config: ReviewConfig,
    error_model: Option<Arc<dyn ErrorScorer>>,
    autofix_model: Option<Arc<dyn Autofixer>>,
    cache: Option<Recomputed>,
    last_report: Option<ResolutionReport>,
    error_map: Option<ScoreMap>,
    recomputer: Option<Recomputer>,
}

impl fmt::Debug for TrackData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackData")
            .field("store", &self.store)
            .field("entries", &self.log.len())
            .field("proposed", &self.log.proposed_len())
            .field("fingerprint", &self.log.fingerprint())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TrackData {
    /// Starts building a session from a validated table.
    #[must_use]
    pub fn builder(tracks: TrackTable, image: Arc<dyn ArrayLike>) -> TrackDataBuilder {
        TrackDataBuilder::with_input(TrackInput::Table(tracks), image)
    }

    /// The original tracking result.
    #[must_use]
    pub fn store(&self) -> &LineageStore {
        &self.store
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    /// Proposes one correction from its wire triple.
    ///
    /// # Errors
    /// `InvalidKind`, `MalformedPayload` or `TooManyProposals`.
    pub fn propose(&mut self, kind: &str, subject: TrackId, payload: &Value) -> ProofResult<CorrectionId> {
        self.log.propose(kind, subject, payload)
    }

    /// Proposes a typed correction.
    ///
    /// # Errors
    /// `TooManyProposals`.
    pub fn propose_correction(&mut self, correction: Correction) -> ProofResult<CorrectionId> {
        self.log.propose_correction(correction)
    }

    /// Merges a correction set into the proposed partition.
    ///
    /// # Errors
    /// `TooManyProposals`.
    pub fn bulk_update(&mut self, update: CorrectionSet) -> ProofResult<Vec<CorrectionId>> {
        self.log.bulk_update(update)
    }

    /// Merges a `{kind: {subject: payload}}` document.
    ///
    /// # Errors
    /// `InvalidKind` or `MalformedPayload` for a bad document, then as
    /// [`TrackData::bulk_update`].
    pub fn bulk_update_value(&mut self, update: &Value) -> ProofResult<Vec<CorrectionId>> {
        let set = CorrectionSet::from_value(update)?;
        self.bulk_update(set)
    }

    /// Marks the newest `kind` correction on `subject` implemented, bypassing
    /// the resolver.
    ///
    /// Returns `Ok(None)` when that entry is already implemented, so calling
    /// again with the same arguments changes nothing.
    ///
    /// # Errors
    /// Propagates log errors.
    pub fn mark_implemented(&mut self, kind: CorrectionKind, subject: TrackId) -> ProofResult<Option<CorrectionId>> {
        self.log.mark_subject_implemented(kind, subject)
    }

    /// Proposes the inverse of an implemented correction.
    ///
    /// # Errors
    /// `CorrectionNotFound`, `NotImplemented` or `NoInverse`.
    pub fn retract(&mut self, id: CorrectionId) -> ProofResult<CorrectionId> {
        self.log.retract(id)
    }

    /// Runs the conflict resolver over the proposed partition.
    ///
    /// # Errors
    /// Only internal log errors; conflicts are reported, not raised.
    pub fn reconcile(&mut self) -> ProofResult<ResolutionReport> {
        let report = resolve(&self.store, &mut self.log)?;
        self.last_report = Some(report.clone());
        Ok(report)
    }

    /// Unresolved corrections from the last reconciliation.
    #[must_use]
    pub fn conflicts(&self) -> &[UnresolvedCorrection] {
        self.last_report
            .as_ref()
            .map(|r| r.unresolved.as_slice())
            .unwrap_or_default()
    }

    /// Reconciles pending proposals and returns the working tracks.
    ///
    /// # Errors
    /// As [`TrackData::reconcile`].
    pub fn tracks(&mut self) -> ProofResult<TrackTable> {
        if self.log.proposed_len() > 0 {
            self.reconcile()?;
        }
        Ok(self.current().materialized.working.to_table())
    }

    /// The working graph for the implemented partition, without reconciling.
    pub fn working_graph(&mut self) -> &WorkingGraph {
        &self.current().materialized.working
    }

    /// Implemented corrections skipped by the last materialization.
    pub fn skipped(&mut self) -> &[(CorrectionId, ExecutionError)] {
        &self.current().materialized.skipped
    }

    /// The correction log.
    #[must_use]
    pub fn corrections(&self) -> &CorrectionLog {
        &self.log
    }

    /// Captures the implemented partition.
    #[must_use]
    pub fn snapshot(&self) -> LogSnapshot {
        self.log.snapshot()
    }

    /// Per-category counts for the working graph.
    pub fn error_tally(&mut self) -> ErrorTally {
        self.current().classification.tally.clone()
    }

    /// Full classification, with labels when enabled in the config.
    pub fn classification(&mut self) -> &Classification {
        &self.current().classification
    }

    /// Runs the error model over the working tracks and keeps the result.
    ///
    /// # Errors
    /// `Collaborator` if no model is configured, otherwise the model's error.
    pub fn score_errors(&mut self) -> ProofResult<&ScoreMap> {
        let model = self.error_model.clone().ok_or_else(|| ExecutionError::Collaborator {
            message: "no error model configured".to_string(),
        })?;
        let table = self.current().materialized.working.to_table();
        let scores = model.score(&table, self.store.image())?;
        debug!(locations = scores.len(), "error map updated");
        Ok(&*self.error_map.insert(scores))
    }

    /// The last error map produced by [`TrackData::score_errors`].
    #[must_use]
    pub fn error_map(&self) -> Option<&ScoreMap> {
        self.error_map.as_ref()
    }

    /// Asks the autofix model for corrections and proposes them.
    ///
    /// Scores the working tracks first if no error map is held.
    ///
    /// # Errors
    /// `Collaborator` if a required model is missing, otherwise collaborator
    /// or log errors.
    pub fn autofix(&mut self) -> ProofResult<Vec<CorrectionId>> {
        let model = self.autofix_model.clone().ok_or_else(|| ExecutionError::Collaborator {
            message: "no autofix model configured".to_string(),
        })?;
        if self.error_map.is_none() {
            self.score_errors()?;
        }
        let scores = self.error_map.clone().unwrap_or_default();
        let suggestions = model.suggest(&scores, &self.current().materialized.working)?;
        info!(suggested = suggestions.len(), "autofix suggestions received");
        self.bulk_update(suggestions)
    }

    /// Queues materialization and classification of the current snapshot on
    /// the background worker.
    ///
    /// # Errors
    /// `QueueFull`, `Disconnected`, or `Internal` if the worker cannot start.
    pub fn recompute_in_background(&mut self) -> ProofResult<RecomputeHandle> {
        if self.recomputer.is_none() {
            self.recomputer = Some(Recomputer::start(self.config.background_queue_capacity)?);
        }
        let worker = self
            .recomputer
            .as_ref()
            .ok_or(ExecutionError::Disconnected)?;
        worker.submit(
            Arc::clone(&self.store),
            self.log.snapshot(),
            self.config.record_vertex_labels,
        )
    }

    /// Installs a background result if it matches the live log.
    ///
    /// Returns false and discards the result if the implemented partition
    /// changed since the snapshot was captured.
    pub fn install(&mut self, result: Recomputed) -> bool {
        let live = self.log.fingerprint();
        if result.fingerprint() != live {
            info!(stale = %result.fingerprint(), live = %live, "stale recompute discarded");
            return false;
        }
        self.cache = Some(result);
        true
    }

    fn current(&mut self) -> &Recomputed {
        let fingerprint = self.log.fingerprint();
        if self.cache.as_ref().is_some_and(|c| c.fingerprint() != fingerprint) {
            self.cache = None;
        }
        let (store, log, record_labels) = (&self.store, &self.log, self.config.record_vertex_labels);
        self.cache.get_or_insert_with(|| {
            debug!(fingerprint = %fingerprint, "recomputing derived state");
            Recomputed::compute(store, &log.snapshot(), record_labels)
        })
    }
}
