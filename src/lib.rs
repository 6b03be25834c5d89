//! # trackproof - track-correction core for lineage review
//!
//! trackproof holds an immutable tracking result (cell or particle lineages
//! through time), a log of reviewer corrections, and the pipeline that turns
//! the two into a corrected working graph with an error taxonomy.
//!
//! ## Pipeline
//!
//! - **Lineage store**: validated original tracks, imagery extents and the
//!   parent/child graph. Never mutated.
//! - **Correction log**: append-only proposed/implemented partitions of
//!   `new_vertex`, `lost_vertex`, `new_parent`, `lost_parent` and `join` edits.
//! - **Resolver**: picks the consistent subset of proposals and reports the rest.
//! - **Materializer**: folds implemented corrections over the store.
//! - **Classifier**: labels every working vertex and tallies the labels.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use trackproof::{TrackData, TrackId, TrackTable, Vertex, Volume};
//!
//! let table = TrackTable::from_vertices((0..4).map(|t| Vertex::new(TrackId(1), t, 0.0, 1.0, 1.0)));
//! let image = Arc::new(Volume::<u16>::zeros(vec![4, 1, 8, 8]));
//! let mut session = TrackData::builder(table, image).build()?;
//!
//! session.propose("lost_vertex", TrackId(1), &json!([3, 0.0, 1.0, 1.0]))?;
//! let report = session.reconcile()?;
//! let tally = session.error_tally();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Data model
pub mod error;
pub mod graph;
pub mod table;
pub mod vertex;
pub mod volume;

// Pipeline
pub mod classify;
pub mod correction;
pub mod log;
pub mod resolver;
pub mod store;
pub mod working;

// Session and collaborators
pub mod collaborator;
pub mod config;
pub mod recompute;
pub mod session;

pub use classify::{classify, Classification, ErrorCategory, ErrorTally};
pub use collaborator::{AnomalyScore, Autofixer, ErrorScorer, ScoreMap};
pub use config::ReviewConfig;
pub use correction::{Correction, CorrectionKey, CorrectionKind, CorrectionSet};
pub use error::{ExecutionError, ProofError, ProofResult, ValidationError};
pub use graph::LineageGraph;
pub use log::{CorrectionId, CorrectionLog, CorrectionState, Fingerprint, ImplementedCorrection, LogEntry, LogSnapshot};
pub use recompute::{RecomputeHandle, Recomputed, Recomputer};
pub use resolver::{
    conflict_rule, plan, resolve, ConflictReason, ConflictRule, ResolutionPlan, ResolutionReport,
    UnresolvedCorrection,
};
pub use session::{TrackData, TrackDataBuilder};
pub use store::{LineageStore, TrackMap};
pub use table::{Column, TrackColumns, TrackTable, REQUIRED_COLUMNS};
pub use vertex::{Position, Slot, TrackId, Vertex};
pub use volume::{ArrayLike, Volume, AXES};
pub use working::{materialize, Materialized, VertexOrigin, WorkingGraph, WorkingVertex};
