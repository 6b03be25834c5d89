//! Lineage graph store: the immutable original tracking result.
//!
//! Created once per review session. Every later stage reads it for comparison;
//! nothing mutates it after `load`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::ValidationError;
use crate::graph::LineageGraph;
use crate::table::{TrackColumns, TrackTable};
use crate::vertex::{Slot, TrackId, Vertex};
use crate::volume::{check_extents, ArrayLike};

/// Time-ordered vertices of every original track.
pub type TrackMap = BTreeMap<TrackId, Vec<Vertex>>;

/// Read-only snapshot of the original tracks, imagery and lineage graph.
#[derive(Clone)]
pub struct LineageStore {
    table: TrackTable,
    tracks: TrackMap,
    graph: LineageGraph,
    image: Arc<dyn ArrayLike>,
    labels: Option<Arc<dyn ArrayLike>>,
}

impl fmt::Debug for LineageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineageStore")
            .field("vertices", &self.table.len())
            .field("tracks", &self.tracks.len())
            .field("edges", &self.graph.edge_count())
            .field("image_shape", &self.image.shape())
            .field("labels_shape", &self.labels.as_ref().map(|l| l.shape().to_vec()))
            .finish()
    }
}

impl LineageStore {
    /// Loads a store from raw columns.
    ///
    /// # Errors
    /// See [`LineageStore::load`]; column problems surface as `Schema`.
    pub fn from_columns(
        columns: &TrackColumns,
        image: Arc<dyn ArrayLike>,
        labels: Option<Arc<dyn ArrayLike>>,
        graph: Option<LineageGraph>,
    ) -> Result<Self, ValidationError> {
        let table = TrackTable::from_columns(columns)?;
        Self::load(table, image, labels, graph)
    }

    /// Validates and freezes the original tracking result.
    ///
    /// # Errors
    /// - `Schema`: two vertices share an `(ID, t)` slot, a coordinate is not
    ///   finite, or the graph names an unknown track, links a track to itself,
    ///   or contains a cycle.
    /// - `DimensionMismatch`: the image is not `(t, z, y, x)`, the labels do not
    ///   match the image extents, or a vertex lies outside the image frames.
    pub fn load(
        table: TrackTable,
        image: Arc<dyn ArrayLike>,
        labels: Option<Arc<dyn ArrayLike>>,
        graph: Option<LineageGraph>,
    ) -> Result<Self, ValidationError> {
        check_extents(image.as_ref(), labels.as_deref())?;

        let frames = image.frames().unwrap_or(0);
        let mut tracks = TrackMap::new();
        let mut previous: Option<Slot> = None;
        for v in table.rows() {
            if previous == Some(v.slot()) {
                return Err(ValidationError::schema(
                    "t",
                    format!("track {} has two vertices at t={}", v.track, v.t),
                ));
            }
            previous = Some(v.slot());
            if let Some(axis) = non_finite_axis(&v) {
                return Err(ValidationError::schema(
                    axis,
                    format!("non-finite coordinate on track {} at t={}", v.track, v.t),
                ));
            }
            if v.t < 0 || usize::try_from(v.t).map_or(true, |t| t >= frames) {
                return Err(ValidationError::DimensionMismatch {
                    what: "tracks.t".to_string(),
                    expected: format!("0 <= t < {frames}"),
                    actual: format!("t={} (track {})", v.t, v.track),
                });
            }
            tracks.entry(v.track).or_default().push(v);
        }

        let graph = graph.unwrap_or_default();
        for (child, parent) in graph.edges() {
            if child == parent {
                return Err(ValidationError::schema(
                    "graph",
                    format!("track {child} is its own parent"),
                ));
            }
            for id in [child, parent] {
                if !tracks.contains_key(&id) {
                    return Err(ValidationError::schema(
                        "graph",
                        format!("edge {parent} -> {child} names unknown track {id}"),
                    ));
                }
            }
        }
        if let Some(track) = graph.find_cycle() {
            return Err(ValidationError::schema(
                "graph",
                format!("lineage cycle through track {track}"),
            ));
        }

        debug!(
            vertices = table.len(),
            tracks = tracks.len(),
            edges = graph.edge_count(),
            "lineage store loaded"
        );

        Ok(Self {
            table,
            tracks,
            graph,
            image,
            labels,
        })
    }

    /// The original tracks as a table.
    #[must_use]
    pub fn tracks(&self) -> &TrackTable {
        &self.table
    }

    /// Original tracks keyed by ID.
    #[must_use]
    pub fn track_map(&self) -> &TrackMap {
        &self.tracks
    }

    /// Vertices of one original track, time-ordered.
    #[must_use]
    pub fn track(&self, id: TrackId) -> Option<&[Vertex]> {
        self.tracks.get(&id).map(Vec::as_slice)
    }

    /// The original parent/child graph.
    #[must_use]
    pub fn graph(&self) -> &LineageGraph {
        &self.graph
    }

    /// The tracked image.
    #[must_use]
    pub fn image(&self) -> &dyn ArrayLike {
        self.image.as_ref()
    }

    /// The segmentation the tracks were produced from, if any.
    #[must_use]
    pub fn labels(&self) -> Option<&dyn ArrayLike> {
        self.labels.as_deref()
    }

    /// Total number of original vertices.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.table.len()
    }

    /// First and last frame of an original track.
    #[must_use]
    pub fn span(&self, id: TrackId) -> Option<(i64, i64)> {
        let vs = self.tracks.get(&id)?;
        Some((vs.first()?.t, vs.last()?.t))
    }
}

fn non_finite_axis(v: &Vertex) -> Option<&'static str> {
    [("z", v.z), ("y", v.y), ("x", v.x)]
        .into_iter()
        .find(|(_, value)| !value.is_finite())
        .map(|(axis, _)| axis)
}
