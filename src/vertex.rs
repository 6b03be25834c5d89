//! Track identities, vertex positions and slots.
//!
//! A vertex is identified by `(track, t)`: two vertices of the same track can
//! never share a frame. Spatial coordinates are compared bit-for-bit so that a
//! removal only ever matches the exact position it names.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub i64);

impl TrackId {
    /// Returns the raw integer ID.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for TrackId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `(track, t)` coordinate. At most one vertex occupies a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    /// Owning track.
    pub track: TrackId,
    /// Frame index.
    pub t: i64,
}

impl Slot {
    /// Creates a slot.
    #[must_use]
    pub const fn new(track: TrackId, t: i64) -> Self {
        Self { track, t }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@t{}", self.track, self.t)
    }
}

/// A point in `(t, z, y, x)` space, without track identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Frame index.
    pub t: i64,
    /// Z coordinate.
    pub z: f64,
    /// Y coordinate.
    pub y: f64,
    /// X coordinate.
    pub x: f64,
}

impl Position {
    /// Creates a position.
    #[must_use]
    pub const fn new(t: i64, z: f64, y: f64, x: f64) -> Self {
        Self { t, z, y, x }
    }

    /// Exact equality: spatial coordinates must match bit-for-bit.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.t == other.t && self.spatial_bits() == other.spatial_bits()
    }

    /// Returns true if every spatial coordinate is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.z.is_finite() && self.y.is_finite() && self.x.is_finite()
    }

    pub(crate) fn spatial_bits(&self) -> [u64; 3] {
        [self.z.to_bits(), self.y.to_bits(), self.x.to_bits()]
    }

    /// Total order used for canonical sorting: `t`, then coordinates by `total_cmp`.
    pub(crate) fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.t
            .cmp(&other.t)
            .then_with(|| self.z.total_cmp(&other.z))
            .then_with(|| self.y.total_cmp(&other.y))
            .then_with(|| self.x.total_cmp(&other.x))
    }
}

/// A vertex of the lineage graph.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    /// Owning track.
    #[serde(rename = "ID")]
    pub track: TrackId,
    /// Frame index.
    pub t: i64,
    /// Z coordinate.
    pub z: f64,
    /// Y coordinate.
    pub y: f64,
    /// X coordinate.
    pub x: f64,
}

impl Vertex {
    /// Creates a vertex.
    #[must_use]
    pub const fn new(track: TrackId, t: i64, z: f64, y: f64, x: f64) -> Self {
        Self { track, t, z, y, x }
    }

    /// Creates a vertex on `track` at `position`.
    #[must_use]
    pub const fn at(track: TrackId, position: Position) -> Self {
        Self {
            track,
            t: position.t,
            z: position.z,
            y: position.y,
            x: position.x,
        }
    }

    /// The vertex position without identity.
    #[must_use]
    pub const fn position(&self) -> Position {
        Position::new(self.t, self.z, self.y, self.x)
    }

    /// The `(track, t)` slot this vertex occupies.
    #[must_use]
    pub const fn slot(&self) -> Slot {
        Slot::new(self.track, self.t)
    }
}
