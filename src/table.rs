//! Columnar track table.
//!
//! Tracks arrive as named columns `ID, t, z, y, x` (the napari tracks layout).
//! `TrackTable` validates that shape once and then stores the columns in
//! canonical `(ID, t)` row order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::vertex::{TrackId, Vertex};

/// Required column names, in canonical order.
pub const REQUIRED_COLUMNS: [&str; 5] = ["ID", "t", "z", "y", "x"];

/// A single input column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Column {
    /// Integer column.
    Int(Vec<i64>),
    /// Floating point column.
    Float(Vec<f64>),
}

impl Column {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
        }
    }

    /// Returns true if the column has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
        }
    }
}

/// Raw named columns, as handed over by a loader.
pub type TrackColumns = BTreeMap<String, Column>;

/// Validated, columnar table of vertices sorted by `(ID, t)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackTable {
    #[serde(rename = "ID")]
    ids: Vec<TrackId>,
    t: Vec<i64>,
    z: Vec<f64>,
    y: Vec<f64>,
    x: Vec<f64>,
}

fn int_column<'a>(columns: &'a TrackColumns, name: &str) -> Result<&'a [i64], ValidationError> {
    match columns.get(name) {
        None => Err(ValidationError::schema(name, "required column is missing")),
        Some(Column::Int(v)) => Ok(v),
        Some(other) => Err(ValidationError::schema(
            name,
            format!("expected int column, got {}", other.type_name()),
        )),
    }
}

fn float_column(columns: &TrackColumns, name: &str) -> Result<Vec<f64>, ValidationError> {
    let values = match columns.get(name) {
        None => return Err(ValidationError::schema(name, "required column is missing")),
        Some(Column::Float(v)) => v.clone(),
        // Integral pixel coordinates are accepted and widened.
        #[allow(clippy::cast_precision_loss)]
        Some(Column::Int(v)) => v.iter().map(|&i| i as f64).collect(),
    };
    if let Some(row) = values.iter().position(|v| !v.is_finite()) {
        return Err(ValidationError::schema(
            name,
            format!("non-finite value at row {row}"),
        ));
    }
    Ok(values)
}

impl TrackTable {
    /// Validates raw columns and builds a table.
    ///
    /// # Errors
    /// `ValidationError::Schema` if a required column is missing, has the wrong
    /// type, has a different length than `ID`, or holds non-finite coordinates.
    pub fn from_columns(columns: &TrackColumns) -> Result<Self, ValidationError> {
        let ids = int_column(columns, "ID")?;
        let t = int_column(columns, "t")?;
        let z = float_column(columns, "z")?;
        let y = float_column(columns, "y")?;
        let x = float_column(columns, "x")?;

        let rows = ids.len();
        for (name, len) in [("t", t.len()), ("z", z.len()), ("y", y.len()), ("x", x.len())] {
            if len != rows {
                return Err(ValidationError::schema(
                    name,
                    format!("column has {len} rows, expected {rows}"),
                ));
            }
        }

        let vertices = (0..rows).map(|i| Vertex::new(TrackId(ids[i]), t[i], z[i], y[i], x[i]));
        Ok(Self::from_vertices(vertices))
    }

    /// Builds a table from vertices, sorting rows by `(ID, t)`.
    pub fn from_vertices(vertices: impl IntoIterator<Item = Vertex>) -> Self {
        let mut rows: Vec<Vertex> = vertices.into_iter().collect();
        rows.sort_by(|a, b| a.slot().cmp(&b.slot()).then_with(|| a.position().canonical_cmp(&b.position())));

        let mut table = Self {
            ids: Vec::with_capacity(rows.len()),
            t: Vec::with_capacity(rows.len()),
            z: Vec::with_capacity(rows.len()),
            y: Vec::with_capacity(rows.len()),
            x: Vec::with_capacity(rows.len()),
        };
        for v in rows {
            table.ids.push(v.track);
            table.t.push(v.t);
            table.z.push(v.z);
            table.y.push(v.y);
            table.x.push(v.x);
        }
        table
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns row `i` as a vertex.
    #[must_use]
    pub fn row(&self, i: usize) -> Option<Vertex> {
        if i >= self.len() {
            return None;
        }
        Some(Vertex::new(self.ids[i], self.t[i], self.z[i], self.y[i], self.x[i]))
    }

    /// Iterates rows in `(ID, t)` order.
    pub fn rows(&self) -> impl Iterator<Item = Vertex> + '_ {
        (0..self.len()).map(|i| Vertex::new(self.ids[i], self.t[i], self.z[i], self.y[i], self.x[i]))
    }

    /// The `ID` column.
    #[must_use]
    pub fn ids(&self) -> &[TrackId] {
        &self.ids
    }

    /// The `t` column.
    #[must_use]
    pub fn times(&self) -> &[i64] {
        &self.t
    }

    /// Distinct track IDs, ascending.
    #[must_use]
    pub fn track_ids(&self) -> Vec<TrackId> {
        let mut ids = self.ids.clone();
        ids.dedup();
        ids
    }

    /// Canonical little-endian encoding of the table, row by row.
    ///
    /// Two tables are equal iff their encodings are equal.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * 40);
        for v in self.rows() {
            out.extend_from_slice(&v.track.0.to_le_bytes());
            out.extend_from_slice(&v.t.to_le_bytes());
            out.extend_from_slice(&v.z.to_bits().to_le_bytes());
            out.extend_from_slice(&v.y.to_bits().to_le_bytes());
            out.extend_from_slice(&v.x.to_bits().to_le_bytes());
        }
        out
    }

    /// Converts back into named columns.
    #[must_use]
    pub fn to_columns(&self) -> TrackColumns {
        let mut columns = TrackColumns::new();
        columns.insert("ID".to_string(), Column::Int(self.ids.iter().map(|id| id.0).collect()));
        columns.insert("t".to_string(), Column::Int(self.t.clone()));
        columns.insert("z".to_string(), Column::Float(self.z.clone()));
        columns.insert("y".to_string(), Column::Float(self.y.clone()));
        columns.insert("x".to_string(), Column::Float(self.x.clone()));
        columns
    }
}
