//! Correction variants and their payload encoding.
//!
//! A correction is a proposed edit of the lineage graph. Editing surfaces send
//! them as `(kind, subject, payload)` triples or as a nested
//! `{kind: {subject: payload}}` update; both are parsed here into the
//! [`Correction`] enum, checking payload shape but not graph consistency.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ValidationError;
use crate::vertex::{Position, Slot, TrackId};

/// The five correction kinds.
///
/// Variant order is the materialization order: removals before insertions,
/// parent edges before joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    /// Remove a vertex.
    LostVertex,
    /// Insert a vertex.
    NewVertex,
    /// Remove a parent link.
    LostParent,
    /// Add a parent link.
    NewParent,
    /// Merge one track into another.
    Join,
}

impl CorrectionKind {
    /// All kinds in materialization order.
    pub const ALL: [Self; 5] = [
        Self::LostVertex,
        Self::NewVertex,
        Self::LostParent,
        Self::NewParent,
        Self::Join,
    ];

    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LostVertex => "lost_vertex",
            Self::NewVertex => "new_vertex",
            Self::LostParent => "lost_parent",
            Self::NewParent => "new_parent",
            Self::Join => "join",
        }
    }

    /// Returns true for `lost_*` kinds.
    #[must_use]
    pub const fn is_removal(self) -> bool {
        matches!(self, Self::LostVertex | Self::LostParent)
    }
}

impl fmt::Display for CorrectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorrectionKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidKind { kind: s.to_string() })
    }
}

/// A proposed edit of the lineage graph.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Correction {
    /// Insert a vertex on `track`.
    NewVertex {
        /// Track receiving the vertex.
        track: TrackId,
        /// Where to insert it.
        position: Position,
    },
    /// Remove the vertex of `track` at exactly `position`.
    LostVertex {
        /// Track losing the vertex.
        track: TrackId,
        /// The vertex to remove.
        position: Position,
    },
    /// Link `parent -> child`.
    NewParent {
        /// Child track.
        child: TrackId,
        /// Parent track.
        parent: TrackId,
    },
    /// Unlink `parent -> child`.
    LostParent {
        /// Child track.
        child: TrackId,
        /// Parent track.
        parent: TrackId,
    },
    /// Merge `first` into `second`; `second` survives.
    Join {
        /// Absorbed track.
        first: TrackId,
        /// Surviving track.
        second: TrackId,
        /// Reviewer marked the tracks as adjacent even though their frame
        /// ranges interleave.
        #[serde(default)]
        adjacent: bool,
    },
}

/// Identity of a correction's target, used for last-write-wins updates and
/// canonical ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum CorrectionKey {
    /// A vertex slot.
    Slot {
        /// Target slot.
        slot: Slot,
    },
    /// A parent edge.
    Edge {
        /// Child track.
        child: TrackId,
        /// Parent track.
        parent: TrackId,
    },
    /// A join, keyed by the absorbed track.
    Join {
        /// Absorbed track.
        first: TrackId,
    },
}

impl Correction {
    /// Kind of this correction.
    #[must_use]
    pub const fn kind(&self) -> CorrectionKind {
        match self {
            Self::NewVertex { .. } => CorrectionKind::NewVertex,
            Self::LostVertex { .. } => CorrectionKind::LostVertex,
            Self::NewParent { .. } => CorrectionKind::NewParent,
            Self::LostParent { .. } => CorrectionKind::LostParent,
            Self::Join { .. } => CorrectionKind::Join,
        }
    }

    /// The subject track ID the correction is filed under.
    #[must_use]
    pub const fn subject(&self) -> TrackId {
        match *self {
            Self::NewVertex { track, .. } | Self::LostVertex { track, .. } => track,
            Self::NewParent { child, .. } | Self::LostParent { child, .. } => child,
            Self::Join { first, .. } => first,
        }
    }

    /// Target key of the correction.
    #[must_use]
    pub const fn key(&self) -> CorrectionKey {
        match *self {
            Self::NewVertex { track, position } | Self::LostVertex { track, position } => {
                CorrectionKey::Slot {
                    slot: Slot::new(track, position.t),
                }
            }
            Self::NewParent { child, parent } | Self::LostParent { child, parent } => {
                CorrectionKey::Edge { child, parent }
            }
            Self::Join { first, .. } => CorrectionKey::Join { first },
        }
    }

    /// Vertex slot touched, for vertex corrections.
    #[must_use]
    pub const fn slot(&self) -> Option<Slot> {
        match *self {
            Self::NewVertex { track, position } | Self::LostVertex { track, position } => {
                Some(Slot::new(track, position.t))
            }
            _ => None,
        }
    }

    /// Every track ID the correction names.
    #[must_use]
    pub fn tracks(&self) -> Vec<TrackId> {
        match *self {
            Self::NewVertex { track, .. } | Self::LostVertex { track, .. } => vec![track],
            Self::NewParent { child, parent } | Self::LostParent { child, parent } => {
                vec![child, parent]
            }
            Self::Join { first, second, .. } => vec![first, second],
        }
    }

    /// The correction that undoes this one. Joins have no inverse.
    #[must_use]
    pub const fn inverse(&self) -> Option<Self> {
        match *self {
            Self::NewVertex { track, position } => Some(Self::LostVertex { track, position }),
            Self::LostVertex { track, position } => Some(Self::NewVertex { track, position }),
            Self::NewParent { child, parent } => Some(Self::LostParent { child, parent }),
            Self::LostParent { child, parent } => Some(Self::NewParent { child, parent }),
            Self::Join { .. } => None,
        }
    }

    /// Total order: kind, target key, then payload.
    #[must_use]
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.kind()
            .cmp(&other.kind())
            .then_with(|| self.key().cmp(&other.key()))
            .then_with(|| match (self, other) {
                (
                    Self::NewVertex { position: a, .. } | Self::LostVertex { position: a, .. },
                    Self::NewVertex { position: b, .. } | Self::LostVertex { position: b, .. },
                ) => a.canonical_cmp(b),
                (
                    Self::Join {
                        second: a,
                        adjacent: aa,
                        ..
                    },
                    Self::Join {
                        second: b,
                        adjacent: ab,
                        ..
                    },
                ) => a.cmp(b).then_with(|| aa.cmp(ab)),
                _ => Ordering::Equal,
            })
    }

    /// Returns true if both corrections carry the same payload bit-for-bit.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.canonical_cmp(other) == Ordering::Equal
            && match (self, other) {
                (
                    Self::NewVertex { position: a, .. } | Self::LostVertex { position: a, .. },
                    Self::NewVertex { position: b, .. } | Self::LostVertex { position: b, .. },
                ) => a.same_as(b),
                _ => true,
            }
    }

    /// Parses a `(kind, subject, payload)` triple.
    ///
    /// Payload shapes:
    /// - `new_vertex` / `lost_vertex`: `[t, z, y, x]` or `{"t", "z", "y", "x"}`
    /// - `new_parent` / `lost_parent`: parent track ID
    /// - `join`: surviving track ID, or `{"into": id, "adjacent": bool}`
    ///
    /// # Errors
    /// `MalformedPayload` if the payload does not have the shape of `kind`.
    pub fn from_payload(
        kind: CorrectionKind,
        subject: TrackId,
        payload: &Value,
    ) -> Result<Self, ValidationError> {
        match kind {
            CorrectionKind::NewVertex => Ok(Self::NewVertex {
                track: subject,
                position: parse_position(kind, payload)?,
            }),
            CorrectionKind::LostVertex => Ok(Self::LostVertex {
                track: subject,
                position: parse_position(kind, payload)?,
            }),
            CorrectionKind::NewParent => Ok(Self::NewParent {
                child: subject,
                parent: parse_track(kind, payload)?,
            }),
            CorrectionKind::LostParent => Ok(Self::LostParent {
                child: subject,
                parent: parse_track(kind, payload)?,
            }),
            CorrectionKind::Join => {
                let (second, adjacent) = match payload {
                    Value::Object(map) => {
                        let into = map
                            .get("into")
                            .ok_or_else(|| ValidationError::malformed(kind.as_str(), "missing 'into'"))?;
                        let adjacent = match map.get("adjacent") {
                            None => false,
                            Some(Value::Bool(b)) => *b,
                            Some(other) => {
                                return Err(ValidationError::malformed(
                                    kind.as_str(),
                                    format!("'adjacent' must be a bool, got {other}"),
                                ))
                            }
                        };
                        (parse_track(kind, into)?, adjacent)
                    }
                    other => (parse_track(kind, other)?, false),
                };
                Ok(Self::Join {
                    first: subject,
                    second,
                    adjacent,
                })
            }
        }
    }

    /// The payload half of the wire triple.
    #[must_use]
    pub fn payload(&self) -> Value {
        match *self {
            Self::NewVertex { position, .. } | Self::LostVertex { position, .. } => {
                json!([position.t, position.z, position.y, position.x])
            }
            Self::NewParent { parent, .. } | Self::LostParent { parent, .. } => json!(parent.0),
            Self::Join {
                second, adjacent, ..
            } => {
                if adjacent {
                    json!({ "into": second.0, "adjacent": true })
                } else {
                    json!(second.0)
                }
            }
        }
    }
}

fn parse_track(kind: CorrectionKind, value: &Value) -> Result<TrackId, ValidationError> {
    value
        .as_i64()
        .map(TrackId)
        .ok_or_else(|| ValidationError::malformed(kind.as_str(), format!("expected integer track ID, got {value}")))
}

fn parse_frame(kind: CorrectionKind, value: &Value) -> Result<i64, ValidationError> {
    if let Some(t) = value.as_i64() {
        return Ok(t);
    }
    // Frames written as whole floats (e.g. `3.0`) are accepted.
    match value.as_f64() {
        #[allow(clippy::cast_possible_truncation)]
        Some(f) if f.fract() == 0.0 && f.is_finite() => Ok(f as i64),
        _ => Err(ValidationError::malformed(
            kind.as_str(),
            format!("'t' must be an integer frame, got {value}"),
        )),
    }
}

fn parse_coord(kind: CorrectionKind, axis: &str, value: &Value) -> Result<f64, ValidationError> {
    match value.as_f64() {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(ValidationError::malformed(
            kind.as_str(),
            format!("'{axis}' must be a finite number, got {value}"),
        )),
    }
}

fn parse_position(kind: CorrectionKind, value: &Value) -> Result<Position, ValidationError> {
    match value {
        Value::Array(items) => {
            let [t, z, y, x] = items.as_slice() else {
                return Err(ValidationError::malformed(
                    kind.as_str(),
                    format!("expected [t, z, y, x], got {} elements", items.len()),
                ));
            };
            Ok(Position::new(
                parse_frame(kind, t)?,
                parse_coord(kind, "z", z)?,
                parse_coord(kind, "y", y)?,
                parse_coord(kind, "x", x)?,
            ))
        }
        Value::Object(map) => {
            let field = |name: &str| {
                map.get(name)
                    .ok_or_else(|| ValidationError::malformed(kind.as_str(), format!("missing '{name}'")))
            };
            Ok(Position::new(
                parse_frame(kind, field("t")?)?,
                parse_coord(kind, "z", field("z")?)?,
                parse_coord(kind, "y", field("y")?)?,
                parse_coord(kind, "x", field("x")?)?,
            ))
        }
        other => Err(ValidationError::malformed(
            kind.as_str(),
            format!("expected [t, z, y, x] or object, got {other}"),
        )),
    }
}

/// A batch of corrections from an external editing surface.
///
/// Within one set, a later correction with the same target key replaces an
/// earlier one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrectionSet {
    corrections: Vec<Correction>,
}

impl CorrectionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a correction, replacing any earlier one with the same kind and key.
    pub fn push(&mut self, correction: Correction) {
        self.corrections
            .retain(|c| !(c.kind() == correction.kind() && c.key() == correction.key()));
        self.corrections.push(correction);
    }

    /// Builder-style [`CorrectionSet::push`].
    #[must_use]
    pub fn with(mut self, correction: Correction) -> Self {
        self.push(correction);
        self
    }

    /// Number of corrections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.corrections.len()
    }

    /// Returns true if the set holds no corrections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.corrections.is_empty()
    }

    /// Iterates corrections in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Correction> {
        self.corrections.iter()
    }

    /// Parses the nested `{kind: {subject: payload}}` shape.
    ///
    /// A subject may map to a single payload or, for vertex kinds, to a list of
    /// payloads.
    ///
    /// # Errors
    /// `InvalidKind` for an unknown top-level key; `MalformedPayload` for a
    /// non-integer subject or a payload of the wrong shape.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let Value::Object(kinds) = value else {
            return Err(ValidationError::malformed("update", "expected an object keyed by kind"));
        };

        let mut set = Self::new();
        for (kind_name, subjects) in kinds {
            let kind: CorrectionKind = kind_name.parse()?;
            let Value::Object(subjects) = subjects else {
                return Err(ValidationError::malformed(kind.as_str(), "expected an object keyed by track ID"));
            };
            for (subject, payload) in subjects {
                let subject = subject.trim().parse::<i64>().map(TrackId).map_err(|_| {
                    ValidationError::malformed(kind.as_str(), format!("subject '{subject}' is not a track ID"))
                })?;
                for payload in split_payloads(kind, payload) {
                    set.push(Correction::from_payload(kind, subject, payload)?);
                }
            }
        }
        Ok(set)
    }

    /// Parses a JSON document of the nested update shape.
    ///
    /// # Errors
    /// `MalformedPayload` if the text is not JSON, otherwise as [`CorrectionSet::from_value`].
    pub fn from_json(s: &str) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_str(s).map_err(|e| ValidationError::malformed("update", e.to_string()))?;
        Self::from_value(&value)
    }

    /// Renders the nested `{kind: {subject: payload}}` shape.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut grouped: BTreeMap<CorrectionKind, BTreeMap<TrackId, Vec<Value>>> = BTreeMap::new();
        for c in &self.corrections {
            grouped
                .entry(c.kind())
                .or_default()
                .entry(c.subject())
                .or_default()
                .push(c.payload());
        }

        let mut out = Map::new();
        for (kind, subjects) in grouped {
            let mut inner = Map::new();
            for (subject, mut payloads) in subjects {
                let value = if payloads.len() == 1 {
                    payloads.remove(0)
                } else {
                    Value::Array(payloads)
                };
                inner.insert(subject.to_string(), value);
            }
            out.insert(kind.as_str().to_string(), Value::Object(inner));
        }
        Value::Object(out)
    }
}

impl IntoIterator for CorrectionSet {
    type Item = Correction;
    type IntoIter = std::vec::IntoIter<Correction>;

    fn into_iter(self) -> Self::IntoIter {
        self.corrections.into_iter()
    }
}

impl FromIterator<Correction> for CorrectionSet {
    fn from_iter<I: IntoIterator<Item = Correction>>(iter: I) -> Self {
        let mut set = Self::new();
        for c in iter {
            set.push(c);
        }
        set
    }
}

fn split_payloads(kind: CorrectionKind, payload: &Value) -> Vec<&Value> {
    let is_vertex = matches!(kind, CorrectionKind::NewVertex | CorrectionKind::LostVertex);
    match payload {
        Value::Array(items)
            if is_vertex && items.first().is_some_and(|v| v.is_array() || v.is_object()) =>
        {
            items.iter().collect()
        }
        other => vec![other],
    }
}
