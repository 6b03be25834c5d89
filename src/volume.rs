//! Image and segmentation volumes.
//!
//! Pixel storage and loading live outside this crate; the core only needs the
//! extents of the `(t, z, y, x)` arrays to check that tracks, image and labels
//! agree. `Volume` is a small dense implementation for embedding and tests.

use std::fmt;
use std::sync::Arc;

use crate::error::ValidationError;

/// Number of axes of an image or label array: `(t, z, y, x)`.
pub const AXES: usize = 4;

/// Anything that exposes an n-dimensional shape.
pub trait ArrayLike: fmt::Debug + Send + Sync {
    /// Extent of each axis.
    fn shape(&self) -> &[usize];

    /// Number of frames (first axis), if the array has at least one axis.
    fn frames(&self) -> Option<usize> {
        self.shape().first().copied()
    }
}

/// Dense, row-major volume.
#[derive(Debug, Clone)]
pub struct Volume<T> {
    shape: Vec<usize>,
    data: Arc<[T]>,
}

impl<T> Volume<T> {
    /// Wraps `data` with the given shape.
    ///
    /// # Errors
    /// `ValidationError::DimensionMismatch` if `data.len()` is not the product
    /// of the shape.
    pub fn new(shape: Vec<usize>, data: Vec<T>) -> Result<Self, ValidationError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ValidationError::DimensionMismatch {
                what: "volume data".to_string(),
                expected: format!("{expected} elements for shape {shape:?}"),
                actual: format!("{} elements", data.len()),
            });
        }
        Ok(Self {
            shape,
            data: data.into(),
        })
    }

    /// Element at a `(t, z, y, x)` index.
    #[must_use]
    pub fn get(&self, index: [usize; AXES]) -> Option<&T> {
        if self.shape.len() != AXES {
            return None;
        }
        let mut offset = 0usize;
        for (axis, &i) in index.iter().enumerate() {
            if i >= self.shape[axis] {
                return None;
            }
            offset = offset * self.shape[axis] + i;
        }
        self.data.get(offset)
    }
}

impl<T: Clone + Default> Volume<T> {
    /// A volume filled with `T::default()`.
    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len: usize = shape.iter().product();
        Self {
            shape,
            data: vec![T::default(); len].into(),
        }
    }
}

impl<T: fmt::Debug + Send + Sync> ArrayLike for Volume<T> {
    fn shape(&self) -> &[usize] {
        &self.shape
    }
}

/// Checks that `image` is 4-D and that `labels`, if present, share its extents.
pub(crate) fn check_extents(
    image: &dyn ArrayLike,
    labels: Option<&dyn ArrayLike>,
) -> Result<(), ValidationError> {
    if image.shape().len() != AXES {
        return Err(ValidationError::DimensionMismatch {
            what: "image".to_string(),
            expected: "4 axes (t, z, y, x)".to_string(),
            actual: format!("{} axes {:?}", image.shape().len(), image.shape()),
        });
    }
    if let Some(labels) = labels {
        if labels.shape() != image.shape() {
            return Err(ValidationError::DimensionMismatch {
                what: "labels".to_string(),
                expected: format!("{:?}", image.shape()),
                actual: format!("{:?}", labels.shape()),
            });
        }
    }
    Ok(())
}
