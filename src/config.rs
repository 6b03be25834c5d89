//! Review session configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! record_vertex_labels = true
//! background_queue_capacity = 4
//! max_proposed = 100000
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ValidationError;
use crate::log::DEFAULT_MAX_PROPOSED;

/// Tunables of a review session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReviewConfig {
    /// Keep the per-vertex label map alongside the error tally.
    pub record_vertex_labels: bool,
    /// Bound of the background recompute queue.
    pub background_queue_capacity: usize,
    /// Cap on outstanding proposed corrections.
    pub max_proposed: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            record_vertex_labels: true,
            background_queue_capacity: 4,
            max_proposed: DEFAULT_MAX_PROPOSED,
        }
    }
}

impl ReviewConfig {
    /// Rejects settings the session cannot run with.
    ///
    /// # Errors
    /// `InvalidConfig` if a capacity is zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.background_queue_capacity == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "background_queue_capacity must be at least 1".to_string(),
            });
        }
        if self.max_proposed == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "max_proposed must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    /// `InvalidConfig` on parse errors, unknown keys, or failed validation.
    pub fn from_toml_str(s: &str) -> Result<Self, ValidationError> {
        let config: Self = toml::from_str(s).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    /// `InvalidConfig` if the file cannot be read, otherwise as
    /// [`ReviewConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), ?config, "review config loaded");
        Ok(config)
    }
}
