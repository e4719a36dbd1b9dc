use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::landmarks::LandmarkScheme;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse liveness config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid liveness config value: {field} - {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

/// How a frame reporting more than one face is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiFacePolicy {
    /// Show a "multiple faces" instruction and freeze challenge progress
    /// until exactly one face is visible again.
    #[default]
    Suppress,
    /// Use the first reported face and ignore the rest.
    FirstFace,
}

/// Thresholds for one liveness session.
///
/// Defaults are the empirically chosen values from the web flow this engine
/// replaced. They have not been calibrated against a spoof dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Landmark indices consumed by the pose estimator.
    pub scheme: LandmarkScheme,
    /// `|offset|` below this counts as facing the camera.
    pub center_tolerance: f32,
    /// `|offset|` above this counts as a deliberate turn.
    pub turn_tolerance: f32,
    /// Delay between alignment and the first challenge step.
    pub stabilize_delay_ms: u64,
    /// How long each challenge pose must be held without interruption.
    pub hold_ms: u64,
    /// Capacity of the rolling yaw history.
    pub yaw_window: usize,
    /// Samples required in the yaw history before the scorer evaluates.
    pub scorer_warmup: usize,
    /// Added to the suspicion score on a flat-motion frame.
    pub suspicion_increment: u32,
    /// Subtracted (floored at zero) on any other scored frame.
    pub suspicion_decrement: u32,
    /// The session blocks once the score exceeds this value.
    pub suspicion_block_threshold: u32,
    /// Yaw-history range below which motion counts as flat.
    pub yaw_flatness_threshold: f32,
    /// `|offset|` above which flat yaw becomes suspicious.
    pub offset_flatness_threshold: f32,
    /// Handling of frames with several faces.
    pub multi_face: MultiFacePolicy,
    /// Consecutive malformed frames treated as face loss. 0 = never.
    pub max_consecutive_malformed: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            scheme: LandmarkScheme::default(),
            center_tolerance: 0.015,
            turn_tolerance: 0.04,
            stabilize_delay_ms: 2000,
            hold_ms: 400,
            yaw_window: 15,
            scorer_warmup: 10,
            suspicion_increment: 2,
            suspicion_decrement: 1,
            suspicion_block_threshold: 20,
            yaw_flatness_threshold: 0.004,
            offset_flatness_threshold: 0.02,
            multi_face: MultiFacePolicy::default(),
            max_consecutive_malformed: 15,
        }
    }
}

impl LivenessConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("center_tolerance", self.center_tolerance),
            ("turn_tolerance", self.turn_tolerance),
            ("yaw_flatness_threshold", self.yaw_flatness_threshold),
            ("offset_flatness_threshold", self.offset_flatness_threshold),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: format!("must be a positive number, got {value}"),
                });
            }
        }

        if self.center_tolerance >= self.turn_tolerance {
            return Err(ConfigError::InvalidValue {
                field: "center_tolerance",
                message: format!(
                    "must be below turn_tolerance ({} >= {})",
                    self.center_tolerance, self.turn_tolerance
                ),
            });
        }
        if self.yaw_window == 0 {
            return Err(ConfigError::InvalidValue {
                field: "yaw_window",
                message: "must be at least 1".to_string(),
            });
        }
        if self.scorer_warmup == 0 || self.scorer_warmup > self.yaw_window {
            return Err(ConfigError::InvalidValue {
                field: "scorer_warmup",
                message: format!(
                    "must be between 1 and yaw_window ({}), got {}",
                    self.yaw_window, self.scorer_warmup
                ),
            });
        }
        if self.suspicion_increment == 0 {
            return Err(ConfigError::InvalidValue {
                field: "suspicion_increment",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
