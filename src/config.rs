//! Run configuration
//!
//! Read from a JSON file; every field may be left out. Command line flags are
//! applied on top by the binary.
//!
//! ```json
//! {
//!   "stars_file": "stars.csv",
//!   "target_dir": "/obs/2015-08-01",
//!   "time_scale": "julian",
//!   "photometry": { "program": "phot.sh", "args": ["{image}", "{catalog}", "{output}"] }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calibration::DEFAULT_MIN_STARS;
use crate::common::TimeScale;
use crate::extinction::DEFAULT_MIN_MEASURES;
use crate::matcher::{DEFAULT_CENTER_DEVIATION, DEFAULT_TOLERANCE};
use crate::solver::ToolCommand;

pub const DEFAULT_DATA_DIR_NAME: &str = "data";
pub const DEFAULT_LOG_LEVEL: &str = "warn";
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stars_file: Option<PathBuf>,
    pub synonyms_file: Option<PathBuf>,
    pub target_dir: Option<PathBuf>,
    /// Directory under the target holding one directory per filter
    pub data_dir_name: String,
    /// Where result files go, the target directory when unset
    pub output_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub time_scale: TimeScale,
    pub match_tolerance: f64,
    pub center_deviation: f64,
    pub min_extinction_measures: usize,
    pub min_calibration_stars: usize,
    pub tool_timeout_secs: u64,
    pub registration: Option<ToolCommand>,
    pub photometry: Option<ToolCommand>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stars_file: None,
            synonyms_file: None,
            target_dir: None,
            data_dir_name: DEFAULT_DATA_DIR_NAME.to_string(),
            output_dir: None,
            log_file: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            time_scale: TimeScale::default(),
            match_tolerance: DEFAULT_TOLERANCE,
            center_deviation: DEFAULT_CENTER_DEVIATION,
            min_extinction_measures: DEFAULT_MIN_MEASURES,
            min_calibration_stars: DEFAULT_MIN_STARS,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            registration: None,
            photometry: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Check the values a run cannot do without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stars_file.is_none() {
            return Err(ConfigError::Missing("stars_file"));
        }
        if self.target_dir.is_none() {
            return Err(ConfigError::Missing("target_dir"));
        }
        if self.data_dir_name.is_empty() {
            return Err(ConfigError::Missing("data_dir_name"));
        }
        if self.match_tolerance.is_nan() || self.match_tolerance <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "match_tolerance",
                value: self.match_tolerance.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.center_deviation) {
            return Err(ConfigError::InvalidValue {
                field: "center_deviation",
                value: self.center_deviation.to_string(),
            });
        }
        Ok(())
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        self.target_dir
            .as_ref()
            .map(|target| target.join(&self.data_dir_name))
    }

    pub fn output_dir(&self) -> Option<PathBuf> {
        self.output_dir.clone().or_else(|| self.target_dir.clone())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Missing configuration value: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}
