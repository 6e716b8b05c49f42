//! Store configuration.
//!
//! A store is configured either through the builder methods on [`Config`]
//! or from a JSON object:
//!
//! ```json
//! {"path": "/mnt/pmem/phonebook", "size": 1073741824, "force_create": 1}
//! ```
//!
//! Recognized keys are `path`, `size`, `force_create`, `create_if_missing`,
//! `sync_on_commit` and the engine tuning keys `buckets`, `degree`, `lanes`
//! and `lane_size`. Unknown keys are ignored so one configuration can be
//! shared between engines.

use crate::error::{CoreError, CoreResult};
use crate::types::EngineKind;
use serde::Deserialize;
use std::path::PathBuf;

/// Smallest pool a configuration may ask for.
pub const MIN_POOL_SIZE: u64 = 8 * 1024 * 1024;

/// Default number of undo lanes.
pub const DEFAULT_LANES: u32 = 16;

/// Default bytes per undo lane.
pub const DEFAULT_LANE_SIZE: u32 = 64 * 1024;

/// Default bucket count for `cmap`.
pub const DEFAULT_BUCKETS: u64 = 1 << 16;

/// Default fan-out for `stree`.
pub const DEFAULT_DEGREE: u32 = 32;

const MAX_LANES: u32 = 1024;
const MIN_LANE_SIZE: u32 = 4096;
const MAX_LANE_SIZE: u32 = 16 * 1024 * 1024;
const MAX_BUCKETS: u64 = 1 << 26;
const MIN_DEGREE: u32 = 4;
const MAX_DEGREE: u32 = 128;

/// Engine-specific tuning. Engines ignore the keys they do not use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTuning {
    /// Bucket count for `cmap`, rounded up to a power of two.
    pub buckets: u64,
    /// Maximum children per `stree` node.
    pub degree: u32,
    /// Number of undo lanes, the limit on concurrent transactions.
    pub lanes: u32,
    /// Bytes per undo lane, the limit on one transaction's snapshots.
    pub lane_size: u32,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS,
            degree: DEFAULT_DEGREE,
            lanes: DEFAULT_LANES,
            lane_size: DEFAULT_LANE_SIZE,
        }
    }
}

impl EngineTuning {
    /// Checks the values every engine uses: the undo lane geometry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first value out of range.
    pub fn validate(&self) -> CoreResult<()> {
        if self.lanes == 0 || self.lanes > MAX_LANES {
            return Err(CoreError::invalid_config(format!(
                "lanes must be between 1 and {MAX_LANES}"
            )));
        }
        if !(MIN_LANE_SIZE..=MAX_LANE_SIZE).contains(&self.lane_size) || self.lane_size % 8 != 0
        {
            return Err(CoreError::invalid_config(format!(
                "lane_size must be a multiple of 8 between {MIN_LANE_SIZE} and {MAX_LANE_SIZE}"
            )));
        }
        Ok(())
    }

    /// Checks the lane geometry and the values `engine` reads.
    ///
    /// Keys for other engines are not looked at.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first value out of range.
    pub fn validate_for(&self, engine: EngineKind) -> CoreResult<()> {
        self.validate()?;
        match engine {
            EngineKind::CMap if self.buckets == 0 || self.buckets > MAX_BUCKETS => Err(
                CoreError::invalid_config(format!("buckets must be between 1 and {MAX_BUCKETS}")),
            ),
            EngineKind::STree if !(MIN_DEGREE..=MAX_DEGREE).contains(&self.degree) => {
                Err(CoreError::invalid_config(format!(
                    "degree must be between {MIN_DEGREE} and {MAX_DEGREE}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Location of the pool file.
    pub path: PathBuf,

    /// Pool size in bytes. Required when a pool is created.
    pub size: Option<u64>,

    /// Create a new pool even if the file exists, overwriting it.
    pub force_create: bool,

    /// Create the pool if the file does not exist, open it otherwise.
    pub create_if_missing: bool,

    /// Issue `msync` for every persist. Turning this off keeps crash
    /// consistency against process death but not against power loss.
    pub sync_on_commit: bool,

    /// Engine tuning, applied when a pool is created.
    pub tuning: EngineTuning,
}

impl Config {
    /// Creates a configuration for the pool at `path` with default values.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size: None,
            force_create: false,
            create_if_missing: false,
            sync_on_commit: true,
            tuning: EngineTuning::default(),
        }
    }

    /// Parses a JSON configuration object.
    ///
    /// `force_create`, `create_if_missing` and `sync_on_commit` accept
    /// booleans or the integers 0 and 1.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for malformed JSON, a missing `path`, wrongly
    /// typed fields, or values that fail [`Config::validate`].
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let raw: RawConfig = serde_json::from_str(json)
            .map_err(|err| CoreError::invalid_config(format!("malformed JSON: {err}")))?;

        let path = raw
            .path
            .ok_or_else(|| CoreError::invalid_config("missing required field \"path\""))?;

        let defaults = EngineTuning::default();
        let config = Self {
            path: PathBuf::from(path),
            size: raw.size,
            force_create: flag(raw.force_create, "force_create", false)?,
            create_if_missing: flag(raw.create_if_missing, "create_if_missing", false)?,
            sync_on_commit: flag(raw.sync_on_commit, "sync_on_commit", true)?,
            tuning: EngineTuning {
                buckets: raw.buckets.unwrap_or(defaults.buckets),
                degree: raw.degree.unwrap_or(defaults.degree),
                lanes: raw.lanes.unwrap_or(defaults.lanes),
                lane_size: raw.lane_size.unwrap_or(defaults.lane_size),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Sets the pool size.
    #[must_use]
    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Sets whether an existing pool is overwritten.
    #[must_use]
    pub fn force_create(mut self, value: bool) -> Self {
        self.force_create = value;
        self
    }

    /// Sets whether a missing pool is created.
    #[must_use]
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether persists reach the device.
    #[must_use]
    pub fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the `cmap` bucket count.
    #[must_use]
    pub fn buckets(mut self, buckets: u64) -> Self {
        self.tuning.buckets = buckets;
        self
    }

    /// Sets the `stree` node degree.
    #[must_use]
    pub fn degree(mut self, degree: u32) -> Self {
        self.tuning.degree = degree;
        self
    }

    /// Sets the number of undo lanes.
    #[must_use]
    pub fn lanes(mut self, lanes: u32) -> Self {
        self.tuning.lanes = lanes;
        self
    }

    /// Sets the size of each undo lane.
    #[must_use]
    pub fn lane_size(mut self, lane_size: u32) -> Self {
        self.tuning.lane_size = lane_size;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an empty path, a size that is zero or below
    /// [`MIN_POOL_SIZE`], a create request without a size, or a lane
    /// geometry out of range. Engine keys are checked by
    /// [`EngineTuning::validate_for`] when a pool is created.
    pub fn validate(&self) -> CoreResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(CoreError::invalid_config("path must not be empty"));
        }
        match self.size {
            Some(0) => return Err(CoreError::invalid_config("size must be positive")),
            Some(size) if size < MIN_POOL_SIZE => {
                return Err(CoreError::invalid_config(format!(
                    "size {size} is below the minimum pool size of {MIN_POOL_SIZE} bytes"
                )))
            }
            None if self.force_create => {
                return Err(CoreError::invalid_config(
                    "size is required when force_create is set",
                ))
            }
            _ => {}
        }
        self.tuning.validate()
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    path: Option<String>,
    size: Option<u64>,
    force_create: Option<Flag>,
    create_if_missing: Option<Flag>,
    sync_on_commit: Option<Flag>,
    buckets: Option<u64>,
    degree: Option<u32>,
    lanes: Option<u32>,
    lane_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(u64),
}

fn flag(value: Option<Flag>, name: &str, default: bool) -> CoreResult<bool> {
    match value {
        None => Ok(default),
        Some(Flag::Bool(value)) => Ok(value),
        Some(Flag::Int(0)) => Ok(false),
        Some(Flag::Int(1)) => Ok(true),
        Some(Flag::Int(other)) => Err(CoreError::invalid_config(format!(
            "{name} must be a boolean, 0 or 1, got {other}"
        ))),
    }
}
