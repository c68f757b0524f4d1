//! Thumbnailer configuration

use sd_utils::error::FileIOError;

use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Scan workers do I/O against archives and folders, more of them mostly fight over the disk
pub const SCAN_POOL_FLOOR: usize = 4;
pub const SCAN_POOL_CEILING: usize = 16;

/// Decode workers are CPU bound
pub const DECODE_POOL_FLOOR: usize = 16;
pub const DECODE_POOL_CEILING: usize = 64;

/// How many workers the adaptive controller adds or removes at once
pub const POOL_STEP: usize = 2;

/// Task durations remembered per stage
pub const DURATION_WINDOW: usize = 64;

/// Consecutive improving ticks required before a pool grows
pub const IMPROVE_INTERVALS: u32 = 3;

/// Share of failed tasks in the window that makes a pool shrink
pub const ERROR_RATE_THRESHOLD: f64 = 0.25;

pub const DEFAULT_BOUNDING_BOX: u32 = 256;
pub const DEFAULT_QUALITY: u8 = 80;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("failed to parse config: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("failed to serialize config: {0}")]
	Serialize(#[from] toml::ser::Error),
	#[error("invalid config: {0}")]
	Invalid(String),
}

/// Encoded format of the artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
	Webp,
	Jpeg,
}

impl OutputFormat {
	#[must_use]
	pub const fn extension(self) -> &'static str {
		match self {
			Self::Webp => "webp",
			Self::Jpeg => "jpg",
		}
	}

	#[must_use]
	pub fn from_extension(ext: &str) -> Option<Self> {
		match ext {
			"webp" => Some(Self::Webp),
			"jpg" | "jpeg" => Some(Self::Jpeg),
			_ => None,
		}
	}
}

/// Sizing of one worker pool and the knobs of its adaptive controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
	pub floor: usize,
	pub ceiling: usize,
	pub initial: usize,
	pub step: usize,
	/// Number of task durations kept in the sliding window
	pub window: usize,
	pub improve_intervals: u32,
	pub error_rate_threshold: f64,
}

impl PoolConfig {
	#[must_use]
	pub const fn scan() -> Self {
		Self {
			floor: SCAN_POOL_FLOOR,
			ceiling: SCAN_POOL_CEILING,
			initial: SCAN_POOL_FLOOR,
			step: POOL_STEP,
			window: DURATION_WINDOW,
			improve_intervals: IMPROVE_INTERVALS,
			error_rate_threshold: ERROR_RATE_THRESHOLD,
		}
	}

	#[must_use]
	pub const fn decode() -> Self {
		Self {
			floor: DECODE_POOL_FLOOR,
			ceiling: DECODE_POOL_CEILING,
			initial: DECODE_POOL_FLOOR,
			step: POOL_STEP,
			window: DURATION_WINDOW,
			improve_intervals: IMPROVE_INTERVALS,
			error_rate_threshold: ERROR_RATE_THRESHOLD,
		}
	}

	/// A fixed size pool, the controller never moves it
	#[must_use]
	pub const fn fixed(size: usize) -> Self {
		Self {
			floor: size,
			ceiling: size,
			initial: size,
			step: 0,
			window: DURATION_WINDOW,
			improve_intervals: IMPROVE_INTERVALS,
			error_rate_threshold: ERROR_RATE_THRESHOLD,
		}
	}

	fn validate(&self, name: &str) -> Result<(), ConfigError> {
		if self.floor == 0 {
			return Err(ConfigError::Invalid(format!("{name} pool floor must be at least 1")));
		}
		if self.floor > self.ceiling {
			return Err(ConfigError::Invalid(format!(
				"{name} pool floor ({}) is above its ceiling ({})",
				self.floor, self.ceiling
			)));
		}
		if !(self.floor..=self.ceiling).contains(&self.initial) {
			return Err(ConfigError::Invalid(format!(
				"{name} pool initial size ({}) is outside [{}, {}]",
				self.initial, self.floor, self.ceiling
			)));
		}
		if self.window == 0 {
			return Err(ConfigError::Invalid(format!("{name} pool window can't be empty")));
		}
		if !(0.0..=1.0).contains(&self.error_rate_threshold) {
			return Err(ConfigError::Invalid(format!(
				"{name} pool error rate threshold must be within 0..=1"
			)));
		}
		Ok(())
	}
}

/// Periodic jobs of the maintenance actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
	pub expire_after_days: u32,
	#[serde(with = "duration_ms")]
	pub expire_interval: Duration,
	#[serde(with = "duration_ms")]
	pub vacuum_interval: Duration,
	#[serde(with = "duration_ms")]
	pub memory_check_interval: Duration,
}

impl Default for MaintenanceConfig {
	fn default() -> Self {
		Self {
			expire_after_days: 30,
			expire_interval: Duration::from_secs(6 * 60 * 60),
			vacuum_interval: Duration::from_secs(24 * 60 * 60),
			memory_check_interval: Duration::from_secs(30),
		}
	}
}

/// Main thumbnailer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailerConfig {
	/// Where the index database, the artifacts and the logs live
	pub data_dir: PathBuf,

	/// Longest side of the artifacts, in pixels
	pub bounding_box: u32,

	pub output_format: OutputFormat,

	/// Encoder quality, 0 to 100
	pub quality: u8,

	/// Sources bigger than this are not even read
	pub max_source_bytes: u64,

	/// Byte budget of the in-memory cache
	pub memory_cache_bytes: u64,

	/// How often the adaptive controllers look at the duration windows
	#[serde(with = "duration_ms")]
	pub adaptive_tick: Duration,

	/// Wall clock budget of a single scan or decode attempt
	#[serde(with = "duration_ms")]
	pub task_timeout: Duration,

	/// Attempts for transient failures, including the first one
	pub max_attempts: u32,

	/// Linear backoff base, attempt `n` waits `retry_backoff * n`
	#[serde(with = "duration_ms")]
	pub retry_backoff: Duration,

	/// Frame used for video keys without a timestamp selector
	#[serde(with = "duration_ms")]
	pub default_video_timestamp: Duration,

	/// How deep folder resolution descends looking for a representative image
	pub folder_search_depth: usize,

	/// Capacity of the result event channel, slow subscribers past it lag
	pub event_capacity: usize,

	pub scan_pool: PoolConfig,
	pub decode_pool: PoolConfig,
	pub maintenance: MaintenanceConfig,
}

impl Default for ThumbnailerConfig {
	fn default() -> Self {
		Self {
			data_dir: PathBuf::from("."),
			bounding_box: DEFAULT_BOUNDING_BOX,
			output_format: OutputFormat::Webp,
			quality: DEFAULT_QUALITY,
			max_source_bytes: 48 * MIB,
			memory_cache_bytes: 256 * MIB,
			adaptive_tick: Duration::from_millis(500),
			task_timeout: Duration::from_secs(30),
			max_attempts: 3,
			retry_backoff: Duration::from_millis(250),
			default_video_timestamp: Duration::from_secs(1),
			folder_search_depth: 3,
			event_capacity: 1024,
			scan_pool: PoolConfig::scan(),
			decode_pool: PoolConfig::decode(),
			maintenance: MaintenanceConfig::default(),
		}
	}
}

impl ThumbnailerConfig {
	pub fn new(data_dir: impl Into<PathBuf>) -> Self {
		Self {
			data_dir: data_dir.into(),
			..Default::default()
		}
	}

	/// Loads a TOML config file, missing fields take their defaults
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		info!(path = %path.display(), "Loading thumbnailer config");

		let contents = std::fs::read_to_string(path)
			.map_err(|e| FileIOError::from((path, e, "Failed to read config file")))?;
		let config: Self = toml::from_str(&contents)?;
		config.validate()?;

		Ok(config)
	}

	pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
		let path = path.as_ref();
		self.validate()?;

		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)
				.map_err(|e| FileIOError::from((parent, e, "Failed to create config directory")))?;
		}

		std::fs::write(path, toml::to_string_pretty(self)?)
			.map_err(|e| FileIOError::from((path, e, "Failed to write config file")))?;
		debug!(path = %path.display(), "Saved thumbnailer config");

		Ok(())
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.bounding_box == 0 {
			return Err(ConfigError::Invalid("bounding box must be at least 1 pixel".into()));
		}
		if self.quality > 100 {
			return Err(ConfigError::Invalid(format!(
				"quality must be within 0..=100, got {}",
				self.quality
			)));
		}
		if self.max_attempts == 0 {
			return Err(ConfigError::Invalid("max attempts must be at least 1".into()));
		}
		if self.task_timeout.is_zero() {
			return Err(ConfigError::Invalid("task timeout can't be zero".into()));
		}
		if self.adaptive_tick.is_zero() {
			return Err(ConfigError::Invalid("adaptive tick can't be zero".into()));
		}
		if self.event_capacity == 0 {
			return Err(ConfigError::Invalid("event capacity can't be zero".into()));
		}

		self.scan_pool.validate("scan")?;
		self.decode_pool.validate("decode")
	}

	#[must_use]
	pub fn thumbnails_dir(&self) -> PathBuf {
		self.data_dir.join(super::store::THUMBNAIL_CACHE_DIR_NAME)
	}

	#[must_use]
	pub fn database_path(&self) -> PathBuf {
		self.data_dir.join(super::store::DATABASE_FILE_NAME)
	}
}

/// Durations are written as integer milliseconds
mod duration_ms {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}
