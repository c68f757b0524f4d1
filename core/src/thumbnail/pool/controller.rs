use std::{collections::VecDeque, time::Duration};

use crate::thumbnail::config::PoolConfig;

/// Fixed size ring buffer of the most recent task outcomes of a stage
#[derive(Debug, Clone)]
pub struct DurationWindow {
	samples: VecDeque<(Duration, bool)>,
	capacity: usize,
}

impl DurationWindow {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			samples: VecDeque::with_capacity(capacity),
			capacity,
		}
	}

	pub fn push(&mut self, duration: Duration, succeeded: bool) {
		if self.samples.len() == self.capacity {
			self.samples.pop_front();
		}
		self.samples.push_back((duration, succeeded));
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.samples.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.samples.is_empty()
	}

	#[must_use]
	pub fn mean(&self) -> Option<Duration> {
		let count = u32::try_from(self.samples.len()).ok().filter(|n| *n > 0)?;
		Some(self.samples.iter().map(|(d, _)| *d).sum::<Duration>() / count)
	}

	/// Share of failed samples, 0 when empty
	#[must_use]
	#[allow(clippy::cast_precision_loss)]
	pub fn error_rate(&self) -> f64 {
		if self.samples.is_empty() {
			return 0.0;
		}
		let failed = self.samples.iter().filter(|(_, ok)| !ok).count();
		failed as f64 / self.samples.len() as f64
	}

	pub fn durations(&self) -> impl Iterator<Item = Duration> + '_ {
		self.samples.iter().map(|(d, _)| *d)
	}
}

/// Hysteresis controller sizing a pool from its duration window.
///
/// Each tick compares the window mean with the previous tick's mean: after
/// `improve_intervals` consecutive decreases the pool grows by `step`, an increase (or an
/// error rate above the threshold) shrinks it by `step`. The size always stays within
/// `[floor, ceiling]`, so a pool failing every task still keeps `floor` workers.
#[derive(Debug, Clone)]
pub struct AdaptiveController {
	config: PoolConfig,
	size: usize,
	last_mean: Option<Duration>,
	improving_streak: u32,
}

impl AdaptiveController {
	#[must_use]
	pub fn new(config: PoolConfig) -> Self {
		Self {
			size: config.initial.clamp(config.floor, config.ceiling),
			config,
			last_mean: None,
			improving_streak: 0,
		}
	}

	#[must_use]
	pub const fn size(&self) -> usize {
		self.size
	}

	/// Looks at the window and returns the new pool size
	pub fn tick(&mut self, window: &DurationWindow) -> usize {
		let Some(mean) = window.mean() else {
			return self.size;
		};

		if window.error_rate() > self.config.error_rate_threshold {
			self.improving_streak = 0;
			self.shrink();
		} else if let Some(last_mean) = self.last_mean {
			if mean < last_mean {
				self.improving_streak += 1;
				if self.improving_streak >= self.config.improve_intervals {
					self.improving_streak = 0;
					self.grow();
				}
			} else if mean > last_mean {
				self.improving_streak = 0;
				self.shrink();
			}
		}

		self.last_mean = Some(mean);
		self.size
	}

	fn grow(&mut self) {
		self.size = (self.size + self.config.step).min(self.config.ceiling);
	}

	fn shrink(&mut self) {
		self.size = self
			.size
			.saturating_sub(self.config.step)
			.max(self.config.floor);
	}
}
