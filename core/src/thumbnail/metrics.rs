//! Counters and snapshots for diagnostics. The adaptive controller reads the pools' own
//! duration windows, these are only for callers.

use std::{
	collections::BTreeMap,
	sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use serde::Serialize;

use super::{error::ErrorKind, key::Tier, pool::Stage};

#[derive(Debug, Default)]
pub struct MetricsRecorder {
	completed: AtomicU64,
	cancelled: AtomicU64,
	memory_hits: AtomicU64,
	durable_hits: AtomicU64,
	errors: Mutex<BTreeMap<ErrorKind, u64>>,
}

impl MetricsRecorder {
	pub fn record_completed(&self) {
		self.completed.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_cancelled(&self, count: u64) {
		self.cancelled.fetch_add(count, Ordering::Relaxed);
	}

	pub fn record_memory_hit(&self) {
		self.memory_hits.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_durable_hit(&self) {
		self.durable_hits.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_error(&self, kind: ErrorKind) {
		*self.errors.lock().entry(kind).or_default() += 1;
	}

	#[must_use]
	pub fn error_counts(&self) -> BTreeMap<ErrorKind, u64> {
		self.errors.lock().clone()
	}

	#[must_use]
	pub fn completed(&self) -> u64 {
		self.completed.load(Ordering::Relaxed)
	}

	#[must_use]
	pub fn cancelled(&self) -> u64 {
		self.cancelled.load(Ordering::Relaxed)
	}

	#[must_use]
	pub fn memory_hits(&self) -> u64 {
		self.memory_hits.load(Ordering::Relaxed)
	}

	#[must_use]
	pub fn durable_hits(&self) -> u64 {
		self.durable_hits.load(Ordering::Relaxed)
	}
}

/// Point in time view of the pipeline
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueMetrics {
	/// Ready requests per tier
	pub queue_depth_by_tier: BTreeMap<Tier, usize>,
	/// Background requests still waiting for their delay
	pub delayed: usize,
	pub running_by_stage: BTreeMap<Stage, usize>,
	/// Requests blocked on a full pool, per stage
	pub waiting_by_stage: BTreeMap<Stage, usize>,
	pub pool_limits: BTreeMap<Stage, usize>,
	/// Most recent task durations per stage, in milliseconds, oldest first
	pub recent_durations: BTreeMap<Stage, Vec<u64>>,
	pub error_counts: BTreeMap<ErrorKind, u64>,
	pub completed: u64,
	pub cancelled: u64,
	pub memory_hits: u64,
	pub durable_hits: u64,
	pub memory_resident_bytes: u64,
}

impl QueueMetrics {
	#[must_use]
	pub fn queued(&self) -> usize {
		self.queue_depth_by_tier.values().sum::<usize>() + self.delayed
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_counts_accumulate_per_kind() {
		let metrics = MetricsRecorder::default();
		metrics.record_error(ErrorKind::Corrupt);
		metrics.record_error(ErrorKind::Corrupt);
		metrics.record_error(ErrorKind::Empty);
		metrics.record_cancelled(3);

		let counts = metrics.error_counts();
		assert_eq!(counts[&ErrorKind::Corrupt], 2);
		assert_eq!(counts[&ErrorKind::Empty], 1);
		assert!(!counts.contains_key(&ErrorKind::Timeout));
		assert_eq!(metrics.cancelled(), 3);
	}

	#[test]
	fn snapshot_serializes() {
		let mut snapshot = QueueMetrics::default();
		snapshot.queue_depth_by_tier.insert(Tier::Immediate, 2);
		snapshot.recent_durations.insert(Stage::Decode, vec![12, 40]);
		snapshot.waiting_by_stage.insert(Stage::Scan, 4);
		snapshot.delayed = 1;

		assert_eq!(snapshot.queued(), 3);

		let json = serde_json::to_value(&snapshot).unwrap();
		assert_eq!(json["queue_depth_by_tier"]["Immediate"], 2);
		assert_eq!(json["recent_durations"]["decode"][1], 40);
		assert_eq!(json["waiting_by_stage"]["scan"], 4);
	}
}
