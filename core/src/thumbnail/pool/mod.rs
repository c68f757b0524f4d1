//! Worker pools with a limit that the adaptive controller can move at runtime.

use std::{
	cmp::Reverse,
	collections::BTreeMap,
	sync::Arc,
	time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::oneshot, time::Instant};
use tracing::debug;

use super::{config::PoolConfig, key::Tier};

mod controller;

pub use controller::{AdaptiveController, DurationWindow};

/// Pipeline stage a pool serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
	Scan,
	Decode,
}

impl Stage {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Scan => "scan",
			Self::Decode => "decode",
		}
	}
}

#[derive(Debug)]
struct Slots {
	active: usize,
	limit: usize,
	/// Parked acquirers, most urgent tier first and FIFO within a tier
	waiters: BTreeMap<(Reverse<Tier>, u64), oneshot::Sender<PoolPermit>>,
	next_seq: u64,
}

/// A counting semaphore whose limit can shrink below the number of running tasks:
/// nobody is preempted, new permits just wait until enough running tasks finish.
/// Freed slots are handed to waiters by tier, not to whoever wakes up first.
#[derive(Debug)]
pub struct AdaptivePool {
	stage: Stage,
	slots: Mutex<Slots>,
	window: Mutex<DurationWindow>,
	controller: Mutex<AdaptiveController>,
}

impl AdaptivePool {
	#[must_use]
	pub fn new(stage: Stage, config: PoolConfig) -> Arc<Self> {
		let controller = AdaptiveController::new(config);

		Arc::new(Self {
			stage,
			slots: Mutex::new(Slots {
				active: 0,
				limit: controller.size(),
				waiters: BTreeMap::new(),
				next_seq: 0,
			}),
			window: Mutex::new(DurationWindow::new(config.window)),
			controller: Mutex::new(controller),
		})
	}

	#[must_use]
	pub const fn stage(&self) -> Stage {
		self.stage
	}

	/// Waits for a free slot behind every waiter of the same or a more urgent tier
	pub async fn acquire_at(self: &Arc<Self>, tier: Tier) -> PoolPermit {
		loop {
			let (rx, orphaned) = {
				let mut slots = self.slots.lock();
				let (tx, rx) = oneshot::channel();
				let seq = slots.next_seq;
				slots.next_seq += 1;
				slots.waiters.insert((Reverse(tier), seq), tx);

				(rx, self.hand_off(&mut slots))
			};
			drop(orphaned);

			// Only fails if the pool went away with our sender in it
			if let Ok(permit) = rx.await {
				return permit;
			}
		}
	}

	/// Waits for a free slot at the lowest urgency
	pub async fn acquire(self: &Arc<Self>) -> PoolPermit {
		self.acquire_at(Tier::Background).await
	}

	#[cfg(test)]
	fn try_acquire(self: &Arc<Self>) -> Option<PoolPermit> {
		let mut slots = self.slots.lock();
		(slots.active < slots.limit && slots.waiters.is_empty()).then(|| {
			slots.active += 1;
			PoolPermit::new(Arc::clone(self))
		})
	}

	/// Hands free slots to the most urgent waiters. Permits whose waiter gave up are
	/// returned, they must be dropped after the lock is released.
	#[must_use]
	fn hand_off(self: &Arc<Self>, slots: &mut Slots) -> Vec<PoolPermit> {
		let mut orphaned = Vec::new();

		while slots.active < slots.limit {
			let Some((_, waiter)) = slots.waiters.pop_first() else {
				break;
			};

			slots.active += 1;
			if let Err(permit) = waiter.send(PoolPermit::new(Arc::clone(self))) {
				orphaned.push(permit);
			}
		}

		orphaned
	}

	pub fn set_limit(self: &Arc<Self>, limit: usize) {
		let orphaned = {
			let mut slots = self.slots.lock();
			slots.limit = limit;
			self.hand_off(&mut slots)
		};
		drop(orphaned);
	}

	#[must_use]
	pub fn limit(&self) -> usize {
		self.slots.lock().limit
	}

	#[must_use]
	pub fn active(&self) -> usize {
		self.slots.lock().active
	}

	#[must_use]
	pub fn waiting(&self) -> usize {
		self.slots.lock().waiters.len()
	}

	pub fn record(&self, duration: Duration, succeeded: bool) {
		self.window.lock().push(duration, succeeded);
	}

	/// Runs the controller over the current window and applies the new limit
	pub fn adjust(self: &Arc<Self>) -> usize {
		let new_limit = {
			let window = self.window.lock();
			self.controller.lock().tick(&window)
		};

		let old_limit = self.limit();
		if new_limit != old_limit {
			debug!(
				stage = self.stage.as_str(),
				old_limit, new_limit, "Resizing worker pool"
			);
			self.set_limit(new_limit);
		}

		new_limit
	}

	#[must_use]
	pub fn recent_durations(&self) -> Vec<Duration> {
		self.window.lock().durations().collect()
	}

	fn release(self: &Arc<Self>) {
		let orphaned = {
			let mut slots = self.slots.lock();
			slots.active = slots.active.saturating_sub(1);
			self.hand_off(&mut slots)
		};
		drop(orphaned);
	}
}

/// A taken slot, released on drop
#[derive(Debug)]
pub struct PoolPermit {
	pool: Arc<AdaptivePool>,
	started_at: Instant,
}

impl PoolPermit {
	fn new(pool: Arc<AdaptivePool>) -> Self {
		Self {
			pool,
			started_at: Instant::now(),
		}
	}

	/// Records how long the slot was held and how it went, without giving it back
	pub fn record(&self, succeeded: bool) {
		self.pool.record(self.started_at.elapsed(), succeeded);
	}

	/// Releases the slot, recording how long it was held and how it went
	pub fn finish(self, succeeded: bool) {
		self.record(succeeded);
	}

	/// Starts the clock over, for permits taken before their work was known
	pub fn restart(&mut self) {
		self.started_at = Instant::now();
	}

	#[must_use]
	pub fn elapsed(&self) -> Duration {
		self.started_at.elapsed()
	}
}

impl Drop for PoolPermit {
	fn drop(&mut self) {
		self.pool.release();
	}
}
