//! The request queue: deduplication, strict tier priority, delayed preloads and the
//! per source epochs that drop stale results.
//!
//! All of it sits behind one lock, the dispatcher in [`pipeline`] is the only consumer.

use std::{
	collections::{BTreeMap, HashMap},
	mem,
	sync::Arc,
};

use parking_lot::Mutex;
use tokio::{
	sync::{broadcast, Notify},
	time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
	event::ThumbnailEvent,
	key::{ContentKey, SourceId, Tier},
	metrics::MetricsRecorder,
};

mod epoch;
pub(crate) mod pipeline;
mod queue;

pub use epoch::EpochTracker;
pub use queue::{ThumbnailRequest, TierQueue};

/// How a submission was taken in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admitted {
	/// A new request was queued
	Enqueued,
	/// Folded into a request already queued or running
	Merged,
}

#[derive(Debug)]
struct InFlight {
	epoch: u64,
	/// A regeneration was asked for while running, queue it again once done
	rerun: bool,
}

#[derive(Debug, Default)]
struct State {
	queue: TierQueue,
	in_flight: HashMap<ContentKey, InFlight>,
	epochs: EpochTracker,
	foreground: Option<SourceId>,
	paused: bool,
	shutdown: bool,
}

impl State {
	fn merge(&mut self, key: &ContentKey, tier: Tier, ready: bool, regenerate: bool) -> bool {
		let epoch = self.epochs.current(&key.source_id());

		if let Some(in_flight) = self.in_flight.get_mut(key) {
			in_flight.epoch = in_flight.epoch.max(epoch);
			in_flight.rerun |= regenerate;
			return true;
		}

		if self.queue.merge(key, tier, epoch, ready) {
			if regenerate {
				self.queue.mark_regenerate(key);
			}
			return true;
		}

		false
	}

	/// Tier and readiness after the foreground source boost
	fn boosted(&self, key: &ContentKey, tier: Tier, due: Option<Instant>) -> (Tier, Option<Instant>) {
		if tier < Tier::High
			&& self
				.foreground
				.as_ref()
				.is_some_and(|source| *source == key.source_id())
		{
			(Tier::High, None)
		} else {
			(tier, due)
		}
	}
}

pub struct Scheduler {
	state: Mutex<State>,
	wakeup: Notify,
	events: broadcast::Sender<ThumbnailEvent>,
	metrics: Arc<MetricsRecorder>,
}

impl Scheduler {
	#[must_use]
	pub fn new(event_capacity: usize, metrics: Arc<MetricsRecorder>) -> Self {
		let (events, _) = broadcast::channel(event_capacity.max(1));

		Self {
			state: Mutex::new(State::default()),
			wakeup: Notify::new(),
			events,
			metrics,
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ThumbnailEvent> {
		self.events.subscribe()
	}

	#[must_use]
	pub fn is_shutdown(&self) -> bool {
		self.state.lock().shutdown
	}

	/// Folds a submission into the request already queued or running for `key`, if any.
	/// A `ready` submission also makes a delayed request ready.
	pub fn try_merge(&self, key: &ContentKey, tier: Tier, ready: bool) -> bool {
		let mut state = self.state.lock();
		let (tier, due) = state.boosted(key, tier, (!ready).then(Instant::now));
		let merged = state.merge(key, tier, due.is_none(), false);

		if merged {
			trace!(%key, %tier, "Merged duplicate request");
			self.wakeup.notify_one();
		}

		merged
	}

	/// Queues a request for `key`, ready right away or once `due` passes, unless one is
	/// already queued or running
	pub fn enqueue(
		&self,
		key: ContentKey,
		tier: Tier,
		due: Option<Instant>,
		regenerate: bool,
	) -> Admitted {
		let mut state = self.state.lock();
		let (tier, due) = state.boosted(&key, tier, due);

		if state.merge(&key, tier, due.is_none(), regenerate) {
			trace!(%key, %tier, "Merged duplicate request");
			self.wakeup.notify_one();
			return Admitted::Merged;
		}

		let epoch = state.epochs.current(&key.source_id());
		trace!(%key, %tier, epoch, delayed = due.is_some(), "Queued thumbnail request");

		state.queue.push(
			ThumbnailRequest {
				key,
				tier,
				submitted_at: Instant::now(),
				epoch,
				regenerate,
			},
			due,
		);
		self.wakeup.notify_one();

		Admitted::Enqueued
	}

	/// Moves `source` to a new epoch: its queued requests are dropped and results of its
	/// running ones won't be delivered. Returns how many queued requests were dropped.
	pub fn cancel_for_source(&self, source: &SourceId) -> usize {
		let mut state = self.state.lock();
		let epoch = state.epochs.bump(source);
		let removed = state.queue.remove_source(source).len();

		if state.foreground.as_ref() == Some(source) {
			state.foreground = None;
		}

		debug!(%source, epoch, removed, "Cancelled requests for source");
		self.metrics.record_cancelled(removed as u64);

		removed
	}

	/// Promotes the queued requests of `source` to High and admits its later submissions
	/// at High too. Returns how many queued requests were promoted.
	pub fn set_foreground_source(&self, source: SourceId) -> usize {
		let mut state = self.state.lock();
		let promoted = state.queue.promote_source(&source, Tier::High);

		debug!(%source, promoted, "Set foreground source");
		state.foreground = Some(source);
		self.wakeup.notify_one();

		promoted
	}

	pub fn clear_foreground_source(&self) {
		self.state.lock().foreground = None;
	}

	/// Waits for the highest priority ready request and marks it as running.
	/// Returns `None` once shut down or cancelled.
	pub async fn next_ready(&self, cancel: &CancellationToken) -> Option<ThumbnailRequest> {
		loop {
			let notified = self.wakeup.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			let next_due = {
				let mut state = self.state.lock();
				if state.shutdown {
					return None;
				}

				if state.paused {
					None
				} else {
					state.queue.promote_due(Instant::now());

					while let Some(request) = state.queue.pop() {
						if state.epochs.is_current(&request.key.source_id(), request.epoch) {
							state.in_flight.insert(
								request.key.clone(),
								InFlight {
									epoch: request.epoch,
									rerun: false,
								},
							);
							return Some(request);
						}

						trace!(key = %request.key, "Dropped stale request before it started");
						self.metrics.record_cancelled(1);
					}

					state.queue.next_due()
				}
			};

			tokio::select! {
				() = cancel.cancelled() => return None,
				() = &mut notified => {}
				() = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {}
			}
		}
	}

	/// Ends a running request. The result is only delivered if the request's epoch is still
	/// current, checked under the lock so a concurrent cancel is either seen or happens after.
	/// Returns whether it was delivered.
	pub fn finish(&self, request: &ThumbnailRequest, event: Option<ThumbnailEvent>) -> bool {
		let mut state = self.state.lock();

		let (epoch, rerun) = state
			.in_flight
			.remove(&request.key)
			.map_or((request.epoch, false), |in_flight| {
				(in_flight.epoch, in_flight.rerun)
			});

		let is_current = state.epochs.is_current(&request.key.source_id(), epoch);
		let delivered = match event {
			Some(event) if is_current => {
				// No subscribers is fine, results are in the caches anyway
				let _ = self.events.send(event);
				true
			}
			_ => {
				trace!(key = %request.key, epoch, "Result not delivered");
				self.metrics.record_cancelled(1);
				false
			}
		};

		if rerun && !state.shutdown {
			let rerun_epoch = state.epochs.current(&request.key.source_id());
			state.queue.push(
				ThumbnailRequest {
					key: request.key.clone(),
					tier: Tier::Immediate,
					submitted_at: Instant::now(),
					epoch: rerun_epoch,
					regenerate: true,
				},
				None,
			);
			self.wakeup.notify_one();
		}

		delivered
	}

	/// Delivers a result found during admission
	pub fn publish(&self, event: ThumbnailEvent) {
		let _ = self.events.send(event);
	}

	pub fn pause(&self) {
		self.state.lock().paused = true;
		debug!("Paused thumbnail dispatch");
	}

	pub fn resume(&self) {
		self.state.lock().paused = false;
		self.wakeup.notify_one();
		debug!("Resumed thumbnail dispatch");
	}

	#[must_use]
	pub fn is_paused(&self) -> bool {
		self.state.lock().paused
	}

	/// Stops dispatching and drops every queued request, running ones still complete
	pub fn shutdown(&self) {
		let dropped = {
			let mut state = self.state.lock();
			state.shutdown = true;
			mem::take(&mut state.queue).len()
		};
		self.metrics.record_cancelled(dropped as u64);
		self.wakeup.notify_one();
	}

	/// Ready requests per tier and the number of delayed ones
	#[must_use]
	pub fn depths(&self) -> (BTreeMap<Tier, usize>, usize) {
		let state = self.state.lock();
		(state.queue.depth_by_tier(), state.queue.delayed_len())
	}

	#[must_use]
	pub fn in_flight(&self) -> usize {
		self.state.lock().in_flight.len()
	}

	/// Ready requests in admission order
	#[must_use]
	pub fn queued(&self) -> Vec<(ContentKey, Tier)> {
		self.state.lock().queue.snapshot()
	}
}
