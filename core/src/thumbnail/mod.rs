//! Thumbnail generation and caching.
//!
//! A [`Thumbnailer`] is built once and shared by handle. Requests go through cache admission
//! (memory, then the durable index) and only misses reach the [`scheduler`], which feeds the
//! scan and decode pools. Results are published on a broadcast channel.

use sd_utils::error::FileIOError;

use std::{
	collections::{BTreeMap, HashSet},
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use async_channel as chan;
use futures_concurrency::future::Join;
use serde::Serialize;
use tokio::{
	sync::{broadcast, oneshot},
	time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, warn};

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod key;
pub mod maintenance;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod resolver;
pub mod scheduler;
pub mod store;

pub use codec::{Artifact, Codec};
pub use config::{MaintenanceConfig, OutputFormat, PoolConfig, ThumbnailerConfig};
pub use error::{ErrorKind, ThumbnailerError};
pub use event::{Outcome, ThumbnailEvent};
pub use key::{ContentKey, Fingerprint, SourceId, Tier};
pub use metrics::QueueMetrics;
pub use resolver::{FfmpegFrameExtractor, FrameExtractor};
pub use store::{StoreStats, VacuumReport};

use maintenance::{Maintenance, MaintenanceMessage};
use memory::MemoryCache;
use metrics::MetricsRecorder;
use pool::{AdaptivePool, Stage};
use resolver::ContentResolver;
use scheduler::{pipeline::Pipeline, Admitted, Scheduler};
use store::{ArtifactRef, DurableStore};

/// What happened to a batch of submitted keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Admission {
	/// Served from a cache, their artifact was published right away
	pub cached: usize,
	/// Newly queued
	pub enqueued: usize,
	/// Folded into a request already queued or running
	pub merged: usize,
	/// Known to have no thumbnail for their current version, published right away
	pub known_failures: usize,
}

pub struct Thumbnailer {
	scheduler: Arc<Scheduler>,
	store: DurableStore,
	memory: Arc<MemoryCache>,
	scan_pool: Arc<AdaptivePool>,
	decode_pool: Arc<AdaptivePool>,
	metrics: Arc<MetricsRecorder>,
	maintenance_tx: chan::Sender<MaintenanceMessage>,
	cancel_token: CancellationToken,
	_cancel_loop: DropGuard,
}

impl Thumbnailer {
	/// Opens the cache in `config.data_dir` and starts the background tasks,
	/// extracting video frames with ffmpeg
	pub async fn new(config: ThumbnailerConfig) -> Result<Self, ThumbnailerError> {
		Self::with_frame_extractor(config, Arc::new(FfmpegFrameExtractor::default())).await
	}

	pub async fn with_frame_extractor(
		config: ThumbnailerConfig,
		frame_extractor: Arc<dyn FrameExtractor>,
	) -> Result<Self, ThumbnailerError> {
		config.validate()?;

		let store = DurableStore::open(&config.data_dir).await?;
		let memory = Arc::new(MemoryCache::new(config.memory_cache_bytes));
		let metrics = Arc::new(MetricsRecorder::default());
		let scheduler = Arc::new(Scheduler::new(config.event_capacity, Arc::clone(&metrics)));
		let scan_pool = AdaptivePool::new(Stage::Scan, config.scan_pool);
		let decode_pool = AdaptivePool::new(Stage::Decode, config.decode_pool);

		let cancel_token = CancellationToken::new();

		let pipeline = Arc::new(Pipeline::new(
			&config,
			Arc::clone(&scheduler),
			store.clone(),
			Arc::clone(&memory),
			ContentResolver::new(&config, frame_extractor),
			Arc::clone(&scan_pool),
			Arc::clone(&decode_pool),
			Arc::clone(&metrics),
		));
		tokio::spawn(pipeline.dispatch(cancel_token.child_token()));

		tokio::spawn(adapt_pools(
			[Arc::clone(&scan_pool), Arc::clone(&decode_pool)],
			config.adaptive_tick,
			cancel_token.child_token(),
		));

		let (maintenance_tx, maintenance_rx) = chan::bounded(16);
		tokio::spawn(
			Maintenance::new(store.clone(), Arc::clone(&memory), config.maintenance)
				.run(maintenance_rx, cancel_token.child_token()),
		);

		info!(
			data_dir = %config.data_dir.display(),
			bounding_box = config.bounding_box,
			format = config.output_format.extension(),
			"Thumbnailer started"
		);

		Ok(Self {
			scheduler,
			store,
			memory,
			scan_pool,
			decode_pool,
			metrics,
			maintenance_tx,
			cancel_token: cancel_token.clone(),
			_cancel_loop: cancel_token.drop_guard(),
		})
	}

	/// Results of every request, cache hits found during admission included.
	/// A receiver that lags behind loses the oldest events.
	pub fn subscribe(&self) -> broadcast::Receiver<ThumbnailEvent> {
		self.scheduler.subscribe()
	}

	/// Requests thumbnails for keys the user is looking at
	pub async fn submit_visible(
		&self,
		keys: impl IntoIterator<Item = ContentKey>,
		tier: Tier,
	) -> Result<Admission, ThumbnailerError> {
		self.admit(keys, tier, None).await
	}

	/// Requests thumbnails at Background tier, not dispatched before `delay` passes
	pub async fn submit_background(
		&self,
		keys: impl IntoIterator<Item = ContentKey>,
		delay: Duration,
	) -> Result<Admission, ThumbnailerError> {
		self.admit(keys, Tier::Background, Some(Instant::now() + delay))
			.await
	}

	#[instrument(skip_all, fields(%tier, delayed = due.is_some()))]
	async fn admit(
		&self,
		keys: impl IntoIterator<Item = ContentKey>,
		tier: Tier,
		due: Option<Instant>,
	) -> Result<Admission, ThumbnailerError> {
		if self.scheduler.is_shutdown() {
			return Err(ThumbnailerError::Shutdown);
		}

		let mut admission = Admission::default();

		let mut seen = HashSet::new();
		let pending = keys
			.into_iter()
			.filter(|key| seen.insert(key.clone()))
			.filter(|key| {
				let merged = self.scheduler.try_merge(key, tier, due.is_none());
				if merged {
					admission.merged += 1;
				}
				!merged
			})
			.collect::<Vec<_>>();

		if pending.is_empty() {
			return Ok(admission);
		}

		let fingerprints = pending
			.iter()
			.map(|key| Fingerprint::of(key.root_path()))
			.collect::<Vec<_>>()
			.join()
			.await;

		// Position in the batch is kept so misses are queued in submission order
		let mut misses = Vec::new();
		let mut durable_lookups = Vec::new();

		for (idx, (key, fingerprint)) in pending.into_iter().zip(fingerprints).enumerate() {
			match fingerprint {
				Ok(Some(fingerprint)) => {
					if let Some(artifact) = self.memory.get_valid(&key, &fingerprint) {
						self.metrics.record_memory_hit();
						self.scheduler.publish(ThumbnailEvent::ready(key, artifact));
						admission.cached += 1;
					} else {
						durable_lookups.push((idx, key, fingerprint));
					}
				}
				// Left for the pipeline to report
				Ok(None) | Err(_) => misses.push((idx, key)),
			}
		}

		if !durable_lookups.is_empty() {
			self.admit_from_store(durable_lookups, &mut misses, &mut admission)
				.await;
		}

		misses.sort_unstable_by_key(|(idx, _)| *idx);

		for (_, key) in misses {
			match self.scheduler.enqueue(key, tier, due, false) {
				Admitted::Enqueued => admission.enqueued += 1,
				Admitted::Merged => admission.merged += 1,
			}
		}

		debug!(?admission, "Admitted thumbnail requests");

		Ok(admission)
	}

	async fn admit_from_store(
		&self,
		lookups: Vec<(usize, ContentKey, Fingerprint)>,
		misses: &mut Vec<(usize, ContentKey)>,
		admission: &mut Admission,
	) {
		let keys = lookups
			.iter()
			.map(|(_, key, _)| key.clone())
			.collect::<Vec<_>>();

		let entries = match self.store.get_batch(&keys).await {
			Ok(entries) => entries,
			Err(e) => {
				warn!(?e, "Failed to look up thumbnail index, generating instead");
				misses.extend(lookups.into_iter().map(|(idx, key, _)| (idx, key)));
				return;
			}
		};

		let mut touched = Vec::with_capacity(entries.len());

		for (idx, key, fingerprint) in lookups {
			let Some(entry) = entries
				.get(&key)
				.filter(|entry| entry.is_valid_for(&fingerprint))
			else {
				misses.push((idx, key));
				continue;
			};

			match &entry.artifact {
				ArtifactRef::Unavailable(kind) => {
					self.scheduler
						.publish(ThumbnailEvent::unavailable(key.clone(), *kind));
					admission.known_failures += 1;
					touched.push(key);
				}
				ArtifactRef::File(_) => match self.store.read_artifact(entry).await {
					Ok(Some(artifact)) => {
						self.metrics.record_durable_hit();
						self.memory.put(key.clone(), artifact.clone(), fingerprint);
						self.scheduler
							.publish(ThumbnailEvent::ready(key.clone(), artifact));
						admission.cached += 1;
						touched.push(key);
					}
					Ok(None) => misses.push((idx, key)),
					Err(e) => {
						warn!(%key, ?e, "Failed to read cached artifact");
						misses.push((idx, key));
					}
				},
			}
		}

		if let Err(e) = self.store.touch(&touched).await {
			warn!(?e, "Failed to update thumbnail access times");
		}
	}

	/// Drops queued requests of `source` and keeps results of its running ones from being
	/// delivered. Returns how many queued requests were dropped.
	pub fn cancel_for_source(&self, source: &SourceId) -> usize {
		self.scheduler.cancel_for_source(source)
	}

	/// Moves `source`'s queued requests ahead of other Normal and Background work
	pub fn set_foreground_source(&self, source: SourceId) -> usize {
		self.scheduler.set_foreground_source(source)
	}

	pub fn clear_foreground_source(&self) {
		self.scheduler.clear_foreground_source();
	}

	/// Generates `key` again at Immediate tier, whatever the caches hold
	pub fn regenerate(&self, key: ContentKey) -> Result<(), ThumbnailerError> {
		if self.scheduler.is_shutdown() {
			return Err(ThumbnailerError::Shutdown);
		}

		self.memory.remove(&key);
		self.scheduler.enqueue(key, Tier::Immediate, None, true);

		Ok(())
	}

	/// Cache only lookup, never generates anything.
	/// Misses when the source changed since the artifact was made.
	pub async fn get_cached(&self, key: &ContentKey) -> Result<Option<Artifact>, ThumbnailerError> {
		let Some(fingerprint) = Fingerprint::of(key.root_path())
			.await
			.map_err(|e| FileIOError::from((key.root_path(), e)))?
		else {
			return Ok(None);
		};

		if let Some(artifact) = self.memory.get_valid(key, &fingerprint) {
			self.metrics.record_memory_hit();
			return Ok(Some(artifact));
		}

		let Some(entry) = self
			.store
			.get(key)
			.await?
			.filter(|entry| entry.is_valid_for(&fingerprint))
		else {
			return Ok(None);
		};

		let artifact = self.store.read_artifact(&entry).await?;
		if let Some(artifact) = &artifact {
			self.metrics.record_durable_hit();
			self.memory
				.put(key.clone(), artifact.clone(), fingerprint);
		}

		Ok(artifact)
	}

	#[must_use]
	pub fn get_metrics(&self) -> QueueMetrics {
		let (queue_depth_by_tier, delayed) = self.scheduler.depths();
		let pools = [&self.scan_pool, &self.decode_pool];

		QueueMetrics {
			queue_depth_by_tier,
			delayed,
			running_by_stage: pools
				.iter()
				.map(|pool| (pool.stage(), pool.active()))
				.collect(),
			waiting_by_stage: pools
				.iter()
				.map(|pool| (pool.stage(), pool.waiting()))
				.collect(),
			pool_limits: pools
				.iter()
				.map(|pool| (pool.stage(), pool.limit()))
				.collect(),
			recent_durations: pools
				.iter()
				.map(|pool| {
					(
						pool.stage(),
						pool.recent_durations()
							.into_iter()
							.map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
							.collect(),
					)
				})
				.collect(),
			error_counts: self.metrics.error_counts(),
			completed: self.metrics.completed(),
			cancelled: self.metrics.cancelled(),
			memory_hits: self.metrics.memory_hits(),
			durable_hits: self.metrics.durable_hits(),
			memory_resident_bytes: self.memory.resident_bytes(),
		}
	}

	#[must_use]
	pub fn get_error_stats(&self) -> BTreeMap<ErrorKind, u64> {
		self.metrics.error_counts()
	}

	/// Ready requests in the order they'll be started
	#[must_use]
	pub fn queued(&self) -> Vec<(ContentKey, Tier)> {
		self.scheduler.queued()
	}

	pub async fn vacuum(&self) -> Result<VacuumReport, ThumbnailerError> {
		self.ask(MaintenanceMessage::Vacuum).await
	}

	/// Drops index entries generated more than `max_age_days` ago
	pub async fn clear_expired(&self, max_age_days: u32) -> Result<u64, ThumbnailerError> {
		let max_age = Duration::from_secs(24 * 60 * 60) * max_age_days;
		self.ask(|reply| MaintenanceMessage::ClearExpired { max_age, reply })
			.await
	}

	/// Drops every cached thumbnail whose source path starts with `prefix`
	pub async fn clear_by_path_prefix(
		&self,
		prefix: impl Into<PathBuf>,
	) -> Result<u64, ThumbnailerError> {
		let prefix = prefix.into();
		self.ask(|reply| MaintenanceMessage::ClearPrefix { prefix, reply })
			.await
	}

	/// Drops cached thumbnails under `path` whose source changed, returns how many
	pub async fn revalidate(&self, path: impl Into<PathBuf>) -> Result<u64, ThumbnailerError> {
		let path = path.into();
		self.ask(|reply| MaintenanceMessage::Revalidate { path, reply })
			.await
	}

	async fn ask<T>(
		&self,
		msg: impl FnOnce(oneshot::Sender<Result<T, ThumbnailerError>>) -> MaintenanceMessage,
	) -> Result<T, ThumbnailerError> {
		let (reply, rx) = oneshot::channel();

		self.maintenance_tx
			.send(msg(reply))
			.await
			.map_err(|_| ThumbnailerError::Shutdown)?;

		rx.await.map_err(|_| ThumbnailerError::Shutdown)?
	}

	/// Forgets `key` in both caches
	pub async fn remove(&self, key: &ContentKey) -> Result<bool, ThumbnailerError> {
		let in_memory = self.memory.remove(key);
		Ok(self.store.remove(key).await? || in_memory)
	}

	/// Drops every negative entry so failed sources are tried again
	pub async fn clear_failed(&self) -> Result<u64, ThumbnailerError> {
		self.store.clear_negative().await
	}

	/// Drops entries whose source is gone from disk
	pub async fn prune_missing_sources(&self) -> Result<u64, ThumbnailerError> {
		self.store.prune_missing_sources().await
	}

	pub async fn store_stats(&self) -> Result<StoreStats, ThumbnailerError> {
		self.store.stats().await
	}

	#[must_use]
	pub fn thumbnails_dir(&self) -> &Path {
		self.store.thumbnails_dir()
	}

	/// Stops admitting queued requests, submissions are still accepted
	pub fn pause(&self) {
		self.scheduler.pause();
	}

	pub fn resume(&self) {
		self.scheduler.resume();
	}

	#[must_use]
	pub fn is_paused(&self) -> bool {
		self.scheduler.is_paused()
	}

	/// Stops dispatch and maintenance. Running requests still complete and deliver.
	pub fn shutdown(&self) {
		self.scheduler.shutdown();
		self.cancel_token.cancel();
		info!("Thumbnailer shut down");
	}
}

/// Ticks the adaptive controller of each pool
async fn adapt_pools(
	pools: [Arc<AdaptivePool>; 2],
	tick: Duration,
	cancel_token: CancellationToken,
) {
	let mut interval = interval(tick);
	interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			() = cancel_token.cancelled() => break,
			_ = interval.tick() => {
				for pool in &pools {
					pool.adjust();
				}
			}
		}
	}
}
