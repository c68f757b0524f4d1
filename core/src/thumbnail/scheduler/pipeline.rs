//! Runs requests: a scan stage (metadata, container index, content resolution) then a
//! decode stage, each in its own adaptive pool, then persistence and delivery.

use sd_utils::error::FileIOError;

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
	fs,
	time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use crate::thumbnail::{
	codec::{Artifact, Codec},
	config::ThumbnailerConfig,
	error::{ErrorKind, ThumbnailerError},
	event::ThumbnailEvent,
	key::{ContentKey, Fingerprint, Tier},
	memory::MemoryCache,
	metrics::MetricsRecorder,
	pool::{AdaptivePool, PoolPermit},
	resolver::{ContentResolver, Resolved, SourceVariant},
	store::{DurableCacheEntry, DurableStore},
};

use super::{Scheduler, ThumbnailRequest};

/// What we knew about the source when the request started
#[derive(Debug, Clone, Copy)]
struct Observed {
	fingerprint: Fingerprint,
	is_dir: bool,
	observed_at: DateTime<Utc>,
}

pub(crate) struct Pipeline {
	pub(crate) scheduler: Arc<Scheduler>,
	pub(crate) store: DurableStore,
	pub(crate) memory: Arc<MemoryCache>,
	pub(crate) resolver: ContentResolver,
	pub(crate) codec: Codec,
	pub(crate) scan_pool: Arc<AdaptivePool>,
	pub(crate) decode_pool: Arc<AdaptivePool>,
	pub(crate) metrics: Arc<MetricsRecorder>,
	task_timeout: Duration,
	max_attempts: u32,
	retry_backoff: Duration,
}

impl Pipeline {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		config: &ThumbnailerConfig,
		scheduler: Arc<Scheduler>,
		store: DurableStore,
		memory: Arc<MemoryCache>,
		resolver: ContentResolver,
		scan_pool: Arc<AdaptivePool>,
		decode_pool: Arc<AdaptivePool>,
		metrics: Arc<MetricsRecorder>,
	) -> Self {
		Self {
			scheduler,
			store,
			memory,
			resolver,
			codec: Codec::from_config(config),
			scan_pool,
			decode_pool,
			metrics,
			task_timeout: config.task_timeout,
			max_attempts: config.max_attempts.max(1),
			retry_backoff: config.retry_backoff,
		}
	}

	/// Dispatch loop. A scan slot is taken before picking a request, so the pick happens
	/// as late as possible and always sees the most urgent request.
	pub(crate) async fn dispatch(self: Arc<Self>, cancel_token: CancellationToken) {
		loop {
			let mut permit = tokio::select! {
				() = cancel_token.cancelled() => break,
				permit = self.scan_pool.acquire() => permit,
			};

			let Some(request) = self.scheduler.next_ready(&cancel_token).await else {
				break;
			};
			permit.restart();

			tokio::spawn(Arc::clone(&self).run(request, permit));
		}

		debug!("Thumbnail dispatcher stopped");
	}

	#[instrument(
		skip_all,
		fields(key = %request.key, tier = %request.tier, epoch = request.epoch)
	)]
	async fn run(self: Arc<Self>, request: ThumbnailRequest, permit: PoolPermit) {
		trace!(
			queued_for = ?request.submitted_at.elapsed(),
			"Starting thumbnail request"
		);

		let event = self.generate(&request, permit).await;
		self.metrics.record_completed();
		self.scheduler.finish(&request, event);
	}

	/// Produces the event for `request`, `None` if there's nothing to tell
	async fn generate(&self, request: &ThumbnailRequest, permit: PoolPermit) -> Option<ThumbnailEvent> {
		let key = &request.key;

		let observed = match self.observe(key).await {
			Ok(observed) => observed,
			Err(e) => {
				permit.finish(!e.kind().is_transient());
				return self.fail(key, None, e).await;
			}
		};

		let (resolved, scan_permit) = match self
			.with_retries(&self.scan_pool, request.tier, Some(permit), || {
				self.resolve(key, observed, request.regenerate)
			})
			.await
		{
			Ok(resolved) => resolved,
			Err(e) => return self.fail(key, Some(observed), e).await,
		};

		// The scan slot is held until the decode stage takes the request, so at most a scan
		// pool worth of resolved sources sit in memory waiting for a decoder
		let decode_permit = self.decode_pool.acquire_at(request.tier).await;
		drop(scan_permit);

		let is_container = resolved.container.is_some();
		let representative = resolved.representative;
		let codec = &self.codec;

		let artifact = match self
			.with_retries(&self.decode_pool, request.tier, Some(decode_permit), || {
				codec.encode(representative.clone())
			})
			.await
		{
			Ok((artifact, _decode_permit)) => artifact,
			Err(e) => return self.fail(key, Some(observed), e).await,
		};

		self.persist(key, observed, is_container, &artifact).await;

		Some(ThumbnailEvent::ready(key.clone(), artifact))
	}

	async fn observe(&self, key: &ContentKey) -> Result<Observed, ThumbnailerError> {
		// Taken before reading metadata, so a later change always has a later timestamp
		let observed_at = Utc::now();
		let path = key.root_path();
		let metadata = fs::metadata(path)
			.await
			.map_err(|e| FileIOError::from((path, e, "Failed to read source metadata")))?;

		Ok(Observed {
			fingerprint: Fingerprint::from_metadata(&metadata),
			is_dir: metadata.is_dir(),
			observed_at,
		})
	}

	/// Scan stage: reuses the container index when the container didn't change,
	/// otherwise resolves from scratch and records what it found
	async fn resolve(
		&self,
		key: &ContentKey,
		observed: Observed,
		regenerate: bool,
	) -> Result<Resolved, ThumbnailerError> {
		let variant = SourceVariant::classify(
			key,
			observed.is_dir,
			self.resolver.default_video_timestamp(),
		)?;

		if !variant.is_container() {
			return variant.resolve(&self.resolver).await;
		}

		let root = key.root_path();

		if !regenerate {
			if let Some(container) = self.store.get_container(root).await? {
				if container.fingerprint == observed.fingerprint {
					match self
						.resolver
						.read_representative(&container.info.representative)
						.await
					{
						Ok(representative) => {
							trace!(
								representative = %container.info.representative,
								"Using representative from container index"
							);
							return Ok(Resolved {
								representative,
								container: Some(container.info),
							});
						}
						Err(e) => {
							debug!(?e, "Recorded representative is unreadable, scanning again");
						}
					}
				}
			}
		}

		let resolved = variant.resolve(&self.resolver).await?;

		if let Some(info) = &resolved.container {
			if let Err(e) = self
				.store
				.put_container(root, observed.fingerprint, info)
				.await
			{
				warn!(?e, "Failed to update container index");
			}
		}

		Ok(resolved)
	}

	/// Runs `task` in a slot of `pool` under the task timeout, retrying transient failures
	/// with a linear backoff. The slot is given back while backing off, and retries queue
	/// for a new one at the request's tier. On success the slot is returned still held.
	async fn with_retries<T, F, Fut>(
		&self,
		pool: &Arc<AdaptivePool>,
		tier: Tier,
		mut permit: Option<PoolPermit>,
		mut task: F,
	) -> Result<(T, PoolPermit), ThumbnailerError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, ThumbnailerError>>,
	{
		let mut attempt = 1;

		loop {
			let slot = match permit.take() {
				Some(permit) => permit,
				None => pool.acquire_at(tier).await,
			};

			let res = timeout(self.task_timeout, task())
				.await
				.unwrap_or(Err(ThumbnailerError::Timeout(self.task_timeout)));

			let transient = matches!(&res, Err(e) if e.kind().is_transient());
			slot.record(!transient);

			match res {
				Ok(value) => return Ok((value, slot)),
				Err(e) if transient && attempt < self.max_attempts => {
					drop(slot);
					debug!(
						stage = pool.stage().as_str(),
						attempt,
						?e,
						"Transient failure, retrying"
					);
					sleep(self.retry_backoff * attempt).await;
					attempt += 1;
				}
				Err(e) => return Err(e),
			}
		}
	}

	async fn persist(
		&self,
		key: &ContentKey,
		observed: Observed,
		is_container: bool,
		artifact: &Artifact,
	) {
		self.memory
			.put(key.clone(), artifact.clone(), observed.fingerprint);

		let artifact_ref = match self.store.write_artifact(artifact).await {
			Ok(artifact_ref) => artifact_ref,
			Err(e) => {
				error!(?e, "Failed to write thumbnail artifact");
				return;
			}
		};

		let entry = DurableCacheEntry {
			key: key.clone(),
			fingerprint: observed.fingerprint,
			artifact: artifact_ref,
			width: artifact.width,
			height: artifact.height,
			byte_size: artifact.byte_size(),
			created_at: observed.observed_at,
			is_container,
		};

		match self.store.put(&entry).await {
			Ok(true) => trace!("Stored thumbnail"),
			Ok(false) => trace!("A fresher thumbnail was already stored"),
			Err(e) => error!(?e, "Failed to index thumbnail"),
		}
	}

	/// Accounts a failed request and, when the source's fingerprint is known, caches the
	/// failure so it isn't tried again until the source changes
	async fn fail(
		&self,
		key: &ContentKey,
		observed: Option<Observed>,
		e: ThumbnailerError,
	) -> Option<ThumbnailEvent> {
		let kind = e.kind();
		if kind == ErrorKind::Cancelled {
			return None;
		}

		self.metrics.record_error(kind);
		warn!(%kind, ?e, "Failed to generate thumbnail");

		if let Some(observed) = observed {
			let entry = DurableCacheEntry::negative(
				key.clone(),
				observed.fingerprint,
				kind,
				observed.observed_at,
			);
			if let Err(e) = self.store.put(&entry).await {
				error!(?e, "Failed to store negative thumbnail entry");
			}
		}

		Some(ThumbnailEvent::unavailable(key.clone(), kind))
	}
}
