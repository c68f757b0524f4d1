//! Background upkeep of both caches, run by an actor on its own task so it never holds up
//! admission: periodic expiry, vacuum and memory budget checks, plus on demand requests.

use std::{
	path::{Path, PathBuf},
	pin::pin,
	sync::Arc,
	time::Duration,
};

use async_channel as chan;
use futures::FutureExt;
use futures_concurrency::stream::Merge;
use tokio::{
	sync::oneshot,
	time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
	config::MaintenanceConfig,
	error::ThumbnailerError,
	key::Fingerprint,
	memory::MemoryCache,
	store::{DurableStore, VacuumReport},
};

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

type Reply<T> = oneshot::Sender<Result<T, ThumbnailerError>>;

#[derive(Debug)]
pub(crate) enum MaintenanceMessage {
	Vacuum(Reply<VacuumReport>),
	ClearExpired { max_age: Duration, reply: Reply<u64> },
	ClearPrefix { prefix: PathBuf, reply: Reply<u64> },
	Revalidate { path: PathBuf, reply: Reply<u64> },
}

pub(crate) struct Maintenance {
	store: DurableStore,
	memory: Arc<MemoryCache>,
	config: MaintenanceConfig,
}

impl Maintenance {
	pub(crate) fn new(store: DurableStore, memory: Arc<MemoryCache>, config: MaintenanceConfig) -> Self {
		Self {
			store,
			memory,
			config,
		}
	}

	pub(crate) async fn run(
		self,
		msgs_rx: chan::Receiver<MaintenanceMessage>,
		cancel_token: CancellationToken,
	) {
		let now = Instant::now();

		let mut expire_interval =
			interval_at(now + self.config.expire_interval, self.config.expire_interval);
		expire_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

		let mut vacuum_interval =
			interval_at(now + self.config.vacuum_interval, self.config.vacuum_interval);
		vacuum_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

		let mut memory_interval = interval_at(
			now + self.config.memory_check_interval,
			self.config.memory_check_interval,
		);
		memory_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

		enum StreamMessage {
			Message(MaintenanceMessage),
			ExpireTick,
			VacuumTick,
			MemoryTick,
			Stop,
		}

		let cancel = pin!(cancel_token.cancelled());

		let mut msg_stream = pin!((
			msgs_rx.map(StreamMessage::Message),
			IntervalStream::new(expire_interval).map(|_| StreamMessage::ExpireTick),
			IntervalStream::new(vacuum_interval).map(|_| StreamMessage::VacuumTick),
			IntervalStream::new(memory_interval).map(|_| StreamMessage::MemoryTick),
			cancel.into_stream().map(|()| StreamMessage::Stop),
		)
			.merge());

		while let Some(msg) = msg_stream.next().await {
			match msg {
				StreamMessage::Message(msg) => self.handle(msg).await,

				StreamMessage::ExpireTick => {
					let max_age = ONE_DAY * self.config.expire_after_days;
					if let Err(e) = self.store.invalidate_older_than(max_age).await {
						error!(?e, "Failed to expire old thumbnails");
					}
				}

				StreamMessage::VacuumTick => {
					if let Err(e) = self.store.vacuum().await {
						error!(?e, "Failed to vacuum thumbnails");
					}
				}

				StreamMessage::MemoryTick => {
					let evicted = self.memory.evict_to_budget(self.memory.budget());
					if !evicted.is_empty() {
						trace!(evicted = evicted.len(), "Enforced memory cache budget");
					}
				}

				StreamMessage::Stop => {
					debug!("Thumbnail maintenance actor stopped");
					break;
				}
			}
		}
	}

	async fn handle(&self, msg: MaintenanceMessage) {
		// A dropped receiver means the caller gave up waiting, nothing to do about it
		match msg {
			MaintenanceMessage::Vacuum(reply) => {
				reply.send(self.store.vacuum().await).ok();
			}
			MaintenanceMessage::ClearExpired { max_age, reply } => {
				reply
					.send(self.store.invalidate_older_than(max_age).await)
					.ok();
			}
			MaintenanceMessage::ClearPrefix { prefix, reply } => {
				reply.send(self.clear_prefix(&prefix).await).ok();
			}
			MaintenanceMessage::Revalidate { path, reply } => {
				reply.send(self.revalidate(&path).await).ok();
			}
		}
	}

	async fn clear_prefix(&self, prefix: &Path) -> Result<u64, ThumbnailerError> {
		let removed = self.store.invalidate_by_prefix(prefix).await?;
		let evicted = self.memory.retain_prefix_removed(prefix);

		info!(
			prefix = %prefix.display(),
			removed,
			evicted,
			"Cleared thumbnails by path prefix"
		);

		Ok(removed)
	}

	/// Drops every entry under `path` whose source changed (or is gone) since it was generated
	async fn revalidate(&self, path: &Path) -> Result<u64, ThumbnailerError> {
		let mut dropped = 0;

		for entry in self.store.entries_under(path).await? {
			let current = match Fingerprint::of(entry.key.root_path()).await {
				Ok(current) => current,
				Err(e) => {
					warn!(key = %entry.key, ?e, "Failed to read source fingerprint");
					continue;
				}
			};

			if current.is_some_and(|fingerprint| entry.is_valid_for(&fingerprint)) {
				continue;
			}

			self.store.remove(&entry.key).await?;
			self.memory.remove(&entry.key);
			dropped += 1;
		}

		debug!(path = %path.display(), dropped, "Revalidated thumbnails");

		Ok(dropped)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::time::SystemTime;

	use bytes::Bytes;
	use chrono::Utc;
	use tempfile::tempdir;

	use crate::thumbnail::{
		codec::Artifact,
		config::OutputFormat,
		key::ContentKey,
		store::{ArtifactRef, DurableCacheEntry},
	};

	fn artifact() -> Artifact {
		Artifact {
			bytes: Bytes::from_static(b"not really a webp"),
			width: 4,
			height: 2,
			format: OutputFormat::Webp,
		}
	}

	async fn index(store: &DurableStore, memory: &MemoryCache, key: &ContentKey) {
		let fingerprint = Fingerprint::of(key.root_path()).await.unwrap().unwrap();
		let artifact = artifact();

		store
			.put(&DurableCacheEntry {
				key: key.clone(),
				fingerprint,
				artifact: ArtifactRef::File("abc.webp".into()),
				width: artifact.width,
				height: artifact.height,
				byte_size: artifact.byte_size(),
				created_at: Utc::now(),
				is_container: false,
			})
			.await
			.unwrap();
		memory.put(key.clone(), artifact, fingerprint);
	}

	#[tokio::test]
	async fn revalidate_drops_changed_and_missing_sources() {
		let data = tempdir().unwrap();
		let sources = tempdir().unwrap();

		let store = DurableStore::open(data.path()).await.unwrap();
		let memory = Arc::new(MemoryCache::new(1024 * 1024));
		let maintenance = Maintenance::new(store.clone(), Arc::clone(&memory), MaintenanceConfig::default());

		let unchanged = ContentKey::new(sources.path().join("unchanged.png"));
		let changed = ContentKey::new(sources.path().join("changed.png"));
		let missing = ContentKey::new(sources.path().join("missing.png"));
		for key in [&unchanged, &changed, &missing] {
			std::fs::write(key.root_path(), b"source").unwrap();
			index(&store, &memory, key).await;
		}

		std::fs::write(changed.root_path(), b"a different source").unwrap();
		std::fs::remove_file(missing.root_path()).unwrap();

		assert_eq!(maintenance.revalidate(sources.path()).await.unwrap(), 2);

		assert!(store.get(&unchanged).await.unwrap().is_some());
		assert!(store.get(&changed).await.unwrap().is_none());
		assert!(store.get(&missing).await.unwrap().is_none());
		assert!(memory.contains(&unchanged));
		assert!(!memory.contains(&changed));
	}

	#[tokio::test]
	async fn actor_answers_requests() {
		let data = tempdir().unwrap();
		let sources = tempdir().unwrap();

		let store = DurableStore::open(data.path()).await.unwrap();
		let memory = Arc::new(MemoryCache::new(1024 * 1024));

		let comics = sources.path().join("comics");
		std::fs::create_dir(&comics).unwrap();
		let key = ContentKey::new(comics.join("cover.png"));
		std::fs::write(key.root_path(), b"source").unwrap();
		index(&store, &memory, &key).await;

		let (msgs_tx, msgs_rx) = chan::bounded(4);
		let cancel_token = CancellationToken::new();
		let actor = tokio::spawn(
			Maintenance::new(store.clone(), Arc::clone(&memory), MaintenanceConfig::default())
				.run(msgs_rx, cancel_token.clone()),
		);

		let (reply, rx) = oneshot::channel();
		msgs_tx
			.send(MaintenanceMessage::ClearPrefix {
				prefix: comics.clone(),
				reply,
			})
			.await
			.unwrap();
		assert_eq!(rx.await.unwrap().unwrap(), 1);
		assert!(store.get(&key).await.unwrap().is_none());
		assert!(!memory.contains(&key));

		// Old enough to be reclaimed
		let shard_dir = store.thumbnails_dir().join("fff");
		std::fs::create_dir_all(&shard_dir).unwrap();
		let file = std::fs::File::create(shard_dir.join("fff0.webp")).unwrap();
		file.set_modified(SystemTime::now() - Duration::from_secs(60 * 60))
			.unwrap();
		drop(file);

		let (reply, rx) = oneshot::channel();
		msgs_tx.send(MaintenanceMessage::Vacuum(reply)).await.unwrap();
		let report = rx.await.unwrap().unwrap();
		assert_eq!(report.orphan_files_removed, 1);

		cancel_token.cancel();
		actor.await.unwrap();
	}
}
