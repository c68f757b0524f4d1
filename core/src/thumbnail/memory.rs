use std::path::Path;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{
	codec::Artifact,
	key::{ContentKey, Fingerprint},
};

#[derive(Debug, Clone)]
struct MemoryEntry {
	artifact: Artifact,
	fingerprint: Fingerprint,
	byte_size: u64,
	last_accessed_at: Instant,
}

struct Inner {
	entries: LruCache<ContentKey, MemoryEntry>,
	resident_bytes: u64,
}

impl Inner {
	fn forget(&mut self, entry: &MemoryEntry) {
		self.resident_bytes = self.resident_bytes.saturating_sub(entry.byte_size);
	}
}

/// Bounded in-memory cache of artifacts, evicting the least recently accessed entries
/// once the byte budget is exceeded
pub struct MemoryCache {
	inner: Mutex<Inner>,
	budget: u64,
}

impl MemoryCache {
	#[must_use]
	pub fn new(budget: u64) -> Self {
		Self {
			inner: Mutex::new(Inner {
				entries: LruCache::unbounded(),
				resident_bytes: 0,
			}),
			budget,
		}
	}

	#[must_use]
	pub const fn budget(&self) -> u64 {
		self.budget
	}

	/// Returns the artifact and the fingerprint it was generated from, marking it as the
	/// most recently accessed
	pub fn get(&self, key: &ContentKey) -> Option<(Artifact, Fingerprint)> {
		let mut inner = self.inner.lock();
		inner.entries.get_mut(key).map(|entry| {
			entry.last_accessed_at = Instant::now();
			(entry.artifact.clone(), entry.fingerprint)
		})
	}

	/// Returns the artifact only if it was generated from `fingerprint`, dropping a stale one
	pub fn get_valid(&self, key: &ContentKey, fingerprint: &Fingerprint) -> Option<Artifact> {
		let (artifact, stored) = self.get(key)?;
		if stored == *fingerprint {
			Some(artifact)
		} else {
			trace!(%key, "Dropping stale artifact from memory");
			self.remove(key);
			None
		}
	}

	/// Looks without touching the recency order
	#[must_use]
	pub fn contains(&self, key: &ContentKey) -> bool {
		self.inner.lock().entries.contains(key)
	}

	/// Inserts (or replaces) an entry, sized by its encoded bytes, then evicts down to budget.
	/// Returns the evicted keys.
	pub fn put(
		&self,
		key: ContentKey,
		artifact: Artifact,
		fingerprint: Fingerprint,
	) -> Vec<ContentKey> {
		let byte_size = artifact.byte_size();
		let mut inner = self.inner.lock();

		if let Some(old) = inner.entries.put(
			key,
			MemoryEntry {
				artifact,
				fingerprint,
				byte_size,
				last_accessed_at: Instant::now(),
			},
		) {
			inner.forget(&old);
		}
		inner.resident_bytes += byte_size;

		Self::evict(&mut inner, self.budget)
	}

	/// Evicts least recently accessed entries until resident bytes fit in `max_bytes`
	pub fn evict_to_budget(&self, max_bytes: u64) -> Vec<ContentKey> {
		Self::evict(&mut self.inner.lock(), max_bytes)
	}

	fn evict(inner: &mut Inner, max_bytes: u64) -> Vec<ContentKey> {
		let mut evicted = Vec::new();

		while inner.resident_bytes > max_bytes {
			let Some((key, entry)) = inner.entries.pop_lru() else {
				break;
			};
			trace!(
				%key,
				byte_size = entry.byte_size,
				idle = ?entry.last_accessed_at.elapsed(),
				"Evicted artifact from memory"
			);
			inner.forget(&entry);
			evicted.push(key);
		}

		evicted
	}

	pub fn remove(&self, key: &ContentKey) -> bool {
		let mut inner = self.inner.lock();
		inner.entries.pop(key).map_or(false, |entry| {
			inner.forget(&entry);
			true
		})
	}

	/// Removes every entry whose root path starts with `prefix` (a plain string prefix,
	/// same as the durable index). Returns how many were removed.
	pub fn retain_prefix_removed(&self, prefix: &Path) -> usize {
		let prefix = prefix.as_os_str().as_encoded_bytes();
		let mut inner = self.inner.lock();

		let doomed = inner
			.entries
			.iter()
			.filter(|(key, _)| {
				key.root_path()
					.as_os_str()
					.as_encoded_bytes()
					.starts_with(prefix)
			})
			.map(|(key, _)| key.clone())
			.collect::<Vec<_>>();

		for key in &doomed {
			if let Some(entry) = inner.entries.pop(key) {
				inner.forget(&entry);
			}
		}

		doomed.len()
	}

	pub fn clear(&self) {
		let mut inner = self.inner.lock();
		inner.entries.clear();
		inner.resident_bytes = 0;
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.inner.lock().entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	#[must_use]
	pub fn resident_bytes(&self) -> u64 {
		self.inner.lock().resident_bytes
	}
}
