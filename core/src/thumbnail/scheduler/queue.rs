use std::{
	cmp::Reverse,
	collections::{BTreeMap, HashMap},
};

use tokio::time::Instant;

use crate::thumbnail::key::{ContentKey, SourceId, Tier};

/// A queued (or running) unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRequest {
	pub key: ContentKey,
	pub tier: Tier,
	pub submitted_at: Instant,
	/// Epoch of the key's source captured at submission, refreshed by merges
	pub epoch: u64,
	/// Skip cache admission and generate again
	pub regenerate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
	Ready { seq: u64 },
	Delayed { due: Instant, seq: u64 },
}

#[derive(Debug)]
struct Slot {
	request: ThumbnailRequest,
	position: Position,
}

/// Strict priority queue: tiers first, FIFO inside a tier. Requests submitted with a delay
/// wait aside until they are due.
#[derive(Debug, Default)]
pub struct TierQueue {
	ready: BTreeMap<(Reverse<Tier>, u64), ContentKey>,
	delayed: BTreeMap<(Instant, u64), ContentKey>,
	slots: HashMap<ContentKey, Slot>,
	next_seq: u64,
}

impl TierQueue {
	fn seq(&mut self) -> u64 {
		self.next_seq += 1;
		self.next_seq
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.slots.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	#[must_use]
	pub fn get(&self, key: &ContentKey) -> Option<&ThumbnailRequest> {
		self.slots.get(key).map(|slot| &slot.request)
	}

	/// Adds a new request, ready right away or once `due` passes.
	/// Returns `false` (and changes nothing) if the key is already queued.
	pub fn push(&mut self, request: ThumbnailRequest, due: Option<Instant>) -> bool {
		if self.slots.contains_key(&request.key) {
			return false;
		}

		let seq = self.seq();
		let position = match due {
			Some(due) => {
				self.delayed.insert((due, seq), request.key.clone());
				Position::Delayed { due, seq }
			}
			None => {
				self.ready
					.insert((Reverse(request.tier), seq), request.key.clone());
				Position::Ready { seq }
			}
		};

		self.slots
			.insert(request.key.clone(), Slot { request, position });

		true
	}

	/// Merges a duplicate submission into the queued request.
	///
	/// The tier only ever goes up, and a raised request goes to the tail of its new tier.
	/// A ready submission makes a delayed request ready. Returns `false` if the key isn't queued.
	pub fn merge(&mut self, key: &ContentKey, tier: Tier, epoch: u64, ready: bool) -> bool {
		let Some(slot) = self.slots.get_mut(key) else {
			return false;
		};

		slot.request.epoch = slot.request.epoch.max(epoch);
		let new_tier = slot.request.tier.max(tier);

		let must_move = match slot.position {
			Position::Ready { .. } => new_tier != slot.request.tier,
			Position::Delayed { .. } => ready,
		};

		if must_move {
			self.reposition(key, new_tier);
		} else {
			slot.request.tier = new_tier;
		}

		true
	}

	/// Flags a queued request to skip the container index when it runs
	pub fn mark_regenerate(&mut self, key: &ContentKey) -> bool {
		self.slots
			.get_mut(key)
			.map(|slot| slot.request.regenerate = true)
			.is_some()
	}

	/// Moves a queued request to the tail of `tier`'s ready list
	fn reposition(&mut self, key: &ContentKey, tier: Tier) {
		let seq = self.seq();
		let Some(slot) = self.slots.get_mut(key) else {
			return;
		};

		match slot.position {
			Position::Ready { seq: old_seq } => {
				self.ready.remove(&(Reverse(slot.request.tier), old_seq));
			}
			Position::Delayed { due, seq: old_seq } => {
				self.delayed.remove(&(due, old_seq));
			}
		}

		slot.request.tier = tier;
		slot.position = Position::Ready { seq };
		self.ready.insert((Reverse(tier), seq), key.clone());
	}

	/// Takes the highest priority ready request
	pub fn pop(&mut self) -> Option<ThumbnailRequest> {
		let (_, key) = self.ready.pop_first()?;
		self.slots.remove(&key).map(|slot| slot.request)
	}

	/// Makes every delayed request due at `now` ready, in due order. Returns how many moved.
	pub fn promote_due(&mut self, now: Instant) -> usize {
		let due = self
			.delayed
			.range(..=(now, u64::MAX))
			.map(|(_, key)| key.clone())
			.collect::<Vec<_>>();

		for key in &due {
			let tier = self.slots.get(key).map(|slot| slot.request.tier);
			if let Some(tier) = tier {
				self.reposition(key, tier);
			}
		}

		due.len()
	}

	#[must_use]
	pub fn next_due(&self) -> Option<Instant> {
		self.delayed.first_key_value().map(|((due, _), _)| *due)
	}

	pub fn remove(&mut self, key: &ContentKey) -> Option<ThumbnailRequest> {
		let slot = self.slots.remove(key)?;
		match slot.position {
			Position::Ready { seq } => {
				self.ready.remove(&(Reverse(slot.request.tier), seq));
			}
			Position::Delayed { due, seq } => {
				self.delayed.remove(&(due, seq));
			}
		}
		Some(slot.request)
	}

	/// Drops every queued request of `source`
	pub fn remove_source(&mut self, source: &SourceId) -> Vec<ThumbnailRequest> {
		self.keys_of(source)
			.iter()
			.filter_map(|key| self.remove(key))
			.collect()
	}

	/// Raises every request of `source` below `tier` to `tier`, ready ones first in their
	/// admission order then delayed ones in due order. Returns how many were promoted.
	pub fn promote_source(&mut self, source: &SourceId, tier: Tier) -> usize {
		let mut promoted = 0;

		for key in self.keys_of(source) {
			let Some(slot) = self.slots.get(&key) else {
				continue;
			};

			let is_delayed = matches!(slot.position, Position::Delayed { .. });
			if slot.request.tier < tier || is_delayed {
				let new_tier = slot.request.tier.max(tier);
				self.reposition(&key, new_tier);
				promoted += 1;
			}
		}

		promoted
	}

	/// Keys of `source` in admission order: ready requests by priority, then delayed ones
	fn keys_of(&self, source: &SourceId) -> Vec<ContentKey> {
		self.ready
			.values()
			.chain(self.delayed.values())
			.filter(|key| key.source_id() == *source)
			.cloned()
			.collect()
	}

	/// Ready requests per tier
	#[must_use]
	pub fn depth_by_tier(&self) -> BTreeMap<Tier, usize> {
		let mut depths = Tier::ALL
			.iter()
			.map(|tier| (*tier, 0))
			.collect::<BTreeMap<_, _>>();

		for (Reverse(tier), _) in self.ready.keys() {
			*depths.entry(*tier).or_default() += 1;
		}

		depths
	}

	#[must_use]
	pub fn delayed_len(&self) -> usize {
		self.delayed.len()
	}

	/// Ready requests in the order they would be admitted
	#[must_use]
	pub fn snapshot(&self) -> Vec<(ContentKey, Tier)> {
		self.ready
			.iter()
			.map(|((Reverse(tier), _), key)| (key.clone(), *tier))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::time::Duration;

	fn request(path: &str, tier: Tier) -> ThumbnailRequest {
		ThumbnailRequest {
			key: ContentKey::new(path),
			tier,
			submitted_at: Instant::now(),
			epoch: 0,
			regenerate: false,
		}
	}

	fn drain(queue: &mut TierQueue) -> Vec<String> {
		std::iter::from_fn(|| queue.pop())
			.map(|request| request.key.root_path().display().to_string())
			.collect()
	}

	#[test]
	fn strict_tiers_then_fifo() {
		let mut queue = TierQueue::default();
		queue.push(request("/n1", Tier::Normal), None);
		queue.push(request("/b1", Tier::Background), None);
		queue.push(request("/i1", Tier::Immediate), None);
		queue.push(request("/n2", Tier::Normal), None);
		queue.push(request("/i2", Tier::Immediate), None);

		assert_eq!(drain(&mut queue), ["/i1", "/i2", "/n1", "/n2", "/b1"]);
		assert!(queue.is_empty());
	}

	#[test]
	fn duplicates_are_not_pushed() {
		let mut queue = TierQueue::default();
		assert!(queue.push(request("/a", Tier::Normal), None));
		assert!(!queue.push(request("/a", Tier::Immediate), None));
		assert_eq!(queue.len(), 1);
		assert_eq!(queue.get(&ContentKey::new("/a")).unwrap().tier, Tier::Normal);
	}

	#[test]
	fn merge_raises_to_tail_and_never_lowers() {
		let mut queue = TierQueue::default();
		queue.push(request("/h1", Tier::High), None);
		queue.push(request("/n1", Tier::Normal), None);
		queue.push(request("/h2", Tier::High), None);

		assert!(queue.merge(&ContentKey::new("/n1"), Tier::High, 3, true));
		assert!(queue.merge(&ContentKey::new("/h1"), Tier::Background, 0, true));

		let merged = queue.get(&ContentKey::new("/n1")).unwrap();
		assert_eq!((merged.tier, merged.epoch), (Tier::High, 3));
		assert_eq!(drain(&mut queue), ["/h1", "/h2", "/n1"]);

		assert!(!queue.merge(&ContentKey::new("/nope"), Tier::High, 0, true));
	}

	#[test]
	fn delayed_requests_wait() {
		let now = Instant::now();
		let mut queue = TierQueue::default();
		queue.push(request("/later", Tier::Background), Some(now + Duration::from_secs(10)));
		queue.push(request("/soon", Tier::Background), Some(now + Duration::from_secs(1)));

		assert!(queue.pop().is_none());
		assert_eq!(queue.next_due(), Some(now + Duration::from_secs(1)));
		assert_eq!(queue.delayed_len(), 2);

		assert_eq!(queue.promote_due(now + Duration::from_secs(5)), 1);
		assert_eq!(drain(&mut queue), ["/soon"]);

		// A visible submission doesn't wait for the delay
		queue.merge(&ContentKey::new("/later"), Tier::Normal, 0, true);
		assert_eq!(queue.delayed_len(), 0);
		assert_eq!(drain(&mut queue), ["/later"]);
	}

	#[test]
	fn source_promotion_keeps_fifo_ahead_of_other_sources() {
		let now = Instant::now();
		let mut queue = TierQueue::default();
		queue.push(request("/a/1", Tier::Normal), None);
		queue.push(request("/b/1", Tier::Normal), None);
		queue.push(request("/a/2", Tier::Background), None);
		queue.push(request("/a/3", Tier::Normal), None);
		queue.push(request("/a/4", Tier::Background), Some(now + Duration::from_secs(60)));
		queue.push(request("/a/5", Tier::Immediate), None);

		let promoted = queue.promote_source(&SourceId::new("/a"), Tier::High);
		assert_eq!(promoted, 4);
		queue.push(request("/b/2", Tier::Normal), None);

		assert_eq!(
			drain(&mut queue),
			["/a/5", "/a/1", "/a/3", "/a/2", "/a/4", "/b/1", "/b/2"]
		);
	}

	#[test]
	fn removal_by_source() {
		let mut queue = TierQueue::default();
		queue.push(request("/a/1", Tier::Normal), None);
		queue.push(request("/b/1", Tier::Normal), None);
		queue.push(
			request("/a/2", Tier::Background),
			Some(Instant::now() + Duration::from_secs(1)),
		);

		let removed = queue.remove_source(&SourceId::new("/a"));
		assert_eq!(removed.len(), 2);
		assert_eq!(queue.delayed_len(), 0);
		assert_eq!(drain(&mut queue), ["/b/1"]);
	}

	#[test]
	fn depth_counts_every_tier() {
		let mut queue = TierQueue::default();
		queue.push(request("/a", Tier::Normal), None);
		queue.push(request("/b", Tier::Normal), None);
		queue.push(request("/c", Tier::Immediate), None);

		let depths = queue.depth_by_tier();
		assert_eq!(depths[&Tier::Normal], 2);
		assert_eq!(depths[&Tier::Immediate], 1);
		assert_eq!(depths[&Tier::Background], 0);
	}
}
