use std::collections::HashMap;

use crate::thumbnail::key::SourceId;

/// Per source generation counters. A request captures the epoch of its source when it is
/// submitted and its result is only delivered if that epoch is still current.
#[derive(Debug, Default)]
pub struct EpochTracker {
	epochs: HashMap<SourceId, u64>,
}

impl EpochTracker {
	#[must_use]
	pub fn current(&self, source: &SourceId) -> u64 {
		self.epochs.get(source).copied().unwrap_or_default()
	}

	/// Moves the source to a new epoch, returning it
	pub fn bump(&mut self, source: &SourceId) -> u64 {
		let epoch = self.epochs.entry(source.clone()).or_default();
		*epoch += 1;
		*epoch
	}

	#[must_use]
	pub fn is_current(&self, source: &SourceId, epoch: u64) -> bool {
		self.current(source) == epoch
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bumping_invalidates_older_epochs() {
		let mut epochs = EpochTracker::default();
		let source = SourceId::new("/comics");
		let other = SourceId::new("/photos");

		let captured = epochs.current(&source);
		assert!(epochs.is_current(&source, captured));

		assert_eq!(epochs.bump(&source), captured + 1);
		assert!(!epochs.is_current(&source, captured));
		assert!(epochs.is_current(&other, 0));
	}
}
