use super::{codec::Artifact, error::ErrorKind, key::ContentKey};

/// Result delivered to subscribers of [`super::Thumbnailer::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailEvent {
	pub key: ContentKey,
	pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
	Ready(Artifact),
	/// No thumbnail can be made for the current version of the source
	Unavailable(ErrorKind),
}

impl ThumbnailEvent {
	#[must_use]
	pub const fn ready(key: ContentKey, artifact: Artifact) -> Self {
		Self {
			key,
			outcome: Outcome::Ready(artifact),
		}
	}

	#[must_use]
	pub const fn unavailable(key: ContentKey, kind: ErrorKind) -> Self {
		Self {
			key,
			outcome: Outcome::Unavailable(kind),
		}
	}

	#[must_use]
	pub const fn artifact(&self) -> Option<&Artifact> {
		match &self.outcome {
			Outcome::Ready(artifact) => Some(artifact),
			Outcome::Unavailable(_) => None,
		}
	}
}
