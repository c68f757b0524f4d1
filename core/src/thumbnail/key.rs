use sd_utils::error::NonUtf8PathError;

use std::{
	fmt,
	path::{Path, PathBuf},
	time::UNIX_EPOCH,
};

use serde::{Deserialize, Serialize};

/// Separates the parts of a [`ContentKey`] in its storage form, can't show up in sane paths
const KEY_SEPARATOR: char = '\u{1f}';

/// Canonical identity of a thumbnail target.
///
/// `root_path` is the file on disk (an image, a video, an archive or a folder), `inner_path`
/// addresses an entry inside an archive and `selector` carries variant specific arguments,
/// like the timestamp of a video frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentKey {
	root_path: PathBuf,
	inner_path: Option<String>,
	selector: Option<String>,
}

impl ContentKey {
	pub fn new(root_path: impl Into<PathBuf>) -> Self {
		Self {
			root_path: root_path.into(),
			inner_path: None,
			selector: None,
		}
	}

	#[must_use]
	pub fn with_inner_path(mut self, inner_path: impl Into<String>) -> Self {
		let inner_path = inner_path.into();
		self.inner_path = (!inner_path.is_empty()).then_some(inner_path);
		self
	}

	#[must_use]
	pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
		let selector = selector.into();
		self.selector = (!selector.is_empty()).then_some(selector);
		self
	}

	#[must_use]
	pub fn root_path(&self) -> &Path {
		&self.root_path
	}

	#[must_use]
	pub fn inner_path(&self) -> Option<&str> {
		self.inner_path.as_deref()
	}

	#[must_use]
	pub fn selector(&self) -> Option<&str> {
		self.selector.as_deref()
	}

	/// The viewing context this key belongs to: the archive for archive entries,
	/// the containing directory for everything else.
	#[must_use]
	pub fn source_id(&self) -> SourceId {
		if self.inner_path.is_some() {
			return SourceId(self.root_path.clone());
		}

		SourceId(
			self.root_path
				.parent()
				.map_or_else(|| self.root_path.clone(), Path::to_path_buf),
		)
	}

	/// Lowercased extension of the innermost name, the archive entry if there is one
	#[must_use]
	pub fn extension(&self) -> Option<String> {
		let name = self
			.inner_path
			.as_deref()
			.map_or_else(|| self.root_path.as_path(), Path::new);

		name.extension()
			.and_then(|ext| ext.to_str())
			.map(str::to_ascii_lowercase)
	}

	/// Canonical string form, used as the primary key of the durable index
	pub fn storage_key(&self) -> Result<String, NonUtf8PathError> {
		let root = self.root_path_str()?;

		let mut key = String::with_capacity(
			root.len()
				+ self.inner_path.as_ref().map_or(0, String::len)
				+ self.selector.as_ref().map_or(0, String::len)
				+ 2,
		);
		key.push_str(root);
		key.push(KEY_SEPARATOR);
		if let Some(inner_path) = &self.inner_path {
			key.push_str(inner_path);
		}
		key.push(KEY_SEPARATOR);
		if let Some(selector) = &self.selector {
			key.push_str(selector);
		}

		Ok(key)
	}

	/// Rebuilds a key from the parts stored in the durable index
	pub(crate) fn from_stored(root_path: String, inner_path: String, selector: String) -> Self {
		Self::new(root_path)
			.with_inner_path(inner_path)
			.with_selector(selector)
	}

	pub(crate) fn root_path_str(&self) -> Result<&str, NonUtf8PathError> {
		self.root_path
			.to_str()
			.ok_or_else(|| NonUtf8PathError(self.root_path.clone().into_boxed_path()))
	}
}

impl fmt::Display for ContentKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.root_path.display())?;
		if let Some(inner_path) = &self.inner_path {
			write!(f, "!/{inner_path}")?;
		}
		if let Some(selector) = &self.selector {
			write!(f, "#{selector}")?;
		}
		Ok(())
	}
}

/// A viewing context (an open folder or archive), the unit of epoch bumps and promotion
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub PathBuf);

impl SourceId {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self(path.into())
	}
}

impl From<&Path> for SourceId {
	fn from(path: &Path) -> Self {
		Self(path.to_path_buf())
	}
}

impl fmt::Display for SourceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.display())
	}
}

/// Change detection signature of a source, taken from its filesystem metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
	pub modified_ms: i64,
	pub byte_size: u64,
}

impl Fingerprint {
	#[must_use]
	pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
		let modified_ms = metadata
			.modified()
			.ok()
			.and_then(|time| time.duration_since(UNIX_EPOCH).ok())
			.and_then(|elapsed| i64::try_from(elapsed.as_millis()).ok())
			.unwrap_or_default();

		Self {
			modified_ms,
			byte_size: metadata.len(),
		}
	}

	/// Reads the fingerprint of `path`, `None` when it doesn't exist anymore
	pub async fn of(path: impl AsRef<Path>) -> std::io::Result<Option<Self>> {
		match tokio::fs::metadata(path).await {
			Ok(metadata) => Ok(Some(Self::from_metadata(&metadata))),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e),
		}
	}
}

/// Priority class of a request. Variants are declared lowest first, so `Ord` follows urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
	Background,
	Normal,
	High,
	Immediate,
}

impl Tier {
	/// Highest first, the order in which queued requests are admitted
	pub const ALL: [Self; 4] = [Self::Immediate, Self::High, Self::Normal, Self::Background];

	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Immediate => "immediate",
			Self::High => "high",
			Self::Normal => "normal",
			Self::Background => "background",
		}
	}
}

impl fmt::Display for Tier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn source_of_plain_file_is_its_directory() {
		let key = ContentKey::new("/photos/trip/img001.jpg");
		assert_eq!(key.source_id(), SourceId::new("/photos/trip"));
	}

	#[test]
	fn source_of_archive_entry_is_the_archive() {
		let key = ContentKey::new("/comics/vol1.cbz").with_inner_path("p/001.png");
		assert_eq!(key.source_id(), SourceId::new("/comics/vol1.cbz"));
		assert_eq!(key.extension().as_deref(), Some("png"));
	}

	#[test]
	fn storage_key_keeps_parts_apart() {
		let a = ContentKey::new("/a").with_inner_path("b");
		let b = ContentKey::new("/a").with_selector("b");
		assert_ne!(a.storage_key().unwrap(), b.storage_key().unwrap());
		assert!(a.storage_key().unwrap().starts_with("/a"));
	}

	#[test]
	fn empty_parts_are_absent() {
		let key = ContentKey::new("/a.mp4").with_inner_path("").with_selector("");
		assert_eq!(key, ContentKey::new("/a.mp4"));
	}

	#[test]
	fn tiers_order_by_urgency() {
		assert!(Tier::Immediate > Tier::High);
		assert!(Tier::High > Tier::Normal);
		assert!(Tier::Normal > Tier::Background);
		assert_eq!(Tier::ALL[0], Tier::Immediate);
	}
}
