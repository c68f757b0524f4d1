//! Content resolution: finds the bytes that represent a [`ContentKey`].
//!
//! Plain images are read as they are, archives and folders are searched for a
//! representative image and videos are asked for a single frame.

use sd_utils::error::FileIOError;

use std::{
	cmp::Ordering,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use bytes::Bytes;
use natural_sort_rs::natural_cmp;
use tokio::{fs, task::spawn_blocking};
use tracing::trace;

use super::{config::ThumbnailerConfig, error::ThumbnailerError, key::ContentKey};

pub mod archive;
pub mod folder;
pub mod video;

pub use video::{FfmpegFrameExtractor, FrameExtractor};

/// Raw bytes picked to represent a key, with the extension they came with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representative {
	pub data: Bytes,
	pub extension: Option<String>,
}

impl Representative {
	#[must_use]
	pub fn new(data: impl Into<Bytes>, extension: Option<&str>) -> Self {
		Self {
			data: data.into(),
			extension: extension.map(str::to_ascii_lowercase),
		}
	}
}

/// What a container scan learned, kept in the container index so the next
/// visit can skip the scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
	pub representative: ContentKey,
	pub child_count: u64,
}

#[derive(Debug)]
pub struct Resolved {
	pub representative: Representative,
	pub container: Option<ContainerInfo>,
}

/// The kinds of sources we know how to get a thumbnail out of
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceVariant {
	PlainImage(PathBuf),
	/// A specific entry when `entry` is set, otherwise the archive as a whole
	ArchiveEntry {
		archive: PathBuf,
		entry: Option<String>,
	},
	Folder(PathBuf),
	Video {
		path: PathBuf,
		timestamp: Duration,
	},
}

impl SourceVariant {
	/// Decides how `key` must be resolved. `is_dir` comes from the metadata of the root path.
	pub fn classify(
		key: &ContentKey,
		is_dir: bool,
		default_video_timestamp: Duration,
	) -> Result<Self, ThumbnailerError> {
		let root = key.root_path();

		let root_extension = root
			.extension()
			.and_then(|ext| ext.to_str())
			.map(str::to_ascii_lowercase);

		if let Some(entry) = key.inner_path() {
			return if root_extension
				.as_deref()
				.is_some_and(archive::is_archive_extension)
			{
				Ok(Self::ArchiveEntry {
					archive: root.to_path_buf(),
					entry: Some(entry.to_string()),
				})
			} else {
				Err(ThumbnailerError::UnsupportedArchive(root.into()))
			};
		}

		if is_dir {
			return Ok(Self::Folder(root.to_path_buf()));
		}

		match root_extension.as_deref() {
			Some(ext) if archive::is_archive_extension(ext) => Ok(Self::ArchiveEntry {
				archive: root.to_path_buf(),
				entry: None,
			}),
			Some(ext) if video::is_video_extension(ext) => Ok(Self::Video {
				path: root.to_path_buf(),
				timestamp: key
					.selector()
					.map(video::parse_timestamp)
					.transpose()?
					.unwrap_or(default_video_timestamp),
			}),
			Some(ext) if sd_images::is_supported_extension(ext) => {
				Ok(Self::PlainImage(root.to_path_buf()))
			}
			_ => Err(ThumbnailerError::UnsupportedSource(root.into())),
		}
	}

	/// Folders and whole archives, whose representative is worth remembering
	#[must_use]
	pub const fn is_container(&self) -> bool {
		matches!(
			self,
			Self::Folder(_) | Self::ArchiveEntry { entry: None, .. }
		)
	}

	pub async fn resolve(&self, resolver: &ContentResolver) -> Result<Resolved, ThumbnailerError> {
		match self {
			Self::PlainImage(path) => Ok(Resolved {
				representative: resolver.read_file(path).await?,
				container: None,
			}),

			Self::ArchiveEntry {
				archive,
				entry: Some(entry),
			} => Ok(Resolved {
				representative: resolver.read_archive_entry(archive, entry).await?,
				container: None,
			}),

			Self::ArchiveEntry {
				archive,
				entry: None,
			} => resolver.resolve_archive(archive).await,

			Self::Folder(path) => resolver.resolve_folder(path).await,

			Self::Video { path, timestamp } => Ok(Resolved {
				representative: Representative::new(
					resolver
						.frame_extractor
						.extract_frame(path, *timestamp)
						.await?,
					None,
				),
				container: None,
			}),
		}
	}
}

/// Shared state and limits of content resolution
#[derive(Clone)]
pub struct ContentResolver {
	max_source_bytes: u64,
	folder_search_depth: usize,
	default_video_timestamp: Duration,
	frame_extractor: Arc<dyn FrameExtractor>,
}

impl ContentResolver {
	pub fn new(config: &ThumbnailerConfig, frame_extractor: Arc<dyn FrameExtractor>) -> Self {
		Self {
			max_source_bytes: config.max_source_bytes,
			folder_search_depth: config.folder_search_depth,
			default_video_timestamp: config.default_video_timestamp,
			frame_extractor,
		}
	}

	#[must_use]
	pub const fn default_video_timestamp(&self) -> Duration {
		self.default_video_timestamp
	}

	/// Reads a representative recorded by a previous container scan
	pub async fn read_representative(
		&self,
		representative: &ContentKey,
	) -> Result<Representative, ThumbnailerError> {
		match representative.inner_path() {
			Some(entry) => {
				self.read_archive_entry(representative.root_path(), entry)
					.await
			}
			None => self.read_file(representative.root_path()).await,
		}
	}

	async fn read_file(&self, path: &Path) -> Result<Representative, ThumbnailerError> {
		let metadata = fs::metadata(path)
			.await
			.map_err(|e| FileIOError::from((path, e)))?;

		if metadata.len() > self.max_source_bytes {
			return Err(ThumbnailerError::TooLarge {
				path: path.into(),
				size: metadata.len(),
				max: self.max_source_bytes,
			});
		}

		let data = fs::read(path)
			.await
			.map_err(|e| FileIOError::from((path, e, "Failed to read image")))?;

		trace!(path = %path.display(), len = data.len(), "Read image");

		Ok(Representative::new(
			data,
			path.extension().and_then(|ext| ext.to_str()),
		))
	}

	async fn read_archive_entry(
		&self,
		archive: &Path,
		entry: &str,
	) -> Result<Representative, ThumbnailerError> {
		let max_bytes = self.max_source_bytes;
		let archive = archive.to_path_buf();
		let entry = entry.to_string();

		blocking(move || {
			let data = archive::read_entry(&archive, &entry, max_bytes)?;
			Ok(Representative::new(
				data,
				Path::new(&entry).extension().and_then(|ext| ext.to_str()),
			))
		})
		.await
	}

	/// Only the first image in natural order is tried, a broken one fails the whole archive
	async fn resolve_archive(&self, archive: &Path) -> Result<Resolved, ThumbnailerError> {
		let max_bytes = self.max_source_bytes;
		let archive = archive.to_path_buf();

		blocking(move || {
			let listing = archive::first_image_entry(&archive)?;
			let data = archive::read_entry(&archive, &listing.first_image, max_bytes)?;

			Ok(Resolved {
				representative: Representative::new(
					data,
					Path::new(&listing.first_image)
						.extension()
						.and_then(|ext| ext.to_str()),
				),
				container: Some(ContainerInfo {
					representative: ContentKey::new(archive).with_inner_path(listing.first_image),
					child_count: listing.image_count,
				}),
			})
		})
		.await
	}

	async fn resolve_folder(&self, path: &Path) -> Result<Resolved, ThumbnailerError> {
		let depth = self.folder_search_depth;
		let folder = path.to_path_buf();

		let scan = blocking(move || Ok(folder::scan(&folder, depth)?)).await?;

		match scan.pick {
			Some(folder::FolderPick::Image(image)) => Ok(Resolved {
				representative: self.read_file(&image).await?,
				container: Some(ContainerInfo {
					representative: ContentKey::new(image),
					child_count: scan.child_count,
				}),
			}),
			Some(folder::FolderPick::Archive(archive)) => {
				let Resolved {
					representative,
					container,
				} = self.resolve_archive(&archive).await?;

				Ok(Resolved {
					representative,
					container: container.map(|inner| ContainerInfo {
						representative: inner.representative,
						child_count: scan.child_count,
					}),
				})
			}
			None => Err(ThumbnailerError::Empty(path.into())),
		}
	}
}

/// Natural order of entry names, ignoring case: `Page2.png` comes before `page10.png`
pub(crate) fn natural_order(a: &str, b: &str) -> Ordering {
	natural_cmp::<str, String>(&a.to_lowercase(), &b.to_lowercase())
}

async fn blocking<T, F>(f: F) -> Result<T, ThumbnailerError>
where
	T: Send + 'static,
	F: FnOnce() -> Result<T, ThumbnailerError> + Send + 'static,
{
	spawn_blocking(f)
		.await
		.map_err(|e| ThumbnailerError::Panic(e.to_string()))?
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::thumbnail::error::ErrorKind;

	const TS: Duration = Duration::from_secs(1);

	#[test]
	fn classification() {
		assert_eq!(
			SourceVariant::classify(&ContentKey::new("/a/b.JPG"), false, TS).unwrap(),
			SourceVariant::PlainImage("/a/b.JPG".into())
		);
		for archive in ["/a/b.cbz", "/a/b.CBR", "/a/b.7z"] {
			assert!(SourceVariant::classify(&ContentKey::new(archive), false, TS)
				.unwrap()
				.is_container());
		}
		assert!(SourceVariant::classify(&ContentKey::new("/a/b"), true, TS)
			.unwrap()
			.is_container());
		assert_eq!(
			SourceVariant::classify(&ContentKey::new("/a/v.mkv").with_selector("t=5"), false, TS)
				.unwrap(),
			SourceVariant::Video {
				path: "/a/v.mkv".into(),
				timestamp: Duration::from_secs(5)
			}
		);
		assert_eq!(
			SourceVariant::classify(&ContentKey::new("/a/v.mp4"), false, TS).unwrap(),
			SourceVariant::Video {
				path: "/a/v.mp4".into(),
				timestamp: TS
			}
		);
	}

	#[test]
	fn natural_order_compares_numbers_by_value() {
		let mut names = ["page10.jpg", "page2.jpg", "Page3.png", "page1.jpg"];
		names.sort_by(|a, b| natural_order(a, b));
		assert_eq!(names, ["page1.jpg", "page2.jpg", "Page3.png", "page10.jpg"]);

		assert_eq!(natural_order("cover", "cover1"), Ordering::Less);
		assert_eq!(natural_order("chapter 10", "Chapter 9"), Ordering::Greater);
	}

	#[test]
	fn unknown_files_are_unsupported() {
		let err = SourceVariant::classify(&ContentKey::new("/a/b.docx"), false, TS).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::Unsupported);

		let err = SourceVariant::classify(
			&ContentKey::new("/a/b.png").with_inner_path("c.png"),
			false,
			TS,
		)
		.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::Unsupported);
	}
}
