//! Archive backends. Every format is listed, filtered down to image entries and sorted in
//! natural order the same way, only listing and extraction are format specific.

use std::path::Path;

use tracing::{instrument, trace};

use crate::thumbnail::error::ThumbnailerError;

use super::natural_order;

mod rar;
mod seven_zip;
mod zipfile;

pub const ZIP_EXTENSIONS: [&str; 2] = ["zip", "cbz"];
pub const RAR_EXTENSIONS: [&str; 2] = ["rar", "cbr"];
pub const SEVEN_ZIP_EXTENSIONS: [&str; 2] = ["7z", "cb7"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
	Zip,
	Rar,
	SevenZip,
}

impl ArchiveFormat {
	#[must_use]
	pub fn from_extension(extension: &str) -> Option<Self> {
		if ZIP_EXTENSIONS.contains(&extension) {
			Some(Self::Zip)
		} else if RAR_EXTENSIONS.contains(&extension) {
			Some(Self::Rar)
		} else if SEVEN_ZIP_EXTENSIONS.contains(&extension) {
			Some(Self::SevenZip)
		} else {
			None
		}
	}

	fn of(path: &Path) -> Result<Self, ThumbnailerError> {
		path.extension()
			.and_then(|ext| ext.to_str())
			.map(str::to_ascii_lowercase)
			.and_then(|ext| Self::from_extension(&ext))
			.ok_or_else(|| ThumbnailerError::UnsupportedArchive(path.into()))
	}

	#[must_use]
	pub const fn name(self) -> &'static str {
		match self {
			Self::Zip => "zip",
			Self::Rar => "rar",
			Self::SevenZip => "7z",
		}
	}
}

#[must_use]
pub fn is_archive_extension(extension: &str) -> bool {
	ArchiveFormat::from_extension(extension).is_some()
}

/// Result of listing an archive: the entry that represents it and how many images it holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveListing {
	pub first_image: String,
	pub image_count: u64,
}

/// Whether an archive entry name is an image worth considering
fn is_image_entry(name: &str) -> bool {
	if name.starts_with("__MACOSX/") {
		return false;
	}

	let file_name = name.rsplit('/').next().unwrap_or(name);
	!file_name.starts_with('.')
		&& Path::new(file_name)
			.extension()
			.and_then(|ext| ext.to_str())
			.map(str::to_ascii_lowercase)
			.is_some_and(|ext| sd_images::is_supported_extension(&ext))
}

fn check_entry_size(
	path: &Path,
	entry: &str,
	size: u64,
	max_bytes: u64,
) -> Result<(), ThumbnailerError> {
	if size > max_bytes {
		return Err(ThumbnailerError::TooLarge {
			path: path.join(entry).into_boxed_path(),
			size,
			max: max_bytes,
		});
	}

	Ok(())
}

/// Lists the archive and picks its first image in natural order. Blocking.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn first_image_entry(path: &Path) -> Result<ArchiveListing, ThumbnailerError> {
	let names = match ArchiveFormat::of(path)? {
		ArchiveFormat::Zip => zipfile::entry_names(path)?,
		ArchiveFormat::Rar => rar::entry_names(path)?,
		ArchiveFormat::SevenZip => seven_zip::entry_names(path)?,
	};

	let mut images = names
		.into_iter()
		.filter(|name| is_image_entry(name))
		.collect::<Vec<_>>();

	let image_count = images.len() as u64;
	images.sort_unstable_by(|a, b| natural_order(a, b));

	let first_image = images
		.into_iter()
		.next()
		.ok_or_else(|| ThumbnailerError::Empty(path.into()))?;

	trace!(%first_image, image_count, "Picked archive representative");

	Ok(ArchiveListing {
		first_image,
		image_count,
	})
}

/// Extracts a single entry, refusing entries larger than `max_bytes`. Blocking.
#[instrument(skip_all, fields(path = %path.display(), %entry))]
pub fn read_entry(path: &Path, entry: &str, max_bytes: u64) -> Result<Vec<u8>, ThumbnailerError> {
	match ArchiveFormat::of(path)? {
		ArchiveFormat::Zip => zipfile::read_entry(path, entry, max_bytes),
		ArchiveFormat::Rar => rar::read_entry(path, entry, max_bytes),
		ArchiveFormat::SevenZip => seven_zip::read_entry(path, entry, max_bytes),
	}
}
