use sd_utils::error::FileIOError;

use std::{
	fs,
	path::{Path, PathBuf},
};

use tracing::{instrument, trace, warn};

use super::{archive::is_archive_extension, natural_order};

/// What a folder scan found to represent the folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderPick {
	Image(PathBuf),
	Archive(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderScan {
	pub pick: Option<FolderPick>,
	/// Visible direct children of the folder
	pub child_count: u64,
}

struct Listing {
	files: Vec<(String, PathBuf)>,
	dirs: Vec<(String, PathBuf)>,
}

/// Lists a directory skipping hidden entries, both halves in natural order
fn list(dir: &Path) -> Result<Listing, FileIOError> {
	let mut files = Vec::new();
	let mut dirs = Vec::new();

	for entry in fs::read_dir(dir).map_err(|e| FileIOError::from((dir, e, "Failed to read folder")))? {
		let entry = entry.map_err(|e| FileIOError::from((dir, e, "Failed to read folder entry")))?;

		let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
			warn!(path = %entry.path().display(), "Skipping non UTF-8 folder entry");
			continue;
		};
		if name.starts_with('.') {
			continue;
		}

		// Follows symlinks, a link to a folder is browsed like one
		match fs::metadata(entry.path()) {
			Ok(metadata) if metadata.is_dir() => dirs.push((name, entry.path())),
			Ok(_) => files.push((name, entry.path())),
			Err(e) => warn!(path = %entry.path().display(), ?e, "Skipping unreadable folder entry"),
		}
	}

	files.sort_by(|(a, _), (b, _)| natural_order(a, b));
	dirs.sort_by(|(a, _), (b, _)| natural_order(a, b));

	Ok(Listing { files, dirs })
}

fn extension_of(name: &str) -> Option<String> {
	Path::new(name)
		.extension()
		.and_then(|ext| ext.to_str())
		.map(str::to_ascii_lowercase)
}

fn is_image(name: &str) -> bool {
	extension_of(name).is_some_and(|ext| sd_images::is_supported_extension(&ext))
}

fn is_archive(name: &str) -> bool {
	extension_of(name).is_some_and(|ext| is_archive_extension(&ext))
}

/// Depth first search for the first file accepted by `matches`: the folder's own files
/// win over anything in its subfolders, which are visited in natural order.
fn find_first(
	listing: &Listing,
	depth: usize,
	matches: fn(&str) -> bool,
) -> Option<PathBuf> {
	if let Some((_, path)) = listing.files.iter().find(|(name, _)| matches(name)) {
		return Some(path.clone());
	}

	if depth == 0 {
		return None;
	}

	listing.dirs.iter().find_map(|(_, dir)| match list(dir) {
		Ok(sub_listing) => find_first(&sub_listing, depth - 1, matches),
		Err(e) => {
			warn!(?e, "Skipping unreadable subfolder");
			None
		}
	})
}

/// Picks the representative of a folder. Blocking.
///
/// Precedence: images directly inside the folder, then images in subfolders (down to
/// `max_depth` levels), then the first archive directly inside the folder, then archives
/// in subfolders.
#[instrument(skip_all, fields(path = %path.display(), max_depth))]
pub fn scan(path: &Path, max_depth: usize) -> Result<FolderScan, FileIOError> {
	let listing = list(path)?;
	let child_count = (listing.files.len() + listing.dirs.len()) as u64;

	let pick = find_first(&listing, max_depth, is_image)
		.map(FolderPick::Image)
		.or_else(|| find_first(&listing, max_depth, is_archive).map(FolderPick::Archive));

	trace!(?pick, child_count, "Scanned folder");

	Ok(FolderScan { pick, child_count })
}
