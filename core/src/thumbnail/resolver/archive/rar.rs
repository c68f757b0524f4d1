use std::{fmt::Debug, path::Path};

use unrar::Archive;

use crate::thumbnail::error::ThumbnailerError;

use super::{check_entry_size, ArchiveFormat};

fn rar_error(path: &Path, e: &impl Debug) -> ThumbnailerError {
	ThumbnailerError::ArchiveFormat {
		path: path.into(),
		format: ArchiveFormat::Rar.name(),
		reason: format!("{e:?}"),
	}
}

/// Entry names use `/` whatever the host that packed them
fn entry_name(filename: &Path) -> String {
	filename.to_string_lossy().replace('\\', "/")
}

pub(super) fn entry_names(path: &Path) -> Result<Vec<String>, ThumbnailerError> {
	let listing = Archive::new(path)
		.open_for_listing()
		.map_err(|e| rar_error(path, &e))?;

	let mut names = Vec::new();
	for header in listing {
		let header = header.map_err(|e| rar_error(path, &e))?;
		if !header.is_directory() {
			names.push(entry_name(&header.filename));
		}
	}

	Ok(names)
}

/// RAR can only be read front to back, entries before `entry` are skipped without unpacking
pub(super) fn read_entry(
	path: &Path,
	entry: &str,
	max_bytes: u64,
) -> Result<Vec<u8>, ThumbnailerError> {
	let mut archive = Archive::new(path)
		.open_for_processing()
		.map_err(|e| rar_error(path, &e))?;

	while let Some(header) = archive.read_header().map_err(|e| rar_error(path, &e))? {
		let (name, size) = {
			let file = header.entry();
			(
				entry_name(&file.filename),
				u64::try_from(file.unpacked_size).unwrap_or(u64::MAX),
			)
		};

		if name != entry {
			archive = header.skip().map_err(|e| rar_error(path, &e))?;
			continue;
		}

		check_entry_size(path, entry, size, max_bytes)?;
		let (data, _rest) = header.read().map_err(|e| rar_error(path, &e))?;

		return Ok(data);
	}

	Err(ThumbnailerError::EntryNotFound {
		archive: path.into(),
		entry: entry.to_string(),
	})
}
