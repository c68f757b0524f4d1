use std::{io::Read, path::Path};

use sevenz_rust::SevenZReader;

use crate::thumbnail::error::ThumbnailerError;

use super::{check_entry_size, ArchiveFormat};

fn seven_zip_error(path: &Path, e: &sevenz_rust::Error) -> ThumbnailerError {
	ThumbnailerError::ArchiveFormat {
		path: path.into(),
		format: ArchiveFormat::SevenZip.name(),
		reason: e.to_string(),
	}
}

pub(super) fn entry_names(path: &Path) -> Result<Vec<String>, ThumbnailerError> {
	let reader = SevenZReader::open(path, "".into()).map_err(|e| seven_zip_error(path, &e))?;

	Ok(reader
		.archive()
		.files
		.iter()
		.filter(|file| !file.is_directory())
		.map(|file| file.name().replace('\\', "/"))
		.collect())
}

/// Solid archives have to be decompressed up to the entry, so entries are walked in order
/// and everything but `entry` is skipped
pub(super) fn read_entry(
	path: &Path,
	entry: &str,
	max_bytes: u64,
) -> Result<Vec<u8>, ThumbnailerError> {
	let mut reader =
		SevenZReader::open(path, "".into()).map_err(|e| seven_zip_error(path, &e))?;

	let size = reader
		.archive()
		.files
		.iter()
		.find(|file| !file.is_directory() && file.name().replace('\\', "/") == entry)
		.map(|file| file.size())
		.ok_or_else(|| ThumbnailerError::EntryNotFound {
			archive: path.into(),
			entry: entry.to_string(),
		})?;

	check_entry_size(path, entry, size, max_bytes)?;

	let mut data = None;
	reader
		.for_each_entries(|file, stream| {
			if file.is_directory() || file.name().replace('\\', "/") != entry {
				return Ok(true);
			}

			let mut buf = Vec::with_capacity(usize::try_from(size).unwrap_or_default());
			stream.read_to_end(&mut buf)?;
			data = Some(buf);

			Ok(false)
		})
		.map_err(|e| seven_zip_error(path, &e))?;

	data.ok_or_else(|| ThumbnailerError::EntryNotFound {
		archive: path.into(),
		entry: entry.to_string(),
	})
}
