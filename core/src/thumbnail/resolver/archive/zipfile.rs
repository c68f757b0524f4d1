use sd_utils::error::FileIOError;

use std::{
	fs::File,
	io::{BufReader, Read},
	path::Path,
};

use zip::{result::ZipError, ZipArchive};

use crate::thumbnail::error::ThumbnailerError;

use super::check_entry_size;

fn open(path: &Path) -> Result<ZipArchive<BufReader<File>>, ThumbnailerError> {
	let file = File::open(path).map_err(|e| FileIOError::from((path, e, "Failed to open archive")))?;

	ZipArchive::new(BufReader::new(file)).map_err(|source| archive_error(path, source))
}

pub(super) fn entry_names(path: &Path) -> Result<Vec<String>, ThumbnailerError> {
	Ok(open(path)?
		.file_names()
		.filter(|name| !name.ends_with('/'))
		.map(ToString::to_string)
		.collect())
}

pub(super) fn read_entry(
	path: &Path,
	entry: &str,
	max_bytes: u64,
) -> Result<Vec<u8>, ThumbnailerError> {
	let mut archive = open(path)?;

	let mut file = archive.by_name(entry).map_err(|source| match source {
		ZipError::FileNotFound => ThumbnailerError::EntryNotFound {
			archive: path.into(),
			entry: entry.to_string(),
		},
		source => archive_error(path, source),
	})?;

	let size = file.size();
	check_entry_size(path, entry, size, max_bytes)?;

	let mut data = Vec::with_capacity(usize::try_from(size).unwrap_or_default());
	// Checksum mismatches surface here as `InvalidData`
	file.read_to_end(&mut data).map_err(|e| {
		FileIOError::from((path, e, format!("Failed to extract entry '{entry}'")))
	})?;

	Ok(data)
}

fn archive_error(path: &Path, source: ZipError) -> ThumbnailerError {
	ThumbnailerError::Archive {
		path: path.into(),
		source,
	}
}
