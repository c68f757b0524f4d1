use std::path::{Path, PathBuf};

/// The practice of dividing files into hex coded folders, often called "sharding,"
/// is mainly used to optimize file system performance. File systems can start to slow down
/// as the number of files in a directory increases. Thus, it's often beneficial to split
/// files into multiple directories to avoid this performance degradation.
///
/// `get_shard_hex` takes an artifact hash (hexadecimal) and returns its first three
/// characters as the directory name, giving us 4096 (16^3) possible directories,
/// named 000 to fff.
#[inline]
#[must_use]
pub fn get_shard_hex(hash: &str) -> &str {
	hash.get(0..3).unwrap_or(hash)
}

/// Where an artifact file named `file_name` (`<hash>.<ext>`) lives
#[must_use]
pub fn artifact_path(thumbnails_dir: &Path, file_name: &str) -> PathBuf {
	let mut path = thumbnails_dir.join(get_shard_hex(file_name));
	path.push(file_name);
	path
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn shards_by_hash_prefix() {
		assert_eq!(get_shard_hex("abcdef0123"), "abc");
		assert_eq!(
			artifact_path(Path::new("/data/thumbnails"), "abcdef.webp"),
			PathBuf::from("/data/thumbnails/abc/abcdef.webp")
		);
	}
}
