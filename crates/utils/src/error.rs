use std::{fmt::Display, io, path::Path};

use thiserror::Error;

/// File I/O error that includes the path that caused the error
#[derive(Error, Debug)]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: io::Error,
	pub maybe_context: Option<String>,
}

impl Display for FileIOError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"file I/O error{}: {}; path: '{}'",
			self.maybe_context
				.as_ref()
				.map(|ctx| format!(" ({ctx})"))
				.unwrap_or_default(),
			self.source,
			self.path.display()
		)
	}
}

impl FileIOError {
	pub fn from_std_io_err(path: impl AsRef<Path>, source: io::Error) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: None,
		}
	}

	pub fn from_std_io_err_with_msg(
		path: impl AsRef<Path>,
		source: io::Error,
		msg: impl Into<String>,
	) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: Some(msg.into()),
		}
	}

	/// The [`io::ErrorKind`] of the wrapped error, used to classify failures as retryable or not
	#[must_use]
	pub fn kind(&self) -> io::ErrorKind {
		self.source.kind()
	}
}

impl<P: AsRef<Path>> From<(P, io::Error)> for FileIOError {
	fn from((path, source): (P, io::Error)) -> Self {
		Self::from_std_io_err(path, source)
	}
}

impl<P: AsRef<Path>, M: Into<String>> From<(P, io::Error, M)> for FileIOError {
	fn from((path, source, msg): (P, io::Error, M)) -> Self {
		Self::from_std_io_err_with_msg(path, source, msg)
	}
}

/// Error for paths that contain non-UTF8 characters
#[derive(Error, Debug)]
#[error("Received a non UTF-8 path: <path='{0:?}'>")]
pub struct NonUtf8PathError(pub Box<Path>);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn display_includes_path_and_context() {
		let err = FileIOError::from((
			"/tmp/thumbnails/abc/abcdef.webp",
			io::Error::new(io::ErrorKind::NotFound, "gone"),
			"reading artifact",
		));

		let msg = err.to_string();
		assert!(msg.contains("(reading artifact)"));
		assert!(msg.contains("abcdef.webp"));
		assert_eq!(err.kind(), io::ErrorKind::NotFound);
	}

	#[test]
	fn display_without_context() {
		let err = FileIOError::from(("a.zip", io::Error::other("busy")));
		assert_eq!(err.to_string(), "file I/O error: busy; path: 'a.zip'");
	}
}
