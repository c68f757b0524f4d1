use sd_utils::error::{FileIOError, NonUtf8PathError};

use std::{fmt, io, path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::ConfigError;

/// What callers get to know about a failure.
///
/// Transient kinds are retried internally and only surface once retries are exhausted,
/// permanent kinds are negative cached until the source changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
	TransientIo,
	Unsupported,
	Corrupt,
	Empty,
	Timeout,
	Cancelled,
}

impl ErrorKind {
	#[must_use]
	pub const fn is_transient(self) -> bool {
		matches!(self, Self::TransientIo | Self::Timeout)
	}

	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::TransientIo => "transient_io",
			Self::Unsupported => "unsupported",
			Self::Corrupt => "corrupt",
			Self::Empty => "empty",
			Self::Timeout => "timeout",
			Self::Cancelled => "cancelled",
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Error)]
#[error("unknown error kind: {0}")]
pub struct UnknownErrorKind(String);

impl FromStr for ErrorKind {
	type Err = UnknownErrorKind;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"transient_io" => Ok(Self::TransientIo),
			"unsupported" => Ok(Self::Unsupported),
			"corrupt" => Ok(Self::Corrupt),
			"empty" => Ok(Self::Empty),
			"timeout" => Ok(Self::Timeout),
			"cancelled" => Ok(Self::Cancelled),
			other => Err(UnknownErrorKind(other.to_string())),
		}
	}
}

#[derive(Debug, Error)]
pub enum ThumbnailerError {
	// Internal errors
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error(transparent)]
	NonUtf8Path(#[from] NonUtf8PathError),
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("thumbnailer is shutting down")]
	Shutdown,

	// Resolution errors
	#[error("no thumbnail can be generated for <path='{}'>", .0.display())]
	UnsupportedSource(Box<Path>),
	#[error("archive format not supported: <path='{}'>", .0.display())]
	UnsupportedArchive(Box<Path>),
	#[error("source too large: <path='{}', size={size}, max={max}>", .path.display())]
	TooLarge { path: Box<Path>, size: u64, max: u64 },
	#[error("no image to represent <path='{}'>", .0.display())]
	Empty(Box<Path>),
	#[error("entry not found in archive: <archive='{}', entry='{entry}'>", .archive.display())]
	EntryNotFound { archive: Box<Path>, entry: String },
	#[error("failed to read archive <path='{}'>: {source}", .path.display())]
	Archive {
		path: Box<Path>,
		#[source]
		source: zip::result::ZipError,
	},
	#[error("failed to read {format} archive <path='{}'>: {reason}", .path.display())]
	ArchiveFormat {
		path: Box<Path>,
		format: &'static str,
		reason: String,
	},
	#[error("video frame at {timestamp:?} is past the end of <path='{}'> ({duration:?})", .path.display())]
	FrameOutOfRange {
		path: Box<Path>,
		timestamp: Duration,
		duration: Duration,
	},
	#[error("failed to extract a video frame from <path='{}'>: {reason}", .path.display())]
	FrameExtraction { path: Box<Path>, reason: String },
	#[error("ffmpeg is not available: {0}")]
	FfmpegUnavailable(io::Error),
	#[error("invalid video timestamp selector: {0}")]
	InvalidSelector(String),

	// Codec errors
	#[error("failed to decode image: {0}")]
	Decode(#[from] sd_images::Error),
	#[error("failed to encode WebP thumbnail: {0}")]
	WebPEncoding(String),
	#[error("failed to encode JPEG thumbnail: {0}")]
	JpegEncoding(#[source] image::ImageError),
	#[error("panic while generating thumbnail: {0}")]
	Panic(String),

	#[error("task took longer than {0:?}")]
	Timeout(Duration),
}

impl ThumbnailerError {
	/// Maps any internal failure onto the public taxonomy
	#[must_use]
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Database(_) => ErrorKind::TransientIo,
			Self::FileIO(e) => io_kind(e.kind()),
			Self::Archive { source, .. } => match source {
				zip::result::ZipError::Io(e) => io_kind(e.kind()),
				zip::result::ZipError::UnsupportedArchive(_) => ErrorKind::Unsupported,
				zip::result::ZipError::FileNotFound => ErrorKind::Empty,
				_ => ErrorKind::Corrupt,
			},

			Self::NonUtf8Path(_)
			| Self::Config(_)
			| Self::UnsupportedSource(_)
			| Self::UnsupportedArchive(_)
			| Self::TooLarge { .. }
			| Self::FfmpegUnavailable(_)
			| Self::InvalidSelector(_) => ErrorKind::Unsupported,

			Self::Empty(_) | Self::EntryNotFound { .. } | Self::FrameOutOfRange { .. } => {
				ErrorKind::Empty
			}

			Self::Decode(e) if e.is_unsupported() => ErrorKind::Unsupported,
			Self::Decode(_)
			| Self::ArchiveFormat { .. }
			| Self::FrameExtraction { .. }
			| Self::WebPEncoding(_)
			| Self::JpegEncoding(_)
			| Self::Panic(_) => ErrorKind::Corrupt,

			Self::Timeout(_) => ErrorKind::Timeout,
			Self::Shutdown => ErrorKind::Cancelled,
		}
	}
}

fn io_kind(kind: io::ErrorKind) -> ErrorKind {
	match kind {
		io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ErrorKind::Unsupported,
		io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => ErrorKind::Corrupt,
		_ => ErrorKind::TransientIo,
	}
}
