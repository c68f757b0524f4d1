use std::{
	io,
	path::{Path, PathBuf},
	process::Stdio,
	time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{instrument, trace};

use crate::thumbnail::error::ThumbnailerError;

pub const VIDEO_EXTENSIONS: [&str; 11] = [
	"mp4", "mkv", "avi", "mov", "flv", "webm", "wmv", "m4v", "mpg", "mpeg", "3gp",
];

#[must_use]
pub fn is_video_extension(extension: &str) -> bool {
	VIDEO_EXTENSIONS.contains(&extension)
}

/// Produces a single still frame of a video, as encoded image bytes (PNG, JPEG, ...)
#[async_trait]
pub trait FrameExtractor: Send + Sync + 'static {
	async fn extract_frame(
		&self,
		path: &Path,
		timestamp: Duration,
	) -> Result<Vec<u8>, ThumbnailerError>;
}

/// Parses a video selector: seconds, optionally written as `t=<seconds>`
pub fn parse_timestamp(selector: &str) -> Result<Duration, ThumbnailerError> {
	let raw = selector.strip_prefix("t=").unwrap_or(selector).trim();

	raw.parse::<f64>()
		.ok()
		.filter(|secs| secs.is_finite() && *secs >= 0.0)
		.map(Duration::from_secs_f64)
		.ok_or_else(|| ThumbnailerError::InvalidSelector(selector.to_string()))
}

/// Shells out to the `ffprobe` and `ffmpeg` binaries
#[derive(Debug, Clone)]
pub struct FfmpegFrameExtractor {
	ffmpeg: PathBuf,
	ffprobe: PathBuf,
}

impl Default for FfmpegFrameExtractor {
	fn default() -> Self {
		Self {
			ffmpeg: PathBuf::from("ffmpeg"),
			ffprobe: PathBuf::from("ffprobe"),
		}
	}
}

impl FfmpegFrameExtractor {
	pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
		Self {
			ffmpeg: ffmpeg.into(),
			ffprobe: ffprobe.into(),
		}
	}

	async fn duration(&self, path: &Path) -> Result<Duration, ThumbnailerError> {
		let output = Command::new(&self.ffprobe)
			.args([
				"-v",
				"error",
				"-show_entries",
				"format=duration",
				"-of",
				"default=noprint_wrappers=1:nokey=1",
			])
			.arg(path)
			.stdin(Stdio::null())
			.kill_on_drop(true)
			.output()
			.await
			.map_err(|e| spawn_error(path, e))?;

		if !output.status.success() {
			return Err(ThumbnailerError::FrameExtraction {
				path: path.into(),
				reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}

		let raw = String::from_utf8_lossy(&output.stdout);
		raw.trim()
			.parse::<f64>()
			.ok()
			.filter(|secs| secs.is_finite() && *secs >= 0.0)
			.map(Duration::from_secs_f64)
			.ok_or_else(|| ThumbnailerError::FrameExtraction {
				path: path.into(),
				reason: format!("unreadable duration: '{}'", raw.trim()),
			})
	}
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
	#[instrument(skip(self, path), fields(path = %path.display()))]
	async fn extract_frame(
		&self,
		path: &Path,
		timestamp: Duration,
	) -> Result<Vec<u8>, ThumbnailerError> {
		let duration = self.duration(path).await?;
		if timestamp > duration {
			return Err(ThumbnailerError::FrameOutOfRange {
				path: path.into(),
				timestamp,
				duration,
			});
		}

		// Seeking before the input is much faster and is frame accurate on modern ffmpeg
		let output = Command::new(&self.ffmpeg)
			.args(["-v", "error", "-ss", &format!("{:.3}", timestamp.as_secs_f64()), "-i"])
			.arg(path)
			.args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "-"])
			.stdin(Stdio::null())
			.kill_on_drop(true)
			.output()
			.await
			.map_err(|e| spawn_error(path, e))?;

		if !output.status.success() || output.stdout.is_empty() {
			return Err(ThumbnailerError::FrameExtraction {
				path: path.into(),
				reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}

		trace!(len = output.stdout.len(), "Extracted video frame");

		Ok(output.stdout)
	}
}

fn spawn_error(path: &Path, e: io::Error) -> ThumbnailerError {
	if e.kind() == io::ErrorKind::NotFound {
		ThumbnailerError::FfmpegUnavailable(e)
	} else {
		ThumbnailerError::FrameExtraction {
			path: path.into(),
			reason: format!("failed to spawn: {e}"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::thumbnail::error::ErrorKind;

	#[test]
	fn selector_parsing() {
		assert_eq!(parse_timestamp("12.5").unwrap(), Duration::from_millis(12_500));
		assert_eq!(parse_timestamp("t=3").unwrap(), Duration::from_secs(3));
		assert!(parse_timestamp("-1").is_err());
		assert!(parse_timestamp("soon").is_err());
	}

	#[tokio::test]
	async fn missing_binary_is_unsupported() {
		let extractor = FfmpegFrameExtractor::new(
			"/definitely/not/here/ffmpeg",
			"/definitely/not/here/ffprobe",
		);
		let err = extractor
			.extract_frame(Path::new("/tmp/video.mp4"), Duration::from_secs(1))
			.await
			.unwrap_err();

		assert_eq!(err.kind(), ErrorKind::Unsupported);
	}
}
