//! Fixtures shared by the integration tests

#![allow(dead_code)]

use sd_core::{
	thumbnail::{FrameExtractor, PoolConfig},
	ThumbnailEvent, ThumbnailerConfig, ThumbnailerError,
};

use sd_utils::error::FileIOError;

use std::{
	io::{self, Cursor, Write},
	path::Path,
	sync::atomic::{AtomicUsize, Ordering},
	time::Duration,
};

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use tokio::{
	sync::{broadcast, Notify},
	time::{sleep, timeout},
};
use zip::{write::SimpleFileOptions, ZipWriter};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn test_config(data_dir: &Path) -> ThumbnailerConfig {
	let mut config = ThumbnailerConfig::new(data_dir);
	config.adaptive_tick = Duration::from_millis(100);
	config.retry_backoff = Duration::from_millis(10);
	config
}

/// Both pools down to a single slot
pub fn saturated_config(data_dir: &Path) -> ThumbnailerConfig {
	let mut config = test_config(data_dir);
	config.scan_pool = PoolConfig::fixed(1);
	config.decode_pool = PoolConfig::fixed(1);
	config
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
	let image = RgbImage::from_fn(width, height, |x, y| {
		Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
	});

	let mut bytes = Cursor::new(Vec::new());
	image
		.write_to(&mut bytes, ImageFormat::Png)
		.expect("in memory encoding can't fail");
	bytes.into_inner()
}

pub fn write_png(path: &Path, width: u32, height: u32) {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).unwrap();
	}
	std::fs::write(path, png_bytes(width, height)).unwrap();
}

/// Writes a zip archive with the given entries, in that order
pub fn write_zip(path: &Path, entries: &[(&str, Vec<u8>)]) {
	let mut zip = ZipWriter::new(std::fs::File::create(path).unwrap());
	for (name, data) in entries {
		zip.start_file(*name, SimpleFileOptions::default()).unwrap();
		zip.write_all(data).unwrap();
	}
	zip.finish().unwrap();
}

pub async fn next_event(events: &mut broadcast::Receiver<ThumbnailEvent>) -> ThumbnailEvent {
	timeout(EVENT_TIMEOUT, events.recv())
		.await
		.expect("timed out waiting for a thumbnail event")
		.expect("event channel closed")
}

/// Asserts nothing is delivered for a while
pub async fn assert_silent(events: &mut broadcast::Receiver<ThumbnailEvent>, wait: Duration) {
	if let Ok(event) = timeout(wait, events.recv()).await {
		panic!("unexpected thumbnail event: {event:?}");
	}
}

/// Frame extractor that holds every frame until [`GatedExtractor::open`] is called
#[derive(Debug, Default)]
pub struct GatedExtractor {
	started: Notify,
	gate: Notify,
}

impl GatedExtractor {
	pub async fn wait_started(&self) {
		timeout(EVENT_TIMEOUT, self.started.notified())
			.await
			.expect("frame extraction never started");
	}

	pub fn open(&self) {
		self.gate.notify_one();
	}
}

#[async_trait]
impl FrameExtractor for GatedExtractor {
	async fn extract_frame(
		&self,
		_path: &Path,
		_timestamp: Duration,
	) -> Result<Vec<u8>, ThumbnailerError> {
		self.started.notify_one();
		self.gate.notified().await;
		Ok(png_bytes(320, 180))
	}
}

/// Frame extractor failing with a transient IO error for its first `failures` calls
#[derive(Debug)]
pub struct FlakyExtractor {
	failures: usize,
	attempts: AtomicUsize,
}

impl FlakyExtractor {
	pub const fn new(failures: usize) -> Self {
		Self {
			failures,
			attempts: AtomicUsize::new(0),
		}
	}

	pub fn attempts(&self) -> usize {
		self.attempts.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl FrameExtractor for FlakyExtractor {
	async fn extract_frame(
		&self,
		path: &Path,
		_timestamp: Duration,
	) -> Result<Vec<u8>, ThumbnailerError> {
		if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
			return Err(FileIOError::from((path, io::Error::from(io::ErrorKind::WouldBlock))).into());
		}
		Ok(png_bytes(320, 180))
	}
}

/// Frame extractor that never finishes within `stall`
#[derive(Debug)]
pub struct StallingExtractor {
	stall: Duration,
	attempts: AtomicUsize,
}

impl StallingExtractor {
	pub const fn new(stall: Duration) -> Self {
		Self {
			stall,
			attempts: AtomicUsize::new(0),
		}
	}

	pub fn attempts(&self) -> usize {
		self.attempts.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl FrameExtractor for StallingExtractor {
	async fn extract_frame(
		&self,
		_path: &Path,
		_timestamp: Duration,
	) -> Result<Vec<u8>, ThumbnailerError> {
		self.attempts.fetch_add(1, Ordering::SeqCst);
		sleep(self.stall).await;
		Ok(png_bytes(320, 180))
	}
}
