//! End to end tests of the thumbnail pipeline: admission, scheduling, resolution,
//! encoding and both caches.

mod helpers;

use helpers::*;

use sd_core::{
	thumbnail::{FrameExtractor, OutputFormat},
	ContentKey, ErrorKind, Outcome, SourceId, Thumbnailer, ThumbnailerError, Tier,
};

use std::{
	collections::HashMap,
	fs::File,
	io::Write,
	sync::Arc,
	time::{Duration, SystemTime},
};

use tempfile::TempDir;
use tokio::time::{sleep, Instant};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn thumbnailer(data_dir: &TempDir) -> Result<Thumbnailer, ThumbnailerError> {
	Thumbnailer::new(test_config(data_dir.path())).await
}

#[tokio::test]
async fn large_image_is_scaled_to_bounding_box() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let path = sources.path().join("huge.png");
	write_png(&path, 4000, 3000);

	let thumbnailer = thumbnailer(&data_dir).await?;
	let mut events = thumbnailer.subscribe();
	let key = ContentKey::new(&path);

	let admission = thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	assert_eq!(admission.enqueued, 1);

	let event = next_event(&mut events).await;
	assert_eq!(event.key, key);
	let artifact = event.artifact().expect("thumbnail was generated").clone();
	assert_eq!((artifact.width, artifact.height), (256, 192));
	assert_eq!(artifact.format, OutputFormat::Webp);

	// Served from memory from now on
	let admission = thumbnailer
		.submit_visible([key.clone()], Tier::Normal)
		.await?;
	assert_eq!(admission.cached, 1);
	assert_eq!(next_event(&mut events).await.artifact(), Some(&artifact));

	assert_eq!(thumbnailer.get_cached(&key).await?, Some(artifact));
	assert!(thumbnailer.get_metrics().memory_hits >= 2);

	Ok(())
}

#[tokio::test]
async fn small_images_are_not_upscaled() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let path = sources.path().join("tiny.png");
	write_png(&path, 40, 30);

	let thumbnailer = thumbnailer(&data_dir).await?;
	let mut events = thumbnailer.subscribe();
	thumbnailer
		.submit_visible([ContentKey::new(&path)], Tier::High)
		.await?;

	let event = next_event(&mut events).await;
	let artifact = event.artifact().expect("thumbnail was generated");
	assert_eq!((artifact.width, artifact.height), (40, 30));

	Ok(())
}

#[tokio::test]
async fn durable_cache_survives_restart() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let path = sources.path().join("photo.png");
	write_png(&path, 512, 256);
	let key = ContentKey::new(&path);

	{
		let thumbnailer = thumbnailer(&data_dir).await?;
		let mut events = thumbnailer.subscribe();
		thumbnailer
			.submit_visible([key.clone()], Tier::Immediate)
			.await?;
		assert!(next_event(&mut events).await.artifact().is_some());
		thumbnailer.shutdown();
	}

	let thumbnailer = thumbnailer(&data_dir).await?;
	let mut events = thumbnailer.subscribe();

	let admission = thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	assert_eq!(admission.cached, 1);
	assert_eq!(admission.enqueued, 0);

	let artifact = next_event(&mut events).await;
	assert_eq!(
		artifact.artifact().map(|artifact| (artifact.width, artifact.height)),
		Some((256, 128))
	);
	assert_eq!(thumbnailer.get_metrics().durable_hits, 1);

	let stats = thumbnailer.store_stats().await?;
	assert_eq!(stats.rows, 1);
	assert_eq!(stats.negative_rows, 0);

	Ok(())
}

#[tokio::test]
async fn duplicate_submissions_run_once() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let path = sources.path().join("dup.png");
	write_png(&path, 64, 64);
	let key = ContentKey::new(&path);

	let thumbnailer = thumbnailer(&data_dir).await?;
	let mut events = thumbnailer.subscribe();
	thumbnailer.pause();
	assert!(thumbnailer.is_paused());

	let first = thumbnailer
		.submit_visible([key.clone(), key.clone()], Tier::Normal)
		.await?;
	assert_eq!((first.enqueued, first.merged), (1, 0));

	let second = thumbnailer
		.submit_visible([key.clone()], Tier::High)
		.await?;
	assert_eq!((second.enqueued, second.merged), (0, 1));

	assert_eq!(thumbnailer.queued(), [(key.clone(), Tier::High)]);

	thumbnailer.resume();
	assert!(!thumbnailer.is_paused());
	assert_eq!(next_event(&mut events).await.key, key);
	assert_silent(&mut events, Duration::from_millis(500)).await;
	assert_eq!(thumbnailer.get_metrics().completed, 1);

	Ok(())
}

#[tokio::test]
async fn cancelled_source_results_are_dropped_but_kept() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let path = sources.path().join("clip.mp4");
	std::fs::write(&path, b"not decoded, the extractor is a fake")?;
	let key = ContentKey::new(&path);

	let extractor = Arc::new(GatedExtractor::default());
	let thumbnailer = Thumbnailer::with_frame_extractor(
		test_config(data_dir.path()),
		Arc::clone(&extractor) as Arc<dyn FrameExtractor>,
	)
	.await?;
	let mut events = thumbnailer.subscribe();

	thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	extractor.wait_started().await;

	thumbnailer.cancel_for_source(&key.source_id());
	extractor.open();

	assert_silent(&mut events, Duration::from_millis(500)).await;

	// The result still lands in the caches
	let deadline = Instant::now() + EVENT_TIMEOUT;
	let artifact = loop {
		if let Some(artifact) = thumbnailer.get_cached(&key).await? {
			break artifact;
		}
		assert!(Instant::now() < deadline, "cancelled result was never cached");
		sleep(Duration::from_millis(50)).await;
	};
	assert_eq!((artifact.width, artifact.height), (256, 144));
	assert!(thumbnailer.get_metrics().cancelled >= 1);

	Ok(())
}

#[tokio::test]
async fn changed_source_is_not_served_from_cache() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let path = sources.path().join("edited.png");
	write_png(&path, 64, 32);
	let key = ContentKey::new(&path);

	let thumbnailer = thumbnailer(&data_dir).await?;
	let mut events = thumbnailer.subscribe();

	thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	let first = next_event(&mut events).await;
	assert_eq!(
		first.artifact().map(|artifact| (artifact.width, artifact.height)),
		Some((64, 32))
	);

	write_png(&path, 32, 64);
	File::options()
		.write(true)
		.open(&path)?
		.set_modified(SystemTime::now() + Duration::from_secs(10))?;

	assert_eq!(thumbnailer.get_cached(&key).await?, None);

	let admission = thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	assert_eq!((admission.cached, admission.enqueued), (0, 1));

	let second = next_event(&mut events).await;
	assert_eq!(
		second.artifact().map(|artifact| (artifact.width, artifact.height)),
		Some((32, 64))
	);

	Ok(())
}

#[tokio::test]
async fn immediate_requests_finish_before_normal_ones() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;

	let normal = (0..30)
		.map(|i| {
			let path = sources.path().join(format!("normal_{i:02}.png"));
			write_png(&path, 300, 200);
			ContentKey::new(path)
		})
		.collect::<Vec<_>>();
	let immediate = (0..5)
		.map(|i| {
			let path = sources.path().join(format!("immediate_{i}.png"));
			write_png(&path, 300, 200);
			ContentKey::new(path)
		})
		.collect::<Vec<_>>();

	let thumbnailer = Thumbnailer::new(saturated_config(data_dir.path())).await?;
	let mut events = thumbnailer.subscribe();

	thumbnailer.pause();
	thumbnailer.submit_visible(normal.clone(), Tier::Normal).await?;
	thumbnailer
		.submit_visible(immediate.clone(), Tier::Immediate)
		.await?;

	let started = Instant::now();
	thumbnailer.resume();

	let mut latencies = HashMap::new();
	while latencies.len() < normal.len() + immediate.len() {
		let event = next_event(&mut events).await;
		assert!(matches!(event.outcome, Outcome::Ready(_)));
		latencies.insert(event.key, started.elapsed());
	}

	let mean = |keys: &[ContentKey]| {
		keys.iter().map(|key| latencies[key]).sum::<Duration>() / keys.len() as u32
	};
	assert!(mean(&immediate) < mean(&normal));

	Ok(())
}

#[tokio::test]
async fn folder_prefers_subfolder_image_over_archive() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let folder = sources.path().join("series");

	write_png(&folder.join("extras").join("landscape.png"), 80, 40);
	let pages = (1..=5)
		.map(|i| (format!("page{i}.png"), png_bytes(40, 80)))
		.collect::<Vec<_>>();
	write_zip(
		&folder.join("volume.cbz"),
		&pages
			.iter()
			.map(|(name, data)| (name.as_str(), data.clone()))
			.collect::<Vec<_>>(),
	);

	let thumbnailer = thumbnailer(&data_dir).await?;
	let mut events = thumbnailer.subscribe();
	let key = ContentKey::new(&folder);

	thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;

	let event = next_event(&mut events).await;
	assert_eq!(event.key, key);
	assert_eq!(
		event.artifact().map(|artifact| (artifact.width, artifact.height)),
		Some((80, 40))
	);

	assert_eq!(thumbnailer.store_stats().await?.containers, 1);

	Ok(())
}

#[tokio::test]
async fn corrupt_first_archive_entry_is_cached_as_failure() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let archive = sources.path().join("broken.cbz");
	write_zip(
		&archive,
		&[
			("page10.png", png_bytes(20, 20)),
			("page2.png", png_bytes(20, 20)),
			("page1.png", b"\x89PNG\r\n\x1a\nthis is not a png".to_vec()),
		],
	);
	let key = ContentKey::new(&archive);

	let thumbnailer = thumbnailer(&data_dir).await?;
	let mut events = thumbnailer.subscribe();

	thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	let event = next_event(&mut events).await;
	assert_eq!(event.outcome, Outcome::Unavailable(ErrorKind::Corrupt));

	let admission = thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	assert_eq!(admission.known_failures, 1);
	assert_eq!(admission.enqueued, 0);
	assert_eq!(
		next_event(&mut events).await.outcome,
		Outcome::Unavailable(ErrorKind::Corrupt)
	);

	assert_eq!(thumbnailer.get_error_stats()[&ErrorKind::Corrupt], 1);
	assert_eq!(thumbnailer.store_stats().await?.negative_rows, 1);

	// Failed entries can be cleared to try again
	assert_eq!(thumbnailer.clear_failed().await?, 1);
	let admission = thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	assert_eq!(admission.enqueued, 1);

	Ok(())
}

#[tokio::test]
async fn stored_entry_with_bad_checksum_fails_without_retrying() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let archive = sources.path().join("flipped.cbz");
	let page = png_bytes(40, 40);

	let mut zip = ZipWriter::new(File::create(&archive)?);
	zip.start_file(
		"page1.png",
		SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
	)?;
	zip.write_all(&page)?;
	zip.finish()?;

	// Same length, so only the CRC check can notice
	let mut bytes = std::fs::read(&archive)?;
	let at = bytes
		.windows(page.len())
		.position(|window| window == page)
		.ok_or("page payload not found in archive")?;
	let last = at + page.len() - 1;
	bytes[last] ^= 0xFF;
	std::fs::write(&archive, bytes)?;
	let key = ContentKey::new(&archive);

	// Any retry would push the event past the wait below
	let mut config = test_config(data_dir.path());
	config.retry_backoff = Duration::from_secs(60);
	let thumbnailer = Thumbnailer::new(config).await?;
	let mut events = thumbnailer.subscribe();

	thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	let event = tokio::time::timeout(Duration::from_secs(10), events.recv()).await??;
	assert_eq!(event.outcome, Outcome::Unavailable(ErrorKind::Corrupt));

	assert_eq!(thumbnailer.get_error_stats()[&ErrorKind::Corrupt], 1);
	assert!(!thumbnailer
		.get_error_stats()
		.contains_key(&ErrorKind::TransientIo));
	assert_eq!(thumbnailer.store_stats().await?.negative_rows, 1);

	Ok(())
}

async fn flaky_video(
	data_dir: &TempDir,
	sources: &TempDir,
	extractor: Arc<dyn FrameExtractor>,
) -> Result<(Thumbnailer, ContentKey), Box<dyn std::error::Error>> {
	let path = sources.path().join("clip.mp4");
	std::fs::write(&path, b"not decoded, the extractor is a fake")?;

	let mut config = test_config(data_dir.path());
	config.max_attempts = 3;
	config.retry_backoff = Duration::from_millis(5);
	config.task_timeout = Duration::from_millis(200);

	let thumbnailer = Thumbnailer::with_frame_extractor(config, extractor).await?;
	Ok((thumbnailer, ContentKey::new(&path)))
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let extractor = Arc::new(FlakyExtractor::new(2));
	let (thumbnailer, key) = flaky_video(
		&data_dir,
		&sources,
		Arc::clone(&extractor) as Arc<dyn FrameExtractor>,
	)
	.await?;
	let mut events = thumbnailer.subscribe();

	thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	let event = next_event(&mut events).await;
	assert_eq!(
		event.artifact().map(|artifact| (artifact.width, artifact.height)),
		Some((256, 144))
	);
	assert_eq!(extractor.attempts(), 3);
	assert_eq!(thumbnailer.store_stats().await?.negative_rows, 0);

	Ok(())
}

#[tokio::test]
async fn exhausted_retries_are_remembered_as_failures() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let extractor = Arc::new(FlakyExtractor::new(10));
	let (thumbnailer, key) = flaky_video(
		&data_dir,
		&sources,
		Arc::clone(&extractor) as Arc<dyn FrameExtractor>,
	)
	.await?;
	let mut events = thumbnailer.subscribe();

	thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	assert_eq!(
		next_event(&mut events).await.outcome,
		Outcome::Unavailable(ErrorKind::TransientIo)
	);
	assert_eq!(extractor.attempts(), 3);
	assert_eq!(thumbnailer.get_error_stats()[&ErrorKind::TransientIo], 1);

	// The negative entry answers the next submission without running the extractor
	let admission = thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	assert_eq!((admission.known_failures, admission.enqueued), (1, 0));
	assert_eq!(
		next_event(&mut events).await.outcome,
		Outcome::Unavailable(ErrorKind::TransientIo)
	);
	assert_silent(&mut events, Duration::from_millis(300)).await;
	assert_eq!(extractor.attempts(), 3);

	Ok(())
}

#[tokio::test]
async fn stalled_extraction_times_out_after_every_attempt() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let extractor = Arc::new(StallingExtractor::new(Duration::from_secs(60)));
	let (thumbnailer, key) = flaky_video(
		&data_dir,
		&sources,
		Arc::clone(&extractor) as Arc<dyn FrameExtractor>,
	)
	.await?;
	let mut events = thumbnailer.subscribe();

	let started = Instant::now();
	thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	assert_eq!(
		next_event(&mut events).await.outcome,
		Outcome::Unavailable(ErrorKind::Timeout)
	);
	assert!(started.elapsed() < Duration::from_secs(30));
	assert_eq!(extractor.attempts(), 3);
	assert_eq!(thumbnailer.get_error_stats()[&ErrorKind::Timeout], 1);
	assert_eq!(thumbnailer.store_stats().await?.negative_rows, 1);

	Ok(())
}

#[tokio::test]
async fn missing_source_is_unavailable() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let key = ContentKey::new(sources.path().join("gone.png"));

	let thumbnailer = thumbnailer(&data_dir).await?;
	let mut events = thumbnailer.subscribe();

	thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	assert_eq!(
		next_event(&mut events).await.outcome,
		Outcome::Unavailable(ErrorKind::Unsupported)
	);

	Ok(())
}

#[tokio::test]
async fn foreground_source_jumps_the_queue() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let album_a = sources.path().join("a");
	let album_b = sources.path().join("b");

	let thumbnailer = thumbnailer(&data_dir).await?;
	thumbnailer.pause();

	let a_keys = (0..200)
		.map(|i| ContentKey::new(album_a.join(format!("{i:03}.png"))))
		.collect::<Vec<_>>();
	thumbnailer.submit_visible(a_keys.clone(), Tier::Normal).await?;

	assert_eq!(
		thumbnailer.set_foreground_source(SourceId::new(&album_a)),
		200
	);

	let b_keys = (0..10)
		.map(|i| ContentKey::new(album_b.join(format!("{i:03}.png"))))
		.collect::<Vec<_>>();
	thumbnailer.submit_visible(b_keys.clone(), Tier::Normal).await?;

	let queued = thumbnailer.queued();
	assert_eq!(queued.len(), 210);

	let (ahead, behind) = queued.split_at(200);
	assert!(ahead.iter().all(|(_, tier)| *tier == Tier::High));
	assert_eq!(
		ahead.iter().map(|(key, _)| key.clone()).collect::<Vec<_>>(),
		a_keys
	);
	assert_eq!(
		behind.iter().map(|(key, _)| key.clone()).collect::<Vec<_>>(),
		b_keys
	);

	Ok(())
}

#[tokio::test]
async fn background_submissions_wait_for_their_delay() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let path = sources.path().join("later.png");
	write_png(&path, 32, 32);
	let key = ContentKey::new(&path);

	let thumbnailer = thumbnailer(&data_dir).await?;
	let mut events = thumbnailer.subscribe();

	thumbnailer
		.submit_background([key.clone()], Duration::from_millis(400))
		.await?;
	assert_eq!(thumbnailer.get_metrics().delayed, 1);
	assert_silent(&mut events, Duration::from_millis(200)).await;

	assert_eq!(next_event(&mut events).await.key, key);

	Ok(())
}

#[tokio::test]
async fn regenerate_bypasses_the_cache() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let path = sources.path().join("again.png");
	write_png(&path, 32, 32);
	let key = ContentKey::new(&path);

	let thumbnailer = thumbnailer(&data_dir).await?;
	let mut events = thumbnailer.subscribe();

	thumbnailer
		.submit_visible([key.clone()], Tier::Immediate)
		.await?;
	next_event(&mut events).await;

	thumbnailer.regenerate(key.clone())?;
	assert!(next_event(&mut events).await.artifact().is_some());
	assert_eq!(thumbnailer.get_metrics().completed, 2);

	Ok(())
}

#[tokio::test]
async fn maintenance_api_clears_caches() -> TestResult {
	let data_dir = TempDir::new()?;
	let sources = TempDir::new()?;
	let kept = sources.path().join("kept").join("a.png");
	let cleared = sources.path().join("cleared").join("b.png");
	write_png(&kept, 32, 32);
	write_png(&cleared, 48, 32);

	let thumbnailer = thumbnailer(&data_dir).await?;
	let mut events = thumbnailer.subscribe();

	thumbnailer
		.submit_visible([ContentKey::new(&kept), ContentKey::new(&cleared)], Tier::High)
		.await?;
	next_event(&mut events).await;
	next_event(&mut events).await;

	assert_eq!(
		thumbnailer
			.clear_by_path_prefix(sources.path().join("cleared"))
			.await?,
		1
	);
	assert!(thumbnailer.get_cached(&ContentKey::new(&cleared)).await?.is_none());
	assert!(thumbnailer.get_cached(&ContentKey::new(&kept)).await?.is_some());

	// Nothing is old enough to expire
	assert_eq!(thumbnailer.clear_expired(1).await?, 0);

	std::fs::remove_file(&kept)?;
	assert_eq!(thumbnailer.revalidate(sources.path()).await?, 1);
	assert_eq!(thumbnailer.store_stats().await?.rows, 0);

	Ok(())
}

#[tokio::test]
async fn shutdown_refuses_new_work() -> TestResult {
	let data_dir = TempDir::new()?;
	let thumbnailer = thumbnailer(&data_dir).await?;

	thumbnailer.shutdown();

	let result = thumbnailer
		.submit_visible([ContentKey::new(data_dir.path().join("x.png"))], Tier::Normal)
		.await;
	assert!(matches!(result, Err(ThumbnailerError::Shutdown)));

	Ok(())
}
