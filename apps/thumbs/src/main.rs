use sd_core::{
	logging::init_logger, thumbnail::OutputFormat as ThumbnailFormat, ContentKey, Outcome,
	ThumbnailEvent, Thumbnailer, ThumbnailerConfig, Tier,
};

use std::{
	collections::HashSet,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::{sync::broadcast::error::RecvError, time::timeout};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
	Human,
	Json,
}

#[derive(Parser, Debug)]
#[command(name = "sd-thumbs", about = "Generate and manage cached thumbnails")]
struct Cli {
	/// Where the thumbnail index, artifacts and logs live
	#[arg(long, env = "SD_THUMBS_DATA_DIR", default_value = ".sd-thumbs")]
	data_dir: PathBuf,

	/// TOML config file, its `data_dir` is replaced by `--data-dir`
	#[arg(long)]
	config: Option<PathBuf>,

	/// Output format
	#[arg(long, value_enum, default_value = "human")]
	format: OutputFormat,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Generate thumbnails for files, or for every entry of folders
	Generate {
		#[arg(required = true)]
		paths: Vec<PathBuf>,
		/// Bounding box, in pixels
		#[arg(long)]
		size: Option<u32>,
		/// Encode as JPEG instead of WebP
		#[arg(long, default_value_t = false)]
		jpeg: bool,
		/// Give up waiting after this many seconds
		#[arg(long, default_value_t = 300)]
		timeout_secs: u64,
	},
	/// Cache statistics
	Stats,
	/// Reclaim orphaned artifact files and compact the index
	Vacuum,
	/// Drop entries older than the given number of days
	ClearExpired {
		#[arg(long)]
		days: u32,
	},
	/// Drop entries whose source path starts with a prefix
	ClearPrefix { prefix: PathBuf },
	/// Drop cached failures so their sources are tried again
	ClearFailed,
	/// Drop entries under a path whose source changed or is gone
	Revalidate { path: PathBuf },
}

#[derive(Debug, Default, Serialize)]
struct GenerateSummary {
	generated: usize,
	unavailable: usize,
	missing: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	let mut config = match &cli.config {
		Some(path) => ThumbnailerConfig::load(path)
			.with_context(|| format!("loading config from {}", path.display()))?,
		None => ThumbnailerConfig::default(),
	};
	config.data_dir = cli.data_dir.clone();

	let _guard = init_logger(&config.data_dir).context("initializing logger")?;

	match cli.command {
		Commands::Generate {
			paths,
			size,
			jpeg,
			timeout_secs,
		} => {
			if let Some(size) = size {
				config.bounding_box = size;
			}
			if jpeg {
				config.output_format = ThumbnailFormat::Jpeg;
			}

			let thumbnailer = Thumbnailer::new(config).await?;
			let summary =
				generate(&thumbnailer, &paths, Duration::from_secs(timeout_secs), cli.format)
					.await?;
			thumbnailer.shutdown();

			match cli.format {
				OutputFormat::Human => println!(
					"{} generated, {} without thumbnail, {} not finished",
					summary.generated, summary.unavailable, summary.missing
				),
				OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
			}
		}

		Commands::Stats => {
			let thumbnailer = Thumbnailer::new(config).await?;
			let stats = thumbnailer.store_stats().await?;
			match cli.format {
				OutputFormat::Human => {
					println!("Thumbnails:   {}", stats.rows);
					println!("Failures:     {}", stats.negative_rows);
					println!("Containers:   {}", stats.containers);
					println!("Artifact size {} bytes", stats.artifact_bytes);
					println!("Directory     {}", thumbnailer.thumbnails_dir().display());
				}
				OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
			}
		}

		Commands::Vacuum => {
			let thumbnailer = Thumbnailer::new(config).await?;
			let report = thumbnailer.vacuum().await?;
			match cli.format {
				OutputFormat::Human => println!(
					"Removed {} orphaned files and {} dangling entries, reclaimed {} bytes",
					report.orphan_files_removed,
					report.dangling_rows_removed,
					report.bytes_reclaimed
				),
				OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
			}
		}

		Commands::ClearExpired { days } => {
			let thumbnailer = Thumbnailer::new(config).await?;
			print_removed(cli.format, thumbnailer.clear_expired(days).await?)?;
		}

		Commands::ClearPrefix { prefix } => {
			let thumbnailer = Thumbnailer::new(config).await?;
			print_removed(cli.format, thumbnailer.clear_by_path_prefix(prefix).await?)?;
		}

		Commands::ClearFailed => {
			let thumbnailer = Thumbnailer::new(config).await?;
			print_removed(cli.format, thumbnailer.clear_failed().await?)?;
		}

		Commands::Revalidate { path } => {
			let thumbnailer = Thumbnailer::new(config).await?;
			print_removed(cli.format, thumbnailer.revalidate(path).await?)?;
		}
	}

	Ok(())
}

fn print_removed(format: OutputFormat, removed: u64) -> Result<()> {
	match format {
		OutputFormat::Human => println!("Removed {removed} entries"),
		OutputFormat::Json => println!("{}", serde_json::json!({ "removed": removed })),
	}
	Ok(())
}

/// Files are taken as they are, folders contribute each of their non hidden entries
fn collect_keys(paths: &[PathBuf]) -> Result<Vec<ContentKey>> {
	let mut keys = Vec::new();

	for path in paths {
		if !path.is_dir() {
			keys.push(ContentKey::new(path));
			continue;
		}

		let mut entries = std::fs::read_dir(path)
			.with_context(|| format!("reading {}", path.display()))?
			.filter_map(|entry| entry.ok().map(|entry| entry.path()))
			.filter(|entry| !is_hidden(entry))
			.collect::<Vec<_>>();
		entries.sort();

		keys.extend(entries.into_iter().map(ContentKey::new));
	}

	Ok(keys)
}

fn is_hidden(path: &Path) -> bool {
	path.file_name()
		.and_then(|name| name.to_str())
		.is_some_and(|name| name.starts_with('.'))
}

async fn generate(
	thumbnailer: &Thumbnailer,
	paths: &[PathBuf],
	wait: Duration,
	format: OutputFormat,
) -> Result<GenerateSummary> {
	let keys = collect_keys(paths)?;
	let mut pending = keys.iter().cloned().collect::<HashSet<_>>();
	let mut summary = GenerateSummary::default();

	let mut events = thumbnailer.subscribe();
	let admission = thumbnailer.submit_visible(keys, Tier::Normal).await?;
	debug!(?admission, "Submitted thumbnails");

	let collect = async {
		while !pending.is_empty() {
			match events.recv().await {
				Ok(event) => {
					if pending.remove(&event.key) {
						report(&event, format, &mut summary);
					}
				}
				Err(RecvError::Lagged(skipped)) => {
					warn!(skipped, "Missed thumbnail events, some results won't be listed");
				}
				Err(RecvError::Closed) => break,
			}
		}
	};

	if timeout(wait, collect).await.is_err() {
		warn!("Timed out waiting for thumbnails");
	}
	summary.missing = pending.len();

	Ok(summary)
}

fn report(event: &ThumbnailEvent, format: OutputFormat, summary: &mut GenerateSummary) {
	match &event.outcome {
		Outcome::Ready(artifact) => {
			summary.generated += 1;
			if matches!(format, OutputFormat::Human) {
				println!("ok   {} ({}x{})", event.key, artifact.width, artifact.height);
			}
		}
		Outcome::Unavailable(kind) => {
			summary.unavailable += 1;
			if matches!(format, OutputFormat::Human) {
				println!("none {} ({kind})", event.key);
			}
		}
	}
}
