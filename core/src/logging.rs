use sd_utils::error::FileIOError;

use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::{
	non_blocking::WorkerGuard,
	rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

pub const LOGS_DIR_NAME: &str = "logs";
pub const LOG_FILE_NAME: &str = "thumbnailer.log";

const DEFAULT_DIRECTIVE: &str = "sd_core=info";

#[derive(Debug, Error)]
pub enum LoggerError {
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("invalid tracing directive: {0}")]
	Directive(#[from] tracing_subscriber::filter::ParseError),
}

/// Installs the global subscriber: `RUST_LOG` aware stdout output plus a daily rotated
/// file under `<data_dir>/logs`.
///
/// The returned guard flushes the file writer on drop, keep it alive for the whole program.
/// Returns `Ok(None)` if a global subscriber was already installed.
pub fn init_logger(data_dir: impl AsRef<Path>) -> Result<Option<WorkerGuard>, LoggerError> {
	let logs_dir = data_dir.as_ref().join(LOGS_DIR_NAME);
	std::fs::create_dir_all(&logs_dir)
		.map_err(|e| FileIOError::from((&logs_dir, e, "Failed to create logs directory")))?;

	let (non_blocking, guard) = tracing_appender::non_blocking(RollingFileAppender::new(
		Rotation::DAILY,
		&logs_dir,
		LOG_FILE_NAME,
	));

	let filter = if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
		EnvFilter::from_default_env()
	} else {
		EnvFilter::default()
			.add_directive(LevelFilter::WARN.into())
			.add_directive(DEFAULT_DIRECTIVE.parse()?)
	};

	let installed = tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer().with_target(true))
		.with(
			fmt::layer()
				.with_writer(non_blocking)
				.with_ansi(false)
				.with_target(true),
		)
		.try_init()
		.is_ok();

	if installed {
		info!(logs_dir = %logs_dir.display(), "Logger initialized");
		Ok(Some(guard))
	} else {
		Ok(None)
	}
}
