#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::dbg_macro
)]
#![forbid(unsafe_code)]
#![allow(
	clippy::missing_errors_doc,
	clippy::module_name_repetitions,
	clippy::cast_possible_truncation
)]

pub mod logging;
pub mod thumbnail;

pub use thumbnail::{
	Admission, Artifact, ContentKey, ErrorKind, Fingerprint, Outcome, OutputFormat, QueueMetrics,
	SourceId, ThumbnailEvent, Thumbnailer, ThumbnailerConfig, ThumbnailerError, Tier,
};
