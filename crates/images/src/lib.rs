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
	clippy::expect_used,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::as_conversions,
	clippy::dbg_macro
)]
#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Decoding capability used by the thumbnailer: turns the raw bytes of a source
//! (a file, an archive entry, a video frame) into pixels.

mod consts;
mod error;
mod generic;
mod handler;
mod svg;

pub use consts::{is_supported_extension, GENERIC_EXTENSIONS, SVG_EXTENSIONS};
pub use error::{Error, Result};
pub use handler::decode;
pub use image::DynamicImage;

pub trait ImageHandler {
	fn maximum_size(&self) -> u64;

	fn validate_size(&self, data: &[u8]) -> Result<()> {
		let len = u64::try_from(data.len())?;
		if len > self.maximum_size() {
			Err(Error::TooLarge(len))
		} else if data.is_empty() {
			Err(Error::InvalidLength)
		} else {
			Ok(())
		}
	}

	fn handle_image(&self, data: &[u8]) -> Result<DynamicImage>;
}

/// Scales `(w, h)` so the larger side equals `bounding_box`, keeping the aspect ratio.
///
/// Never upscales: when both sides already fit inside the box the input is returned untouched.
/// The smaller side is rounded to the nearest pixel and never drops below 1.
#[must_use]
pub fn scale_dimensions(w: u32, h: u32, bounding_box: u32) -> (u32, u32) {
	let longest = w.max(h);
	if longest <= bounding_box || longest == 0 {
		return (w, h);
	}

	let scale = |side: u32| -> u32 {
		let scaled = (u64::from(side) * u64::from(bounding_box) + u64::from(longest) / 2)
			/ u64::from(longest);
		u32::try_from(scaled).unwrap_or(bounding_box).max(1)
	};

	if w >= h {
		(bounding_box, scale(h))
	} else {
		(scale(w), bounding_box)
	}
}
