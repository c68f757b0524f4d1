use std::{io::Cursor, ops::Deref, panic};

use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, imageops, DynamicImage, GenericImageView};
use tokio::{sync::oneshot, task::spawn_blocking};
use tracing::{error, instrument, trace};
use webp::Encoder;

use super::{
	config::{OutputFormat, ThumbnailerConfig},
	error::ThumbnailerError,
	resolver::Representative,
};

/// An encoded thumbnail, cheap to clone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
	pub bytes: Bytes,
	pub width: u32,
	pub height: u32,
	pub format: OutputFormat,
}

impl Artifact {
	#[must_use]
	pub fn byte_size(&self) -> u64 {
		u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
	}
}

/// Decode, downscale and encode, all on the blocking thread pool
#[derive(Debug, Clone, Copy)]
pub struct Codec {
	bounding_box: u32,
	format: OutputFormat,
	quality: u8,
}

impl Codec {
	#[must_use]
	pub const fn new(bounding_box: u32, format: OutputFormat, quality: u8) -> Self {
		Self {
			bounding_box,
			format,
			quality,
		}
	}

	#[must_use]
	pub const fn from_config(config: &ThumbnailerConfig) -> Self {
		Self::new(config.bounding_box, config.output_format, config.quality)
	}

	#[must_use]
	pub const fn format(&self) -> OutputFormat {
		self.format
	}

	#[instrument(skip_all, fields(len = source.data.len(), extension = ?source.extension))]
	pub async fn encode(&self, source: Representative) -> Result<Artifact, ThumbnailerError> {
		let codec = *self;
		let (tx, rx) = oneshot::channel();

		// Using channel instead of waiting the JoinHandle as for some reason
		// the JoinHandle can take some extra time to complete
		let handle = spawn_blocking(move || {
			// Handling error on receiver side
			let _ = tx.send(
				panic::catch_unwind(|| {
					codec.encode_blocking(&source.data, source.extension.as_deref())
				})
				.unwrap_or_else(|_| {
					Err(ThumbnailerError::Panic(
						"Internal panic on third party crate".to_string(),
					))
				}),
			);
		});

		if let Ok(res) = rx.await {
			trace!("Generated thumbnail bytes");
			res
		} else {
			error!("Failed to generate thumbnail");
			Err(ThumbnailerError::Panic(
				handle
					.await
					.err()
					.map_or_else(|| "encoder task vanished".to_string(), |e| e.to_string()),
			))
		}
	}

	/// Synchronous core of [`Codec::encode`], must not run on the async executor
	pub fn encode_blocking(
		&self,
		data: &[u8],
		extension: Option<&str>,
	) -> Result<Artifact, ThumbnailerError> {
		let img = sd_images::decode(data, extension)?;

		let (w, h) = img.dimensions();
		let (width, height) = sd_images::scale_dimensions(w, h, self.bounding_box);

		let img = if (width, height) == (w, h) {
			img
		} else {
			DynamicImage::ImageRgba8(imageops::resize(
				&img,
				width,
				height,
				imageops::FilterType::Triangle,
			))
		};

		let bytes = match self.format {
			OutputFormat::Webp => self.encode_webp(img)?,
			OutputFormat::Jpeg => self.encode_jpeg(&img)?,
		};

		Ok(Artifact {
			bytes,
			width,
			height,
			format: self.format,
		})
	}

	fn encode_webp(&self, img: DynamicImage) -> Result<Bytes, ThumbnailerError> {
		// The WebP encoder only takes 8 bit RGB(A)
		let img = match img {
			img @ (DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_)) => img,
			other => DynamicImage::ImageRgba8(other.to_rgba8()),
		};

		let encoder = Encoder::from_image(&img)
			.map_err(|reason| ThumbnailerError::WebPEncoding(reason.to_string()))?;

		// Type `WebPMemory` is !Send, so we copy it out right away
		Ok(Bytes::copy_from_slice(
			encoder.encode(f32::from(self.quality)).deref(),
		))
	}

	fn encode_jpeg(&self, img: &DynamicImage) -> Result<Bytes, ThumbnailerError> {
		let mut out = Cursor::new(Vec::new());

		// JPEG has no alpha channel
		DynamicImage::ImageRgb8(img.to_rgb8())
			.write_with_encoder(JpegEncoder::new_with_quality(&mut out, self.quality))
			.map_err(ThumbnailerError::JpegEncoding)?;

		Ok(Bytes::from(out.into_inner()))
	}
}
