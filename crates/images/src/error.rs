use std::num::TryFromIntError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("error with usvg: {0}")]
	USvg(#[from] resvg::usvg::Error),
	#[error("failed to allocate `Pixbuf` while converting an SVG")]
	Pixbuf,
	#[error("error while loading the image (via the `image` crate): {0}")]
	Image(#[from] image::ImageError),
	#[error("there was an error while converting the image to an `RgbImage`")]
	RgbImageConversion,
	#[error("the image provided is unsupported")]
	Unsupported,
	#[error("the image provided is too large ({0} bytes)")]
	TooLarge(u64),
	#[error("the image has an invalid length")]
	InvalidLength,
	#[error("error while parsing integers")]
	TryFromInt(#[from] TryFromIntError),
}

impl Error {
	/// Whether the source can never be decoded by us, as opposed to being damaged
	#[must_use]
	pub const fn is_unsupported(&self) -> bool {
		matches!(
			self,
			Self::Unsupported
				| Self::TooLarge(_)
				| Self::Image(image::ImageError::Unsupported(_) | image::ImageError::Limits(_))
		)
	}
}
