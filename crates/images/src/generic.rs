use crate::{consts::GENERIC_MAXIMUM_FILE_SIZE, ImageHandler, Result};

use image::{DynamicImage, ImageFormat};

pub struct GenericHandler {
	pub(crate) format_hint: Option<ImageFormat>,
}

impl ImageHandler for GenericHandler {
	fn maximum_size(&self) -> u64 {
		GENERIC_MAXIMUM_FILE_SIZE
	}

	fn handle_image(&self, data: &[u8]) -> Result<DynamicImage> {
		self.validate_size(data)?;

		// Extensions lie quite often (PNGs named .jpg and so on), so the hint only wins
		// when the content sniffing can't tell
		match image::guess_format(data) {
			Ok(format) => Ok(image::load_from_memory_with_format(data, format)?),
			Err(e) => self.format_hint.map_or_else(
				|| Err(e.into()),
				|format| Ok(image::load_from_memory_with_format(data, format)?),
			),
		}
	}
}
