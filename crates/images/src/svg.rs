use std::sync::Arc;

use crate::{
	consts::{SVG_MAXIMUM_FILE_SIZE, SVG_RENDER_SIDE},
	scale_dimensions, Error, ImageHandler, Result,
};

use image::DynamicImage;
use once_cell::sync::Lazy;
use resvg::{tiny_skia, usvg};

// Loading system fonts is slow, so we do it once for the whole process
static FONT_DB: Lazy<Arc<usvg::fontdb::Database>> = Lazy::new(|| {
	let mut fontdb = usvg::fontdb::Database::new();
	fontdb.load_system_fonts();
	Arc::new(fontdb)
});

#[derive(PartialEq, Eq)]
pub struct SvgHandler {}

impl ImageHandler for SvgHandler {
	fn maximum_size(&self) -> u64 {
		SVG_MAXIMUM_FILE_SIZE
	}

	fn handle_image(&self, data: &[u8]) -> Result<DynamicImage> {
		self.validate_size(data)?;

		let options = usvg::Options {
			fontdb: Arc::clone(&FONT_DB),
			..Default::default()
		};

		let rtree = usvg::Tree::from_data(data, &options)?;

		let tree_size = rtree.size();
		// Rounds up to whole pixels
		let int_size = tree_size.to_int_size();
		let (width, height) =
			scale_dimensions(int_size.width(), int_size.height(), SVG_RENDER_SIDE);

		// Render sides are small enough to be exact as `f32`
		let (Ok(scaled_width), Ok(scaled_height)) = (
			u16::try_from(width).map(f32::from),
			u16::try_from(height).map(f32::from),
		) else {
			return Err(Error::InvalidLength);
		};
		if width == 0 || height == 0 {
			return Err(Error::InvalidLength);
		}

		let transform = tiny_skia::Transform::from_scale(
			scaled_width / tree_size.width(),
			scaled_height / tree_size.height(),
		);

		let Some(mut pixmap) = tiny_skia::Pixmap::new(width, height) else {
			return Err(Error::Pixbuf);
		};

		resvg::render(&rtree, transform, &mut pixmap.as_mut());

		image::RgbaImage::from_raw(pixmap.width(), pixmap.height(), pixmap.data().into())
			.map_or_else(
				|| Err(Error::RgbImageConversion),
				|x| Ok(DynamicImage::ImageRgba8(x)),
			)
	}
}
