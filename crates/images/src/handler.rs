use crate::{
	consts::{GENERIC_EXTENSIONS, SVG_EXTENSIONS},
	error::{Error, Result},
	generic::GenericHandler,
	svg::SvgHandler,
	ImageHandler,
};

use image::{DynamicImage, ImageFormat};
use tracing::trace;

/// Decodes `data` into pixels.
///
/// `extension` is the extension of the file (or archive entry) the bytes came from, if any.
/// It picks the handler and serves as a format hint when the content can't be sniffed.
pub fn decode(data: &[u8], extension: Option<&str>) -> Result<DynamicImage> {
	let extension = extension.map(str::to_ascii_lowercase);

	let handler = match_to_handler(extension.as_deref())?;
	trace!(?extension, len = data.len(), "Decoding image");

	handler.handle_image(data)
}

fn match_to_handler(extension: Option<&str>) -> Result<Box<dyn ImageHandler>> {
	match extension {
		Some(ext) if SVG_EXTENSIONS.contains(&ext) => Ok(Box::new(SvgHandler {})),
		Some(ext) if GENERIC_EXTENSIONS.contains(&ext) => Ok(Box::new(GenericHandler {
			format_hint: ImageFormat::from_extension(ext),
		})),
		// No extension (video frames, extensionless archive entries): sniff the content
		None => Ok(Box::new(GenericHandler { format_hint: None })),
		Some(_) => Err(Error::Unsupported),
	}
}
