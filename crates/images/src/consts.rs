/// Raster formats decoded through the `image` crate
pub const GENERIC_EXTENSIONS: [&str; 14] = [
	"jpg", "jpeg", "jfif", "png", "apng", "gif", "webp", "bmp", "ico", "tif", "tiff", "tga", "qoi",
	"avif",
];

pub const SVG_EXTENSIONS: [&str; 2] = ["svg", "svgz"];

/// The maximum file size that an image can be in order to have a thumbnail generated.
///
/// This value is in MiB.
pub(crate) const SVG_MAXIMUM_FILE_SIZE: u64 = MIB * 24;

/// The maximum file size that an image can be in order to have a thumbnail generated.
///
/// This value is in MiB.
pub(crate) const GENERIC_MAXIMUM_FILE_SIZE: u64 = MIB * 48;

/// Vector images have no native resolution, so they are rasterized with this longest side
/// and then downscaled like any other image.
pub(crate) const SVG_RENDER_SIDE: u32 = 1024;

/// The size of 1MiB in bytes
const MIB: u64 = 1_048_576;

/// Checks an extension (without the leading dot, any case) against everything we can decode
#[must_use]
pub fn is_supported_extension(extension: &str) -> bool {
	let extension = extension.to_ascii_lowercase();
	GENERIC_EXTENSIONS
		.iter()
		.chain(SVG_EXTENSIONS.iter())
		.any(|ext| *ext == extension)
}
