use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;

/// Extensions of wavelet-compressed images that browsers cannot display.
pub const WAVELET_EXTENSIONS: [&str; 2] = ["j2k", "jp2"];

pub fn is_wavelet_format(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| WAVELET_EXTENSIONS.iter().any(|w| e.eq_ignore_ascii_case(w)))
        .unwrap_or(false)
}

/// The image operations the rest of the crate needs. Keeps the choice of
/// decoding library out of the gateway and the resolution tool.
pub trait ImageTranscoder: Send + Sync {
    /// Decode `path` and re-encode it as an RGB JPEG.
    fn to_jpeg(&self, path: &Path) -> Result<Vec<u8>>;

    /// Pixel `(width, height)` of the image at `path`.
    fn dimensions(&self, path: &Path) -> Result<(u32, u32)>;
}

/// `image` crate backend, with OpenJPEG for JPEG 2000 inputs.
#[derive(Debug, Clone)]
pub struct ImageCrateTranscoder {
    quality: u8,
}

impl ImageCrateTranscoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    fn decode(&self, path: &Path) -> Result<DynamicImage> {
        let name = path.to_string_lossy();
        if is_wavelet_format(&name) {
            decode_jpeg2000(path)
        } else {
            image::open(path).with_context(|| format!("decoding {}", path.display()))
        }
    }
}

impl Default for ImageCrateTranscoder {
    fn default() -> Self {
        Self::new(75)
    }
}

impl ImageTranscoder for ImageCrateTranscoder {
    fn to_jpeg(&self, path: &Path) -> Result<Vec<u8>> {
        let rgb = DynamicImage::ImageRgb8(self.decode(path)?.to_rgb8());
        let mut buf = Vec::new();
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, self.quality))
            .with_context(|| format!("encoding {} as jpeg", path.display()))?;
        Ok(buf)
    }

    fn dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        let name = path.to_string_lossy();
        if is_wavelet_format(&name) {
            let img = decode_jpeg2000(path)?;
            Ok((img.width(), img.height()))
        } else {
            image::image_dimensions(path).with_context(|| format!("reading {}", path.display()))
        }
    }
}

#[cfg(feature = "jpeg2000")]
fn decode_jpeg2000(path: &Path) -> Result<DynamicImage> {
    let j2k = jpeg2k::Image::from_file(path)
        .map_err(|e| anyhow!("decoding {}: {:?}", path.display(), e))?;
    DynamicImage::try_from(&j2k).map_err(|e| anyhow!("converting {}: {:?}", path.display(), e))
}

#[cfg(not(feature = "jpeg2000"))]
fn decode_jpeg2000(path: &Path) -> Result<DynamicImage> {
    Err(anyhow!(
        "cannot decode {}: built without jpeg2000 support",
        path.display()
    ))
}

/// Content type for a file served as-is.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("bmp") => "image/bmp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}
