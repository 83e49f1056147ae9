//! Off-thread image decoding.

use bytes::Bytes;
use tracing::trace;

use crate::domain::errors::LoadError;

/// Decodes a payload on the blocking pool.
///
/// Images wider or taller than `max_dimension` are downscaled preserving the
/// aspect ratio.
///
/// # Errors
/// Returns `LoadError::Decode` if the bytes are not a supported image.
pub async fn decode(bytes: Bytes, max_dimension: Option<u32>) -> Result<image::DynamicImage, LoadError> {
    tokio::task::spawn_blocking(move || decode_blocking(&bytes, max_dimension))
        .await
        .map_err(|e| LoadError::decode(format!("Decode task panicked: {e}")))?
}

fn decode_blocking(bytes: &[u8], max_dimension: Option<u32>) -> Result<image::DynamicImage, LoadError> {
    let img = image::load_from_memory(bytes).map_err(|e| LoadError::decode(e.to_string()))?;

    match max_dimension {
        Some(max) if img.width() > max || img.height() > max => {
            trace!(
                width = img.width(),
                height = img.height(),
                max = max,
                "Downscaling decoded image"
            );
            Ok(img.resize(max, max, image::imageops::FilterType::Lanczos3))
        }
        _ => Ok(img),
    }
}

/// Decoded size charged against the memory budget.
#[must_use]
pub fn decoded_size(img: &image::DynamicImage) -> u64 {
    img.as_bytes().len() as u64
}

/// Encodes a solid PNG for tests.
#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::new_rgb8(width, height)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}
