use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, GenericImageView};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Frame payload is empty")]
    EmptyPayload,
    #[error("Frame payload too large: {len} bytes (max: {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Error decoding image: {0}")]
    Image(#[from] image::ImageError),
    #[error("Error reading image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decoded image has no pixels")]
    EmptyImage,
}

/// Turns encoded image bytes into a pixel buffer.
pub trait FrameDecoder: Send + Sync + 'static {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, DecodeError>;
}

/// Decoder backed by the `image` crate; the format is sniffed from the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

impl FrameDecoder for ImageCodec {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
        let image_reader = image::ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        let image = image_reader.decode()?;

        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DecodeError::EmptyImage);
        }
        Ok(image)
    }
}

/// Decodes the base64 `data` field of a frame message.
///
/// Browser clients often send canvas data URLs, so a `data:<mime>;base64,` prefix is
/// stripped. The size check runs on the encoded text before any allocation.
pub fn decode_base64_payload(data: &str, max_len: usize) -> Result<Vec<u8>, DecodeError> {
    let encoded = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let encoded = encoded.trim();

    if encoded.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    if encoded.len() > max_len {
        return Err(DecodeError::PayloadTooLarge {
            len: encoded.len(),
            max: max_len,
        });
    }

    Ok(STANDARD.decode(encoded)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(width, height, Rgb([255, 0, 0]));
        let mut image_data: Vec<u8> = Vec::new();
        img.write_to(&mut Cursor::new(&mut image_data), image::ImageFormat::Png)
            .unwrap();
        image_data
    }

    #[test]
    fn test_decode_png_frame() {
        let image = ImageCodec.decode(&png_bytes(100, 80)).unwrap();
        assert_eq!(image.dimensions(), (100, 80));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = ImageCodec.decode(b"definitely not an image");
        assert!(result.is_err());
    }

    #[test]
    fn test_payload_strips_data_url_prefix() {
        let bytes = png_bytes(2, 2);
        let encoded = format!("data:image/png;base64,{}", STANDARD.encode(&bytes));

        let decoded = decode_base64_payload(&encoded, 1024 * 1024).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn test_payload_limits() {
        assert!(matches!(
            decode_base64_payload("", 10),
            Err(DecodeError::EmptyPayload)
        ));
        assert!(matches!(
            decode_base64_payload("QUJDREVGR0g=", 4),
            Err(DecodeError::PayloadTooLarge { len: 12, max: 4 })
        ));
        assert!(matches!(
            decode_base64_payload("not base64 at all!", 1024),
            Err(DecodeError::Base64(_))
        ));
    }
}
