use std::fmt;

pub const BYTES_PER_PIXEL: u64 = 4;

/// A decoded image ready for presentation, tightly packed RGBA8.
///
/// Instances are immutable once built; the presentation path shares them
/// behind `Arc` and swaps whole bitmaps rather than mutating pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapError {
    ZeroDimension,
    BufferLengthMismatch { expected_len: u64, actual_len: u64 },
}

impl fmt::Display for BitmapError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitmapError::ZeroDimension => {
                write!(formatter, "bitmap dimensions must be non-zero")
            }
            BitmapError::BufferLengthMismatch {
                expected_len,
                actual_len,
            } => {
                write!(
                    formatter,
                    "bitmap buffer length {actual_len} does not match expected {expected_len}"
                )
            }
        }
    }
}

impl std::error::Error for BitmapError {}

impl Bitmap {
    pub fn from_rgba8(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, BitmapError> {
        if width == 0 || height == 0 {
            return Err(BitmapError::ZeroDimension);
        }
        // Dimensions near u32::MAX overflow the u64 byte count; no
        // buffer can reach that size, so saturating keeps the
        // comparison a mismatch instead of wrapping.
        let expected_len = u64::from(width)
            .checked_mul(u64::from(height))
            .and_then(|pixel_count| pixel_count.checked_mul(BYTES_PER_PIXEL))
            .unwrap_or(u64::MAX);
        if rgba.len() as u64 != expected_len {
            return Err(BitmapError::BufferLengthMismatch {
                expected_len,
                actual_len: rgba.len() as u64,
            });
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitmapDecodeError {
    EmptyPayload,
    UnsupportedFormat,
    CorruptData { message: String },
}

impl fmt::Display for BitmapDecodeError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitmapDecodeError::EmptyPayload => {
                write!(formatter, "image payload is empty")
            }
            BitmapDecodeError::UnsupportedFormat => {
                write!(formatter, "image payload format is not supported")
            }
            BitmapDecodeError::CorruptData { message } => {
                write!(formatter, "image payload could not be decoded: {message}")
            }
        }
    }
}

impl std::error::Error for BitmapDecodeError {}

/// Turns an encoded image payload into a displayable bitmap.
///
/// Called from fetch worker threads; a failed decode skips one refresh
/// iteration and must never panic.
pub trait BitmapDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Bitmap, BitmapDecodeError>;
}

/// Decoder for the encoded payloads the remote service actually sends
/// (PNG or JPEG), backed by the image crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodedImageDecoder;

impl BitmapDecoder for EncodedImageDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Bitmap, BitmapDecodeError> {
        if payload.is_empty() {
            return Err(BitmapDecodeError::EmptyPayload);
        }
        let decoded = image::load_from_memory(payload).map_err(|error| match error {
            image::ImageError::Unsupported(_) => BitmapDecodeError::UnsupportedFormat,
            other => BitmapDecodeError::CorruptData {
                message: other.to_string(),
            },
        })?;
        let rgba = decoded.to_rgba8();
        let width = rgba.width();
        let height = rgba.height();
        Bitmap::from_rgba8(width, height, rgba.into_raw()).map_err(|error| {
            BitmapDecodeError::CorruptData {
                message: error.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_fixture(width: u32, height: u32, pixel: [u8; 4]) -> Vec<u8> {
        let mut bytes = Vec::new();
        image::RgbaImage::from_pixel(width, height, image::Rgba(pixel))
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encode png fixture");
        bytes
    }

    #[test]
    fn bitmap_rejects_zero_dimensions_and_bad_buffer_lengths() {
        assert_eq!(
            Bitmap::from_rgba8(0, 4, Vec::new()),
            Err(BitmapError::ZeroDimension)
        );
        assert_eq!(
            Bitmap::from_rgba8(2, 2, vec![0; 15]),
            Err(BitmapError::BufferLengthMismatch {
                expected_len: 16,
                actual_len: 15,
            })
        );
        let bitmap = Bitmap::from_rgba8(2, 2, vec![7; 16]).expect("build bitmap");
        assert_eq!(bitmap.width(), 2);
        assert_eq!(bitmap.height(), 2);
        assert_eq!(bitmap.rgba().len(), 16);
    }

    #[test]
    fn bitmap_rejects_dimensions_whose_byte_count_overflows() {
        assert_eq!(
            Bitmap::from_rgba8(u32::MAX, u32::MAX, Vec::new()),
            Err(BitmapError::BufferLengthMismatch {
                expected_len: u64::MAX,
                actual_len: 0,
            })
        );
    }

    #[test]
    fn decodes_png_payload_to_rgba() {
        let payload = png_fixture(2, 3, [10, 20, 30, 255]);
        let bitmap = EncodedImageDecoder
            .decode(&payload)
            .expect("decode png payload");
        assert_eq!(bitmap.width(), 2);
        assert_eq!(bitmap.height(), 3);
        assert_eq!(&bitmap.rgba()[0..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn decodes_jpeg_payload() {
        let mut payload = Vec::new();
        image::RgbImage::from_pixel(4, 4, image::Rgb([200, 40, 40]))
            .write_to(&mut Cursor::new(&mut payload), image::ImageFormat::Jpeg)
            .expect("encode jpeg fixture");

        let bitmap = EncodedImageDecoder
            .decode(&payload)
            .expect("decode jpeg payload");
        assert_eq!(bitmap.width(), 4);
        assert_eq!(bitmap.height(), 4);
        assert_eq!(bitmap.rgba().len(), 64);
    }

    #[test]
    fn rejects_empty_and_unrecognized_payloads() {
        assert_eq!(
            EncodedImageDecoder.decode(&[]),
            Err(BitmapDecodeError::EmptyPayload)
        );
        assert_eq!(
            EncodedImageDecoder.decode(b"definitely not an image"),
            Err(BitmapDecodeError::UnsupportedFormat)
        );
    }

    #[test]
    fn reports_truncated_png_as_corrupt() {
        let payload = png_fixture(8, 8, [1, 2, 3, 255]);
        let truncated = &payload[..payload.len() / 2];
        assert!(matches!(
            EncodedImageDecoder.decode(truncated),
            Err(BitmapDecodeError::CorruptData { .. })
        ));
    }
}
