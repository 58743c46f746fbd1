//! Frame decode pipeline.
//!
//! Turns a decrypted, compressed payload into a [`DecodedFrame`] in the one
//! pixel format the registry and viewer understand: interleaved 8-bit BGR,
//! row-major, no row padding.
//!
//! Still images the `image` crate recognises (JPEG, PNG, BMP, ...) are
//! decoded for real. Annex-B H.264 has no decoder here; such payloads
//! produce a placeholder frame flagged [`DecodedFrame::is_placeholder`] so
//! consumers can tell a live picture from a stand-in.

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{ImageFormat, ImageReader, Limits};
use thiserror::Error;

use crate::registry::FeedId;

/// Width of placeholder frames.
pub const PLACEHOLDER_WIDTH: u32 = 1280;

/// Height of placeholder frames.
pub const PLACEHOLDER_HEIGHT: u32 = 720;

/// Placeholder background, in BGR order.
const PLACEHOLDER_BGR: [u8; 3] = [60, 40, 40];

/// Largest frame accepted from a payload, in pixels per side.
const MAX_DIMENSION: u32 = 8192;

/// Errors produced while decoding a single frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("unrecognised payload format")]
    UnsupportedFormat,

    #[error("frame dimensions {width}x{height} out of range")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("pixel buffer is {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Pixel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Interleaved blue, green, red; one byte each.
    Bgr8,
}

impl PixelFormat {
    /// Returns the number of bytes per pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgr8 => 3,
        }
    }
}

/// One picture ready for display.
///
/// Cloning is cheap: the pixel buffer is shared.
#[derive(Clone, PartialEq)]
pub struct DecodedFrame {
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: Arc<[u8]>,
    captured_at: Instant,
    is_placeholder: bool,
    feed_id: Option<FeedId>,
}

impl DecodedFrame {
    /// Wraps a BGR pixel buffer, checking its size.
    pub fn from_bgr(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, DecodeError> {
        Self::build(width, height, pixels, Instant::now(), false)
    }

    /// Creates a uniform placeholder frame.
    pub fn placeholder(width: u32, height: u32) -> Self {
        Self::placeholder_with(width, height, placeholder_pixels(width, height), Instant::now())
    }

    fn placeholder_with(width: u32, height: u32, pixels: Arc<[u8]>, captured_at: Instant) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Bgr8,
            pixels,
            captured_at,
            is_placeholder: true,
            feed_id: None,
        }
    }

    fn build(
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        captured_at: Instant,
        is_placeholder: bool,
    ) -> Result<Self, DecodeError> {
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(DecodeError::InvalidDimensions { width, height });
        }
        let expected = width as usize * height as usize * PixelFormat::Bgr8.bytes_per_pixel();
        if pixels.len() != expected {
            return Err(DecodeError::BufferSize {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format: PixelFormat::Bgr8,
            pixels: pixels.into(),
            captured_at,
            is_placeholder,
            feed_id: None,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Returns the pixel buffer.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Returns the BGR value at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        Some([
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
        ])
    }

    /// Returns when the frame was produced.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Returns how long ago the frame was produced.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Returns true if this frame stands in for video that could not be
    /// decoded.
    pub fn is_placeholder(&self) -> bool {
        self.is_placeholder
    }

    /// Returns the feed this frame was published to, once the registry
    /// holds it.
    pub fn feed_id(&self) -> Option<FeedId> {
        self.feed_id
    }

    pub(crate) fn with_feed_id(mut self, feed_id: FeedId) -> Self {
        self.feed_id = Some(feed_id);
        self
    }
}

impl std::fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("is_placeholder", &self.is_placeholder)
            .field("feed_id", &self.feed_id)
            .finish_non_exhaustive()
    }
}

fn placeholder_pixels(width: u32, height: u32) -> Arc<[u8]> {
    PLACEHOLDER_BGR
        .repeat(width as usize * height as usize)
        .into()
}

/// What a payload contains, judged from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// A still image in a format the `image` crate reads.
    Image(ImageFormat),
    /// An H.264 Annex-B elementary stream.
    AnnexB,
    /// Anything else.
    Unknown,
}

/// Classifies a payload.
pub fn detect_payload(payload: &[u8]) -> PayloadKind {
    if payload.starts_with(&[0, 0, 0, 1]) || payload.starts_with(&[0, 0, 1]) {
        return PayloadKind::AnnexB;
    }
    match image::guess_format(payload) {
        Ok(format) => PayloadKind::Image(format),
        Err(_) => PayloadKind::Unknown,
    }
}

/// Counters kept by a [`FrameDecoder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Frames decoded into real pixels.
    pub decoded: u64,
    /// Placeholder frames emitted for undecodable video.
    pub placeholders: u64,
    /// Payloads rejected with a [`DecodeError`].
    pub failures: u64,
}

/// Per-session decoder. Capture timestamps it assigns never go backwards.
#[derive(Default)]
pub struct FrameDecoder {
    last_captured: Option<Instant>,
    stats: DecodeStats,
    // Shared by every placeholder this decoder emits
    placeholder: Option<Arc<[u8]>>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one compressed payload.
    pub fn decode(&mut self, payload: &[u8]) -> Result<DecodedFrame, DecodeError> {
        let result = self.decode_inner(payload);
        match &result {
            Ok(frame) if frame.is_placeholder() => self.stats.placeholders += 1,
            Ok(_) => self.stats.decoded += 1,
            Err(_) => self.stats.failures += 1,
        }
        result
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    fn decode_inner(&mut self, payload: &[u8]) -> Result<DecodedFrame, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }

        match detect_payload(payload) {
            PayloadKind::AnnexB => {
                let pixels = self
                    .placeholder
                    .get_or_insert_with(|| placeholder_pixels(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT))
                    .clone();
                Ok(DecodedFrame::placeholder_with(
                    PLACEHOLDER_WIDTH,
                    PLACEHOLDER_HEIGHT,
                    pixels,
                    self.next_timestamp(),
                ))
            }
            PayloadKind::Image(format) => {
                // Header only; the pixels are not touched until the size is known
                let (width, height) =
                    ImageReader::with_format(Cursor::new(payload), format).into_dimensions()?;
                if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
                    return Err(DecodeError::InvalidDimensions { width, height });
                }

                let mut reader = ImageReader::with_format(Cursor::new(payload), format);
                reader.limits(decode_limits());
                let image = reader.decode()?;
                let (width, height) = (image.width(), image.height());
                let mut pixels = image.into_rgb8().into_raw();
                for px in pixels.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                DecodedFrame::build(width, height, pixels, self.next_timestamp(), false)
            }
            PayloadKind::Unknown => Err(DecodeError::UnsupportedFormat),
        }
    }

    fn next_timestamp(&mut self) -> Instant {
        let now = Instant::now();
        let stamp = match self.last_captured {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_captured = Some(stamp);
        stamp
    }
}

fn decode_limits() -> Limits {
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_DIMENSION);
    limits.max_image_height = Some(MAX_DIMENSION);
    limits
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(width, height, Rgb(rgb));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, ImageFormat::Png).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_png_decodes_to_bgr() {
        let mut decoder = FrameDecoder::new();
        let frame = decoder.decode(&png_bytes(4, 2, [10, 20, 30])).unwrap();

        assert_eq!(frame.width(), 4);
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.format(), PixelFormat::Bgr8);
        assert_eq!(frame.pixels().len(), 4 * 2 * 3);
        assert_eq!(frame.pixel(3, 1), Some([30, 20, 10]));
        assert!(!frame.is_placeholder());
        assert_eq!(decoder.stats().decoded, 1);
    }

    #[test]
    fn test_annex_b_yields_placeholder() {
        let mut decoder = FrameDecoder::new();
        for payload in [&[0u8, 0, 0, 1, 0x67, 0x42][..], &[0u8, 0, 1, 0x65, 0x88][..]] {
            let frame = decoder.decode(payload).unwrap();
            assert!(frame.is_placeholder());
            assert_eq!(frame.width(), PLACEHOLDER_WIDTH);
            assert_eq!(frame.height(), PLACEHOLDER_HEIGHT);
            assert_eq!(frame.pixel(0, 0), Some(PLACEHOLDER_BGR));
        }
        assert_eq!(decoder.stats().placeholders, 2);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.decode(b"definitely not video"),
            Err(DecodeError::UnsupportedFormat)
        ));
        assert!(matches!(decoder.decode(b""), Err(DecodeError::Empty)));
        assert_eq!(decoder.stats().failures, 2);
    }

    #[test]
    fn test_oversized_image_rejected_from_header() {
        let mut decoder = FrameDecoder::new();
        let wide = png_bytes(MAX_DIMENSION + 1, 1, [0, 0, 0]);
        assert!(matches!(
            decoder.decode(&wide),
            Err(DecodeError::InvalidDimensions { width, height: 1 }) if width == MAX_DIMENSION + 1
        ));

        // Pixel data cut short: a full decode would fail with an image error
        let truncated = &wide[..wide.len() - 16];
        assert!(matches!(
            decoder.decode(truncated),
            Err(DecodeError::InvalidDimensions { .. })
        ));
        assert_eq!(decoder.stats().failures, 2);
        assert_eq!(decoder.stats().decoded, 0);
    }

    #[test]
    fn test_truncated_image_is_decode_error() {
        let png = png_bytes(8, 8, [1, 2, 3]);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.decode(&png[..png.len() / 2]),
            Err(DecodeError::Image(_))
        ));
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let mut decoder = FrameDecoder::new();
        let png = png_bytes(2, 2, [0, 0, 0]);
        let mut last = None;
        for _ in 0..5 {
            let frame = decoder.decode(&png).unwrap();
            if let Some(prev) = last {
                assert!(frame.captured_at() >= prev);
            }
            last = Some(frame.captured_at());
        }
    }

    #[test]
    fn test_from_bgr_checks_size() {
        assert!(DecodedFrame::from_bgr(2, 2, vec![0; 12]).is_ok());
        assert!(matches!(
            DecodedFrame::from_bgr(2, 2, vec![0; 11]),
            Err(DecodeError::BufferSize { expected: 12, actual: 11 })
        ));
        assert!(matches!(
            DecodedFrame::from_bgr(0, 2, Vec::new()),
            Err(DecodeError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_detect_payload() {
        assert_eq!(detect_payload(&[0, 0, 0, 1, 0x67]), PayloadKind::AnnexB);
        assert_eq!(
            detect_payload(&png_bytes(1, 1, [0, 0, 0])),
            PayloadKind::Image(ImageFormat::Png)
        );
        assert_eq!(detect_payload(b"hello"), PayloadKind::Unknown);
    }

    #[test]
    fn test_pixel_out_of_bounds() {
        let frame = DecodedFrame::placeholder(2, 2);
        assert_eq!(frame.pixel(2, 0), None);
    }
}
