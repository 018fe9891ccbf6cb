//! Frame types and pixel decoding: Y16 radiometric frames, YUYV/MJPG color.

use image::RgbImage;
use ndarray::Array2;

/// Raw radiometric frame: one uncalibrated 16-bit count per pixel,
/// shape = (height, width).
pub type RawThermalFrame = Array2<u16>;

/// Raw color frame: 8-bit RGB, height × width × 3.
pub type RawColorFrame = RgbImage;

/// Lepton 3.x sensor geometry.
pub const THERMAL_WIDTH: u32 = 160;
pub const THERMAL_HEIGHT: u32 = 120;

/// 1080p color sensor geometry.
pub const COLOR_WIDTH: u32 = 1920;
pub const COLOR_HEIGHT: u32 = 1080;

/// Fixed frame geometry a sensor is expected to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
}

impl FrameShape {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn thermal() -> Self {
        Self::new(THERMAL_WIDTH, THERMAL_HEIGHT)
    }

    pub const fn color() -> Self {
        Self::new(COLOR_WIDTH, COLOR_HEIGHT)
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Zero-filled radiometric frame of this shape.
    pub fn zero_thermal(&self) -> RawThermalFrame {
        Array2::zeros((self.height as usize, self.width as usize))
    }

    /// Black color frame of this shape.
    pub fn zero_color(&self) -> RawColorFrame {
        RgbImage::new(self.width, self.height)
    }

    pub fn matches_thermal(&self, frame: &RawThermalFrame) -> bool {
        frame.dim() == (self.height as usize, self.width as usize)
    }

    pub fn matches_color(&self, frame: &RawColorFrame) -> bool {
        frame.dimensions() == (self.width, self.height)
    }
}

impl std::fmt::Display for FrameShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Decode a Y16 (16-bit little-endian grayscale) buffer into a radiometric frame.
///
/// `data` must hold exactly `2 * width * height` bytes.
pub fn decode_y16(data: &[u8], shape: FrameShape) -> Result<RawThermalFrame, FrameError> {
    let expected = shape.pixels() * 2;
    if data.len() != expected {
        return Err(FrameError::MalformedFrame {
            expected,
            actual: data.len(),
        });
    }
    let samples: Vec<u16> = data
        .chunks_exact(2)
        .map(|px| u16::from_le_bytes([px[0], px[1]]))
        .collect();
    Array2::from_shape_vec((shape.height as usize, shape.width as usize), samples)
        .map_err(|e| FrameError::Shape(e.to_string()))
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 full-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U and V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::MalformedFrame {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| FrameError::Shape(format!("{width}x{height} RGB buffer")))
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let cb = u as f32 - 128.0;
    let cr = v as f32 - 128.0;
    let r = y + 1.402 * cr;
    let g = y - 0.344_136 * cb - 0.714_136 * cr;
    let b = y + 1.772 * cb;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Decode a Motion-JPEG buffer into RGB.
pub fn mjpeg_to_rgb(jpeg: &[u8]) -> Result<RgbImage, FrameError> {
    let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(e.to_string()))?;
    Ok(decoded.to_rgb8())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: expected {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },
    #[error("frame shape mismatch: {0}")]
    Shape(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}
