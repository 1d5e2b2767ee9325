//! Image arrays: the in-memory form of camera frames.
//!
//! An [`ImageArray`] is a row-major `height × width × channels` u8 buffer,
//! the same layout an image decoder hands back. Frames are persisted as
//! side files by the file store and packed into a single buffer by the
//! wire format.

use std::path::Path;

use ::image::{DynamicImage, GrayAlphaImage, GrayImage, RgbImage, RgbaImage};

use crate::errors::{Result, TubError};

/// ITU-R 601 luma weights for R, G, B.
pub const LUMA_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArray {
    height: u32,
    width: u32,
    channels: u8,
    data: Vec<u8>,
}

impl ImageArray {
    /// Wrap a raw pixel buffer, checking its length against the shape.
    pub fn new(height: u32, width: u32, channels: u8, data: Vec<u8>) -> Result<Self> {
        if !(1..=4).contains(&channels) {
            return Err(TubError::InvalidConfiguration(format!(
                "image arrays have 1 to 4 channels, got {channels}"
            )));
        }
        let expected = height as usize * width as usize * channels as usize;
        if data.len() != expected {
            return Err(TubError::InvalidConfiguration(format!(
                "pixel buffer of {} bytes does not match shape {height}x{width}x{channels}",
                data.len()
            )));
        }
        Ok(Self {
            height,
            width,
            channels,
            data,
        })
    }

    /// A frame with every sample set to `value`.
    pub fn filled(height: u32, width: u32, channels: u8, value: u8) -> Self {
        let channels = channels.clamp(1, 4);
        let len = height as usize * width as usize * channels as usize;
        Self {
            height,
            width,
            channels,
            data: vec![value; len],
        }
    }

    /// Build a 3-channel frame where every pixel is `rgb`.
    pub fn solid_rgb(height: u32, width: u32, rgb: [u8; 3]) -> Self {
        let pixels = height as usize * width as usize;
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            height,
            width,
            channels: 3,
            data,
        }
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// `(height, width, channels)`.
    pub fn shape(&self) -> (u32, u32, u8) {
        (self.height, self.width, self.channels)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    /// Sample at row `y`, column `x`, channel `c`.
    pub fn get(&self, y: u32, x: u32, c: u8) -> Option<u8> {
        if y >= self.height || x >= self.width || c >= self.channels {
            return None;
        }
        let idx = ((y as usize * self.width as usize) + x as usize) * self.channels as usize
            + c as usize;
        self.data.get(idx).copied()
    }

    /// Per-pixel luminance. Single-channel frames are already grayscale.
    pub fn luminance(&self) -> Vec<f32> {
        let ch = self.channels as usize;
        self.data
            .chunks_exact(ch)
            .map(|px| {
                if ch < 3 {
                    px[0] as f32
                } else {
                    px[0] as f32 * LUMA_WEIGHTS[0]
                        + px[1] as f32 * LUMA_WEIGHTS[1]
                        + px[2] as f32 * LUMA_WEIGHTS[2]
                }
            })
            .collect()
    }

    /// Pack three frames into one: each is reduced to luminance and becomes
    /// one channel of the output, `a` in channel 0 through `c` in channel 2.
    pub fn stack3(a: &ImageArray, b: &ImageArray, c: &ImageArray) -> Result<ImageArray> {
        let (h, w) = (a.height, a.width);
        for other in [b, c] {
            if other.height != h || other.width != w {
                return Err(TubError::InvalidConfiguration(format!(
                    "cannot stack {}x{} frame with {}x{} frame",
                    h, w, other.height, other.width
                )));
            }
        }
        let (ga, gb, gc) = (a.luminance(), b.luminance(), c.luminance());
        let mut data = Vec::with_capacity(ga.len() * 3);
        for i in 0..ga.len() {
            // Float to u8 casts truncate and saturate.
            data.push(ga[i] as u8);
            data.push(gb[i] as u8);
            data.push(gc[i] as u8);
        }
        ImageArray::new(h, w, 3, data)
    }

    pub fn from_dynamic(img: DynamicImage) -> Self {
        let (width, height) = (img.width(), img.height());
        let (channels, data) = match img {
            DynamicImage::ImageLuma8(buf) => (1, buf.into_raw()),
            DynamicImage::ImageLumaA8(buf) => (2, buf.into_raw()),
            DynamicImage::ImageRgba8(buf) => (4, buf.into_raw()),
            DynamicImage::ImageRgb8(buf) => (3, buf.into_raw()),
            other => (3, other.to_rgb8().into_raw()),
        };
        Self {
            height,
            width,
            channels,
            data,
        }
    }

    pub fn to_dynamic(&self) -> Result<DynamicImage> {
        let (w, h) = (self.width, self.height);
        let raw = self.data.clone();
        let img = match self.channels {
            1 => GrayImage::from_raw(w, h, raw).map(DynamicImage::ImageLuma8),
            2 => GrayAlphaImage::from_raw(w, h, raw).map(DynamicImage::ImageLumaA8),
            3 => RgbImage::from_raw(w, h, raw).map(DynamicImage::ImageRgb8),
            4 => RgbaImage::from_raw(w, h, raw).map(DynamicImage::ImageRgba8),
            _ => None,
        };
        img.ok_or_else(|| {
            TubError::InvalidConfiguration(format!(
                "buffer does not fit {}x{}x{}",
                h, w, self.channels
            ))
        })
    }

    /// Decode an image file. A missing file is `NotFound`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TubError::NotFound(path.display().to_string()));
        }
        let img = ::image::open(path)?;
        Ok(Self::from_dynamic(img))
    }

    /// Encode to `path`, format chosen by extension. JPEG has no alpha, so
    /// alpha channels are dropped for `.jpg`/`.jpeg`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut img = self.to_dynamic()?;
        let is_jpeg = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
            .unwrap_or(false);
        if is_jpeg && (self.channels == 2 || self.channels == 4) {
            img = if self.channels == 2 {
                DynamicImage::ImageLuma8(img.to_luma8())
            } else {
                DynamicImage::ImageRgb8(img.to_rgb8())
            };
        }
        img.save(path)?;
        Ok(())
    }
}
