//! # Captured frames and grayscale conversion

use crate::prelude::v1::*;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// RGBA colour structure.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RGBA {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

/// RGB colour structure.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RGB {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl RGB {
    /// Swap red and blue channels (BGR <-> RGB).
    pub fn swapped(self) -> Self {
        Self {
            r: self.b,
            g: self.g,
            b: self.r,
        }
    }
}

/// BT.601 luma of a colour, in 0-255 range.
#[inline]
pub fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

/// Pixel layout of a captured frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb8,
    Bgr8,
    Rgba8,
}

impl PixelFormat {
    /// Number of bytes per pixel.
    pub fn channels(self) -> usize {
        match self {
            Self::Gray8 => 1,
            Self::Rgb8 | Self::Bgr8 => 3,
            Self::Rgba8 => 4,
        }
    }
}

/// Single captured image buffer.
///
/// Frames are short lived: one is produced per tick and dropped as soon as it has been converted
/// to grayscale.
#[derive(Clone, Debug)]
pub struct Frame {
    width: usize,
    height: usize,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Frame {
    /// Create a frame from raw row-major bytes.
    ///
    /// Fails if the buffer length does not match `width * height * channels`.
    pub fn new(width: usize, height: usize, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = width * height * format.channels();
        if data.len() != expected {
            return Err(anyhow!(
                "{:?} frame of {}x{} needs {} bytes, got {}",
                format,
                width,
                height,
                expected,
                data.len()
            ));
        }

        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Create an `Rgba8` frame from a pixel slice.
    pub fn from_rgba(width: usize, height: usize, pixels: &[RGBA]) -> Result<Self> {
        Self::new(
            width,
            height,
            PixelFormat::Rgba8,
            bytemuck::cast_slice(pixels).to_vec(),
        )
    }

    /// Get width and height of the frame.
    pub fn dim(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Convert the frame to grayscale, reusing `out`'s allocation.
    pub fn to_gray_into(&self, out: &mut GrayFrame) {
        out.reset(self.width, self.height);

        let dst = out.as_mut_slice();

        match self.format {
            PixelFormat::Gray8 => {
                for (d, &s) in dst.iter_mut().zip(&self.data) {
                    *d = s as f32;
                }
            }
            PixelFormat::Rgb8 => {
                let src: &[RGB] = bytemuck::cast_slice(&self.data);
                for (d, p) in dst.iter_mut().zip(src) {
                    *d = luma(p.r, p.g, p.b);
                }
            }
            PixelFormat::Bgr8 => {
                let src: &[RGB] = bytemuck::cast_slice(&self.data);
                for (d, p) in dst.iter_mut().zip(src.iter().map(|p| p.swapped())) {
                    *d = luma(p.r, p.g, p.b);
                }
            }
            PixelFormat::Rgba8 => {
                let src: &[RGBA] = bytemuck::cast_slice(&self.data);
                for (d, p) in dst.iter_mut().zip(src) {
                    *d = luma(p.r, p.g, p.b);
                }
            }
        }
    }

    /// Convert the frame to a newly allocated grayscale image.
    pub fn to_gray(&self) -> GrayFrame {
        let mut out = GrayFrame::default();
        self.to_gray_into(&mut out);
        out
    }
}

/// Single channel floating point image, in 0-255 range.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GrayFrame {
    data: Vec<f32>,
    width: usize,
    height: usize,
}

impl GrayFrame {
    /// Create a black image.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            data: vec![0.0; width * height],
            width,
            height,
        }
    }

    /// Create an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            data,
            width,
            height,
        }
    }

    /// Resize the buffer to given dimensions, keeping the allocation when possible.
    ///
    /// Contents are unspecified afterwards.
    pub fn reset(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.data.resize(width * height, 0.0);
    }

    /// Get width and height of the image.
    pub fn dim(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Get pixel value at coordinates.
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Drop the pixel storage.
    pub fn release(&mut self) {
        self.data = vec![];
        self.width = 0;
        self.height = 0;
    }
}
