//! # Frame sources

use crate::prelude::v1::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Media constraints requested when opening a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConstraints {
    pub video: bool,
    pub audio: bool,
    /// Target frame width. Sources may deliver a different size.
    pub width: usize,
    /// Target frame height. Sources may deliver a different size.
    pub height: usize,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: false,
            width: 640,
            height: 480,
        }
    }
}

impl CaptureConstraints {
    /// Check that the constraints can be served by a video-only source.
    pub fn check_video_only(&self) -> Result<()> {
        if !self.video {
            return Err(CaptureError::CaptureUnsupported("no video track requested".into()).into());
        }
        if self.audio {
            return Err(CaptureError::CaptureUnsupported("audio capture".into()).into());
        }
        Ok(())
    }
}

/// Live stream of frames.
pub trait FrameSource: Send {
    /// Read the current frame of the stream.
    ///
    /// Blocks until a frame is available. Returns `Err` when the device fails or the stream has
    /// ended.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Get the resolution of the stream.
    ///
    /// This will return `Some((width, height))` if it is known. Resolution may change after the
    /// first frame is read.
    fn resolution(&self) -> Option<(usize, usize)>;

    /// Get the framerate of the stream, if known.
    fn framerate(&self) -> Option<f64> {
        None
    }

    /// Release the underlying device. No frames are read afterwards.
    fn release(&mut self) {}
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn read_frame(&mut self) -> Result<Frame> {
        (**self).read_frame()
    }

    fn resolution(&self) -> Option<(usize, usize)> {
        (**self).resolution()
    }

    fn framerate(&self) -> Option<f64> {
        (**self).framerate()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Number of plane waves summed into the synthetic texture.
const WAVES: usize = 6;

/// Procedural texture translating by a constant amount every frame.
pub struct SyntheticSource {
    width: usize,
    height: usize,
    step: (f32, f32),
    /// `(fx, fy, phase, amplitude)` of every wave in the texture.
    waves: Vec<(f32, f32, f32, f32)>,
    frame: usize,
}

impl SyntheticSource {
    /// Create a new synthetic source.
    ///
    /// # Arguments
    ///
    /// * `width` - frame width.
    /// * `height` - frame height.
    /// * `step` - translation of the texture per frame, in pixels.
    /// * `seed` - texture seed.
    pub fn new(width: usize, height: usize, step: (f32, f32), seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        // Spread the wave directions so that motion is observable along both axes.
        let waves = (0..WAVES)
            .map(|i| {
                let sector = std::f32::consts::PI / WAVES as f32;
                let angle = i as f32 * sector + rng.gen_range(0.0..sector);
                let freq = rng.gen_range(0.12..0.25);
                (
                    angle.cos() * freq,
                    angle.sin() * freq,
                    rng.gen_range(0.0..std::f32::consts::TAU),
                    rng.gen_range(30.0..45.0),
                )
            })
            .collect();

        Self {
            width,
            height,
            step,
            waves,
            frame: 0,
        }
    }

    /// Create a source from capture constraints, moving one pixel right and half a pixel down
    /// every frame.
    pub fn from_constraints(constraints: &CaptureConstraints) -> Result<Self> {
        constraints.check_video_only()?;
        Ok(Self::new(constraints.width, constraints.height, (1.0, 0.5), 0))
    }

    /// Intensity of the texture at given position and frame.
    fn sample(&self, x: f32, y: f32, t: f32) -> u8 {
        let (x, y) = (x - self.step.0 * t, y - self.step.1 * t);
        let v = self
            .waves
            .iter()
            .map(|&(fx, fy, phase, amp)| amp * (fx * x + fy * y + phase).sin())
            .sum::<f32>();
        (128.0 + v).clamp(0.0, 255.0) as u8
    }
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<Frame> {
        let t = self.frame as f32;
        let mut data = Vec::with_capacity(self.width * self.height * 3);

        for y in 0..self.height {
            for x in 0..self.width {
                let v = self.sample(x as f32, y as f32, t);
                data.extend_from_slice(&[v, v, v]);
            }
        }

        self.frame += 1;

        Frame::new(self.width, self.height, PixelFormat::Rgb8, data)
    }

    fn resolution(&self) -> Option<(usize, usize)> {
        Some((self.width, self.height))
    }

    fn framerate(&self) -> Option<f64> {
        Some(30.0)
    }
}
