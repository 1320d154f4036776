//! OpenCV frame source and optical flow implementation

use flowloop::prelude::v1::{Result, *};
use log::*;
use nalgebra as na;
use flowloop::estimator::USE_INITIAL_FLOW;
use opencv::core::{Point2f, Scalar, Vec3b, CV_32FC2, CV_8UC1, CV_8UC3};
use opencv::prelude::*;
use opencv::videoio::*;

/// Map an OpenCV open failure into the capture error taxonomy.
fn open_error(what: &str, err: impl std::fmt::Display) -> Error {
    let msg = format!("{}: {}", what, err);
    if msg.to_ascii_lowercase().contains("permission") {
        CaptureError::PermissionDenied(msg).into()
    } else {
        CaptureError::DeviceError(msg).into()
    }
}

/// Camera or video file read through `VideoCapture`.
pub struct CvCamera {
    capture: VideoCapture,
    frame: Mat,
    name: String,
}

impl CvCamera {
    /// Open camera device `index` and request the constrained resolution.
    pub fn open(index: i32, constraints: &CaptureConstraints) -> Result<Self> {
        constraints.check_video_only()?;

        let name = format!("camera {}", index);
        let capture = VideoCapture::new(index, CAP_ANY).map_err(|e| open_error(&name, e))?;

        Self::configure(capture, name, constraints)
    }

    /// Open a video file.
    pub fn from_file(path: &str, constraints: &CaptureConstraints) -> Result<Self> {
        constraints.check_video_only()?;

        let capture = VideoCapture::from_file(path, CAP_ANY).map_err(|e| open_error(path, e))?;

        Self::configure(capture, path.to_string(), constraints)
    }

    fn configure(
        mut capture: VideoCapture,
        name: String,
        constraints: &CaptureConstraints,
    ) -> Result<Self> {
        if !capture.is_opened()? {
            return Err(CaptureError::DeviceError(format!("{} is not available", name)).into());
        }

        capture.set(CAP_PROP_FRAME_WIDTH, constraints.width as f64)?;
        capture.set(CAP_PROP_FRAME_HEIGHT, constraints.height as f64)?;
        capture.set(CAP_PROP_BUFFERSIZE, 1.0)?;

        info!(
            "opened {} at {}x{}",
            name,
            capture.get(CAP_PROP_FRAME_WIDTH)?,
            capture.get(CAP_PROP_FRAME_HEIGHT)?
        );

        Ok(Self {
            capture,
            frame: Default::default(),
            name,
        })
    }
}

impl FrameSource for CvCamera {
    fn read_frame(&mut self) -> Result<Frame> {
        if !self.capture.read(&mut self.frame)? || self.frame.rows() <= 0 {
            return Err(
                CaptureError::DeviceError(format!("Failed to grab frame from {}", self.name))
                    .into(),
            );
        }

        let (w, h) = (self.frame.cols() as usize, self.frame.rows() as usize);

        match self.frame.typ() {
            CV_8UC1 => {
                let mut data = Vec::with_capacity(w * h);
                for y in 0..self.frame.rows() {
                    for x in 0..self.frame.cols() {
                        data.push(*self.frame.at_2d::<u8>(y, x)?);
                    }
                }
                Frame::new(w, h, PixelFormat::Gray8, data)
            }
            CV_8UC3 => {
                let mut data = Vec::with_capacity(w * h * 3);
                for y in 0..self.frame.rows() {
                    for x in 0..self.frame.cols() {
                        let bgr: &Vec3b = self.frame.at_2d(y, x)?;
                        data.extend_from_slice(&[bgr[0], bgr[1], bgr[2]]);
                    }
                }
                Frame::new(w, h, PixelFormat::Bgr8, data)
            }
            t => Err(anyhow!("Unsupported frame type {}", t)),
        }
    }

    fn resolution(&self) -> Option<(usize, usize)> {
        Some((
            self.capture.get(CAP_PROP_FRAME_WIDTH).ok()? as usize,
            self.capture.get(CAP_PROP_FRAME_HEIGHT).ok()? as usize,
        ))
    }

    fn framerate(&self) -> Option<f64> {
        self.capture.get(CAP_PROP_FPS).ok().filter(|f| *f > 0.0)
    }

    fn release(&mut self) {
        if let Err(e) = self.capture.release() {
            warn!("releasing {}: {}", self.name, e);
        }
        self.frame = Default::default();
    }
}

/// Farnebäck flow computed by OpenCV.
#[derive(Default)]
pub struct CvFarneback {
    prev: Mat,
    next: Mat,
    flow: Mat,
}

fn gray_to_mat(gray: &GrayFrame, mat: &mut Mat) -> Result<()> {
    let (w, h) = gray.dim();

    if mat.cols() as usize != w || mat.rows() as usize != h || mat.typ() != CV_8UC1 {
        *mat = Mat::new_rows_cols_with_default(h as _, w as _, CV_8UC1, Scalar::all(0.0))?;
    }

    for (i, &v) in gray.as_slice().iter().enumerate() {
        *mat.at_2d_mut::<u8>((i / w) as _, (i % w) as _)? = v.round().clamp(0.0, 255.0) as u8;
    }

    Ok(())
}

impl FlowEstimator for CvFarneback {
    fn estimate(
        &mut self,
        prev: &GrayFrame,
        next: &GrayFrame,
        params: &FarnebackParams,
        out: &mut FlowField,
    ) -> Result<()> {
        let (w, h) = next.dim();

        gray_to_mat(prev, &mut self.prev)?;
        gray_to_mat(next, &mut self.next)?;

        let seed = params.use_initial_flow() && out.dim() == (w, h);

        // OpenCV reads the output matrix as the initial guess, it must hold the previous field.
        let flags = if seed {
            params.flags
        } else {
            params.flags & !USE_INITIAL_FLOW
        };

        if seed {
            self.flow =
                Mat::new_rows_cols_with_default(h as _, w as _, CV_32FC2, Scalar::all(0.0))?;
            for (x, y, motion) in out.iter() {
                let pt = self.flow.at_2d_mut::<Point2f>(y as _, x as _)?;
                pt.x = motion.x;
                pt.y = motion.y;
            }
        }

        opencv::video::calc_optical_flow_farneback(
            &self.prev,
            &self.next,
            &mut self.flow,
            params.pyr_scale,
            params.levels as _,
            params.winsize as _,
            params.iterations as _,
            params.poly_n as _,
            params.poly_sigma,
            flags as _,
        )?;

        out.reset(w, h);

        for y in 0..h {
            for x in 0..w {
                let dir: &Point2f = self.flow.at_2d(y as _, x as _)?;
                out.set_motion(x, y, na::Vector2::new(dir.x, dir.y));
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "opencv"
    }
}
