//! Common `FrameSource` and `FlowEstimator` loader.

use flowloop::prelude::v1::*;
use log::*;
use std::path::{Path, PathBuf};

/// Extensions picked up by [`ImageSequence`].
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Open a frame source depending on the input.
///
/// * `synthetic` or `synthetic:WxH` - moving procedural texture.
/// * `cam:N` or a bare number - camera device `N`.
/// * A directory - every image within it, in lexical order.
/// * Any other existing file - a video file.
///
/// Cameras and video files need the `cv` feature, without it they fail with
/// `CaptureError::CaptureUnsupported`.
pub fn open_source(input: &str, constraints: &CaptureConstraints) -> Result<Box<dyn FrameSource>> {
    constraints.check_video_only()?;

    if let Some(rest) = input.strip_prefix("synthetic") {
        let mut constraints = *constraints;

        if let Some(size) = rest.strip_prefix(':') {
            let (w, h) = size
                .split_once('x')
                .ok_or_else(|| anyhow!("Invalid synthetic size {}", size))?;
            constraints.width = w.parse()?;
            constraints.height = h.parse()?;
        } else if !rest.is_empty() {
            return Err(anyhow!("Invalid synthetic input {}", input));
        }

        return Ok(Box::new(SyntheticSource::from_constraints(&constraints)?));
    }

    let camera = input
        .strip_prefix("cam:")
        .unwrap_or(input)
        .parse::<i32>()
        .ok();

    if let Some(index) = camera {
        return open_camera(index, constraints);
    }

    let path = Path::new(input);

    if path.is_dir() {
        Ok(Box::new(ImageSequence::open(path)?))
    } else if path.is_file() {
        open_video(input, constraints)
    } else {
        Err(CaptureError::DeviceError(format!("No such input: {}", input)).into())
    }
}

#[cfg(feature = "cv")]
fn open_camera(index: i32, constraints: &CaptureConstraints) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(flowloop_cv::CvCamera::open(index, constraints)?))
}

#[cfg(not(feature = "cv"))]
fn open_camera(index: i32, _: &CaptureConstraints) -> Result<Box<dyn FrameSource>> {
    Err(CaptureError::CaptureUnsupported(format!(
        "camera {} requested, but built without camera support",
        index
    ))
    .into())
}

#[cfg(feature = "cv")]
fn open_video(input: &str, constraints: &CaptureConstraints) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(flowloop_cv::CvCamera::from_file(input, constraints)?))
}

#[cfg(not(feature = "cv"))]
fn open_video(input: &str, _: &CaptureConstraints) -> Result<Box<dyn FrameSource>> {
    Err(CaptureError::CaptureUnsupported(format!(
        "{} looks like a video file, but built without video support",
        input
    ))
    .into())
}

/// Create a flow estimator by name.
///
/// `farneback` is always available, `opencv` needs the `cv` feature.
pub fn create_estimator(name: &str) -> Result<Box<dyn FlowEstimator>> {
    match name {
        "farneback" => Ok(Box::new(Farneback::new())),
        #[cfg(feature = "cv")]
        "opencv" => Ok(Box::new(flowloop_cv::CvFarneback::default())),
        _ => Err(anyhow!(
            "Unknown estimator {}, available: {}",
            name,
            available_estimators().join(", ")
        )),
    }
}

/// Names accepted by [`create_estimator`].
pub fn available_estimators() -> Vec<&'static str> {
    let mut ret = vec!["farneback"];
    if cfg!(feature = "cv") {
        ret.push("opencv");
    }
    ret
}

/// Directory of still images played back as a stream.
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    next: usize,
    resolution: Option<(usize, usize)>,
}

impl ImageSequence {
    /// List the images of a directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();

        let mut paths = std::fs::read_dir(dir)
            .map_err(|e| CaptureError::DeviceError(format!("{}: {}", dir.display(), e)))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();

        if paths.is_empty() {
            return Err(
                CaptureError::DeviceError(format!("no images in {}", dir.display())).into(),
            );
        }

        paths.sort();

        info!("{} frames in {}", paths.len(), dir.display());

        Ok(Self {
            paths,
            next: 0,
            resolution: None,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequence {
    fn read_frame(&mut self) -> Result<Frame> {
        let path = self
            .paths
            .get(self.next)
            .ok_or_else(|| CaptureError::DeviceError("end of image sequence".into()))?;

        let img = image::open(path)
            .map_err(|e| CaptureError::DeviceError(format!("{}: {}", path.display(), e)))?
            .to_rgb8();

        self.next += 1;

        let (w, h) = (img.width() as usize, img.height() as usize);
        self.resolution = Some((w, h));

        Frame::new(w, h, PixelFormat::Rgb8, img.into_raw())
    }

    fn resolution(&self) -> Option<(usize, usize)> {
        self.resolution
    }

    fn release(&mut self) {
        self.next = self.paths.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("frame-loader-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn synthetic_sizes() {
        let c = CaptureConstraints::default();

        let mut src = open_source("synthetic", &c).unwrap();
        assert_eq!(src.read_frame().unwrap().dim(), (640, 480));

        let mut src = open_source("synthetic:32x16", &c).unwrap();
        assert_eq!(src.read_frame().unwrap().dim(), (32, 16));

        assert!(open_source("synthetic:32", &c).is_err());
        assert!(open_source("syntheticfoo", &c).is_err());
    }

    #[cfg(not(feature = "cv"))]
    #[test]
    fn camera_unsupported_without_cv() {
        let err = open_source("cam:0", &Default::default()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<CaptureError>(),
            Some(CaptureError::CaptureUnsupported(_))
        ));
    }

    #[test]
    fn missing_input_is_device_error() {
        let err = open_source("/definitely/not/here", &Default::default())
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<CaptureError>(),
            Some(CaptureError::DeviceError(_))
        ));
    }

    #[test]
    fn audio_rejected() {
        let c = CaptureConstraints {
            audio: true,
            ..Default::default()
        };
        assert!(open_source("synthetic", &c).is_err());
    }

    #[test]
    fn image_sequence_in_order() {
        let dir = temp_dir("seq");

        for (i, v) in [10u8, 20, 30].iter().enumerate() {
            let img = image::RgbImage::from_pixel(6, 4, image::Rgb([*v, *v, *v]));
            img.save(dir.join(format!("{:03}.png", i))).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let mut src = open_source(dir.to_str().unwrap(), &Default::default()).unwrap();

        for v in [10.0, 20.0, 30.0] {
            let gray = src.read_frame().unwrap().to_gray();
            assert_eq!(gray.dim(), (6, 4));
            assert!((gray.get(0, 0) - v).abs() < 0.01);
        }

        assert_eq!(src.resolution(), Some((6, 4)));

        let err = src.read_frame().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CaptureError>(),
            Some(CaptureError::DeviceError(_))
        ));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn empty_directory_rejected() {
        let dir = temp_dir("empty");
        assert!(ImageSequence::open(&dir).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn estimators_by_name() {
        assert!(create_estimator("farneback").is_ok());
        let err = create_estimator("magic").err().unwrap();
        assert!(err.to_string().contains("available: farneback"), "{}", err);
        assert!(available_estimators().contains(&"farneback"));
    }
}
