//! # Real-time Dense Optical Flow Loop
//!
//! This library pulls frames from a live source, converts them to grayscale and computes a dense
//! optical flow field between every pair of consecutive frames. Results are published on a
//! channel and mirrored into a shared "current value" state, while the loop throttles itself to a
//! target frame rate.
//!
//! The easiest way to use the library is to import its prelude:
//!
//! ```
//! use flowloop::prelude::v1::*;
//! ```
//!
//! You may need [`nalgebra`](https://crates.io/crates/nalgebra) to make use of the flow field.

pub mod config;
pub mod error;
pub mod estimator;
pub mod farneback;
pub mod flow_field;
pub mod frame;
pub mod frame_loop;
pub mod source;
pub mod state;
pub mod timer;
pub mod utils;
pub mod worker;

pub mod prelude {
    pub mod v1 {
        pub use crate::{
            config::{ErrorPolicy, LoopSettings},
            error::CaptureError,
            estimator::{FarnebackParams, FlowEstimator},
            farneback::Farneback,
            flow_field::FlowField,
            frame::{Frame, GrayFrame, PixelFormat, RGB, RGBA},
            frame_loop::{FrameLoop, FrameResult, TickOutcome},
            source::{CaptureConstraints, FrameSource, SyntheticSource},
            state::{CaptureStatus, SharedState},
            worker::CaptureWorker,
        };
        pub use anyhow::{anyhow, Error, Result};
    }
}
