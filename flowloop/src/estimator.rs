//! # Dense optical flow estimator

use crate::prelude::v1::*;
use serde::{Deserialize, Serialize};

/// Seed the computation with the contents of the output field.
pub const USE_INITIAL_FLOW: u32 = 4;
/// Use a Gaussian window instead of a box filter when accumulating constraints.
pub const FARNEBACK_GAUSSIAN: u32 = 256;

/// Parameters of pyramidal Farnebäck flow.
///
/// Defaults are the values used by the capture loop: pyramid scale 0.5, 3 levels, window size 20,
/// 3 iterations, polynomial neighborhood 5 with sigma 1.2 and no flags.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FarnebackParams {
    /// Scale between consecutive pyramid levels, in the `(0, 1)` range.
    pub pyr_scale: f64,
    /// Number of pyramid levels on top of the original image.
    pub levels: u32,
    /// Averaging window size.
    pub winsize: u32,
    /// Iterations per pyramid level.
    pub iterations: u32,
    /// Neighborhood used for polynomial expansion.
    pub poly_n: u32,
    /// Gaussian sigma weighting the polynomial fit.
    pub poly_sigma: f64,
    /// Combination of [`USE_INITIAL_FLOW`] and [`FARNEBACK_GAUSSIAN`].
    pub flags: u32,
}

impl Default for FarnebackParams {
    fn default() -> Self {
        Self {
            pyr_scale: 0.5,
            levels: 3,
            winsize: 20,
            iterations: 3,
            poly_n: 5,
            poly_sigma: 1.2,
            flags: 0,
        }
    }
}

impl FarnebackParams {
    /// Check the parameters are usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.pyr_scale > 0.0 && self.pyr_scale < 1.0) {
            return Err(anyhow!("pyr_scale must be in (0, 1), got {}", self.pyr_scale));
        }
        if self.winsize == 0 || self.iterations == 0 || self.poly_n == 0 {
            return Err(anyhow!(
                "winsize, iterations and poly_n must be positive: {:?}",
                self
            ));
        }
        if self.poly_sigma <= 0.0 {
            return Err(anyhow!("poly_sigma must be positive, got {}", self.poly_sigma));
        }
        Ok(())
    }

    pub fn use_initial_flow(&self) -> bool {
        self.flags & USE_INITIAL_FLOW != 0
    }

    pub fn gaussian_window(&self) -> bool {
        self.flags & FARNEBACK_GAUSSIAN != 0
    }
}

/// Generic dense optical flow estimator.
pub trait FlowEstimator: Send {
    /// Compute dense flow from `prev` to `next`.
    ///
    /// Both images are expected to be of equal size. `out` is resized to match them and, unless
    /// [`USE_INITIAL_FLOW`] is set, overwritten.
    ///
    /// # Arguments
    ///
    /// * `prev` - grayscale reference frame.
    /// * `next` - grayscale current frame.
    /// * `params` - flow parameters.
    /// * `out` - output flow field.
    fn estimate(
        &mut self,
        prev: &GrayFrame,
        next: &GrayFrame,
        params: &FarnebackParams,
        out: &mut FlowField,
    ) -> Result<()>;

    /// Human readable name of the estimator, used in logs.
    fn name(&self) -> &str {
        "unnamed"
    }
}

impl<T: FlowEstimator + ?Sized> FlowEstimator for Box<T> {
    fn estimate(
        &mut self,
        prev: &GrayFrame,
        next: &GrayFrame,
        params: &FarnebackParams,
        out: &mut FlowField,
    ) -> Result<()> {
        (**self).estimate(prev, next, params, out)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
