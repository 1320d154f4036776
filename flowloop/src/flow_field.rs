//! # Dense optical flow field

use nalgebra::*;

/// Per-pixel optical flow field.
///
/// Each cell holds the `(dx, dy)` displacement, in pixels, that takes a point of the previous
/// frame to its location in the next frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowField {
    vf: Matrix2xX<f32>,
    width: usize,
}

impl Default for FlowField {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl FlowField {
    /// Create a new zeroed flow field.
    ///
    /// # Arguments
    ///
    /// * `width` - width of the field.
    /// * `height` - height of the field.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            vf: Matrix2xX::repeat(width * height, 0f32),
            width,
        }
    }

    /// Resize the field and zero it out.
    pub fn reset(&mut self, width: usize, height: usize) {
        if self.dim() != (width, height) {
            *self = Self::new(width, height);
        } else {
            self.vf.fill(0.0);
        }
    }

    /// Get width and height of the flow field.
    pub fn dim(&self) -> (usize, usize) {
        if self.width == 0 {
            (0, 0)
        } else {
            (self.width, self.vf.ncols() / self.width)
        }
    }

    /// Get size of the flow field.
    ///
    /// This is the same as `width * height`
    pub fn size(&self) -> usize {
        self.vf.ncols()
    }

    /// Get the flow field in row-major order.
    ///
    /// The elements returned are in the following order:
    ///
    /// `field[0,0].x, field[0,0].y, field[0,1].x, ... field[0,N].y, field[1,0].x, ... field[N,N].y`
    pub fn as_slice(&self) -> &[f32] {
        self.vf.as_slice()
    }

    /// Mutable access to the interleaved `(dx, dy)` storage.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        self.vf.as_mut_slice()
    }

    /// Set motion at given position.
    pub fn set_motion(&mut self, x: usize, y: usize, motion: Vector2<f32>) {
        self.vf.set_column(self.width * y + x, &motion);
    }

    /// Get motion at coordinates.
    pub fn get_motion(&self, x: usize, y: usize) -> Vector2<f32> {
        self.vf.column(self.width * y + x).into()
    }

    /// Iterate every element of the flow field.
    ///
    /// The resulting iterator yields `(x, y, motion)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, Vector2<f32>)> + '_ {
        let (width, height) = self.dim();
        (0..height).flat_map(move |y| (0..width).map(move |x| (x, y, self.get_motion(x, y))))
    }

    /// Average motion magnitude over the whole field.
    pub fn mean_magnitude(&self) -> f32 {
        if self.size() == 0 {
            return 0.0;
        }
        self.vf.column_iter().map(|c| c.magnitude()).sum::<f32>() / self.size() as f32
    }

    /// Largest motion magnitude in the field.
    pub fn max_magnitude(&self) -> f32 {
        self.vf
            .column_iter()
            .map(|c| c.magnitude())
            .fold(0.0, f32::max)
    }

    /// Average motion of the whole field.
    pub fn mean_motion(&self) -> Vector2<f32> {
        if self.size() == 0 {
            return Vector2::zeros();
        }
        self.vf.column_sum() / self.size() as f32
    }

    /// Block-average the field down to `width` x `height` cells.
    ///
    /// Every source cell is accumulated into the output cell covering it, so the output never
    /// contains holes as long as it is not larger than the source.
    pub fn downsample(&self, width: usize, height: usize) -> FlowField {
        let (sw, sh) = self.dim();
        let mut out = FlowField::new(width, height);

        if width == 0 || height == 0 || sw == 0 || sh == 0 {
            return out;
        }

        let mut counts = vec![std::f32::EPSILON; width * height];

        for (x, y, motion) in self.iter() {
            let (ox, oy) = (x * width / sw, y * height / sh);
            let idx = oy * width + ox;
            counts[idx] += 1.0;
            let acc = out.vf.column(idx) + motion;
            out.vf.set_column(idx, &acc);
        }

        for (mut col, cnt) in out.vf.column_iter_mut().zip(counts) {
            col /= cnt;
        }

        out
    }
}
