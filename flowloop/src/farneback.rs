//! # Pyramidal Farnebäck dense optical flow
//!
//! Each image is locally approximated by a quadratic polynomial `x^T A x + b^T x + c`. Comparing
//! the expansions of two frames yields a linear constraint on the displacement at every pixel,
//! which is accumulated over a window and solved in a least squares sense. The process runs
//! coarse-to-fine over an image pyramid and is iterated a few times per level.

use crate::estimator::FarnebackParams;
use crate::prelude::v1::*;
use nalgebra as na;
use rayon::prelude::*;

/// Pyramid levels whose smaller side falls below this are skipped.
const MIN_LEVEL_SIZE: f64 = 32.0;
const BORDER: usize = 5;
/// Constraint damping of the outermost pixels.
const BORDER_WEIGHTS: [f32; BORDER] = [0.14, 0.14, 0.4472, 0.4472, 0.4472];

/// Per-pixel expansion coefficients: `[bx, by, axx, ayy, axy2]`.
///
/// `axy2` is the coefficient of the `xy` term, i.e. twice the off-diagonal of `A`.
type Poly = [f32; 5];
/// Per-pixel normal equations: `[g11, g12, g22, h1, h2]`.
type Normal = [f32; 5];
type Motion = [f32; 2];

/// Precomputed polynomial expansion filters.
struct PolyKernel {
    poly_n: u32,
    poly_sigma: f64,
    g: Vec<f32>,
    /// Rows of the inverted normal matrix mapping the weighted moments to `Poly`.
    proj: [[f32; 6]; 5],
}

impl PolyKernel {
    fn new(poly_n: u32, poly_sigma: f64) -> Result<Self> {
        let n = poly_n as isize;
        let mut g = (-n..=n)
            .map(|k| (-((k * k) as f64) / (2.0 * poly_sigma * poly_sigma)).exp())
            .collect::<Vec<_>>();
        let sum = g.iter().sum::<f64>();
        g.iter_mut().for_each(|v| *v /= sum);

        // Weighted normal matrix of the basis [1, x, y, x^2, y^2, xy].
        let mut normal = na::Matrix6::<f64>::zeros();
        for y in -n..=n {
            for x in -n..=n {
                let (fx, fy) = (x as f64, y as f64);
                let b = na::Vector6::new(1.0, fx, fy, fx * fx, fy * fy, fx * fy);
                let w = g[(x + n) as usize] * g[(y + n) as usize];
                normal += b * b.transpose() * w;
            }
        }

        let inv = normal
            .try_inverse()
            .ok_or_else(|| anyhow!("singular polynomial expansion for poly_n={}", poly_n))?;

        let mut proj = [[0f32; 6]; 5];
        for (r, row) in proj.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = inv[(r + 1, c)] as f32;
            }
        }

        Ok(Self {
            poly_n,
            poly_sigma,
            g: g.into_iter().map(|v| v as f32).collect(),
            proj,
        })
    }

    fn matches(&self, params: &FarnebackParams) -> bool {
        self.poly_n == params.poly_n && self.poly_sigma == params.poly_sigma
    }

    /// Compute the polynomial expansion of every pixel of `img`.
    fn expand(&self, img: &[f32], width: usize, height: usize) -> Vec<Poly> {
        let n = self.poly_n as isize;
        let g = &self.g;
        let mut out = vec![[0f32; 5]; width * height];

        out.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            // Vertical moments: sum g, sum y*g, sum y^2*g.
            let mut v = vec![[0f32; 3]; width];
            for k in -n..=n {
                let sy = clamp_idx(y as isize + k, height);
                let gk = g[(k + n) as usize];
                let kf = k as f32;
                for (acc, &p) in v.iter_mut().zip(&img[sy * width..(sy + 1) * width]) {
                    let t = gk * p;
                    acc[0] += t;
                    acc[1] += kf * t;
                    acc[2] += kf * kf * t;
                }
            }

            for (x, dst) in row.iter_mut().enumerate() {
                // Moments in the order of the basis [1, x, y, x^2, y^2, xy].
                let mut s = [0f32; 6];
                for j in -n..=n {
                    let [v0, v1, v2] = v[clamp_idx(x as isize + j, width)];
                    let gj = g[(j + n) as usize];
                    let jf = j as f32;
                    s[0] += gj * v0;
                    s[1] += jf * gj * v0;
                    s[2] += gj * v1;
                    s[3] += jf * jf * gj * v0;
                    s[4] += gj * v2;
                    s[5] += jf * gj * v1;
                }

                for (c, proj) in dst.iter_mut().zip(&self.proj) {
                    *c = proj.iter().zip(&s).map(|(a, b)| a * b).sum();
                }
            }
        });

        out
    }
}

/// Pure-Rust pyramidal Farnebäck estimator.
#[derive(Default)]
pub struct Farneback {
    kernel: Option<PolyKernel>,
}

impl Farneback {
    pub fn new() -> Self {
        Self::default()
    }

    fn kernel(&mut self, params: &FarnebackParams) -> Result<&PolyKernel> {
        if !matches!(&self.kernel, Some(k) if k.matches(params)) {
            self.kernel = Some(PolyKernel::new(params.poly_n, params.poly_sigma)?);
        }
        self.kernel
            .as_ref()
            .ok_or_else(|| anyhow!("polynomial kernel missing"))
    }
}

impl FlowEstimator for Farneback {
    fn estimate(
        &mut self,
        prev: &GrayFrame,
        next: &GrayFrame,
        params: &FarnebackParams,
        out: &mut FlowField,
    ) -> Result<()> {
        params.validate()?;

        if prev.dim() != next.dim() {
            return Err(anyhow!(
                "frame size mismatch: {:?} vs {:?}",
                prev.dim(),
                next.dim()
            ));
        }

        let (width, height) = prev.dim();

        if width < 2 || height < 2 {
            return Err(anyhow!("frame too small for flow: {}x{}", width, height));
        }

        let kernel = self.kernel(params)?;

        let mut levels = 0;
        let mut scale = 1.0;
        while levels < params.levels {
            scale *= params.pyr_scale;
            if width as f64 * scale < MIN_LEVEL_SIZE || height as f64 * scale < MIN_LEVEL_SIZE {
                break;
            }
            levels += 1;
        }

        let window = if params.gaussian_window() {
            let m = (params.winsize / 2) as usize;
            gaussian_kernel(2 * m + 1, m as f64 * 0.3)
        } else {
            let m = (params.winsize / 2) as usize;
            vec![1.0 / (2 * m + 1) as f32; 2 * m + 1]
        };

        let mut flow: Vec<Motion> = vec![];
        let mut flow_dim = (0, 0);

        for k in (0..=levels).rev() {
            let scale = params.pyr_scale.powi(k as i32);
            let (lw, lh) = (
                ((width as f64 * scale).round() as usize).max(1),
                ((height as f64 * scale).round() as usize).max(1),
            );

            let (i0, i1) = if k == 0 {
                (prev.as_slice().to_vec(), next.as_slice().to_vec())
            } else {
                let sigma = (1.0 / scale - 1.0) * 0.5;
                let ksize = (((sigma * 5.0).round() as usize) | 1).max(3);
                let blur = gaussian_kernel(ksize, sigma);
                (
                    pyramid_level(prev, &blur, lw, lh),
                    pyramid_level(next, &blur, lw, lh),
                )
            };

            flow = if k == levels {
                if params.use_initial_flow() && out.dim() == (width, height) {
                    let seed: &[Motion] = bytemuck::cast_slice(out.as_slice());
                    let mut seed = resize_bilinear(seed, width, height, lw, lh);
                    scale_motion(&mut seed, scale as f32);
                    seed
                } else {
                    vec![[0.0; 2]; lw * lh]
                }
            } else {
                let mut up = resize_bilinear(&flow, flow_dim.0, flow_dim.1, lw, lh);
                scale_motion(&mut up, (1.0 / params.pyr_scale) as f32);
                up
            };
            flow_dim = (lw, lh);

            let r0 = kernel.expand(&i0, lw, lh);
            let r1 = kernel.expand(&i1, lw, lh);

            let mut m = update_matrices(&r0, &r1, &flow, lw, lh);

            for i in 0..params.iterations {
                let blurred = separable_blur(&m, lw, lh, &window);
                update_flow(&blurred, &mut flow, lw);
                if i + 1 < params.iterations {
                    m = update_matrices(&r0, &r1, &flow, lw, lh);
                }
            }
        }

        out.reset(width, height);
        out.as_mut_slice()
            .copy_from_slice(bytemuck::cast_slice(&flow));

        Ok(())
    }

    fn name(&self) -> &str {
        "farneback"
    }
}

#[inline]
fn clamp_idx(i: isize, len: usize) -> usize {
    i.clamp(0, len as isize - 1) as usize
}

fn border_weight(i: usize, len: usize) -> f32 {
    if i < BORDER {
        BORDER_WEIGHTS[i]
    } else if i + BORDER >= len {
        BORDER_WEIGHTS[len - 1 - i]
    } else {
        1.0
    }
}

fn scale_motion(flow: &mut [Motion], scale: f32) {
    for m in flow {
        m[0] *= scale;
        m[1] *= scale;
    }
}

/// Normalised 1D Gaussian kernel of given (odd) size.
fn gaussian_kernel(ksize: usize, sigma: f64) -> Vec<f32> {
    let r = (ksize / 2) as isize;
    let sigma = if sigma > 0.0 { sigma } else { 1e-3 };
    let k = (-r..=r)
        .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp())
        .collect::<Vec<_>>();
    let sum = k.iter().sum::<f64>();
    k.into_iter().map(|v| (v / sum) as f32).collect()
}

/// Blur and downscale an image to one pyramid level.
fn pyramid_level(img: &GrayFrame, blur: &[f32], lw: usize, lh: usize) -> Vec<f32> {
    let (w, h) = img.dim();
    let src: &[[f32; 1]] = bytemuck::cast_slice(img.as_slice());
    let blurred = separable_blur(src, w, h, blur);
    let resized = resize_bilinear(&blurred, w, h, lw, lh);
    bytemuck::cast_slice(&resized).to_vec()
}

/// Separable convolution with replicated borders.
fn separable_blur<const C: usize>(
    src: &[[f32; C]],
    width: usize,
    height: usize,
    kernel: &[f32],
) -> Vec<[f32; C]> {
    let r = (kernel.len() / 2) as isize;

    let mut tmp = vec![[0f32; C]; width * height];
    tmp.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        for (k, &kv) in kernel.iter().enumerate() {
            let sy = clamp_idx(y as isize + k as isize - r, height);
            for (d, s) in row.iter_mut().zip(&src[sy * width..(sy + 1) * width]) {
                for c in 0..C {
                    d[c] += kv * s[c];
                }
            }
        }
    });

    let mut out = vec![[0f32; C]; width * height];
    out.par_chunks_mut(width)
        .zip(tmp.par_chunks(width))
        .for_each(|(orow, trow)| {
            for (x, d) in orow.iter_mut().enumerate() {
                for (k, &kv) in kernel.iter().enumerate() {
                    let s = trow[clamp_idx(x as isize + k as isize - r, width)];
                    for c in 0..C {
                        d[c] += kv * s[c];
                    }
                }
            }
        });

    out
}

/// Bilinear resize with pixel-centre alignment.
fn resize_bilinear<const C: usize>(
    src: &[[f32; C]],
    sw: usize,
    sh: usize,
    dw: usize,
    dh: usize,
) -> Vec<[f32; C]> {
    if (sw, sh) == (dw, dh) {
        return src.to_vec();
    }

    let (fx, fy) = (sw as f32 / dw as f32, sh as f32 / dh as f32);
    let mut out = vec![[0f32; C]; dw * dh];

    out.par_chunks_mut(dw).enumerate().for_each(|(y, row)| {
        let syf = ((y as f32 + 0.5) * fy - 0.5).max(0.0);
        let y0 = (syf as usize).min(sh - 1);
        let y1 = (y0 + 1).min(sh - 1);
        let b = syf - y0 as f32;

        for (x, d) in row.iter_mut().enumerate() {
            let sxf = ((x as f32 + 0.5) * fx - 0.5).max(0.0);
            let x0 = (sxf as usize).min(sw - 1);
            let x1 = (x0 + 1).min(sw - 1);
            let a = sxf - x0 as f32;

            let (p00, p01, p10, p11) = (
                src[y0 * sw + x0],
                src[y0 * sw + x1],
                src[y1 * sw + x0],
                src[y1 * sw + x1],
            );

            for c in 0..C {
                d[c] = (1.0 - b) * ((1.0 - a) * p00[c] + a * p01[c])
                    + b * ((1.0 - a) * p10[c] + a * p11[c]);
            }
        }
    });

    out
}

/// Build the per-pixel normal equations for the current flow estimate.
fn update_matrices(
    r0: &[Poly],
    r1: &[Poly],
    flow: &[Motion],
    width: usize,
    height: usize,
) -> Vec<Normal> {
    let mut m = vec![[0f32; 5]; width * height];

    m.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        for (x, dst) in row.iter_mut().enumerate() {
            let idx = y * width + x;
            let [dx, dy] = flow[idx];
            let p0 = r0[idx];

            let fx = x as f32 + dx;
            let fy = y as f32 + dy;
            let x1 = fx.floor() as isize;
            let y1 = fy.floor() as isize;

            let (bx, by, mut axx, mut ayy, mut axy) = if x1 >= 0
                && y1 >= 0
                && x1 < width as isize - 1
                && y1 < height as isize - 1
            {
                let (a, b) = (fx - x1 as f32, fy - y1 as f32);
                let i = y1 as usize * width + x1 as usize;
                let (w00, w01, w10, w11) = (
                    (1.0 - a) * (1.0 - b),
                    a * (1.0 - b),
                    (1.0 - a) * b,
                    a * b,
                );

                let mut p1 = [0f32; 5];
                for (c, v) in p1.iter_mut().enumerate() {
                    *v = w00 * r1[i][c]
                        + w01 * r1[i + 1][c]
                        + w10 * r1[i + width][c]
                        + w11 * r1[i + width + 1][c];
                }

                (
                    p1[0],
                    p1[1],
                    (p0[2] + p1[2]) * 0.5,
                    (p0[3] + p1[3]) * 0.5,
                    (p0[4] + p1[4]) * 0.25,
                )
            } else {
                // Sample fell outside of the next frame, rely on the previous one alone.
                (0.0, 0.0, p0[2], p0[3], p0[4] * 0.5)
            };

            let mut hx = (p0[0] - bx) * 0.5 + axx * dx + axy * dy;
            let mut hy = (p0[1] - by) * 0.5 + axy * dx + ayy * dy;

            let scale = border_weight(x, width) * border_weight(y, height);
            if scale != 1.0 {
                hx *= scale;
                hy *= scale;
                axx *= scale;
                ayy *= scale;
                axy *= scale;
            }

            *dst = [
                axx * axx + axy * axy,
                (axx + ayy) * axy,
                ayy * ayy + axy * axy,
                axx * hx + axy * hy,
                axy * hx + ayy * hy,
            ];
        }
    });

    m
}

/// Solve the window-accumulated normal equations for new flow.
fn update_flow(m: &[Normal], flow: &mut [Motion], width: usize) {
    flow.par_chunks_mut(width)
        .zip(m.par_chunks(width))
        .for_each(|(frow, mrow)| {
            for (f, &[g11, g12, g22, h1, h2]) in frow.iter_mut().zip(mrow) {
                let idet = 1.0 / (g11 * g22 - g12 * g12 + 1e-3);
                *f = [(g22 * h1 - g12 * h2) * idet, (g11 * h2 - g12 * h1) * idet];
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn texture(x: f32, y: f32) -> f32 {
        128.0
            + 40.0 * (x * 0.2 + y * 0.08).sin()
            + 40.0 * (y * 0.18 - x * 0.06).cos()
            + 20.0 * ((x + y) * 0.12).sin()
    }

    fn shifted_pair(w: usize, h: usize, dx: f32, dy: f32) -> (GrayFrame, GrayFrame) {
        (
            GrayFrame::from_fn(w, h, |x, y| texture(x as f32, y as f32)),
            GrayFrame::from_fn(w, h, |x, y| texture(x as f32 - dx, y as f32 - dy)),
        )
    }

    fn interior_mean(flow: &FlowField, margin: usize) -> (f32, f32) {
        let (w, h) = flow.dim();
        let mut sum = (0.0, 0.0);
        let mut cnt = 0.0;
        for (x, y, m) in flow.iter() {
            if x >= margin && y >= margin && x + margin < w && y + margin < h {
                sum.0 += m.x;
                sum.1 += m.y;
                cnt += 1.0;
            }
        }
        (sum.0 / cnt, sum.1 / cnt)
    }

    #[test]
    fn polynomial_fit_is_exact_for_quadratics() {
        let kernel = PolyKernel::new(5, 1.2).unwrap();
        // f = 2x^2 + 0.5y^2 + 0.75xy + 3x - 4y + 7 around the centre pixel.
        let (w, h) = (21, 21);
        let img = GrayFrame::from_fn(w, h, |x, y| {
            let (x, y) = (x as f32 - 10.0, y as f32 - 10.0);
            2.0 * x * x + 0.5 * y * y + 0.75 * x * y + 3.0 * x - 4.0 * y + 7.0
        });
        let r = kernel.expand(img.as_slice(), w, h);
        let c = r[10 * w + 10];
        assert_approx_eq!(c[0], 3.0, 1e-2);
        assert_approx_eq!(c[1], -4.0, 1e-2);
        assert_approx_eq!(c[2], 2.0, 1e-2);
        assert_approx_eq!(c[3], 0.5, 1e-2);
        assert_approx_eq!(c[4], 0.75, 1e-2);
    }

    #[test]
    fn identical_frames_have_no_motion() {
        let (a, _) = shifted_pair(48, 40, 0.0, 0.0);
        let params = FarnebackParams {
            levels: 0,
            iterations: 1,
            ..Default::default()
        };
        let mut flow = FlowField::default();
        Farneback::new().estimate(&a, &a, &params, &mut flow).unwrap();
        assert_eq!(flow.dim(), (48, 40));
        for (x, y, m) in flow.iter() {
            if (12..36).contains(&x) && (12..28).contains(&y) {
                assert!(m.magnitude() < 1e-3, "{} {} {}", x, y, m);
            }
        }
    }

    #[test]
    fn recovers_subpixel_translation() {
        let (a, b) = shifted_pair(64, 64, 1.5, -0.5);
        let mut flow = FlowField::default();
        Farneback::new()
            .estimate(&a, &b, &Default::default(), &mut flow)
            .unwrap();
        let (mx, my) = interior_mean(&flow, 16);
        assert_approx_eq!(mx, 1.5, 0.25);
        assert_approx_eq!(my, -0.5, 0.25);
    }

    #[test]
    fn recovers_larger_translation_through_pyramid() {
        let (a, b) = shifted_pair(96, 96, 3.0, 2.0);
        let mut flow = FlowField::default();
        Farneback::new()
            .estimate(&a, &b, &Default::default(), &mut flow)
            .unwrap();
        let (mx, my) = interior_mean(&flow, 24);
        assert_approx_eq!(mx, 3.0, 0.5);
        assert_approx_eq!(my, 2.0, 0.5);
    }

    #[test]
    fn gaussian_window_flag() {
        let (a, b) = shifted_pair(64, 64, -1.0, 1.0);
        let params = FarnebackParams {
            flags: crate::estimator::FARNEBACK_GAUSSIAN,
            ..Default::default()
        };
        let mut flow = FlowField::default();
        Farneback::new().estimate(&a, &b, &params, &mut flow).unwrap();
        let (mx, my) = interior_mean(&flow, 16);
        assert_approx_eq!(mx, -1.0, 0.25);
        assert_approx_eq!(my, 1.0, 0.25);
    }

    #[test]
    fn rejects_mismatched_frames() {
        let a = GrayFrame::new(32, 32);
        let b = GrayFrame::new(32, 16);
        let mut flow = FlowField::default();
        assert!(Farneback::new()
            .estimate(&a, &b, &Default::default(), &mut flow)
            .is_err());
    }

    #[test]
    fn resize_keeps_constant_images() {
        let src = vec![[3.0f32, -1.0]; 8 * 6];
        let out = resize_bilinear(&src, 8, 6, 3, 5);
        assert_eq!(out.len(), 15);
        for [a, b] in out {
            assert_approx_eq!(a, 3.0);
            assert_approx_eq!(b, -1.0);
        }
    }

    #[test]
    fn blur_keeps_constant_images() {
        let src = vec![[7.0f32]; 10 * 4];
        let out = separable_blur(&src, 10, 4, &gaussian_kernel(5, 1.0));
        for [v] in out {
            assert_approx_eq!(v, 7.0, 1e-4);
        }
    }
}
