use dem_core::{Error, Raster, Result};
use serde::{Deserialize, Serialize};

/// Largest BCO radius accepted; keeps the tap weights on the stack.
pub const MAX_BCO_RADIUS: u32 = 8;
const MAX_TAPS: usize = 2 * MAX_BCO_RADIUS as usize + 1;

/// Interpolation kernel used when sampling at non-integer positions.
///
/// Pixel centres sit on integer coordinates. Taps falling outside the
/// sampled raster replicate its edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Interpolation {
    Nearest,
    Linear,
    /// Bicubic convolution over `2 * radius + 1` taps per axis.
    Bco { radius: u32, alpha: f64 },
}

impl Default for Interpolation {
    fn default() -> Self {
        Self::bco(2)
    }
}

impl Interpolation {
    pub fn bco(radius: u32) -> Self {
        Interpolation::Bco {
            radius,
            alpha: -0.5,
        }
    }

    /// Support radius in pixels.
    pub fn radius(&self) -> u32 {
        match self {
            Interpolation::Nearest => 0,
            Interpolation::Linear => 1,
            Interpolation::Bco { radius, .. } => *radius,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Interpolation::Bco { radius, alpha } = *self {
            if radius == 0 || radius > MAX_BCO_RADIUS {
                return Err(Error::config(format!(
                    "BCO radius must be in 1..={MAX_BCO_RADIUS}, got {radius}"
                )));
            }
            if !alpha.is_finite() {
                return Err(Error::config("BCO alpha must be finite"));
            }
        }
        Ok(())
    }

    pub fn sample(&self, src: &Raster<f32>, x: f64, y: f64) -> f32 {
        match *self {
            Interpolation::Nearest => {
                sample_clamped(src, x.round() as i32, y.round() as i32) as f32
            }
            Interpolation::Linear => sample_bilinear(src, x, y) as f32,
            Interpolation::Bco { radius, alpha } => sample_bco(src, x, y, radius, alpha) as f32,
        }
    }
}

#[inline]
fn sample_clamped(src: &Raster<f32>, x: i32, y: i32) -> f64 {
    let r = src.region();
    if r.is_empty() {
        return 0.0;
    }
    let cx = x.clamp(r.x, r.right() - 1);
    let cy = y.clamp(r.y, r.bottom() - 1);
    src.get(cx, cy).unwrap_or(0.0) as f64
}

/// Bilinear sample with edge replication.
pub fn sample_bilinear(src: &Raster<f32>, x: f64, y: f64) -> f64 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i32, y0 as i32);

    let v00 = sample_clamped(src, x0, y0);
    let v10 = sample_clamped(src, x0 + 1, y0);
    let v01 = sample_clamped(src, x0, y0 + 1);
    let v11 = sample_clamped(src, x0 + 1, y0 + 1);

    let v0 = v00 * (1.0 - fx) + v10 * fx;
    let v1 = v01 * (1.0 - fx) + v11 * fx;

    v0 * (1.0 - fy) + v1 * fy
}

/// Normalised BCO weights for the taps around the nearest pixel.
///
/// The cubic convolution kernel (support 2) is stretched so its support
/// covers `radius` pixels on each side.
fn bco_weights(offset: f64, radius: u32, alpha: f64, weights: &mut [f64; MAX_TAPS]) -> usize {
    let taps = 2 * radius as usize + 1;
    let step = 2.0 / radius as f64;
    let mut position = -(radius as f64) * step;
    let mut sum = 0.0;
    for w in weights.iter_mut().take(taps) {
        let dist = (position - offset * step).abs();
        *w = if dist <= 1.0 {
            (alpha + 2.0) * dist.powi(3) - (alpha + 3.0) * dist * dist + 1.0
        } else if dist <= 2.0 {
            alpha * dist.powi(3) - 5.0 * alpha * dist * dist + 8.0 * alpha * dist - 4.0 * alpha
        } else {
            0.0
        };
        sum += *w;
        position += step;
    }
    if sum.abs() > f64::EPSILON {
        for w in weights.iter_mut().take(taps) {
            *w /= sum;
        }
    }
    taps
}

fn sample_bco(src: &Raster<f32>, x: f64, y: f64, radius: u32, alpha: f64) -> f64 {
    let cx = (x + 0.5).floor();
    let cy = (y + 0.5).floor();

    let mut wx = [0.0; MAX_TAPS];
    let mut wy = [0.0; MAX_TAPS];
    let taps = bco_weights(x - cx, radius, alpha, &mut wx);
    bco_weights(y - cy, radius, alpha, &mut wy);

    let r = radius as i32;
    let (cx, cy) = (cx as i32, cy as i32);
    let mut value = 0.0;
    for (j, &wj) in wy.iter().enumerate().take(taps) {
        if wj == 0.0 {
            continue;
        }
        let py = cy - r + j as i32;
        let mut row = 0.0;
        for (i, &wi) in wx.iter().enumerate().take(taps) {
            if wi != 0.0 {
                row += wi * sample_clamped(src, cx - r + i as i32, py);
            }
        }
        value += wj * row;
    }
    value
}
