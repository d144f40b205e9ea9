//! Sparse epipolar displacement fields.

use crate::{Error, Raster, Region, Result};
use nalgebra::{Point2, Vector2};

/// Offsets from epipolar pixels to sensor pixels, sampled on a regular lattice.
///
/// Node `(i, j)` sits at epipolar pixel `(i * step, j * step)` and stores
/// `sensor_pixel - epipolar_pixel`. Nodes that could not be mapped hold NaN,
/// which propagates through interpolation so the warp pads those pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementField {
    step: u32,
    cols: u32,
    rows: u32,
    offsets: Vec<Vector2<f64>>,
}

impl DisplacementField {
    pub fn new(step: u32, cols: u32, rows: u32, offsets: Vec<Vector2<f64>>) -> Result<Self> {
        if step == 0 {
            return Err(Error::config("displacement lattice step must be >= 1"));
        }
        if cols == 0 || rows == 0 || offsets.len() != (cols * rows) as usize {
            return Err(Error::DimensionMismatch(format!(
                "lattice {}x{} needs {} offsets, got {}",
                cols,
                rows,
                cols as usize * rows as usize,
                offsets.len()
            )));
        }
        Ok(Self {
            step,
            cols,
            rows,
            offsets,
        })
    }

    /// All-zero field whose lattice covers `width x height` epipolar pixels.
    pub fn zeros(step: u32, width: u32, height: u32) -> Result<Self> {
        let (cols, rows) = Self::lattice_size(step.max(1), width, height);
        Self::new(step, cols, rows, vec![Vector2::zeros(); (cols * rows) as usize])
    }

    /// Node counts needed so the lattice reaches the last pixel of the extent.
    pub fn lattice_size(step: u32, width: u32, height: u32) -> (u32, u32) {
        let step = step.max(1);
        (
            width.saturating_sub(1).div_ceil(step) + 1,
            height.saturating_sub(1).div_ceil(step) + 1,
        )
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn node(&self, i: u32, j: u32) -> Vector2<f64> {
        self.offsets[(j * self.cols + i) as usize]
    }

    pub fn set_node(&mut self, i: u32, j: u32, offset: Vector2<f64>) {
        let idx = (j * self.cols + i) as usize;
        self.offsets[idx] = offset;
    }

    pub fn node_position(&self, i: u32, j: u32) -> Point2<f64> {
        Point2::new((i * self.step) as f64, (j * self.step) as f64)
    }

    pub fn valid_nodes(&self) -> usize {
        self.offsets
            .iter()
            .filter(|o| o.x.is_finite() && o.y.is_finite())
            .count()
    }

    /// Bilinear offset at an epipolar position, clamped to the lattice.
    pub fn offset_at(&self, x: f64, y: f64) -> Vector2<f64> {
        let (i0, i1, fx) = Self::axis_cell(x / self.step as f64, self.cols);
        let (j0, j1, fy) = Self::axis_cell(y / self.step as f64, self.rows);

        let taps = [
            (i0, j0, (1.0 - fx) * (1.0 - fy)),
            (i1, j0, fx * (1.0 - fy)),
            (i0, j1, (1.0 - fx) * fy),
            (i1, j1, fx * fy),
        ];

        // Zero-weight taps are skipped so an unmapped neighbour does not
        // poison positions sitting exactly on a valid node.
        let mut acc = Vector2::zeros();
        for (i, j, w) in taps {
            if w > 0.0 {
                acc += self.node(i, j) * w;
            }
        }
        acc
    }

    /// Sensor pixel reached from an epipolar position, `None` on unmapped lattice cells.
    pub fn sensor_position(&self, x: f64, y: f64) -> Option<Point2<f64>> {
        let o = self.offset_at(x, y);
        if o.x.is_finite() && o.y.is_finite() {
            Some(Point2::new(x + o.x, y + o.y))
        } else {
            None
        }
    }

    /// Full-resolution offsets over `region`.
    pub fn upsample(&self, region: Region) -> Raster<Vector2<f64>> {
        Raster::from_fn(region, |x, y| self.offset_at(x as f64, y as f64))
    }

    /// Bounding box `(min, max)` of the sensor positions reached from `region`.
    ///
    /// Interpolation is bilinear per lattice cell, so the extremes are found
    /// on the nodes of the cells touching the region.
    pub fn sensor_bounds(&self, region: Region) -> Option<(Point2<f64>, Point2<f64>)> {
        if region.is_empty() {
            return None;
        }
        let step = self.step as i32;
        let clamp_i = |v: i32, n: u32| v.clamp(0, n as i32 - 1) as u32;
        let i0 = clamp_i(region.x.div_euclid(step), self.cols);
        let i1 = clamp_i((region.right() - 1).div_euclid(step) + 1, self.cols);
        let j0 = clamp_i(region.y.div_euclid(step), self.rows);
        let j1 = clamp_i((region.bottom() - 1).div_euclid(step) + 1, self.rows);

        let mut lo = Point2::new(f64::INFINITY, f64::INFINITY);
        let mut hi = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        let mut extend = |p: Point2<f64>| {
            lo.x = lo.x.min(p.x);
            lo.y = lo.y.min(p.y);
            hi.x = hi.x.max(p.x);
            hi.y = hi.y.max(p.y);
        };

        for j in j0..=j1 {
            for i in i0..=i1 {
                let o = self.node(i, j);
                if o.x.is_finite() && o.y.is_finite() {
                    extend(self.node_position(i, j) + o);
                }
            }
        }
        // Positions clamped past the lattice edge keep the edge offset.
        for (x, y) in [
            (region.x, region.y),
            (region.right() - 1, region.y),
            (region.x, region.bottom() - 1),
            (region.right() - 1, region.bottom() - 1),
        ] {
            if let Some(p) = self.sensor_position(x as f64, y as f64) {
                extend(p);
            }
        }

        if lo.x.is_finite() {
            Some((lo, hi))
        } else {
            None
        }
    }

    fn axis_cell(t: f64, n: u32) -> (u32, u32, f64) {
        if n <= 1 {
            return (0, 0, 0.0);
        }
        let t = t.clamp(0.0, (n - 1) as f64);
        let i0 = (t.floor() as u32).min(n - 2);
        (i0, i0 + 1, t - i0 as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_field() -> DisplacementField {
        // offset = (0.5 * x, -0.25 * y) at the nodes
        let (cols, rows) = DisplacementField::lattice_size(4, 17, 9);
        let mut offsets = Vec::new();
        for j in 0..rows {
            for i in 0..cols {
                offsets.push(Vector2::new(0.5 * (i * 4) as f64, -0.25 * (j * 4) as f64));
            }
        }
        DisplacementField::new(4, cols, rows, offsets).unwrap()
    }

    #[test]
    fn lattice_reaches_last_pixel() {
        assert_eq!(DisplacementField::lattice_size(4, 100, 1), (26, 1));
        assert_eq!(DisplacementField::lattice_size(4, 97, 5), (25, 2));
        assert_eq!(DisplacementField::lattice_size(1, 3, 3), (3, 3));
    }

    #[test]
    fn bilinear_reproduces_linear_offsets() {
        let f = linear_field();
        let o = f.offset_at(6.5, 3.0);
        assert!((o.x - 3.25).abs() < 1e-12);
        assert!((o.y + 0.75).abs() < 1e-12);
    }

    #[test]
    fn upsample_matches_pointwise_offsets() {
        let mut f = linear_field();
        f.set_node(2, 1, Vector2::new(-3.0, 7.5));
        let region = Region::new(-2, 3, 21, 8);
        let dense = f.upsample(region);
        assert_eq!(dense.region(), region);
        for (x, y, o) in dense.iter_indexed() {
            assert_eq!(o, f.offset_at(x as f64, y as f64), "pixel ({x}, {y})");
        }
        assert_eq!(dense.get(8, 4), Some(Vector2::new(-3.0, 7.5)));
    }

    #[test]
    fn unmapped_node_poisons_its_cells() {
        let mut f = DisplacementField::zeros(2, 5, 5).unwrap();
        f.set_node(1, 1, Vector2::new(f64::NAN, f64::NAN));
        assert!(f.sensor_position(1.0, 1.0).is_none());
        assert!(f.sensor_position(4.0, 4.0).is_some());
        assert_eq!(f.valid_nodes(), 8);
    }

    #[test]
    fn sensor_bounds_enclose_region() {
        let f = linear_field();
        let region = Region::new(2, 1, 6, 5);
        let (lo, hi) = f.sensor_bounds(region).unwrap();
        for y in region.y..region.bottom() {
            for x in region.x..region.right() {
                let p = f.sensor_position(x as f64, y as f64).unwrap();
                assert!(p.x >= lo.x - 1e-9 && p.x <= hi.x + 1e-9);
                assert!(p.y >= lo.y - 1e-9 && p.y <= hi.y + 1e-9);
            }
        }
    }
}
