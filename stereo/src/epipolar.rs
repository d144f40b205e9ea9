//! Epipolar resampling grids
//!
//! Builds the pair of sparse displacement fields that warp a left/right
//! acquisition pair into a common epipolar frame, in which the images of a
//! ground point at the hypothesis elevation share the same pixel and
//! elevation changes move it along the rows.

use crate::Result;
use dem_core::{DisplacementField, Error, Region, SensorImage, SensorModel};
use nalgebra::{Point2, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpipolarParams {
    /// Lattice spacing in epipolar pixels.
    pub grid_step: u32,
    /// Sensor pixels per epipolar pixel.
    pub scale: f64,
    /// Elevation hypothesis at which both images are registered.
    pub average_elevation: f64,
    /// Elevation increment used to trace the local epipolar direction.
    pub elevation_offset: f64,
}

impl Default for EpipolarParams {
    fn default() -> Self {
        Self {
            grid_step: 4,
            scale: 1.0,
            average_elevation: 0.0,
            elevation_offset: 50.0,
        }
    }
}

impl EpipolarParams {
    pub fn validate(&self) -> Result<()> {
        if self.grid_step == 0 {
            return Err(Error::config("epipolar grid step must be >= 1"));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(Error::config(format!(
                "epipolar scale must be > 0, got {}",
                self.scale
            )));
        }
        if !self.average_elevation.is_finite() {
            return Err(Error::config("average elevation must be finite"));
        }
        if !(self.elevation_offset.is_finite() && self.elevation_offset != 0.0) {
            return Err(Error::config("epipolar elevation offset must be non-zero"));
        }
        Ok(())
    }
}

/// Displacement fields of both images over the shared epipolar extent.
#[derive(Debug, Clone, PartialEq)]
pub struct EpipolarGeometry {
    pub left: DisplacementField,
    pub right: DisplacementField,
    /// Rectified extent, anchored at the epipolar origin.
    pub extent: Region,
    /// Mean epipolar parallax in pixels per unit of elevation.
    pub mean_baseline_ratio: f64,
}

/// Affine epipolar frame linearised at the left image centre.
#[derive(Debug, Clone, Copy)]
struct Frame {
    centre: Point2<f64>,
    axis: Vector2<f64>,
    normal: Vector2<f64>,
    scale: f64,
}

impl Frame {
    fn to_frame(&self, p: &Point2<f64>) -> Vector2<f64> {
        let d = p - self.centre;
        Vector2::new(d.dot(&self.axis), d.dot(&self.normal)) / self.scale
    }

    fn to_sensor(&self, u: f64, v: f64) -> Point2<f64> {
        self.centre + (self.axis * u + self.normal * v) * self.scale
    }
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min: Vector2<f64>,
    max: Vector2<f64>,
}

impl Bounds {
    fn of(points: &[Vector2<f64>]) -> Self {
        let mut b = Bounds {
            min: Vector2::new(f64::INFINITY, f64::INFINITY),
            max: Vector2::new(f64::NEG_INFINITY, f64::NEG_INFINITY),
        };
        for p in points {
            b.min = b.min.inf(p);
            b.max = b.max.sup(p);
        }
        b
    }

    fn intersects(&self, other: &Bounds) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
    }

    fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }
}

/// One lattice node: left offset, right offset, parallax per unit elevation.
type Node = (Vector2<f64>, Vector2<f64>, Option<f64>);

fn unmapped() -> Vector2<f64> {
    Vector2::new(f64::NAN, f64::NAN)
}

pub struct EpipolarGridBuilder<'a> {
    left: &'a dyn SensorModel,
    left_extent: Region,
    right: &'a dyn SensorModel,
    right_extent: Region,
    params: EpipolarParams,
}

impl<'a> EpipolarGridBuilder<'a> {
    pub fn new(
        left: &'a dyn SensorModel,
        left_extent: Region,
        right: &'a dyn SensorModel,
        right_extent: Region,
    ) -> Self {
        Self {
            left,
            left_extent,
            right,
            right_extent,
            params: EpipolarParams::default(),
        }
    }

    pub fn with_params(mut self, params: EpipolarParams) -> Self {
        self.params = params;
        self
    }

    /// Local epipolar direction at a left sensor pixel, oriented along `reference`.
    ///
    /// The raw direction follows increasing elevation and is flipped when it
    /// points away from `reference`. Walks pass their previous direction.
    pub fn local_direction(
        &self,
        pixel: &Point2<f64>,
        reference: &Vector2<f64>,
    ) -> Option<Vector2<f64>> {
        let h = self.params.average_elevation;
        let dh = self.params.elevation_offset;
        let ground = self.left.forward(pixel, h)?;
        let right_pixel = self.right.inverse(&ground)?;

        let near = self.left.inverse(&self.right.forward(&right_pixel, h)?)?;
        let far = self.left.inverse(&self.right.forward(&right_pixel, h + dh)?)?;
        let d = far - near;
        let norm = d.norm();
        if !norm.is_finite() || norm < 1e-12 {
            return None;
        }
        let d = d / norm;
        Some(if d.dot(reference) < 0.0 { -d } else { d })
    }

    fn corners(extent: &Region) -> [Point2<f64>; 4] {
        let (x0, y0) = (extent.x as f64, extent.y as f64);
        let (x1, y1) = ((extent.right() - 1) as f64, (extent.bottom() - 1) as f64);
        [
            Point2::new(x0, y0),
            Point2::new(x1, y0),
            Point2::new(x0, y1),
            Point2::new(x1, y1),
        ]
    }

    fn right_node(&self, left_pixel: &Point2<f64>) -> Option<(Point2<f64>, f64)> {
        let h = self.params.average_elevation;
        let dh = self.params.elevation_offset;
        let near = self.right.inverse(&self.left.forward(left_pixel, h)?)?;
        let far = self.right.inverse(&self.left.forward(left_pixel, h + dh)?)?;
        let ratio = (far - near).norm() / (self.params.scale * dh.abs());
        Some((near, ratio))
    }

    pub fn build(&self) -> Result<EpipolarGeometry> {
        self.params.validate()?;
        if self.left_extent.is_empty() || self.right_extent.is_empty() {
            return Err(Error::geometry("empty sensor image extent"));
        }
        let h = self.params.average_elevation;

        let centre = Point2::new(
            (self.left_extent.x + self.left_extent.right() - 1) as f64 * 0.5,
            (self.left_extent.y + self.left_extent.bottom() - 1) as f64 * 0.5,
        );
        let axis = self.local_direction(&centre, &Vector2::x()).ok_or_else(|| {
            Error::geometry("cannot derive the epipolar direction at the left image centre")
        })?;
        let frame = Frame {
            centre,
            axis,
            normal: Vector2::new(-axis.y, axis.x),
            scale: self.params.scale,
        };

        let left_fp: Vec<_> = Self::corners(&self.left_extent)
            .iter()
            .map(|p| frame.to_frame(p))
            .collect();
        let mut right_fp = Vec::with_capacity(4);
        for corner in Self::corners(&self.right_extent) {
            let carried = self
                .right
                .forward(&corner, h)
                .and_then(|g| self.left.inverse(&g))
                .ok_or_else(|| Error::geometry("right image corner does not map into the left image"))?;
            right_fp.push(frame.to_frame(&carried));
        }

        let left_bounds = Bounds::of(&left_fp);
        let right_bounds = Bounds::of(&right_fp);
        if !left_bounds.intersects(&right_bounds) {
            return Err(Error::geometry(format!(
                "image footprints do not overlap at elevation {h}"
            )));
        }
        let bounds = left_bounds.union(&right_bounds);
        let size = bounds.max - bounds.min;
        let extent = Region::from_size(size.x.ceil() as u32 + 1, size.y.ceil() as u32 + 1);

        let step = self.params.grid_step;
        let (cols, rows) = DisplacementField::lattice_size(step, extent.width, extent.height);
        let stride = (step as f64) * self.params.scale;

        // Row starts walk down the local normal, each direction oriented
        // like the previous one.
        let mut starts = Vec::with_capacity(rows as usize);
        let mut start = frame.to_sensor(bounds.min.x, bounds.min.y);
        let mut heading = frame.axis;
        for _ in 0..rows {
            starts.push(start);
            heading = self.local_direction(&start, &heading).unwrap_or(heading);
            start += Vector2::new(-heading.y, heading.x) * stride;
        }

        let nodes: Vec<Vec<Node>> = starts
            .par_iter()
            .enumerate()
            .map(|(j, row_start)| {
                let mut node = *row_start;
                let mut heading = frame.axis;
                let mut out = Vec::with_capacity(cols as usize);
                for i in 0..cols {
                    let epi = Vector2::new((i * step) as f64, (j as u32 * step) as f64);
                    let entry = match self.right_node(&node) {
                        Some((right, ratio)) if right.coords.iter().all(|c| c.is_finite()) => {
                            (node.coords - epi, right.coords - epi, Some(ratio))
                        }
                        _ => (unmapped(), unmapped(), None),
                    };
                    out.push(entry);
                    heading = self.local_direction(&node, &heading).unwrap_or(heading);
                    node += heading * stride;
                }
                out
            })
            .collect();

        let mut left = Vec::with_capacity((cols * rows) as usize);
        let mut right = Vec::with_capacity((cols * rows) as usize);
        let mut ratio_sum = 0.0;
        let mut mapped = 0usize;
        for (l, r, ratio) in nodes.into_iter().flatten() {
            left.push(l);
            right.push(r);
            if let Some(ratio) = ratio {
                ratio_sum += ratio;
                mapped += 1;
            }
        }
        if mapped == 0 {
            return Err(Error::geometry("no epipolar lattice node could be mapped"));
        }
        let total = left.len();
        if mapped < total {
            tracing::warn!(mapped, total, "some epipolar lattice nodes are unmapped");
        }

        let geometry = EpipolarGeometry {
            left: DisplacementField::new(step, cols, rows, left)?,
            right: DisplacementField::new(step, cols, rows, right)?,
            extent,
            mean_baseline_ratio: ratio_sum / mapped as f64,
        };
        tracing::debug!(
            extent = ?geometry.extent,
            cols,
            rows,
            baseline_ratio = geometry.mean_baseline_ratio,
            "epipolar grids built"
        );
        Ok(geometry)
    }
}

/// Epipolar grids for a sensor image pair
pub fn build_epipolar_geometry(
    left: &SensorImage,
    right: &SensorImage,
    params: EpipolarParams,
) -> Result<EpipolarGeometry> {
    EpipolarGridBuilder::new(
        left.model.as_ref(),
        left.extent(),
        right.model.as_ref(),
        right.extent(),
    )
    .with_params(params)
    .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dem_core::{AffineSensorModel, CameraExtrinsics, CameraIntrinsics, PinholeSensorModel};
    use nalgebra::{Matrix3, Point3};

    fn pair(parallax: f64, right_shift: f64) -> (AffineSensorModel, AffineSensorModel) {
        let left = AffineSensorModel::north_up(Vector2::new(500.0, 800.0), 1.0, Vector2::zeros()).unwrap();
        let right = AffineSensorModel::north_up(
            Vector2::new(500.0 + right_shift, 800.0),
            1.0,
            Vector2::new(parallax, 0.0),
        )
        .unwrap();
        (left, right)
    }

    #[test]
    fn test_direction_follows_parallax() {
        let (l, r) = pair(0.2, 0.0);
        let extent = Region::from_size(50, 40);
        let b = EpipolarGridBuilder::new(&l, extent, &r, extent);
        let d = b.local_direction(&Point2::new(10.0, 10.0), &Vector2::x()).unwrap();
        assert!((d.x - 1.0).abs() < 1e-12 && d.y.abs() < 1e-12);

        // negative parallax is turned around to match the reference
        let (l, r) = pair(-0.2, 0.0);
        let b = EpipolarGridBuilder::new(&l, extent, &r, extent);
        let d = b.local_direction(&Point2::new(10.0, 10.0), &Vector2::x()).unwrap();
        assert!((d.x - 1.0).abs() < 1e-12);
        let d = b.local_direction(&Point2::new(10.0, 10.0), &Vector2::new(-1.0, 0.0)).unwrap();
        assert!((d.x + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_aligned_pair_gives_identity_left_grid() {
        let (l, r) = pair(0.2, 0.0);
        let extent = Region::from_size(50, 40);
        let geom = EpipolarGridBuilder::new(&l, extent, &r, extent).build().unwrap();

        assert_eq!(geom.extent, extent);
        assert_eq!(geom.left.valid_nodes(), (geom.left.cols() * geom.left.rows()) as usize);
        for (x, y) in [(0.0, 0.0), (17.0, 9.0), (49.0, 39.0)] {
            let p = geom.left.sensor_position(x, y).unwrap();
            assert!((p.x - x).abs() < 1e-9 && (p.y - y).abs() < 1e-9);
            let q = geom.right.sensor_position(x, y).unwrap();
            assert!((q.x - x).abs() < 1e-9 && (q.y - y).abs() < 1e-9);
        }
        assert!((geom.mean_baseline_ratio - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_shifted_pair_extends_extent() {
        // right image sees ground 10 units further east
        let (l, r) = pair(0.2, 10.0);
        let extent = Region::from_size(50, 40);
        let params = EpipolarParams {
            grid_step: 5,
            ..Default::default()
        };
        let geom = EpipolarGridBuilder::new(&l, extent, &r, extent)
            .with_params(params)
            .build()
            .unwrap();
        assert_eq!(geom.extent, Region::from_size(60, 40));
        // epipolar (15, 5) is left pixel (15, 5) and right pixel (5, 5)
        let p = geom.left.sensor_position(15.0, 5.0).unwrap();
        let q = geom.right.sensor_position(15.0, 5.0).unwrap();
        assert!((p - Point2::new(15.0, 5.0)).norm() < 1e-9);
        assert!((q - Point2::new(5.0, 5.0)).norm() < 1e-9);
    }

    #[test]
    fn test_disjoint_footprints_are_a_geometry_error() {
        let (l, r) = pair(0.2, 1000.0);
        let extent = Region::from_size(50, 40);
        let err = EpipolarGridBuilder::new(&l, extent, &r, extent).build().unwrap_err();
        assert!(matches!(err, Error::Geometry(_)));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let (l, r) = pair(0.2, 0.0);
        let extent = Region::from_size(10, 10);
        for params in [
            EpipolarParams { grid_step: 0, ..Default::default() },
            EpipolarParams { scale: 0.0, ..Default::default() },
            EpipolarParams { elevation_offset: 0.0, ..Default::default() },
        ] {
            let err = EpipolarGridBuilder::new(&l, extent, &r, extent)
                .with_params(params)
                .build()
                .unwrap_err();
            assert!(matches!(err, Error::Config(_)));
        }
    }

    /// Frame camera 1000 above the ground at `(0, y)`, pitched by `pitch`
    /// about the east axis. Camera x is east, camera y is south.
    fn pinhole(y: f64, pitch: f64) -> PinholeSensorModel {
        let (s, c) = pitch.sin_cos();
        let rotation = Matrix3::new(1.0, 0.0, 0.0, 0.0, -c, s, 0.0, -s, -c);
        let intrinsics = CameraIntrinsics::new(500.0, 500.0, 49.5, 39.5, 100, 80);
        PinholeSensorModel::new(
            intrinsics,
            CameraExtrinsics::from_center(rotation, &Point3::new(0.0, y, 1000.0)),
        )
    }

    #[test]
    fn test_along_track_pinhole_pair_stays_on_the_image() {
        // North-south baseline: the epipolar lines run along the columns and
        // their x component changes sign across the image.
        let left = pinhole(20.0, 0.02);
        let right = pinhole(-20.0, -0.02);
        let extent = Region::from_size(100, 80);
        let b = EpipolarGridBuilder::new(&left, extent, &right, extent);

        let up = Vector2::new(0.0, 1.0);
        for x in [0.0, 49.0, 56.0, 99.0] {
            let d = b.local_direction(&Point2::new(x, 40.0), &up).unwrap();
            assert!(d.y > 0.99, "direction {d:?} at x = {x}");
        }

        let geom = b.build().unwrap();
        let field = &geom.left;
        let total = (field.cols() * field.rows()) as usize;
        assert_eq!(field.valid_nodes(), total);

        let mut inside = 0;
        for j in 0..field.rows() {
            let sensor = |i: u32| field.node_position(i, j) + field.node(i, j);
            let first = sensor(1) - sensor(0);
            for i in 0..field.cols() {
                let p = sensor(i);
                if (0.0..=99.0).contains(&p.x) && (0.0..=79.0).contains(&p.y) {
                    inside += 1;
                }
                if i > 0 {
                    let d = sensor(i) - sensor(i - 1);
                    assert!(d.dot(&first) > 0.0, "row {j} turns back at node {i}");
                }
            }
        }
        assert!(inside * 4 >= total * 3, "{inside} of {total} nodes on the left image");
        assert!(geom.mean_baseline_ratio > 0.015 && geom.mean_baseline_ratio < 0.03);
    }
}
