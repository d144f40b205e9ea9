//! Sensor projection models and ray geometry.
//!
//! Ground coordinates are `(x, y, z)` with `z` the elevation; `x` grows
//! eastwards and `y` northwards. Pixel coordinates are `(column, row)`.

use crate::{Error, Result};
use nalgebra::{Matrix2, Matrix3, Point2, Point3, Unit, Vector2, Vector3};

/// Pixel <-> ground projection capability of one acquisition.
pub trait SensorModel: Send + Sync {
    /// Ground point seen at `pixel` when the terrain lies at `elevation`.
    fn forward(&self, pixel: &Point2<f64>, elevation: f64) -> Option<Point3<f64>>;

    /// Pixel in which `ground` is imaged.
    fn inverse(&self, ground: &Point3<f64>) -> Option<Point2<f64>>;
}

/// Parallel projection with a constant height parallax.
///
/// `ground.xy = origin + axes * (col, row) + elevation * parallax`. This is
/// the local linearisation of a pushbroom acquisition and gives exact
/// epipolar lines, which makes it the workhorse for synthetic scenes.
#[derive(Debug, Clone, Copy)]
pub struct AffineSensorModel {
    pub origin: Vector2<f64>,
    pub axes: Matrix2<f64>,
    pub parallax: Vector2<f64>,
    inverse_axes: Matrix2<f64>,
}

impl AffineSensorModel {
    pub fn new(origin: Vector2<f64>, axes: Matrix2<f64>, parallax: Vector2<f64>) -> Result<Self> {
        let inverse_axes = axes
            .try_inverse()
            .ok_or_else(|| Error::config("affine sensor axes must be invertible"))?;
        Ok(Self {
            origin,
            axes,
            parallax,
            inverse_axes,
        })
    }

    /// North-up sensor with square pixels of `gsd` ground units.
    pub fn north_up(origin: Vector2<f64>, gsd: f64, parallax: Vector2<f64>) -> Result<Self> {
        Self::new(origin, Matrix2::new(gsd, 0.0, 0.0, -gsd), parallax)
    }
}

impl SensorModel for AffineSensorModel {
    fn forward(&self, pixel: &Point2<f64>, elevation: f64) -> Option<Point3<f64>> {
        let xy = self.origin + self.axes * pixel.coords + self.parallax * elevation;
        Some(Point3::new(xy.x, xy.y, elevation))
    }

    fn inverse(&self, ground: &Point3<f64>) -> Option<Point2<f64>> {
        let planar = Vector2::new(ground.x, ground.y) - self.origin - self.parallax * ground.z;
        Some(Point2::from(self.inverse_axes * planar))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    pub fn project(&self, point: &Point3<f64>) -> Point2<f64> {
        let x = point.x / point.z;
        let y = point.y / point.z;
        Point2::new(x * self.fx + self.cx, y * self.fy + self.cy)
    }

    /// Viewing direction of a pixel in the camera frame (z = 1).
    pub fn unproject_direction(&self, pixel: &Point2<f64>) -> Vector3<f64> {
        Vector3::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
            1.0,
        )
    }
}

/// World-to-camera rigid transform: `p_cam = rotation * p_world + translation`.
#[derive(Debug, Clone, Copy)]
pub struct CameraExtrinsics {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl CameraExtrinsics {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Camera at `center` with the given world-to-camera rotation.
    pub fn from_center(rotation: Matrix3<f64>, center: &Point3<f64>) -> Self {
        Self {
            rotation,
            translation: -(rotation * center.coords),
        }
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * point.coords + self.translation)
    }

    pub fn center(&self) -> Point3<f64> {
        Point3::from(-(self.rotation.transpose() * self.translation))
    }
}

impl Default for CameraExtrinsics {
    fn default() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }
}

/// Frame camera looking at a Z-up world; terrain hypotheses are horizontal planes.
#[derive(Debug, Clone, Copy)]
pub struct PinholeSensorModel {
    pub intrinsics: CameraIntrinsics,
    pub extrinsics: CameraExtrinsics,
}

impl PinholeSensorModel {
    pub fn new(intrinsics: CameraIntrinsics, extrinsics: CameraExtrinsics) -> Self {
        Self {
            intrinsics,
            extrinsics,
        }
    }
}

impl SensorModel for PinholeSensorModel {
    fn forward(&self, pixel: &Point2<f64>, elevation: f64) -> Option<Point3<f64>> {
        let center = self.extrinsics.center();
        let dir =
            self.extrinsics.rotation.transpose() * self.intrinsics.unproject_direction(pixel);
        if dir.z.abs() < 1e-12 {
            return None;
        }
        let s = (elevation - center.z) / dir.z;
        if s <= 0.0 {
            return None;
        }
        Some(center + dir * s)
    }

    fn inverse(&self, ground: &Point3<f64>) -> Option<Point2<f64>> {
        let p_cam = self.extrinsics.transform_point(ground);
        if p_cam.z <= 1e-12 {
            return None;
        }
        Some(self.intrinsics.project(&p_cam))
    }
}

/// Half-line of sight.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Point3<f64>,
    pub direction: Unit<Vector3<f64>>,
}

impl Ray {
    pub fn new(origin: Point3<f64>, direction: Vector3<f64>) -> Option<Self> {
        Unit::try_new(direction, 1e-12).map(|direction| Self { origin, direction })
    }

    pub fn through(from: &Point3<f64>, to: &Point3<f64>) -> Option<Self> {
        Self::new(*from, to - from)
    }

    /// Line of sight of `pixel`, from its ground point at `elevation_max` down to `elevation_min`.
    pub fn from_sensor(
        model: &dyn SensorModel,
        pixel: &Point2<f64>,
        elevation_min: f64,
        elevation_max: f64,
    ) -> Option<Self> {
        let top = model.forward(pixel, elevation_max)?;
        let bottom = model.forward(pixel, elevation_min)?;
        Self::through(&top, &bottom)
    }

    pub fn distance_to(&self, p: &Point3<f64>) -> f64 {
        let v = p - self.origin;
        (v - self.direction.into_inner() * v.dot(&self.direction)).norm()
    }
}

/// Point minimising the sum of squared distances to the rays.
///
/// For two rays this is the mid-point of their closest approach. Returns
/// `None` for fewer than two rays or (near) parallel ones.
pub fn midpoint_intersection(rays: &[Ray]) -> Option<Point3<f64>> {
    if rays.len() < 2 {
        return None;
    }
    let mut a = Matrix3::<f64>::zeros();
    let mut b = Vector3::<f64>::zeros();
    for ray in rays {
        let d = ray.direction.into_inner();
        let proj = Matrix3::identity() - d * d.transpose();
        a += proj;
        b += proj * ray.origin.coords;
    }
    if a.determinant().abs() < 1e-12 {
        return None;
    }
    a.lu().solve(&b).map(Point3::from)
}
