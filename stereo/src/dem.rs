//! Elevation grids from disparities
//!
//! Valid disparities are turned into ground points by intersecting the
//! lines of sight of both images, then merged into a north-up grid where
//! each cell keeps the highest elevation offered to it.

use crate::{DisparityMap, Result};
use dem_core::{
    midpoint_intersection, DisplacementField, Error, Mask, Raster, Ray, Region, SensorModel,
};
use image::GrayImage;
use nalgebra::{Point2, Point3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// North-up grid layout: `origin` is the upper-left corner of cell `(0, 0)`,
/// columns grow eastwards and rows southwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DemGeometry {
    pub origin: Point2<f64>,
    pub spacing: f64,
    pub width: u32,
    pub height: u32,
}

impl DemGeometry {
    pub fn new(origin: Point2<f64>, spacing: f64, width: u32, height: u32) -> Result<Self> {
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(Error::config(format!("DEM spacing must be > 0, got {spacing}")));
        }
        if width == 0 || height == 0 {
            return Err(Error::DimensionMismatch("DEM grid must have at least one cell".into()));
        }
        Ok(Self {
            origin,
            spacing,
            width,
            height,
        })
    }

    /// Footprint of a sensor image over the elevation range.
    pub fn from_sensor_envelope(
        model: &dyn SensorModel,
        extent: Region,
        elevation_min: f64,
        elevation_max: f64,
        spacing: f64,
    ) -> Result<Self> {
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(Error::config(format!("DEM spacing must be > 0, got {spacing}")));
        }
        if extent.is_empty() {
            return Err(Error::geometry("cannot build a DEM over an empty image"));
        }
        let (x0, y0) = (extent.x as f64 - 0.5, extent.y as f64 - 0.5);
        let (x1, y1) = (extent.right() as f64 - 0.5, extent.bottom() as f64 - 0.5);

        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for corner in [(x0, y0), (x1, y0), (x0, y1), (x1, y1)] {
            for elevation in [elevation_min, elevation_max] {
                let g = model
                    .forward(&Point2::new(corner.0, corner.1), elevation)
                    .ok_or_else(|| Error::geometry("image corner does not reach the ground"))?;
                min_x = min_x.min(g.x);
                min_y = min_y.min(g.y);
                max_x = max_x.max(g.x);
                max_y = max_y.max(g.y);
            }
        }

        let width = (((max_x - min_x) / spacing).ceil() as u32).max(1);
        let height = (((max_y - min_y) / spacing).ceil() as u32).max(1);
        Self::new(Point2::new(min_x, max_y), spacing, width, height)
    }

    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Cell holding a ground position.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(u32, u32)> {
        let col = ((x - self.origin.x) / self.spacing).floor();
        let row = ((self.origin.y - y) / self.spacing).floor();
        if col < 0.0 || row < 0.0 || col >= self.width as f64 || row >= self.height as f64 {
            return None;
        }
        Some((col as u32, row as u32))
    }

    pub fn cell_center(&self, col: u32, row: u32) -> Point2<f64> {
        Point2::new(
            self.origin.x + (col as f64 + 0.5) * self.spacing,
            self.origin.y - (row as f64 + 0.5) * self.spacing,
        )
    }
}

/// Bit pattern of a never-written cell; a NaN, so no elevation collides with it.
const EMPTY: u64 = u64::MAX;

/// Shared elevation grid with a max-wins merge.
///
/// Cells only ever move to higher elevations, so the final grid does not
/// depend on the order in which concurrent writers offer their values.
#[derive(Debug)]
pub struct DemGrid {
    geometry: DemGeometry,
    cells: Vec<AtomicU64>,
}

impl DemGrid {
    pub fn new(geometry: DemGeometry) -> Self {
        let cells = (0..geometry.cell_count()).map(|_| AtomicU64::new(EMPTY)).collect();
        Self { geometry, cells }
    }

    pub fn geometry(&self) -> &DemGeometry {
        &self.geometry
    }

    fn index(&self, col: u32, row: u32) -> Option<usize> {
        (col < self.geometry.width && row < self.geometry.height)
            .then(|| row as usize * self.geometry.width as usize + col as usize)
    }

    /// Writes `z` iff the cell is empty or holds a lower elevation.
    ///
    /// Returns whether the cell changed.
    pub fn offer(&self, col: u32, row: u32, z: f64) -> bool {
        let Some(idx) = self.index(col, row) else {
            return false;
        };
        if !z.is_finite() {
            return false;
        }
        self.cells[idx]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == EMPTY || z > f64::from_bits(current) {
                    Some(z.to_bits())
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Offers `z` to the cell holding ground position `(x, y)`.
    pub fn offer_at(&self, x: f64, y: f64, z: f64) -> bool {
        match self.geometry.cell_of(x, y) {
            Some((col, row)) => self.offer(col, row, z),
            None => false,
        }
    }

    pub fn get(&self, col: u32, row: u32) -> Option<f64> {
        let bits = self.cells[self.index(col, row)?].load(Ordering::Acquire);
        (bits != EMPTY).then(|| f64::from_bits(bits))
    }

    pub fn written_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| c.load(Ordering::Acquire) != EMPTY)
            .count()
    }

    fn region(&self) -> Region {
        Region::from_size(self.geometry.width, self.geometry.height)
    }

    pub fn written_mask(&self) -> Mask {
        Raster::from_fn(self.region(), |x, y| self.get(x as u32, y as u32).is_some())
    }

    /// Elevations as a raster, `no_data` in never-written cells.
    pub fn to_raster(&self, no_data: f32) -> Raster<f32> {
        Raster::from_fn(self.region(), |x, y| {
            self.get(x as u32, y as u32).map_or(no_data, |z| z as f32)
        })
    }

    /// Rescaled elevations for visualization, no-data cells black.
    pub fn to_printable_image(&self) -> GrayImage {
        self.to_raster(f32::NAN).to_printable_image(Some(&self.written_mask()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElevationPolicy {
    /// Drop triangulated points outside the elevation range.
    #[default]
    Discard,
    /// Clamp them into the range.
    Clamp,
}

/// Counters of one projection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionStats {
    /// Valid disparity pixels considered.
    pub candidates: usize,
    /// Pixels whose epipolar position is unmapped or whose rays failed.
    pub unmapped: usize,
    /// Pairs of (near) parallel rays.
    pub no_intersection: usize,
    pub out_of_range: usize,
    pub clamped: usize,
    pub outside_grid: usize,
    /// Points offered to the grid.
    pub offered: usize,
    /// Offers that raised a cell.
    pub written: usize,
}

impl AddAssign for ProjectionStats {
    fn add_assign(&mut self, rhs: Self) {
        self.candidates += rhs.candidates;
        self.unmapped += rhs.unmapped;
        self.no_intersection += rhs.no_intersection;
        self.out_of_range += rhs.out_of_range;
        self.clamped += rhs.clamped;
        self.outside_grid += rhs.outside_grid;
        self.offered += rhs.offered;
        self.written += rhs.written;
    }
}

#[derive(Default)]
struct AtomicStats {
    candidates: AtomicUsize,
    unmapped: AtomicUsize,
    no_intersection: AtomicUsize,
    out_of_range: AtomicUsize,
    clamped: AtomicUsize,
    outside_grid: AtomicUsize,
    offered: AtomicUsize,
    written: AtomicUsize,
}

impl AtomicStats {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProjectionStats {
        ProjectionStats {
            candidates: self.candidates.load(Ordering::Relaxed),
            unmapped: self.unmapped.load(Ordering::Relaxed),
            no_intersection: self.no_intersection.load(Ordering::Relaxed),
            out_of_range: self.out_of_range.load(Ordering::Relaxed),
            clamped: self.clamped.load(Ordering::Relaxed),
            outside_grid: self.outside_grid.load(Ordering::Relaxed),
            offered: self.offered.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
        }
    }
}

/// Triangulates disparities through the epipolar fields of both images.
pub struct DemProjector<'a> {
    left_model: &'a dyn SensorModel,
    right_model: &'a dyn SensorModel,
    left_field: &'a DisplacementField,
    right_field: &'a DisplacementField,
    elevation_min: f64,
    elevation_max: f64,
    policy: ElevationPolicy,
}

impl<'a> DemProjector<'a> {
    pub fn new(
        left_model: &'a dyn SensorModel,
        right_model: &'a dyn SensorModel,
        left_field: &'a DisplacementField,
        right_field: &'a DisplacementField,
        elevation_min: f64,
        elevation_max: f64,
    ) -> Result<Self> {
        if !(elevation_min.is_finite() && elevation_max.is_finite()) || elevation_min >= elevation_max
        {
            return Err(Error::config(format!(
                "elevation range must satisfy min < max, got [{elevation_min}, {elevation_max}]"
            )));
        }
        Ok(Self {
            left_model,
            right_model,
            left_field,
            right_field,
            elevation_min,
            elevation_max,
            policy: ElevationPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: ElevationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Ground point of one disparity, `Err` names the counter to bump.
    fn triangulate(&self, x: i32, y: i32, h: f32, v: f32) -> std::result::Result<Point3<f64>, Skip> {
        let left = self
            .left_field
            .sensor_position(x as f64, y as f64)
            .ok_or(Skip::Unmapped)?;
        let right = self
            .right_field
            .sensor_position(x as f64 + h as f64, y as f64 + v as f64)
            .ok_or(Skip::Unmapped)?;

        let rays = [
            Ray::from_sensor(self.left_model, &left, self.elevation_min, self.elevation_max)
                .ok_or(Skip::Unmapped)?,
            Ray::from_sensor(self.right_model, &right, self.elevation_min, self.elevation_max)
                .ok_or(Skip::Unmapped)?,
        ];
        midpoint_intersection(&rays).ok_or(Skip::NoIntersection)
    }

    /// Projects every valid disparity (also set in `mask`, if any) into `grid`.
    pub fn project(&self, disparity: &DisparityMap, mask: Option<&Mask>, grid: &DemGrid) -> ProjectionStats {
        let stats = AtomicStats::default();
        let region = disparity.region();

        (region.y..region.bottom()).into_par_iter().for_each(|y| {
            for x in region.x..region.right() {
                let Some((h, v)) = disparity.get(x, y) else {
                    continue;
                };
                if mask.is_some_and(|m| !m.get_or(x, y, false)) {
                    continue;
                }
                AtomicStats::bump(&stats.candidates);

                let mut point = match self.triangulate(x, y, h, v) {
                    Ok(p) => p,
                    Err(Skip::Unmapped) => {
                        AtomicStats::bump(&stats.unmapped);
                        continue;
                    }
                    Err(Skip::NoIntersection) => {
                        AtomicStats::bump(&stats.no_intersection);
                        continue;
                    }
                };

                if point.z < self.elevation_min || point.z > self.elevation_max {
                    match self.policy {
                        ElevationPolicy::Discard => {
                            AtomicStats::bump(&stats.out_of_range);
                            continue;
                        }
                        ElevationPolicy::Clamp => {
                            AtomicStats::bump(&stats.clamped);
                            point.z = point.z.clamp(self.elevation_min, self.elevation_max);
                        }
                    }
                }

                let Some((col, row)) = grid.geometry().cell_of(point.x, point.y) else {
                    AtomicStats::bump(&stats.outside_grid);
                    continue;
                };
                AtomicStats::bump(&stats.offered);
                if grid.offer(col, row, point.z) {
                    AtomicStats::bump(&stats.written);
                }
            }
        });

        let stats = stats.snapshot();
        tracing::debug!(?region, ?stats, "disparities projected");
        stats
    }
}

enum Skip {
    Unmapped,
    NoIntersection,
}
