//! Stereo reconstruction stages
//!
//! Epipolar grid construction, dense block matching, sub-pixel refinement,
//! median outlier filtering and projection of disparities into an
//! elevation grid, composed by a tiled [`pipeline::StereoPipeline`].

use dem_core::{Mask, Raster, Region};
use image::GrayImage;

pub mod block_matching;
pub mod config;
pub mod dem;
pub mod epipolar;
pub mod median;
pub mod pipeline;
pub mod subpixel;

pub use block_matching::*;
pub use config::*;
pub use dem::*;
pub use epipolar::*;
pub use median::*;
pub use pipeline::*;
pub use subpixel::*;

pub use dem_core::{Error, Result};

/// Dense disparity matching trait over epipolar rasters
pub trait StereoMatcher {
    fn compute(&self, input: &MatchInput<'_>, output: Region) -> Result<MatchOutput>;
}

/// Horizontal and vertical disparities aligned with the left epipolar image.
///
/// `right = left + (horizontal, vertical)`. Values at invalid pixels are
/// meaningless.
#[derive(Debug, Clone, PartialEq)]
pub struct DisparityMap {
    pub horizontal: Raster<f32>,
    pub vertical: Raster<f32>,
    pub valid: Mask,
    /// Winning similarity score per pixel, when requested.
    pub metric: Option<Raster<f32>>,
}

impl DisparityMap {
    /// All-invalid map over `region`.
    pub fn new(region: Region) -> Self {
        Self {
            horizontal: Raster::filled(region, 0.0),
            vertical: Raster::filled(region, 0.0),
            valid: Raster::filled(region, false),
            metric: None,
        }
    }

    pub fn with_metric(mut self) -> Self {
        self.metric = Some(Raster::filled(self.region(), f32::NAN));
        self
    }

    pub fn region(&self) -> Region {
        self.valid.region()
    }

    /// `(horizontal, vertical)` at a valid pixel.
    pub fn get(&self, x: i32, y: i32) -> Option<(f32, f32)> {
        if !self.valid.get_or(x, y, false) {
            return None;
        }
        Some((self.horizontal.get(x, y)?, self.vertical.get(x, y)?))
    }

    pub fn set(&mut self, x: i32, y: i32, h: f32, v: f32) {
        if self.horizontal.set(x, y, h) {
            self.vertical.set(x, y, v);
            self.valid.set(x, y, true);
        }
    }

    pub fn invalidate(&mut self, x: i32, y: i32) {
        self.valid.set(x, y, false);
    }

    pub fn valid_count(&self) -> usize {
        self.valid.count_true()
    }

    /// Copies the overlapping part of `tile`; the metric follows when both carry one.
    pub fn paste(&mut self, tile: &DisparityMap) {
        self.horizontal.paste(&tile.horizontal);
        self.vertical.paste(&tile.vertical);
        self.valid.paste(&tile.valid);
        if let (Some(dst), Some(src)) = (self.metric.as_mut(), tile.metric.as_ref()) {
            dst.paste(src);
        }
    }

    pub fn crop(&self, region: Region) -> Result<DisparityMap> {
        Ok(Self {
            horizontal: self.horizontal.crop(region)?,
            vertical: self.vertical.crop(region)?,
            valid: self.valid.crop(region)?,
            metric: self.metric.as_ref().map(|m| m.crop(region)).transpose()?,
        })
    }

    /// Rescaled horizontal and vertical disparities for visualization
    pub fn to_images(&self) -> (GrayImage, GrayImage) {
        (
            self.horizontal.to_printable_image(Some(&self.valid)),
            self.vertical.to_printable_image(Some(&self.valid)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disparity_map() {
        let mut disp = DisparityMap::new(Region::from_size(10, 10));
        assert_eq!(disp.valid_count(), 0);

        disp.set(5, 5, -3.5, 0.25);
        assert_eq!(disp.get(5, 5), Some((-3.5, 0.25)));
        assert_eq!(disp.get(4, 5), None);

        disp.invalidate(5, 5);
        assert_eq!(disp.get(5, 5), None);

        let (h, v) = disp.to_images();
        assert_eq!(h.width(), 10);
        assert_eq!(v.height(), 10);
    }

    #[test]
    fn test_paste_tile_keeps_global_position() {
        let mut full = DisparityMap::new(Region::from_size(8, 8)).with_metric();
        let mut tile = DisparityMap::new(Region::new(4, 4, 4, 4)).with_metric();
        tile.set(5, 6, -2.0, 1.0);
        if let Some(m) = tile.metric.as_mut() {
            m.set(5, 6, 0.9);
        }
        full.paste(&tile);
        assert_eq!(full.get(5, 6), Some((-2.0, 1.0)));
        assert_eq!(full.metric.as_ref().and_then(|m| m.get(5, 6)), Some(0.9));
        assert_eq!(full.valid_count(), 1);
    }
}
