//! Resampling of sensor images into the epipolar frame.

use crate::Interpolation;
use dem_core::{DisplacementField, Raster, Region, Result, TileSource};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpParams {
    pub interpolation: Interpolation,
    /// Value written where the sensor position is unmapped or off the image.
    pub edge_padding: f32,
}

impl Default for WarpParams {
    fn default() -> Self {
        Self {
            interpolation: Interpolation::default(),
            edge_padding: 0.0,
        }
    }
}

impl WarpParams {
    pub fn new(interpolation: Interpolation) -> Self {
        Self {
            interpolation,
            ..Default::default()
        }
    }

    pub fn with_edge_padding(mut self, padding: f32) -> Self {
        self.edge_padding = padding;
        self
    }
}

/// Sensor region needed to fill `output`, dilated by the kernel support and
/// clipped to `source_extent`. `None` when no output pixel reaches the source.
pub fn required_input_region(
    field: &DisplacementField,
    output: Region,
    source_extent: Region,
    interpolation: Interpolation,
) -> Option<Region> {
    let (lo, hi) = field.sensor_bounds(output)?;
    let radius = interpolation.radius() as i32;
    let wanted = Region::from_bounds(
        lo.x.floor() as i32 - radius - 1,
        lo.y.floor() as i32 - radius - 1,
        hi.x.ceil() as i32 + radius + 2,
        hi.y.ceil() as i32 + radius + 2,
    );
    wanted.intersect(&source_extent)
}

#[inline]
fn inside_extent(extent: &Region, x: f64, y: f64) -> bool {
    x >= extent.x as f64 - 0.5
        && x < extent.right() as f64 - 0.5
        && y >= extent.y as f64 - 0.5
        && y < extent.bottom() as f64 - 0.5
}

/// Warps `source` (a tile of an image whose full extent is `source_extent`)
/// onto the epipolar `output` region through `field`.
///
/// Kernel taps that leave `source` replicate its edge; callers pass a tile
/// obtained from [`required_input_region`] so this only happens on the true
/// image border.
pub fn warp_region(
    source: &Raster<f32>,
    source_extent: Region,
    field: &DisplacementField,
    output: Region,
    params: &WarpParams,
) -> Raster<f32> {
    let mut dst = Raster::filled(output, params.edge_padding);
    if output.is_empty() || source.region().is_empty() {
        return dst;
    }

    let x0 = output.x;
    dst.par_rows_mut().for_each(|(y, row)| {
        for (i, out) in row.iter_mut().enumerate() {
            let x = x0 + i as i32;
            let Some(p) = field.sensor_position(x as f64, y as f64) else {
                continue;
            };
            if inside_extent(&source_extent, p.x, p.y) {
                *out = params.interpolation.sample(source, p.x, p.y);
            }
        }
    });

    dst
}

/// Reads the needed sensor tile from `source` and warps it onto `output`.
pub fn warp_tile(
    source: &dyn TileSource,
    field: &DisplacementField,
    output: Region,
    params: &WarpParams,
) -> Result<Raster<f32>> {
    let extent = source.extent();
    let Some(input) = required_input_region(field, output, extent, params.interpolation) else {
        tracing::debug!(?output, "epipolar tile does not reach the sensor image");
        return Ok(Raster::filled(output, params.edge_padding));
    };
    let tile = source.read_tile(input)?;
    Ok(warp_region(&tile, extent, field, output, params))
}
