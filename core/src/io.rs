//! Tile-level raster access and image-file helpers.
//!
//! Codecs and geo-referencing belong to the caller; the chain only sees
//! [`TileSource`] / [`TileSink`].

use crate::{Error, Mask, Raster, Region, Result, SensorModel};
use image::DynamicImage;
use std::path::Path;
use std::sync::Arc;

/// Random tile access to a (possibly huge) single-band raster.
pub trait TileSource: Send + Sync {
    fn extent(&self) -> Region;

    /// Samples over `region`, which must lie within [`TileSource::extent`].
    fn read_tile(&self, region: Region) -> Result<Raster<f32>>;
}

/// Destination for computed tiles.
pub trait TileSink {
    fn write_tile(&mut self, tile: &Raster<f32>) -> Result<()>;
}

impl TileSource for Raster<f32> {
    fn extent(&self) -> Region {
        self.region()
    }

    fn read_tile(&self, region: Region) -> Result<Raster<f32>> {
        self.crop(region).map_err(|e| Error::TileRead {
            region,
            reason: e.to_string(),
        })
    }
}

impl TileSink for Raster<f32> {
    fn write_tile(&mut self, tile: &Raster<f32>) -> Result<()> {
        if !self.region().contains_region(&tile.region()) {
            return Err(Error::DimensionMismatch(format!(
                "tile {:?} falls outside sink {:?}",
                tile.region(),
                self.region()
            )));
        }
        self.paste(tile);
        Ok(())
    }
}

/// Input acquisition: pixels plus the projection capability of the sensor.
#[derive(Clone)]
pub struct SensorImage {
    pub source: Arc<dyn TileSource>,
    pub model: Arc<dyn SensorModel>,
}

impl SensorImage {
    pub fn new(source: Arc<dyn TileSource>, model: Arc<dyn SensorModel>) -> Self {
        Self { source, model }
    }

    pub fn from_raster(raster: Raster<f32>, model: impl SensorModel + 'static) -> Self {
        Self {
            source: Arc::new(raster),
            model: Arc::new(model),
        }
    }

    pub fn extent(&self) -> Region {
        self.source.extent()
    }
}

impl std::fmt::Debug for SensorImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorImage")
            .field("extent", &self.extent())
            .finish_non_exhaustive()
    }
}

/// Loads any image the `image` crate decodes as a single-band `f32` raster.
///
/// 16-bit and float images keep their sample values; colour images are
/// reduced to luma at their own bit depth.
pub fn load_gray(path: impl AsRef<Path>) -> Result<Raster<f32>> {
    let path = path.as_ref();
    let img = image::open(path).map_err(|source| Error::Image {
        path: path.to_path_buf(),
        source,
    })?;
    match img {
        DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_) => {
            let luma = img.to_luma16();
            let region = Region::from_size(luma.width(), luma.height());
            Raster::from_vec(region, luma.as_raw().iter().map(|&v| f32::from(v)).collect())
        }
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
            let luma = img.to_luma32f();
            let region = Region::from_size(luma.width(), luma.height());
            Raster::from_vec(region, luma.into_raw())
        }
        _ => Ok(Raster::from_gray_image(&img.to_luma8())),
    }
}

/// Writes a min/max rescaled 8-bit rendering of `raster`.
pub fn save_printable(
    raster: &Raster<f32>,
    mask: Option<&Mask>,
    path: impl AsRef<Path>,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| Error::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    raster
        .to_printable_image(mask)
        .save(path)
        .map_err(|source| Error::Image {
            path: path.to_path_buf(),
            source,
        })
}
