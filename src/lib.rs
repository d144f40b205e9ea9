//! Dense stereo reconstruction from overlapping pose-tagged images to
//! gridded elevation models.
//!
//! ```no_run
//! use stereo_dem::core::{load_gray, AffineSensorModel, SensorImage};
//! use stereo_dem::stereo::{StereoConfig, StereoPipeline};
//! use nalgebra::Vector2;
//!
//! # fn main() -> stereo_dem::Result<()> {
//! let left_model = AffineSensorModel::north_up(Vector2::new(500.0, 800.0), 1.0, Vector2::zeros())?;
//! let right_model = AffineSensorModel::north_up(Vector2::new(500.0, 800.0), 1.0, Vector2::new(0.2, 0.0))?;
//! let left = SensorImage::from_raster(load_gray("left.png")?, left_model);
//! let right = SensorImage::from_raster(load_gray("right.png")?, right_model);
//!
//! let config = StereoConfig::from_json_file("stereo.json")?;
//! let product = StereoPipeline::new(config)?.run(&left, &right)?;
//! product.save_previews("out")?;
//! # Ok(())
//! # }
//! ```

pub use dem_core as core;
pub use dem_imgproc as imgproc;
pub use dem_stereo as stereo;

pub use dem_core::{Error, Result};

/// Initialize a single global Rayon thread pool for all CPU-parallel routines.
///
/// Call this once at application startup before running a reconstruction.
/// Repeated calls are idempotent and return the first initialization result.
///
/// Priority order:
/// 1. explicit `num_threads`
/// 2. `DEM_CPU_THREADS` env var
/// 3. Rayon default
pub fn init_thread_pool(num_threads: Option<usize>) -> Result<()> {
    dem_core::init_global_thread_pool(num_threads)
}
