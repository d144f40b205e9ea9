//! Image processing stages of the elevation chain
//!
//! Interpolation kernels, resampling of sensor images through sparse
//! displacement fields, and validity masks over resampled rasters.

pub mod interpolation;
pub mod mask;
pub mod warp;

pub use interpolation::*;
pub use mask::*;
pub use warp::*;

pub use dem_core::{Error, Result};
