//! Core primitives for stereo elevation extraction
//!
//! Rasters and regions, sparse displacement fields, sensor projection
//! models with ray geometry, tile I/O traits and the shared error type.

pub mod error;
pub mod field;
pub mod geometry;
pub mod io;
pub mod raster;
pub mod runtime;

pub use error::{Error, Result};
pub use field::DisplacementField;
pub use geometry::*;
pub use io::{load_gray, save_printable, SensorImage, TileSink, TileSource};
pub use raster::{Mask, Raster, Region};
pub use runtime::{build_thread_pool, current_cpu_threads, init_global_thread_pool};
