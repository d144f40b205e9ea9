use crate::Region;
use std::path::PathBuf;

/// Errors surfaced by the elevation extraction chain.
///
/// Only configuration, geometry and I/O problems are reported here. Pixel
/// level failures (no candidate in the search window, degenerate sub-pixel
/// stencil, a point outside the DEM) travel as validity bits in the rasters.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Failed to read tile {region:?}: {reason}")]
    TileRead { region: Region, reason: String },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image error on {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn geometry(msg: impl Into<String>) -> Self {
        Error::Geometry(msg.into())
    }
}
