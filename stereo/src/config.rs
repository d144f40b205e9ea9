//! Pipeline configuration
//!
//! One serde tree covering every stage. Missing fields take their defaults,
//! so a JSON document only needs to name what it changes.

use crate::{
    BlockMatcher, DisparityBounds, DisparityPrior, ElevationPolicy, EpipolarParams,
    MatchingMetric, MedianFilter, Polarity, Result, SubpixelMethod,
};
use dem_core::Error;
use dem_imgproc::WarpParams;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Search centred on a constant disparity instead of the global bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorConfig {
    pub h: f64,
    pub v: f64,
    pub h_radius: u32,
    pub v_radius: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub radius: u32,
    pub bounds: DisparityBounds,
    pub metric: MatchingMetric,
    /// Overrides the metric's natural polarity.
    pub polarity: Option<Polarity>,
    pub min_overlap: f64,
    pub prior: Option<PriorConfig>,
    /// Keep the winning score next to the disparities.
    pub emit_metric: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            radius: 3,
            bounds: DisparityBounds::default(),
            metric: MatchingMetric::Ncc,
            polarity: None,
            min_overlap: 0.25,
            prior: None,
            emit_metric: false,
        }
    }
}

impl MatchingConfig {
    /// Matcher described by this section. Stencils are requested when the
    /// refinement can work from them alone.
    pub fn block_matcher(&self, subpixel: Option<SubpixelMethod>) -> BlockMatcher {
        let mut matcher = BlockMatcher::new()
            .with_radius(self.radius)
            .with_bounds(self.bounds)
            .with_metric(self.metric)
            .with_min_overlap(self.min_overlap)
            .with_metric_output(self.emit_metric)
            .with_stencils(matches!(
                subpixel,
                Some(SubpixelMethod::Parabolic | SubpixelMethod::Triangular)
            ));
        if let Some(polarity) = self.polarity {
            matcher = matcher.with_polarity(polarity);
        }
        if let Some(p) = self.prior {
            matcher = matcher.with_prior(DisparityPrior::uniform(p.h, p.v, p.h_radius, p.v_radius));
        }
        matcher
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemConfig {
    /// Lowest accepted elevation, relative to the average elevation.
    pub below_average: f64,
    /// Highest accepted elevation, relative to the average elevation.
    pub above_average: f64,
    /// Ground distance between cell centres.
    pub spacing: f64,
    pub policy: ElevationPolicy,
    /// Value written to cells that never received an elevation.
    pub no_data: f32,
}

impl Default for DemConfig {
    fn default() -> Self {
        Self {
            below_average: 10.0,
            above_average: 80.0,
            spacing: 2.5,
            policy: ElevationPolicy::Discard,
            no_data: -32768.0,
        }
    }
}

impl DemConfig {
    /// Absolute `(min, max)` elevation bounds around `average_elevation`.
    pub fn elevation_range(&self, average_elevation: f64) -> (f64, f64) {
        (
            average_elevation - self.below_average,
            average_elevation + self.above_average,
        )
    }
}

/// Complete configuration of a stereo-to-DEM run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoConfig {
    pub epipolar: EpipolarParams,
    pub resampling: WarpParams,
    pub matching: MatchingConfig,
    /// `None` keeps integer disparities.
    pub subpixel: Option<SubpixelMethod>,
    pub median: MedianFilter,
    pub dem: DemConfig,
    /// Side of the square output tiles in epipolar pixels.
    pub tile_size: u32,
    /// Dedicated worker count for a run, global pool when unset.
    pub threads: Option<usize>,
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            epipolar: EpipolarParams::default(),
            resampling: WarpParams::default(),
            matching: MatchingConfig::default(),
            subpixel: Some(SubpixelMethod::default()),
            median: MedianFilter::default(),
            dem: DemConfig::default(),
            tile_size: 256,
            threads: None,
        }
    }
}

impl StereoConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: StereoConfig = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::config(format!("cannot serialize configuration: {e}")))
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Absolute elevation bounds used by the DEM stage.
    pub fn elevation_range(&self) -> (f64, f64) {
        self.dem.elevation_range(self.epipolar.average_elevation)
    }

    pub fn block_matcher(&self) -> BlockMatcher {
        self.matching.block_matcher(self.subpixel)
    }

    /// Checks every stage's parameters; nothing runs on an invalid config.
    pub fn validate(&self) -> Result<()> {
        self.epipolar.validate()?;
        self.resampling.interpolation.validate()?;
        self.block_matcher().validate()?;
        if let Some(method) = self.subpixel {
            method.validate()?;
        }
        self.median.validate()?;

        let (emin, emax) = self.elevation_range();
        if !(emin.is_finite() && emax.is_finite()) || emin >= emax {
            return Err(Error::config(format!(
                "elevation_min must be below elevation_max, got [{emin}, {emax}]"
            )));
        }
        if !(self.dem.spacing.is_finite() && self.dem.spacing > 0.0) {
            return Err(Error::config(format!(
                "DEM spacing must be > 0, got {}",
                self.dem.spacing
            )));
        }
        if self.tile_size == 0 {
            return Err(Error::config("tile size must be >= 1"));
        }
        if self.threads == Some(0) {
            return Err(Error::config("thread count must be >= 1"));
        }
        Ok(())
    }
}
