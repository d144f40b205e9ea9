//! Tiled stereo-to-DEM scheduler
//!
//! The epipolar extent is cut into disjoint output tiles. Every tile reads
//! only the input it needs, runs resampling, matching, refinement and median
//! filtering on its own, and hands back its disparities. The tiles are then
//! projected in parallel into one shared elevation grid.

use crate::{
    build_epipolar_geometry, refine, refine_with_stencils, BlockMatcher, DemGeometry, DemGrid,
    DemProjector, DisparityMap, EpipolarGeometry, MatchInput, ProjectionStats, Result,
    StereoConfig, StereoMatcher, SubpixelMethod,
};
use dem_core::{build_thread_pool, save_printable, Raster, Region, SensorImage};
use dem_imgproc::{validity_mask, warp_tile};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    EpipolarGrid,
    Resampling,
    Matching,
    Refinement,
    MedianFilter,
    DemProjection,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::EpipolarGrid => "epipolar grid",
            Stage::Resampling => "resampling",
            Stage::Matching => "matching",
            Stage::Refinement => "refinement",
            Stage::MedianFilter => "median filter",
            Stage::DemProjection => "DEM projection",
        }
    }
}

/// Timings and counts of one run.
///
/// Per-tile stages add up the time spent in every tile, so with several
/// workers their sum can exceed `total`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub stages: BTreeMap<Stage, Duration>,
    pub tiles: usize,
    pub valid_disparities: usize,
    pub total: Duration,
}

impl PipelineReport {
    fn record(&mut self, stage: Stage, elapsed: Duration) {
        *self.stages.entry(stage).or_default() += elapsed;
    }

    fn merge(&mut self, other: &PipelineReport) {
        for (stage, elapsed) in &other.stages {
            self.record(*stage, *elapsed);
        }
    }

    pub fn elapsed(&self, stage: Stage) -> Duration {
        self.stages.get(&stage).copied().unwrap_or_default()
    }
}

/// Everything a run produces.
#[derive(Debug)]
pub struct StereoProduct {
    pub geometry: EpipolarGeometry,
    /// Filtered disparities over the whole epipolar extent.
    pub disparity: DisparityMap,
    pub dem: DemGrid,
    /// `dem` with unwritten cells set to the configured no-data value.
    pub dem_raster: Raster<f32>,
    pub stats: ProjectionStats,
    pub report: PipelineReport,
}

impl StereoProduct {
    /// Writes rescaled 8-bit renderings of the horizontal disparity and the DEM.
    pub fn save_previews(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        save_printable(
            &self.disparity.horizontal,
            Some(&self.disparity.valid),
            dir.join("disparity_h.png"),
        )?;
        save_printable(
            &self.dem_raster,
            Some(&self.dem.written_mask()),
            dir.join("dem.png"),
        )
    }
}

/// Input regions feeding one output tile, all within the epipolar extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    pub output: Region,
    /// Disparities the median filter looks at.
    pub disparity: Region,
    pub left: Region,
    /// Empty when the search never reaches the right image.
    pub right: Region,
}

impl TilePlan {
    pub fn new(output: Region, extent: Region, matcher: &BlockMatcher, median_radius: u32) -> Self {
        let clip = |r: Region| r.intersect(&extent).unwrap_or_default();
        let disparity = clip(output.dilate(median_radius, median_radius));
        let left = clip(disparity.dilate(matcher.radius, matcher.radius));
        // one extra pixel on each side for the sub-pixel stencil
        let env = matcher.search_envelope();
        let right = clip(Region::from_bounds(
            left.x + env.h_min - 1,
            left.y + env.v_min - 1,
            left.right() + env.h_max + 1,
            left.bottom() + env.v_max + 1,
        ));
        Self {
            output,
            disparity,
            left,
            right,
        }
    }
}

struct TileProduct {
    disparity: DisparityMap,
    report: PipelineReport,
}

/// Runs the full chain on a sensor image pair.
///
/// ```no_run
/// # fn demo(left: &dem_core::SensorImage, right: &dem_core::SensorImage) -> dem_stereo::Result<()> {
/// use dem_stereo::{StereoConfig, StereoPipeline};
///
/// let product = StereoPipeline::new(StereoConfig::default())?.run(left, right)?;
/// println!("{} DEM cells written", product.stats.written);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StereoPipeline {
    config: StereoConfig,
    matcher: BlockMatcher,
}

impl StereoPipeline {
    pub fn new(config: StereoConfig) -> Result<Self> {
        config.validate()?;
        let matcher = config.block_matcher();
        Ok(Self { config, matcher })
    }

    pub fn config(&self) -> &StereoConfig {
        &self.config
    }

    pub fn matcher(&self) -> &BlockMatcher {
        &self.matcher
    }

    pub fn run(&self, left: &SensorImage, right: &SensorImage) -> Result<StereoProduct> {
        match self.config.threads {
            Some(n) => build_thread_pool(n)?.install(|| self.run_in_pool(left, right)),
            None => self.run_in_pool(left, right),
        }
    }

    fn run_in_pool(&self, left: &SensorImage, right: &SensorImage) -> Result<StereoProduct> {
        let started = Instant::now();
        let mut report = PipelineReport::default();

        let t = Instant::now();
        let geometry = build_epipolar_geometry(left, right, self.config.epipolar)?;
        report.record(Stage::EpipolarGrid, t.elapsed());

        let extent = geometry.extent;
        let tiles = extent.tiles(self.config.tile_size, self.config.tile_size);
        report.tiles = tiles.len();
        tracing::debug!(?extent, tiles = tiles.len(), "processing epipolar tiles");

        let products = tiles
            .par_iter()
            .map(|&tile| {
                let plan = TilePlan::new(tile, extent, &self.matcher, self.config.median.radius);
                self.process_tile(&plan, &geometry, left, right)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut disparity = DisparityMap::new(extent);
        if self.matcher.emit_metric {
            disparity = disparity.with_metric();
        }
        for product in &products {
            disparity.paste(&product.disparity);
            report.merge(&product.report);
        }
        report.valid_disparities = disparity.valid_count();

        let t = Instant::now();
        let (emin, emax) = self.config.elevation_range();
        let dem_geometry = DemGeometry::from_sensor_envelope(
            left.model.as_ref(),
            left.extent(),
            emin,
            emax,
            self.config.dem.spacing,
        )?;
        let dem = DemGrid::new(dem_geometry);
        let projector = DemProjector::new(
            left.model.as_ref(),
            right.model.as_ref(),
            &geometry.left,
            &geometry.right,
            emin,
            emax,
        )?
        .with_policy(self.config.dem.policy);

        let stats = products
            .par_iter()
            .map(|p| projector.project(&p.disparity, None, &dem))
            .reduce(ProjectionStats::default, |mut a, b| {
                a += b;
                a
            });
        let dem_raster = dem.to_raster(self.config.dem.no_data);
        report.record(Stage::DemProjection, t.elapsed());
        report.total = started.elapsed();

        tracing::info!(
            tiles = report.tiles,
            valid_disparities = report.valid_disparities,
            dem_cells = dem.geometry().cell_count(),
            written = stats.written,
            out_of_range = stats.out_of_range,
            elapsed_ms = report.total.as_millis() as u64,
            "stereo reconstruction done"
        );
        for (stage, elapsed) in &report.stages {
            tracing::debug!(stage = stage.name(), elapsed_ms = elapsed.as_millis() as u64, "stage timing");
        }

        Ok(StereoProduct {
            geometry,
            disparity,
            dem,
            dem_raster,
            stats,
            report,
        })
    }

    fn process_tile(
        &self,
        plan: &TilePlan,
        geometry: &EpipolarGeometry,
        left: &SensorImage,
        right: &SensorImage,
    ) -> Result<TileProduct> {
        let mut report = PipelineReport::default();
        let warp = &self.config.resampling;

        let t = Instant::now();
        let left_epi = warp_tile(left.source.as_ref(), &geometry.left, plan.left, warp)?;
        let right_epi = warp_tile(right.source.as_ref(), &geometry.right, plan.right, warp)?;
        let left_mask = validity_mask(&left_epi, warp.edge_padding);
        let right_mask = validity_mask(&right_epi, warp.edge_padding);
        report.record(Stage::Resampling, t.elapsed());

        let input = MatchInput::new(&left_epi, &right_epi, &left_mask, &right_mask)
            .with_extents(geometry.extent, geometry.extent);

        let t = Instant::now();
        let matched = self.matcher.compute(&input, plan.disparity)?;
        report.record(Stage::Matching, t.elapsed());

        let t = Instant::now();
        let refined = match (self.config.subpixel, matched.stencils.as_ref()) {
            (None, _) => matched.disparity,
            (Some(method @ SubpixelMethod::Dichotomy { .. }), _) | (Some(method), None) => {
                refine(&matched.disparity, &self.matcher, &input, method)?
            }
            (Some(method), Some(stencils)) => {
                refine_with_stencils(&matched.disparity, stencils, method, self.matcher.polarity)?
            }
        };
        report.record(Stage::Refinement, t.elapsed());

        let t = Instant::now();
        let (filtered, _, _) =
            self.config
                .median
                .filter_disparity(&refined, Some(&left_mask), plan.output)?;
        report.record(Stage::MedianFilter, t.elapsed());

        tracing::debug!(
            tile = ?plan.output,
            valid = filtered.valid_count(),
            "tile done"
        );
        Ok(TileProduct {
            disparity: filtered,
            report,
        })
    }
}
