use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stereo_dem::core::{AffineSensorModel, Raster, Region, SensorImage};
use stereo_dem::stereo::{DemGrid, StereoConfig, StereoPipeline, StereoProduct};
use stereo_dem::Error;

const WIDTH: u32 = 96;
const HEIGHT: u32 = 64;
/// Elevation per pixel of parallax between the two views.
const PARALLAX: f64 = 0.2;

/// Raised block of the synthetic scene, in left pixels.
const BLOCK: Region = Region {
    x: 40,
    y: 16,
    width: 32,
    height: 32,
};

fn models() -> (AffineSensorModel, AffineSensorModel) {
    let origin = Vector2::new(500.0, 800.0);
    let left = AffineSensorModel::north_up(origin, 1.0, Vector2::zeros()).unwrap();
    let right = AffineSensorModel::north_up(origin, 1.0, Vector2::new(PARALLAX, 0.0)).unwrap();
    (left, right)
}

/// Renders a textured scene at `background` elevation, optionally with the
/// block raised to `block`. Elevations are multiples of 5 so every view
/// shift is a whole number of pixels.
fn render(background: i32, block: Option<i32>) -> (SensorImage, SensorImage) {
    let shift_bg = background / 5;
    let margin = 16u32;
    let mut rng = StdRng::seed_from_u64(2024);
    let data = (0..(WIDTH + margin) * HEIGHT)
        .map(|_| rng.gen_range(10.0f32..250.0))
        .collect();
    let texture = Raster::from_vec(Region::from_size(WIDTH + margin, HEIGHT), data).unwrap();

    let region = Region::from_size(WIDTH, HEIGHT);
    let left = Raster::from_fn(region, |x, y| texture.get(x, y).unwrap());
    let mut right = Raster::from_fn(region, |x, y| texture.get(x + shift_bg, y).unwrap());
    if let Some(z) = block {
        let shift = z / 5;
        for y in BLOCK.y..BLOCK.bottom() {
            for c in BLOCK.x..BLOCK.right() {
                right.set(c - shift, y, texture.get(c, y).unwrap());
            }
        }
    }

    let (lm, rm) = models();
    (
        SensorImage::from_raster(left, lm),
        SensorImage::from_raster(right, rm),
    )
}

fn config() -> StereoConfig {
    let mut config = StereoConfig::default().with_tile_size(32);
    config.dem.spacing = 1.0;
    config
}

fn run(config: StereoConfig, scene: &(SensorImage, SensorImage)) -> StereoProduct {
    StereoPipeline::new(config).unwrap().run(&scene.0, &scene.1).unwrap()
}

/// Cell `(col, row)` of a north-up, unit-spacing DEM is left pixel `(col, row)`.
fn assert_elevation(dem: &DemGrid, cells: Region, expected: f64, tolerance: f64) {
    for row in cells.y..cells.bottom() {
        for col in cells.x..cells.right() {
            let z = dem
                .get(col as u32, row as u32)
                .unwrap_or_else(|| panic!("cell ({col}, {row}) not written"));
            assert!(
                (z - expected).abs() < tolerance,
                "cell ({col}, {row}): {z} instead of {expected}"
            );
        }
    }
}

#[test]
fn test_flat_scene_reconstructs_constant_elevation() {
    let scene = render(20, None);
    let product = run(config(), &scene);

    assert_eq!(product.geometry.extent, Region::from_size(WIDTH, HEIGHT));
    assert_eq!(product.report.tiles, 6);
    let geometry = product.dem.geometry();
    assert_eq!((geometry.width, geometry.height), (WIDTH, HEIGHT));

    for x in 8..=92 {
        for y in 3..=60 {
            assert_eq!(product.disparity.get(x, y).map(|(_, v)| v.abs() < 0.05), Some(true));
        }
    }
    assert_elevation(&product.dem, Region::from_bounds(8, 3, 93, 61), 20.0, 0.5);

    // rows closer than the window radius to the frame never match
    let no_data = product.dem_raster.get(50, 0).unwrap();
    assert_eq!(no_data, config().dem.no_data);
    assert_eq!(product.stats.written, product.dem.written_count());
    assert_eq!(product.stats.candidates, product.report.valid_disparities);
}

#[test]
fn test_raised_block_stands_out() {
    let scene = render(20, Some(60));
    let product = run(config(), &scene);

    // inside the block, away from its walls
    assert_elevation(&product.dem, Region::new(48, 24, 16, 16), 60.0, 0.5);
    // background left of the occluded strip and right of the block
    assert_elevation(&product.dem, Region::from_bounds(8, 3, 24, 61), 20.0, 0.5);
    assert_elevation(&product.dem, Region::from_bounds(80, 3, 93, 61), 20.0, 0.5);
}

#[test]
fn test_tiling_and_threads_do_not_change_the_result() {
    let scene = render(20, Some(60));
    let reference = run(config().with_tile_size(256), &scene);
    let tiled = run(config().with_tile_size(24).with_threads(3), &scene);

    assert_eq!(reference.report.tiles, 1);
    assert_eq!(tiled.report.tiles, 12);
    assert_eq!(tiled.disparity, reference.disparity);
    assert_eq!(tiled.dem_raster, reference.dem_raster);
    assert_eq!(tiled.stats, reference.stats);
}

#[test]
fn test_out_of_range_policies() {
    let scene = render(20, Some(60));

    let mut clipped = config();
    clipped.dem.above_average = 40.0;
    let discard = run(clipped.clone(), &scene);
    assert!(discard.stats.out_of_range > 0);
    assert_eq!(discard.dem.get(55, 30), None);
    assert_elevation(&discard.dem, Region::from_bounds(8, 3, 24, 61), 20.0, 0.5);

    clipped.dem.policy = stereo_dem::stereo::ElevationPolicy::Clamp;
    let clamp = run(clipped, &scene);
    assert_eq!(clamp.stats.out_of_range, 0);
    assert_eq!(clamp.dem.get(55, 30), Some(40.0));
}

#[test]
fn test_configuration_from_json_drives_the_run() {
    let config = StereoConfig::from_json_str(
        r#"{
            "matching": { "radius": 2, "metric": { "kind": "ssd" } },
            "subpixel": { "kind": "parabolic" },
            "dem": { "spacing": 1.0 },
            "tile_size": 40
        }"#,
    )
    .unwrap();
    let pipeline = StereoPipeline::new(config).unwrap();
    assert!(pipeline.matcher().emit_stencils);

    let scene = render(20, None);
    let product = pipeline.run(&scene.0, &scene.1).unwrap();
    // parabolic vertices stay within half a pixel of the integer match
    assert_elevation(&product.dem, Region::from_bounds(8, 2, 94, 62), 20.0, 2.6);
}

#[test]
fn test_disjoint_images_fail_with_geometry_error() {
    let (left, _) = render(20, None);
    let far = AffineSensorModel::north_up(Vector2::new(5000.0, 800.0), 1.0, Vector2::new(PARALLAX, 0.0))
        .unwrap();
    let right = SensorImage::new(left.source.clone(), std::sync::Arc::new(far));

    let err = StereoPipeline::new(config()).unwrap().run(&left, &right).unwrap_err();
    assert!(matches!(err, Error::Geometry(_)));
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let mut config = config();
    config.matching.bounds = stereo_dem::stereo::DisparityBounds::new(0, -24, 0, 0);
    assert!(matches!(StereoPipeline::new(config), Err(Error::Config(_))));
}
