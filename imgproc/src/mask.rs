use dem_core::{Mask, Raster};

/// True where the resampled value is real data, i.e. neither the padding
/// value nor NaN.
pub fn validity_mask(raster: &Raster<f32>, padding: f32) -> Mask {
    raster.map(|v| !v.is_nan() && v != padding)
}

/// Pixel-wise AND over the common region of both masks.
pub fn mask_and(a: &Mask, b: &Mask) -> Mask {
    match a.region().intersect(&b.region()) {
        Some(common) => Raster::from_fn(common, |x, y| {
            a.get_or(x, y, false) && b.get_or(x, y, false)
        }),
        None => Raster::filled(Default::default(), false),
    }
}
