use crate::{DisparityMap, Result};
use dem_core::{Error, Mask, Raster, Region};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Rejects disparities too far from the median of their neighbourhood.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedianFilter {
    pub radius: u32,
    pub incoherence_threshold: f64,
}

impl Default for MedianFilter {
    fn default() -> Self {
        Self {
            radius: 2,
            incoherence_threshold: 2.0,
        }
    }
}

/// Result of filtering one disparity component.
#[derive(Debug, Clone, PartialEq)]
pub struct MedianOutput {
    /// Input values over the output region, unchanged.
    pub values: Raster<f32>,
    pub valid: Mask,
    /// Local median, NaN where the pixel was not eligible.
    pub median: Raster<f32>,
}

impl MedianFilter {
    pub fn new(radius: u32, incoherence_threshold: f64) -> Self {
        Self {
            radius,
            incoherence_threshold,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.incoherence_threshold.is_finite() && self.incoherence_threshold >= 0.0) {
            return Err(Error::config(format!(
                "incoherence threshold must be >= 0, got {}",
                self.incoherence_threshold
            )));
        }
        Ok(())
    }

    /// Filters `values` over `output`, which must lie within `values`.
    ///
    /// A pixel takes part (as centre or neighbour) when it is set in `valid`
    /// and in `mask`, if any.
    pub fn filter(
        &self,
        values: &Raster<f32>,
        valid: &Mask,
        mask: Option<&Mask>,
        output: Region,
    ) -> Result<MedianOutput> {
        self.validate()?;
        if valid.region() != values.region() || !values.region().contains_region(&output) {
            return Err(Error::DimensionMismatch(format!(
                "median filter output {:?} over values {:?} and validity {:?}",
                output,
                values.region(),
                valid.region()
            )));
        }

        let usable = |x: i32, y: i32| {
            valid.get_or(x, y, false) && mask.map_or(true, |m| m.get_or(x, y, false))
        };
        let r = self.radius as i32;
        let x0 = output.x;

        let mut median = Raster::filled(output, f32::NAN);
        median.par_rows_mut().for_each(|(y, row)| {
            let mut window = Vec::with_capacity((2 * r as usize + 1).pow(2));
            for (i, out) in row.iter_mut().enumerate() {
                let x = x0 + i as i32;
                if !usable(x, y) {
                    continue;
                }
                window.clear();
                for ny in y - r..=y + r {
                    for nx in x - r..=x + r {
                        if usable(nx, ny) {
                            if let Some(v) = values.get(nx, ny) {
                                window.push(v);
                            }
                        }
                    }
                }
                *out = median_of(&mut window);
            }
        });

        let threshold = self.incoherence_threshold;
        let valid_out = Raster::from_fn(output, |x, y| {
            match (values.get(x, y), median.get(x, y)) {
                (Some(v), Some(m)) if m.is_finite() => ((v - m).abs() as f64) <= threshold,
                _ => false,
            }
        });

        Ok(MedianOutput {
            values: values.crop(output)?,
            valid: valid_out,
            median,
        })
    }

    /// Filters both components; a pixel stays valid only if both pass.
    pub fn filter_disparity(
        &self,
        disparity: &DisparityMap,
        mask: Option<&Mask>,
        output: Region,
    ) -> Result<(DisparityMap, MedianOutput, MedianOutput)> {
        let h = self.filter(&disparity.horizontal, &disparity.valid, mask, output)?;
        let v = self.filter(&disparity.vertical, &disparity.valid, mask, output)?;

        let valid = Raster::from_fn(output, |x, y| {
            h.valid.get_or(x, y, false) && v.valid.get_or(x, y, false)
        });
        let filtered = DisparityMap {
            horizontal: h.values.clone(),
            vertical: v.values.clone(),
            valid,
            metric: disparity
                .metric
                .as_ref()
                .map(|m| m.crop(output))
                .transpose()?,
        };

        tracing::debug!(
            ?output,
            before = disparity.valid_count(),
            after = filtered.valid_count(),
            "median outlier filter done"
        );
        Ok((filtered, h, v))
    }
}

/// Median of a non-empty sample; even counts average the two middle values.
fn median_of(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    values.sort_unstable_by(f32::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}
