use crate::{DisparityMap, Result, StereoMatcher};
use dem_core::{Error, Mask, Raster, Region};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use wide::f64x4;

/// Similarity score between a left and a right window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchingMetric {
    /// Normalized Cross-Correlation
    Ncc,
    /// Mean of Squared Differences
    Ssd,
    /// `(mean |l - r|^p)^(1/p)`
    Lp { p: f64 },
}

impl MatchingMetric {
    pub fn natural_polarity(&self) -> Polarity {
        match self {
            MatchingMetric::Ncc => Polarity::Maximize,
            MatchingMetric::Ssd | MatchingMetric::Lp { .. } => Polarity::Minimize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Minimize,
    Maximize,
}

impl Polarity {
    /// Strict improvement; equal scores never replace the incumbent.
    #[inline]
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Polarity::Minimize => candidate < incumbent,
            Polarity::Maximize => candidate > incumbent,
        }
    }
}

/// Inclusive disparity search window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisparityBounds {
    pub h_min: i32,
    pub h_max: i32,
    pub v_min: i32,
    pub v_max: i32,
}

impl Default for DisparityBounds {
    fn default() -> Self {
        Self::new(-24, 0, 0, 0)
    }
}

impl DisparityBounds {
    pub fn new(h_min: i32, h_max: i32, v_min: i32, v_max: i32) -> Self {
        Self {
            h_min,
            h_max,
            v_min,
            v_max,
        }
    }

    /// Horizontal-only search, the usual case on epipolar images.
    pub fn horizontal(h_min: i32, h_max: i32) -> Self {
        Self::new(h_min, h_max, 0, 0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.h_min > self.h_max {
            return Err(Error::config(format!(
                "horizontal disparity bounds inverted: {} > {}",
                self.h_min, self.h_max
            )));
        }
        if self.v_min > self.v_max {
            return Err(Error::config(format!(
                "vertical disparity bounds inverted: {} > {}",
                self.v_min, self.v_max
            )));
        }
        Ok(())
    }

    pub fn contains(&self, h: i32, v: i32) -> bool {
        h >= self.h_min && h <= self.h_max && v >= self.v_min && v <= self.v_max
    }

    pub fn union(&self, other: &DisparityBounds) -> DisparityBounds {
        Self::new(
            self.h_min.min(other.h_min),
            self.h_max.max(other.h_max),
            self.v_min.min(other.v_min),
            self.v_max.max(other.v_max),
        )
    }

    pub fn candidates(&self) -> usize {
        ((self.h_max - self.h_min + 1).max(0) * (self.v_max - self.v_min + 1).max(0)) as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PriorSource {
    Uniform { h: f64, v: f64 },
    /// Per-pixel estimates; NaN or missing samples fall back to the global bounds.
    Map { h: Raster<f32>, v: Raster<f32> },
}

/// Initial disparity estimate narrowing the search to `prior ± radius`.
#[derive(Debug, Clone, PartialEq)]
pub struct DisparityPrior {
    pub source: PriorSource,
    pub h_radius: u32,
    pub v_radius: u32,
}

impl DisparityPrior {
    pub fn uniform(h: f64, v: f64, h_radius: u32, v_radius: u32) -> Self {
        Self {
            source: PriorSource::Uniform { h, v },
            h_radius,
            v_radius,
        }
    }

    pub fn from_map(h: Raster<f32>, v: Raster<f32>, h_radius: u32, v_radius: u32) -> Result<Self> {
        if h.region() != v.region() {
            return Err(Error::DimensionMismatch(format!(
                "prior maps cover {:?} and {:?}",
                h.region(),
                v.region()
            )));
        }
        Ok(Self {
            source: PriorSource::Map { h, v },
            h_radius,
            v_radius,
        })
    }

    fn window(&self, h: f64, v: f64) -> DisparityBounds {
        let (hc, vc) = (h.round() as i32, v.round() as i32);
        let (hr, vr) = (self.h_radius as i32, self.v_radius as i32);
        DisparityBounds::new(hc - hr, hc + hr, vc - vr, vc + vr)
    }

    /// Search window at a pixel, `None` where the prior has no estimate.
    pub fn bounds_at(&self, x: i32, y: i32) -> Option<DisparityBounds> {
        let (h, v) = match &self.source {
            PriorSource::Uniform { h, v } => (*h, *v),
            PriorSource::Map { h, v } => (h.get(x, y)? as f64, v.get(x, y)? as f64),
        };
        if h.is_finite() && v.is_finite() {
            Some(self.window(h, v))
        } else {
            None
        }
    }

    /// Union of every per-pixel window, `None` for an empty map.
    pub fn envelope(&self) -> Option<DisparityBounds> {
        match &self.source {
            PriorSource::Uniform { h, v } => {
                (h.is_finite() && v.is_finite()).then(|| self.window(*h, *v))
            }
            PriorSource::Map { h, v } => {
                let (h_lo, h_hi) = h.min_max(None)?;
                let (v_lo, v_hi) = v.min_max(None)?;
                let lo = self.window(h_lo as f64, v_lo as f64);
                let hi = self.window(h_hi as f64, v_hi as f64);
                Some(lo.union(&hi))
            }
        }
    }
}

/// Metric at the winner and its two neighbours on each axis.
///
/// Index 1 is the winner; NaN marks samples outside the search window or
/// not evaluable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricStencil {
    pub h: [f64; 3],
    pub v: [f64; 3],
}

impl MetricStencil {
    pub const UNAVAILABLE: MetricStencil = MetricStencil {
        h: [f64::NAN; 3],
        v: [f64::NAN; 3],
    };
}

/// Epipolar rasters and masks handed to a matcher.
///
/// The rasters may be tiles; the extents are those of the full epipolar
/// images and drive the border and out-of-frame rules.
#[derive(Debug, Clone, Copy)]
pub struct MatchInput<'a> {
    pub left: &'a Raster<f32>,
    pub right: &'a Raster<f32>,
    pub left_mask: &'a Mask,
    pub right_mask: &'a Mask,
    pub left_extent: Region,
    pub right_extent: Region,
}

impl<'a> MatchInput<'a> {
    pub fn new(
        left: &'a Raster<f32>,
        right: &'a Raster<f32>,
        left_mask: &'a Mask,
        right_mask: &'a Mask,
    ) -> Self {
        Self {
            left,
            right,
            left_mask,
            right_mask,
            left_extent: left.region(),
            right_extent: right.region(),
        }
    }

    pub fn with_extents(mut self, left_extent: Region, right_extent: Region) -> Self {
        self.left_extent = left_extent;
        self.right_extent = right_extent;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.left.region() != self.left_mask.region()
            || self.right.region() != self.right_mask.region()
        {
            return Err(Error::DimensionMismatch(
                "Epipolar rasters and their masks must cover the same regions".to_string(),
            ));
        }
        Ok(())
    }

    /// Right sample paired with nothing when off-frame, masked or non-finite.
    #[inline]
    fn right_pixel(&self, x: i32, y: i32) -> Option<f64> {
        if !self.right_extent.contains(x, y) || !self.right_mask.get_or(x, y, false) {
            return None;
        }
        let v = self.right.get(x, y)?;
        v.is_finite().then_some(v as f64)
    }

    /// Bilinear right sample; every tap with non-zero weight must be usable.
    fn right_sample(&self, x: f64, y: f64) -> Option<f64> {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as i32, y0 as i32);

        let taps = [
            (x0, y0, (1.0 - fx) * (1.0 - fy)),
            (x0 + 1, y0, fx * (1.0 - fy)),
            (x0, y0 + 1, (1.0 - fx) * fy),
            (x0 + 1, y0 + 1, fx * fy),
        ];
        let mut acc = 0.0;
        for (tx, ty, w) in taps {
            if w > 0.0 {
                acc += w * self.right_pixel(tx, ty)?;
            }
        }
        Some(acc)
    }
}

pub struct MatchOutput {
    pub disparity: DisparityMap,
    pub stencils: Option<Raster<MetricStencil>>,
}

/// Block matching stereo matcher
///
/// Candidates are scanned with `v` in the outer loop and `h` in the inner
/// one, both ascending; only a strictly better score replaces the current
/// best, so the first candidate in that order wins ties.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMatcher {
    /// Window radius; windows are `(2 * radius + 1)` pixels square.
    pub radius: u32,
    pub bounds: DisparityBounds,
    pub prior: Option<DisparityPrior>,
    pub metric: MatchingMetric,
    pub polarity: Polarity,
    /// Fraction of the window that must hold populated pairs.
    pub min_overlap: f64,
    pub emit_metric: bool,
    pub emit_stencils: bool,
}

impl Default for BlockMatcher {
    fn default() -> Self {
        Self {
            radius: 3,
            bounds: DisparityBounds::default(),
            prior: None,
            metric: MatchingMetric::Ncc,
            polarity: Polarity::Maximize,
            min_overlap: 0.25,
            emit_metric: false,
            emit_stencils: false,
        }
    }
}

impl StereoMatcher for BlockMatcher {
    fn compute(&self, input: &MatchInput<'_>, output: Region) -> Result<MatchOutput> {
        self.validate()?;
        input.validate()?;

        let width = output.width as usize;
        let rows: Vec<Vec<Option<PixelMatch>>> = (output.y..output.bottom())
            .into_par_iter()
            .map(|y| {
                let mut scorer = WindowScorer::new(self, input);
                (output.x..output.right())
                    .map(|x| self.match_pixel(&mut scorer, x, y))
                    .collect()
            })
            .collect();

        let mut disparity = DisparityMap::new(output);
        if self.emit_metric {
            disparity = disparity.with_metric();
        }
        let mut stencils = self
            .emit_stencils
            .then(|| Raster::filled(output, MetricStencil::UNAVAILABLE));

        for (row, y) in rows.iter().zip(output.y..) {
            debug_assert_eq!(row.len(), width);
            for (m, x) in row.iter().zip(output.x..) {
                let Some(m) = m else { continue };
                disparity.set(x, y, m.h as f32, m.v as f32);
                if let Some(metric) = disparity.metric.as_mut() {
                    metric.set(x, y, m.score as f32);
                }
                if let (Some(s), Some(st)) = (stencils.as_mut(), m.stencil) {
                    s.set(x, y, st);
                }
            }
        }

        tracing::debug!(
            ?output,
            valid = disparity.valid_count(),
            "block matching done"
        );
        Ok(MatchOutput {
            disparity,
            stencils,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct PixelMatch {
    h: i32,
    v: i32,
    score: f64,
    stencil: Option<MetricStencil>,
}

impl BlockMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_radius(mut self, radius: u32) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_bounds(mut self, bounds: DisparityBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_disparity_range(mut self, h_min: i32, h_max: i32, v_min: i32, v_max: i32) -> Self {
        self.bounds = DisparityBounds::new(h_min, h_max, v_min, v_max);
        self
    }

    /// Sets the metric together with its natural polarity.
    pub fn with_metric(mut self, metric: MatchingMetric) -> Self {
        self.metric = metric;
        self.polarity = metric.natural_polarity();
        self
    }

    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn with_prior(mut self, prior: DisparityPrior) -> Self {
        self.prior = Some(prior);
        self
    }

    pub fn with_min_overlap(mut self, fraction: f64) -> Self {
        self.min_overlap = fraction;
        self
    }

    pub fn with_metric_output(mut self, enabled: bool) -> Self {
        self.emit_metric = enabled;
        self
    }

    pub fn with_stencils(mut self, enabled: bool) -> Self {
        self.emit_stencils = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.radius == 0 {
            return Err(Error::config("block matching radius must be >= 1"));
        }
        self.bounds.validate()?;
        if let MatchingMetric::Lp { p } = self.metric {
            if !(p.is_finite() && p > 0.0) {
                return Err(Error::config(format!("Lp exponent must be > 0, got {p}")));
            }
        }
        if !(self.min_overlap > 0.0 && self.min_overlap <= 1.0) {
            return Err(Error::config(format!(
                "minimum window overlap must be in (0, 1], got {}",
                self.min_overlap
            )));
        }
        Ok(())
    }

    /// Search window used at a left pixel.
    pub fn search_bounds(&self, x: i32, y: i32) -> DisparityBounds {
        self.prior
            .as_ref()
            .and_then(|p| p.bounds_at(x, y))
            .unwrap_or(self.bounds)
    }

    /// Union of the search windows over all pixels.
    pub fn search_envelope(&self) -> DisparityBounds {
        let Some(prior) = &self.prior else {
            return self.bounds;
        };
        match (&prior.source, prior.envelope()) {
            (PriorSource::Uniform { .. }, Some(envelope)) => envelope,
            // pixels without an estimate fall back to the global bounds
            (PriorSource::Map { .. }, Some(envelope)) => envelope.union(&self.bounds),
            (_, None) => self.bounds,
        }
    }

    pub fn window_size(&self) -> usize {
        let side = 2 * self.radius as usize + 1;
        side * side
    }

    fn min_pairs(&self) -> usize {
        ((self.min_overlap * self.window_size() as f64).ceil() as usize).max(1)
    }

    /// Best integer disparity at `(x, y)`, scanning `v` then `h` in ascending order.
    fn match_pixel(&self, scorer: &mut WindowScorer<'_, '_>, x: i32, y: i32) -> Option<PixelMatch> {
        if !scorer.load(x, y) {
            return None;
        }
        let bounds = self.search_bounds(x, y);

        let mut best: Option<PixelMatch> = None;
        for v in bounds.v_min..=bounds.v_max {
            for h in bounds.h_min..=bounds.h_max {
                let Some(score) = scorer.score(h as f64, v as f64) else {
                    continue;
                };
                if best.map_or(true, |b| self.polarity.is_better(score, b.score)) {
                    best = Some(PixelMatch {
                        h,
                        v,
                        score,
                        stencil: None,
                    });
                }
            }
        }

        let mut best = best?;
        if self.emit_stencils {
            let mut sample = |h: i32, v: i32| {
                if bounds.contains(h, v) {
                    scorer.score(h as f64, v as f64).unwrap_or(f64::NAN)
                } else {
                    f64::NAN
                }
            };
            let (h, v) = (best.h, best.v);
            best.stencil = Some(MetricStencil {
                h: [sample(h - 1, v), best.score, sample(h + 1, v)],
                v: [sample(h, v - 1), best.score, sample(h, v + 1)],
            });
        }
        Some(best)
    }
}

/// Compute disparities over the whole left raster
pub fn match_full(
    matcher: &BlockMatcher,
    left: &Raster<f32>,
    right: &Raster<f32>,
    left_mask: &Mask,
    right_mask: &Mask,
) -> Result<MatchOutput> {
    let input = MatchInput::new(left, right, left_mask, right_mask);
    matcher.compute(&input, left.region())
}

/// Window metric evaluation around one left pixel at arbitrary disparities.
///
/// Reused by the matcher for integer candidates and by the dichotomy
/// refiner for fractional ones.
pub struct WindowScorer<'m, 'a> {
    matcher: &'m BlockMatcher,
    input: &'m MatchInput<'a>,
    window: Vec<f64>,
    left: Vec<f64>,
    right: Vec<f64>,
    x: i32,
    y: i32,
    loaded: bool,
}

impl<'m, 'a> WindowScorer<'m, 'a> {
    pub fn new(matcher: &'m BlockMatcher, input: &'m MatchInput<'a>) -> Self {
        let n = matcher.window_size();
        Self {
            matcher,
            input,
            window: Vec::with_capacity(n),
            left: Vec::with_capacity(n),
            right: Vec::with_capacity(n),
            x: 0,
            y: 0,
            loaded: false,
        }
    }

    /// Loads the left window at `(x, y)`; false when the pixel cannot be matched
    /// (within `radius` of the left border or masked out).
    pub fn load(&mut self, x: i32, y: i32) -> bool {
        let r = self.matcher.radius as i32;
        let ext = self.input.left_extent;
        let interior = x >= ext.x + r && x < ext.right() - r && y >= ext.y + r && y < ext.bottom() - r;
        self.loaded = interior && self.input.left_mask.get_or(x, y, false);
        if !self.loaded {
            return false;
        }

        self.x = x;
        self.y = y;
        self.window.clear();
        for dy in -r..=r {
            for dx in -r..=r {
                let (lx, ly) = (x + dx, y + dy);
                let value = match self.input.left.get(lx, ly) {
                    Some(v) if v.is_finite() && self.input.left_mask.get_or(lx, ly, false) => {
                        v as f64
                    }
                    _ => f64::NAN,
                };
                self.window.push(value);
            }
        }
        true
    }

    /// Metric for disparity `(h, v)`, `None` when the candidate is not evaluable.
    pub fn score(&mut self, h: f64, v: f64) -> Option<f64> {
        if !self.loaded {
            return None;
        }
        let input = self.input;
        let (cx, cy) = (self.x + h.round() as i32, self.y + v.round() as i32);
        if input.right_extent.contains(cx, cy) && !input.right_mask.get_or(cx, cy, false) {
            return None;
        }

        let r = self.matcher.radius as i32;
        let integral = h.fract() == 0.0 && v.fract() == 0.0;
        self.left.clear();
        self.right.clear();
        let mut idx = 0;
        for dy in -r..=r {
            for dx in -r..=r {
                let l = self.window[idx];
                idx += 1;
                if l.is_nan() {
                    continue;
                }
                let (lx, ly) = (self.x + dx, self.y + dy);
                let rv = if integral {
                    input.right_pixel(lx + h as i32, ly + v as i32)
                } else {
                    input.right_sample(lx as f64 + h, ly as f64 + v)
                };
                if let Some(rv) = rv {
                    self.left.push(l);
                    self.right.push(rv);
                }
            }
        }

        if self.left.len() < self.matcher.min_pairs() {
            return None;
        }
        Some(window_metric(self.matcher.metric, &self.left, &self.right))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Moments {
    n: f64,
    sum_l: f64,
    sum_r: f64,
    sum_ll: f64,
    sum_rr: f64,
    sum_lr: f64,
    sum_dd: f64,
}

fn moments_simd(left: &[f64], right: &[f64]) -> Moments {
    let mut sl = f64x4::ZERO;
    let mut sr = f64x4::ZERO;
    let mut sll = f64x4::ZERO;
    let mut srr = f64x4::ZERO;
    let mut slr = f64x4::ZERO;
    let mut sdd = f64x4::ZERO;

    let lc = left.chunks_exact(4);
    let rc = right.chunks_exact(4);
    let (l_rem, r_rem) = (lc.remainder(), rc.remainder());
    for (l, r) in lc.zip(rc) {
        let l = f64x4::from([l[0], l[1], l[2], l[3]]);
        let r = f64x4::from([r[0], r[1], r[2], r[3]]);
        let d = l - r;
        sl += l;
        sr += r;
        sll += l * l;
        srr += r * r;
        slr += l * r;
        sdd += d * d;
    }

    let mut m = Moments {
        n: left.len() as f64,
        sum_l: sl.reduce_add(),
        sum_r: sr.reduce_add(),
        sum_ll: sll.reduce_add(),
        sum_rr: srr.reduce_add(),
        sum_lr: slr.reduce_add(),
        sum_dd: sdd.reduce_add(),
    };
    // Remainder
    for (&l, &r) in l_rem.iter().zip(r_rem) {
        m.sum_l += l;
        m.sum_r += r;
        m.sum_ll += l * l;
        m.sum_rr += r * r;
        m.sum_lr += l * r;
        m.sum_dd += (l - r) * (l - r);
    }
    m
}

/// Score of paired window samples; both slices have the same, non-zero length.
pub fn window_metric(metric: MatchingMetric, left: &[f64], right: &[f64]) -> f64 {
    match metric {
        MatchingMetric::Lp { p } => {
            let n = left.len() as f64;
            let sum: f64 = left
                .iter()
                .zip(right)
                .map(|(l, r)| (l - r).abs().powf(p))
                .sum();
            (sum / n).powf(1.0 / p)
        }
        MatchingMetric::Ssd => {
            let m = moments_simd(left, right);
            m.sum_dd / m.n
        }
        MatchingMetric::Ncc => {
            let m = moments_simd(left, right);
            let mean_l = m.sum_l / m.n;
            let mean_r = m.sum_r / m.n;
            let var_l = m.sum_ll / m.n - mean_l * mean_l;
            let var_r = m.sum_rr / m.n - mean_r * mean_r;
            let cov = m.sum_lr / m.n - mean_l * mean_r;
            let denom = (var_l * var_r).sqrt();
            if var_l <= 1e-12 || var_r <= 1e-12 || denom <= 0.0 {
                0.0
            } else {
                cov / denom
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_texture(x: i32, y: i32) -> f32 {
        let mut h = (x as u32).wrapping_mul(0x9E37_79B1) ^ (y as u32).wrapping_mul(0x85EB_CA77);
        h ^= h >> 15;
        h = h.wrapping_mul(0x2C1B_3C6D);
        h ^= h >> 12;
        (h % 251) as f32 + 1.0
    }

    fn shifted_pair(w: u32, h: u32, shift: i32) -> (Raster<f32>, Raster<f32>) {
        let region = Region::from_size(w, h);
        let left = Raster::from_fn(region, hash_texture);
        let right = Raster::from_fn(region, |x, y| hash_texture(x + shift, y));
        (left, right)
    }

    #[test]
    fn test_ncc_is_scale_invariant() {
        let l = [1.0, 4.0, 2.0, 8.0, 5.0, 7.0];
        let r: Vec<f64> = l.iter().map(|v| 3.0 * v + 10.0).collect();
        let s = window_metric(MatchingMetric::Ncc, &l, &r);
        assert!((s - 1.0).abs() < 1e-12);
        let flat = [2.0; 6];
        assert_eq!(window_metric(MatchingMetric::Ncc, &l, &flat), 0.0);
    }

    #[test]
    fn test_ssd_and_lp_are_means() {
        let l = [0.0, 0.0, 0.0, 0.0, 0.0];
        let r = [1.0, 2.0, 0.0, 0.0, 2.0];
        assert!((window_metric(MatchingMetric::Ssd, &l, &r) - 9.0 / 5.0).abs() < 1e-12);
        let l1 = window_metric(MatchingMetric::Lp { p: 1.0 }, &l, &r);
        assert!((l1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_block_matcher_recovers_shift() {
        let (left, right) = shifted_pair(48, 32, 4);
        let mask = Raster::filled(left.region(), true);

        for metric in [MatchingMetric::Ncc, MatchingMetric::Ssd, MatchingMetric::Lp { p: 1.5 }] {
            let matcher = BlockMatcher::new()
                .with_radius(2)
                .with_disparity_range(-8, 2, 0, 0)
                .with_metric(metric);
            let out = match_full(&matcher, &left, &right, &mask, &mask).unwrap();
            assert_eq!(out.disparity.get(20, 16), Some((-4.0, 0.0)), "{metric:?}");
            assert_eq!(out.disparity.get(1, 16), None);
        }
    }

    #[test]
    fn test_tie_keeps_first_candidate() {
        // flat images give the same SSD for every candidate
        let region = Region::from_size(20, 20);
        let left = Raster::filled(region, 10.0f32);
        let right = Raster::filled(region, 10.0f32);
        let mask = Raster::filled(region, true);
        let matcher = BlockMatcher::new()
            .with_radius(1)
            .with_disparity_range(-3, 3, -1, 1)
            .with_metric(MatchingMetric::Ssd);

        let out = match_full(&matcher, &left, &right, &mask, &mask).unwrap();
        assert_eq!(out.disparity.get(10, 10), Some((-3.0, -1.0)));
    }

    #[test]
    fn test_masked_left_pixel_is_invalid() {
        let (left, right) = shifted_pair(30, 30, 2);
        let mut left_mask = Raster::filled(left.region(), true);
        left_mask.set(15, 15, false);
        let right_mask = Raster::filled(right.region(), true);
        let matcher = BlockMatcher::new()
            .with_radius(2)
            .with_disparity_range(-4, 0, 0, 0)
            .with_metric(MatchingMetric::Ssd);

        let out = match_full(&matcher, &left, &right, &left_mask, &right_mask).unwrap();
        assert_eq!(out.disparity.get(15, 15), None);
        // neighbours still match with one pair excluded
        assert_eq!(out.disparity.get(16, 15), Some((-2.0, 0.0)));
    }

    #[test]
    fn test_masked_right_centre_skips_candidate() {
        let (left, right) = shifted_pair(30, 30, 2);
        let left_mask = Raster::filled(left.region(), true);
        let mut right_mask = Raster::filled(right.region(), true);
        right_mask.set(13, 15, false);
        let matcher = BlockMatcher::new()
            .with_radius(2)
            .with_disparity_range(-2, -2, 0, 0)
            .with_metric(MatchingMetric::Ssd);

        let out = match_full(&matcher, &left, &right, &left_mask, &right_mask).unwrap();
        assert_eq!(out.disparity.get(15, 15), None);
        assert_eq!(out.disparity.get(16, 15), Some((-2.0, 0.0)));
    }

    #[test]
    fn test_stencils_and_metric_output() {
        let (left, right) = shifted_pair(40, 24, 3);
        let mask = Raster::filled(left.region(), true);
        let matcher = BlockMatcher::new()
            .with_radius(2)
            .with_disparity_range(-3, 1, 0, 0)
            .with_metric(MatchingMetric::Ssd)
            .with_metric_output(true)
            .with_stencils(true);

        let out = match_full(&matcher, &left, &right, &mask, &mask).unwrap();
        let stencils = out.stencils.unwrap();
        let s = stencils.get(20, 12).unwrap();
        // winner on the lower edge of the window
        assert!(s.h[0].is_nan());
        assert_eq!(s.h[1], 0.0);
        assert!(s.h[2] > 0.0);
        // vertical search is a single row
        assert!(s.v[0].is_nan() && s.v[2].is_nan());
        let metric = out.disparity.metric.unwrap();
        assert_eq!(metric.get(20, 12), Some(0.0));
    }

    #[test]
    fn test_prior_narrows_search() {
        let (left, right) = shifted_pair(40, 24, 6);
        let mask = Raster::filled(left.region(), true);
        let matcher = BlockMatcher::new()
            .with_radius(2)
            .with_disparity_range(0, 0, 0, 0)
            .with_metric(MatchingMetric::Ssd)
            .with_prior(DisparityPrior::uniform(-5.4, 0.0, 2, 0));

        assert_eq!(matcher.search_envelope(), DisparityBounds::new(-7, -3, 0, 0));
        let out = match_full(&matcher, &left, &right, &mask, &mask).unwrap();
        assert_eq!(out.disparity.get(20, 12), Some((-6.0, 0.0)));
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let region = Region::from_size(8, 8);
        let r = Raster::filled(region, 1.0f32);
        let m = Raster::filled(region, true);
        let bad = [
            BlockMatcher::new().with_radius(0),
            BlockMatcher::new().with_disparity_range(2, 1, 0, 0),
            BlockMatcher::new().with_disparity_range(0, 1, 3, 0),
            BlockMatcher::new().with_metric(MatchingMetric::Lp { p: 0.0 }),
            BlockMatcher::new().with_min_overlap(0.0),
        ];
        for matcher in bad {
            assert!(matches!(
                match_full(&matcher, &r, &r, &m, &m),
                Err(Error::Config(_))
            ));
        }
    }
}
