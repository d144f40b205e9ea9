//! Sub-pixel disparity refinement.
//!
//! Each axis is refined independently around the integer winner. Degenerate
//! neighbourhoods (winner on the search-window edge, winner not an extremum,
//! flat stencil) keep the integer disparity.

use crate::{
    BlockMatcher, DisparityMap, MatchInput, MetricStencil, Polarity, Result, WindowScorer,
};
use dem_core::{Error, Raster};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubpixelMethod {
    Parabolic,
    Triangular,
    /// Iterative bisection on the metric of a bilinearly resampled right window.
    Dichotomy { max_iterations: u32, min_step: f64 },
}

impl Default for SubpixelMethod {
    fn default() -> Self {
        SubpixelMethod::Dichotomy {
            max_iterations: 10,
            min_step: 0.01,
        }
    }
}

impl SubpixelMethod {
    pub fn validate(&self) -> Result<()> {
        if let SubpixelMethod::Dichotomy {
            max_iterations,
            min_step,
        } = *self
        {
            if max_iterations == 0 {
                return Err(Error::config("dichotomy needs at least one iteration"));
            }
            if !(min_step.is_finite() && min_step > 0.0) {
                return Err(Error::config(format!(
                    "dichotomy minimum step must be > 0, got {min_step}"
                )));
            }
        }
        Ok(())
    }
}

/// Fractional correction and the metric predicted there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StencilFit {
    pub offset: f64,
    pub value: f64,
}

/// Closed-form fit on `[a, b, c]` sampled at `-1, 0, +1`.
///
/// `None` for degenerate stencils; `Dichotomy` has no closed form and is
/// rejected as well.
pub fn refine_stencil(stencil: [f64; 3], method: SubpixelMethod, polarity: Polarity) -> Option<StencilFit> {
    let [a, b, c] = stencil;
    if !(a.is_finite() && b.is_finite() && c.is_finite()) {
        return None;
    }
    let extremum = match polarity {
        Polarity::Minimize => b <= a && b <= c,
        Polarity::Maximize => b >= a && b >= c,
    };
    if !extremum {
        return None;
    }

    let fit = match method {
        SubpixelMethod::Parabolic => {
            let denom = a - 2.0 * b + c;
            if denom == 0.0 {
                return None;
            }
            let offset = (a - c) / (2.0 * denom);
            StencilFit {
                offset,
                value: b - (a - c) * (a - c) / (8.0 * denom),
            }
        }
        SubpixelMethod::Triangular => {
            // Work on a minimisation problem.
            let sign = match polarity {
                Polarity::Minimize => 1.0,
                Polarity::Maximize => -1.0,
            };
            let (a, b, c) = (sign * a, sign * b, sign * c);
            let slope = a.max(c) - b;
            if slope == 0.0 {
                return None;
            }
            let offset = (a - c) / (2.0 * slope);
            StencilFit {
                offset,
                value: sign * (b - slope * offset.abs()),
            }
        }
        SubpixelMethod::Dichotomy { .. } => return None,
    };

    (fit.offset.is_finite() && fit.offset.abs() < 1.0).then_some(fit)
}

#[derive(Debug, Clone, Copy)]
struct Refined {
    h: f32,
    v: f32,
    score: Option<f64>,
}

/// Parabolic or triangular refinement from stencils emitted by the matcher.
pub fn refine_with_stencils(
    disparity: &DisparityMap,
    stencils: &Raster<MetricStencil>,
    method: SubpixelMethod,
    polarity: Polarity,
) -> Result<DisparityMap> {
    if matches!(method, SubpixelMethod::Dichotomy { .. }) {
        return Err(Error::config(
            "dichotomy refinement needs the epipolar images, use refine()",
        ));
    }
    if !stencils.region().contains_region(&disparity.region()) {
        return Err(Error::DimensionMismatch(format!(
            "stencils cover {:?}, disparities {:?}",
            stencils.region(),
            disparity.region()
        )));
    }

    let region = disparity.region();
    let rows: Vec<Vec<Option<Refined>>> = (region.y..region.bottom())
        .into_par_iter()
        .map(|y| {
            (region.x..region.right())
                .map(|x| {
                    let (h, v) = disparity.get(x, y)?;
                    let stencil = stencils.get(x, y)?;
                    Some(apply_fits(h, v, &stencil, method, polarity))
                })
                .collect()
        })
        .collect();

    Ok(assemble(disparity, rows))
}

/// Refines every valid disparity, re-evaluating the metric on the epipolar
/// images through `matcher`.
pub fn refine(
    disparity: &DisparityMap,
    matcher: &BlockMatcher,
    input: &MatchInput<'_>,
    method: SubpixelMethod,
) -> Result<DisparityMap> {
    method.validate()?;
    matcher.validate()?;
    input.validate()?;

    let region = disparity.region();
    let polarity = matcher.polarity;
    let rows: Vec<Vec<Option<Refined>>> = (region.y..region.bottom())
        .into_par_iter()
        .map(|y| {
            let mut scorer = WindowScorer::new(matcher, input);
            (region.x..region.right())
                .map(|x| {
                    let (h, v) = disparity.get(x, y)?;
                    if !scorer.load(x, y) {
                        return Some(Refined { h, v, score: None });
                    }
                    let bounds = matcher.search_bounds(x, y);
                    let (hi, vi) = (h.round() as i32, v.round() as i32);
                    let mut sample = |dh: i32, dv: i32| {
                        if bounds.contains(hi + dh, vi + dv) {
                            scorer.score((hi + dh) as f64, (vi + dv) as f64).unwrap_or(f64::NAN)
                        } else {
                            f64::NAN
                        }
                    };
                    let centre = sample(0, 0);
                    let stencil = MetricStencil {
                        h: [sample(-1, 0), centre, sample(1, 0)],
                        v: [sample(0, -1), centre, sample(0, 1)],
                    };

                    Some(match method {
                        SubpixelMethod::Dichotomy {
                            max_iterations,
                            min_step,
                        } => dichotomy(
                            &mut scorer,
                            (hi, vi),
                            &stencil,
                            polarity,
                            max_iterations,
                            min_step,
                        ),
                        _ => apply_fits(h, v, &stencil, method, polarity),
                    })
                })
                .collect()
        })
        .collect();

    let refined = assemble(disparity, rows);
    tracing::debug!(?region, ?method, "sub-pixel refinement done");
    Ok(refined)
}

fn apply_fits(h: f32, v: f32, stencil: &MetricStencil, method: SubpixelMethod, polarity: Polarity) -> Refined {
    let fh = refine_stencil(stencil.h, method, polarity);
    let fv = refine_stencil(stencil.v, method, polarity);
    let score = match (fh, fv) {
        (Some(a), Some(b)) if polarity.is_better(b.value, a.value) => Some(b.value),
        (Some(a), _) => Some(a.value),
        (None, Some(b)) => Some(b.value),
        (None, None) => None,
    };
    Refined {
        h: h + fh.map_or(0.0, |f| f.offset as f32),
        v: v + fv.map_or(0.0, |f| f.offset as f32),
        score,
    }
}

/// Bisection along one axis; the other stays at its integer value.
fn dichotomy_axis(
    scorer: &mut WindowScorer<'_, '_>,
    origin: (i32, i32),
    horizontal: bool,
    best_score: f64,
    polarity: Polarity,
    max_iterations: u32,
    min_step: f64,
) -> f64 {
    let mut pos = 0.0;
    let mut best = best_score;
    let mut step = 0.5;
    let at = |offset: f64| {
        if horizontal {
            (origin.0 as f64 + offset, origin.1 as f64)
        } else {
            (origin.0 as f64, origin.1 as f64 + offset)
        }
    };

    for _ in 0..max_iterations {
        if step < min_step {
            break;
        }
        let mut next = pos;
        for candidate in [pos - step, pos + step] {
            let (h, v) = at(candidate);
            if let Some(score) = scorer.score(h, v) {
                if polarity.is_better(score, best) {
                    best = score;
                    next = candidate;
                }
            }
        }
        pos = next;
        step *= 0.5;
    }
    pos
}

fn dichotomy(
    scorer: &mut WindowScorer<'_, '_>,
    (hi, vi): (i32, i32),
    stencil: &MetricStencil,
    polarity: Polarity,
    max_iterations: u32,
    min_step: f64,
) -> Refined {
    let usable = |s: [f64; 3]| {
        s.iter().all(|v| v.is_finite())
            && match polarity {
                Polarity::Minimize => s[1] <= s[0] && s[1] <= s[2],
                Polarity::Maximize => s[1] >= s[0] && s[1] >= s[2],
            }
    };
    let centre = stencil.h[1];

    let dh = if usable(stencil.h) {
        dichotomy_axis(scorer, (hi, vi), true, centre, polarity, max_iterations, min_step)
    } else {
        0.0
    };
    let dv = if usable(stencil.v) {
        dichotomy_axis(scorer, (hi, vi), false, centre, polarity, max_iterations, min_step)
    } else {
        0.0
    };

    let (h, v) = (hi as f64 + dh, vi as f64 + dv);
    let score = scorer.score(h, v).or(centre.is_finite().then_some(centre));
    Refined {
        h: h as f32,
        v: v as f32,
        score,
    }
}

fn assemble(disparity: &DisparityMap, rows: Vec<Vec<Option<Refined>>>) -> DisparityMap {
    let region = disparity.region();
    let mut out = disparity.clone();
    for (row, y) in rows.into_iter().zip(region.y..) {
        for (r, x) in row.into_iter().zip(region.x..) {
            let Some(r) = r else { continue };
            out.set(x, y, r.h, r.v);
            if let (Some(metric), Some(score)) = (out.metric.as_mut(), r.score) {
                metric.set(x, y, score as f32);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{match_full, MatchingMetric};
    use dem_core::Region;

    #[test]
    fn test_parabola_vertex_recovered() {
        // f(t) = 2 (t - 0.3)^2 + 1
        let f = |t: f64| 2.0 * (t - 0.3) * (t - 0.3) + 1.0;
        let fit = refine_stencil([f(-1.0), f(0.0), f(1.0)], SubpixelMethod::Parabolic, Polarity::Minimize)
            .unwrap();
        assert!((fit.offset - 0.3).abs() < 1e-6);
        assert!((fit.value - 1.0).abs() < 1e-6);

        // inverted parabola for a maximised metric
        let g = |t: f64| -3.0 * (t + 0.2) * (t + 0.2) + 0.9;
        let fit = refine_stencil([g(-1.0), g(0.0), g(1.0)], SubpixelMethod::Parabolic, Polarity::Maximize)
            .unwrap();
        assert!((fit.offset + 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_triangular_apex_recovered() {
        let f = |t: f64| 5.0 * (t - 0.25).abs() + 2.0;
        let fit = refine_stencil([f(-1.0), f(0.0), f(1.0)], SubpixelMethod::Triangular, Polarity::Minimize)
            .unwrap();
        assert!((fit.offset - 0.25).abs() < 1e-9);
        assert!((fit.value - 2.0).abs() < 1e-9);

        let g = |t: f64| -(t + 0.4).abs();
        let fit = refine_stencil([g(-1.0), g(0.0), g(1.0)], SubpixelMethod::Triangular, Polarity::Maximize)
            .unwrap();
        assert!((fit.offset + 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_stencils_rejected() {
        let parabolic = SubpixelMethod::Parabolic;
        assert!(refine_stencil([f64::NAN, 1.0, 2.0], parabolic, Polarity::Minimize).is_none());
        assert!(refine_stencil([0.0, 1.0, 2.0], parabolic, Polarity::Minimize).is_none());
        assert!(refine_stencil([1.0, 1.0, 1.0], parabolic, Polarity::Minimize).is_none());
        assert!(refine_stencil([1.0, 1.0, 1.0], SubpixelMethod::Triangular, Polarity::Maximize).is_none());
    }

    fn ramp_pair(shift: f64) -> (Raster<f32>, Raster<f32>) {
        // smooth texture so bilinear resampling is close to the true signal
        let tex = |x: f64, y: f64| {
            100.0 + 40.0 * (0.35 * x).sin() + 25.0 * (0.23 * y + 0.11 * x).cos() + 0.5 * x
        };
        let region = Region::from_size(60, 30);
        let left = Raster::from_fn(region, |x, y| tex(x as f64, y as f64) as f32);
        let right = Raster::from_fn(region, |x, y| tex(x as f64 + shift, y as f64) as f32);
        (left, right)
    }

    #[test]
    fn test_refine_moves_towards_fractional_shift() {
        let (left, right) = ramp_pair(3.4);
        let mask = Raster::filled(left.region(), true);
        let matcher = BlockMatcher::new()
            .with_radius(3)
            .with_disparity_range(-6, 0, 0, 0)
            .with_metric(MatchingMetric::Ssd)
            .with_stencils(true);
        let out = match_full(&matcher, &left, &right, &mask, &mask).unwrap();
        assert_eq!(out.disparity.get(30, 15), Some((-3.0, 0.0)));

        let input = MatchInput::new(&left, &right, &mask, &mask);
        for method in [SubpixelMethod::Parabolic, SubpixelMethod::default()] {
            let refined = refine(&out.disparity, &matcher, &input, method).unwrap();
            let (h, v) = refined.get(30, 15).unwrap();
            assert!((h + 3.4).abs() < 0.15, "{method:?}: {h}");
            // vertical search is a single row, nothing to refine
            assert_eq!(v, 0.0);
        }

        let stencils = out.stencils.as_ref().unwrap();
        let from_stencils =
            refine_with_stencils(&out.disparity, stencils, SubpixelMethod::Parabolic, matcher.polarity)
                .unwrap();
        let direct = refine(&out.disparity, &matcher, &input, SubpixelMethod::Parabolic).unwrap();
        assert_eq!(from_stencils.get(30, 15), direct.get(30, 15));
    }

    #[test]
    fn test_edge_winner_keeps_integer() {
        let (left, right) = ramp_pair(3.4);
        let mask = Raster::filled(left.region(), true);
        // true disparity lies outside the window, winner sits on its edge
        let matcher = BlockMatcher::new()
            .with_radius(3)
            .with_disparity_range(-2, 0, 0, 0)
            .with_metric(MatchingMetric::Ssd);
        let out = match_full(&matcher, &left, &right, &mask, &mask).unwrap();
        let input = MatchInput::new(&left, &right, &mask, &mask);
        let refined = refine(&out.disparity, &matcher, &input, SubpixelMethod::default()).unwrap();
        assert_eq!(refined.get(30, 15), Some((-2.0, 0.0)));
    }

    #[test]
    fn test_dichotomy_needs_images() {
        let d = DisparityMap::new(Region::from_size(2, 2));
        let s = Raster::filled(Region::from_size(2, 2), MetricStencil::UNAVAILABLE);
        assert!(refine_with_stencils(&d, &s, SubpixelMethod::default(), Polarity::Minimize).is_err());
    }
}
