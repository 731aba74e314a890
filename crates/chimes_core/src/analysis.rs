//! Post-run analysis of recorded histories.

use crate::error::{EngineError, Result};
use crate::integrate::RunState;
use indexmap::IndexMap;
use ndarray::{s, Array5, ArrayView1, Axis, Zip};
use num_complex::Complex64;
use serde::Serialize;
use std::f64::consts::PI;

/// Time derivative of a history along its time axis.
///
/// Central differences in the interior, one-sided differences at both ends.
/// A single time point has a zero derivative.
pub fn time_derivative(history: &Array5<f64>, dt: f64) -> Array5<f64> {
    let steps = history.len_of(Axis(0));
    let mut out = Array5::zeros(history.raw_dim());
    if steps < 2 {
        return out;
    }

    let first = (&history.index_axis(Axis(0), 1) - &history.index_axis(Axis(0), 0)) / dt;
    out.index_axis_mut(Axis(0), 0).assign(&first);

    let last = (&history.index_axis(Axis(0), steps - 1) - &history.index_axis(Axis(0), steps - 2)) / dt;
    out.index_axis_mut(Axis(0), steps - 1).assign(&last);

    if steps > 2 {
        let ahead = history.slice(s![2.., .., .., .., ..]);
        let behind = history.slice(s![..steps - 2, .., .., .., ..]);
        Zip::from(out.slice_mut(s![1..steps - 1, .., .., .., ..]))
            .and(&ahead)
            .and(&behind)
            .for_each(|o, &a, &b| *o = (a - b) / (2.0 * dt));
    }
    out
}

/// Relative growth rate: the time derivative divided by the value.
pub fn log_derivative(history: &Array5<f64>, dt: f64) -> Array5<f64> {
    let mut out = time_derivative(history, dt);
    Zip::from(&mut out)
        .and(history)
        .for_each(|d, &v| *d /= v);
    out
}

/// Per-run rate at which trajectories approach `target`.
///
/// The Euclidean distance to the target point (one scalar per field, read
/// at `region` and the first sector) is fitted with an exponential by a
/// least-squares fit of its logarithm, weighted by the distance itself.
/// The returned rate is the decay constant: larger means faster
/// convergence. Runs with a non-finite distance anywhere get `-inf`; runs
/// that sit exactly on the target get `+inf`.
pub fn convergence_rate(
    state: &RunState,
    target: &IndexMap<String, f64>,
    region: usize,
) -> Result<Vec<f64>> {
    if region >= state.regions {
        return Err(EngineError::ShapeMismatch {
            field: "region".to_string(),
            expected: vec![state.regions],
            found: vec![region],
        });
    }
    let valid = state.last_valid_index + 1;
    let time = state
        .field("time")
        .ok_or_else(|| EngineError::unknown("time"))?;

    let mut distance = ndarray::Array2::<f64>::zeros((valid, state.runs));
    for (name, &goal) in target {
        let history = state
            .field(name)
            .ok_or_else(|| EngineError::unknown_in(name.as_str(), "convergence target"))?;
        if history.len_of(Axis(0)) < valid {
            return Err(EngineError::malformed(name, "has no time axis"));
        }
        let values = history.slice(s![..valid, .., region, 0, 0]);
        Zip::from(&mut distance)
            .and_broadcast(&values)
            .for_each(|d, &v| *d += (v - goal).powi(2));
    }
    distance.mapv_inplace(f64::sqrt);

    let t = time.slice(s![..valid, 0, 0, 0, 0]);
    let rates = distance
        .axis_iter(Axis(1))
        .map(|dist| {
            if dist.iter().any(|d| !d.is_finite()) {
                return f64::NEG_INFINITY;
            }
            let points: Vec<(f64, f64, f64)> = t
                .iter()
                .zip(dist.iter())
                .filter(|(_, &d)| d > 0.0)
                .map(|(&time, &d)| (time, d.ln(), d))
                .collect();
            if points.len() < 2 {
                return f64::INFINITY;
            }
            -weighted_slope(&points)
        })
        .collect();
    Ok(rates)
}

/// Fourier coefficients computed per cycle for [`Cycle::harmonicity`].
pub const CYCLE_HARMONICS: usize = 10;

/// One oscillation of a field, delimited by two successive local maxima of
/// a reference field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cycle {
    /// Time indices of the two maxima; the cycle covers `start..end`.
    pub start: usize,
    pub end: usize,
    pub t_start: f64,
    pub t_end: f64,
    pub period: f64,
    pub mean: f64,
    pub median: f64,
    pub stdev: f64,
    pub min: f64,
    pub max: f64,
    /// Magnitudes of the first [`CYCLE_HARMONICS`] Fourier coefficients.
    pub coefficients: Vec<f64>,
    /// Share of the spectral energy outside the constant term.
    pub harmonicity: f64,
}

impl Cycle {
    pub fn t_mid(&self) -> f64 {
        0.5 * (self.t_start + self.t_end)
    }

    pub fn frequency(&self) -> f64 {
        1.0 / self.period
    }
}

/// Cycles of `field` for every run, with boundaries taken from the local
/// maxima of `reference` (pass the same name to detect a field's own cycles).
///
/// Both fields are read at `region` and the first sector, up to the last
/// valid time index. A run with fewer than two maxima has no cycles.
pub fn cycles(
    state: &RunState,
    field: &str,
    reference: &str,
    region: usize,
) -> Result<Vec<Vec<Cycle>>> {
    if region >= state.regions {
        return Err(EngineError::ShapeMismatch {
            field: "region".to_string(),
            expected: vec![state.regions],
            found: vec![region],
        });
    }
    let valid = state.last_valid_index + 1;
    let time = state
        .field("time")
        .ok_or_else(|| EngineError::unknown("time"))?;
    let t = time.slice(s![..valid, 0, 0, 0, 0]);
    let values = time_series(state, field, valid, region)?;
    let reference = time_series(state, reference, valid, region)?;

    let per_run = (0..state.runs)
        .map(|run| {
            let x = values.slice(s![.., run.min(values.ncols() - 1)]);
            let r = reference.slice(s![.., run.min(reference.ncols() - 1)]);
            local_maxima(r)
                .windows(2)
                .map(|w| describe_cycle(x, t, w[0], w[1]))
                .collect()
        })
        .collect();
    Ok(per_run)
}

/// `(time, run)` view of a time-varying field at `region` and the first sector.
fn time_series<'a>(
    state: &'a RunState,
    name: &str,
    valid: usize,
    region: usize,
) -> Result<ndarray::ArrayView2<'a, f64>> {
    let history = state
        .field(name)
        .ok_or_else(|| EngineError::unknown_in(name, "cycle analysis"))?;
    if history.len_of(Axis(0)) < valid {
        return Err(EngineError::malformed(name, "has no time axis"));
    }
    Ok(history.view().slice_move(s![..valid, .., region, 0, 0]))
}

/// Indices strictly greater than both neighbours. The last two points are
/// never candidates.
fn local_maxima(values: ArrayView1<'_, f64>) -> Vec<usize> {
    let n = values.len();
    (1..n.saturating_sub(2))
        .filter(|&i| values[i] > values[i - 1] && values[i] > values[i + 1])
        .collect()
}

fn describe_cycle(
    values: ArrayView1<'_, f64>,
    t: ArrayView1<'_, f64>,
    start: usize,
    end: usize,
) -> Cycle {
    let window: Vec<f64> = values.slice(s![start..end]).to_vec();
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let stdev = (window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    let min = window.iter().copied().fold(f64::INFINITY, f64::min);
    let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut sorted = window.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    };

    let coefficients = fourier_magnitudes(&window, CYCLE_HARMONICS);
    let energy: f64 = coefficients.iter().map(|c| c * c).sum();
    let harmonicity = if energy > 0.0 {
        coefficients[1..].iter().map(|c| c * c).sum::<f64>() / energy
    } else {
        0.0
    };

    Cycle {
        start,
        end,
        t_start: t[start],
        t_end: t[end],
        period: t[end] - t[start],
        mean,
        median,
        stdev,
        min,
        max,
        coefficients,
        harmonicity,
    }
}

/// `|mean(y · exp(-2πi·k·s))|` for `k < harmonics`, with `s` spanning `[0, 1]`
/// over the samples.
fn fourier_magnitudes(y: &[f64], harmonics: usize) -> Vec<f64> {
    let n = y.len();
    let step = if n > 1 { 1.0 / (n - 1) as f64 } else { 0.0 };
    (0..harmonics)
        .map(|k| {
            let sum: Complex64 = y
                .iter()
                .enumerate()
                .map(|(j, &v)| v * Complex64::from_polar(1.0, -2.0 * PI * k as f64 * j as f64 * step))
                .sum();
            (sum / n as f64).norm()
        })
        .collect()
}

/// Slope of the weighted least-squares line through `(x, y, weight)` points.
fn weighted_slope(points: &[(f64, f64, f64)]) -> f64 {
    let total: f64 = points.iter().map(|p| p.2).sum();
    let x_mean = points.iter().map(|p| p.2 * p.0).sum::<f64>() / total;
    let y_mean = points.iter().map(|p| p.2 * p.1).sum::<f64>() / total;
    let (cov, var) = points.iter().fold((0.0, 0.0), |(cov, var), &(x, y, w)| {
        (
            cov + w * (x - x_mean) * (y - y_mean),
            var + w * (x - x_mean).powi(2),
        )
    });
    cov / var
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[f64]) -> Array5<f64> {
        Array5::from_shape_vec((values.len(), 1, 1, 1, 1), values.to_vec()).unwrap()
    }

    fn state_with(fields: Vec<(&str, Array5<f64>)>, dt: f64) -> RunState {
        let steps = fields[0].1.len_of(Axis(0));
        let runs = fields[0].1.len_of(Axis(1));
        let mut map = IndexMap::new();
        let time = Array5::from_shape_fn((steps, runs, 1, 1, 1), |(i, _, _, _, _)| i as f64 * dt);
        map.insert("time".to_string(), time);
        for (name, history) in fields {
            map.insert(name.to_string(), history);
        }
        RunState {
            dt,
            steps,
            runs,
            regions: 1,
            sector_labels: IndexMap::new(),
            solver: "eRK4-homemade".to_string(),
            last_valid_index: steps - 1,
            fields: map,
        }
    }

    #[test]
    fn derivative_of_a_parabola() {
        let dt = 0.5;
        let values: Vec<f64> = (0..6).map(|i| (i as f64 * dt).powi(2)).collect();
        let d = time_derivative(&series(&values), dt);
        // central differences are exact on a parabola
        for i in 1..5 {
            assert!((d[(i, 0, 0, 0, 0)] - 2.0 * i as f64 * dt).abs() < 1e-12);
        }
        assert!((d[(0, 0, 0, 0, 0)] - 0.5).abs() < 1e-12);
        assert!((d[(5, 0, 0, 0, 0)] - 4.5).abs() < 1e-12);
    }

    #[test]
    fn single_point_has_zero_derivative() {
        let d = time_derivative(&series(&[3.0]), 0.1);
        assert_eq!(d[(0, 0, 0, 0, 0)], 0.0);
    }

    #[test]
    fn log_derivative_recovers_growth_rate() {
        let dt = 0.01;
        let values: Vec<f64> = (0..101).map(|i| (0.3 * i as f64 * dt).exp()).collect();
        let g = log_derivative(&series(&values), dt);
        assert!((g[(50, 0, 0, 0, 0)] - 0.3).abs() < 1e-4);
    }

    #[test]
    fn convergence_rate_fits_the_decay_constant() {
        let dt = 0.1;
        let steps = 101;
        let x = Array5::from_shape_fn((steps, 2, 1, 1, 1), |(i, run, _, _, _)| {
            let rate = if run == 0 { 0.5 } else { 2.0 };
            1.0 + (-rate * i as f64 * dt).exp()
        });
        let state = state_with(vec![("x", x)], dt);
        let mut target = IndexMap::new();
        target.insert("x".to_string(), 1.0);
        let rates = convergence_rate(&state, &target, 0).unwrap();
        assert!((rates[0] - 0.5).abs() < 1e-6);
        assert!((rates[1] - 2.0).abs() < 1e-6);
    }

    fn sine(steps: usize, dt: f64, period: f64, scale: f64, offset: f64) -> Array5<f64> {
        Array5::from_shape_fn((steps, 1, 1, 1, 1), |(i, _, _, _, _)| {
            offset + scale * (2.0 * PI * i as f64 * dt / period).sin()
        })
    }

    #[test]
    fn cycles_of_a_sine_have_its_period_and_moments() {
        let dt = 0.01;
        let state = state_with(vec![("x", sine(1001, dt, 2.0, 1.0, 0.0))], dt);
        let runs = cycles(&state, "x", "x", 0).unwrap();
        assert_eq!(runs.len(), 1);
        let found = &runs[0];
        // maxima at t = 0.5, 2.5, 4.5, 6.5, 8.5
        assert_eq!(found.len(), 4);
        for (n, cycle) in found.iter().enumerate() {
            assert_eq!(cycle.start, 50 + 200 * n);
            assert_eq!(cycle.end, 250 + 200 * n);
            assert!((cycle.period - 2.0).abs() < 1e-9);
            assert!((cycle.frequency() - 0.5).abs() < 1e-9);
            assert!((cycle.t_mid() - (1.5 + 2.0 * n as f64)).abs() < 1e-9);
            assert!(cycle.mean.abs() < 1e-9);
            assert!(cycle.median.abs() < 1e-9);
            assert!((cycle.stdev - 0.5f64.sqrt()).abs() < 1e-9);
            assert!((cycle.max - 1.0).abs() < 1e-12);
            assert!((cycle.min + 1.0).abs() < 1e-12);
            assert_eq!(cycle.coefficients.len(), CYCLE_HARMONICS);
            assert!(cycle.harmonicity > 0.99);
        }
    }

    #[test]
    fn cycles_follow_the_reference_field() {
        let dt = 0.01;
        let state = state_with(
            vec![
                ("x", sine(1001, dt, 2.0, 1.0, 0.0)),
                ("y", sine(1001, dt, 2.0, 2.0, 3.0)),
            ],
            dt,
        );
        let found = &cycles(&state, "y", "x", 0).unwrap()[0];
        assert_eq!(found.len(), 4);
        assert!((found[0].mean - 3.0).abs() < 1e-9);
        assert!((found[0].max - 5.0).abs() < 1e-12);
        assert!((found[0].min - 1.0).abs() < 1e-12);
        // a constant offset lowers the share of energy in the oscillation
        assert!(found[0].harmonicity < 0.5);
    }

    #[test]
    fn monotone_trajectories_have_no_cycles() {
        let state = state_with(vec![("x", series(&[0.0, 1.0, 2.0, 3.0, 4.0]))], 1.0);
        assert!(cycles(&state, "x", "x", 0).unwrap()[0].is_empty());
        assert!(matches!(
            cycles(&state, "x", "ghost", 0),
            Err(EngineError::UnknownField { .. })
        ));
        assert!(matches!(
            cycles(&state, "x", "x", 1),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn diverged_runs_get_negative_infinity() {
        let x = series(&[1.0, f64::NAN, 3.0]);
        let state = state_with(vec![("x", x)], 1.0);
        let mut target = IndexMap::new();
        target.insert("x".to_string(), 0.0);
        assert_eq!(
            convergence_rate(&state, &target, 0).unwrap(),
            vec![f64::NEG_INFINITY]
        );

        target.insert("ghost".to_string(), 0.0);
        assert!(matches!(
            convergence_rate(&state, &target, 0),
            Err(EngineError::UnknownField { .. })
        ));
    }
}
