//! Ensemble generation for sensitivity studies.
//!
//! Each uncertain field gets a [`DistributionSpec`]; [`generate_ensemble`]
//! draws one value per parallel run for every field, independently. The
//! resulting lists are meant to be assigned to the parallel-run axis.

use crate::error::{EngineError, Result};
use indexmap::IndexMap;
use ndarray::{Array4, Array5, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal, Normal, Uniform};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionKind {
    #[serde(alias = "gaussian")]
    Normal,
    /// Log-normal, moment-matched to the requested mean and spread.
    #[serde(alias = "log", alias = "log-normal")]
    LogNormal,
    Uniform,
}

impl DistributionKind {
    pub fn parse(field: &str, name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "normal" | "gaussian" => Ok(DistributionKind::Normal),
            "log" | "lognormal" | "log-normal" => Ok(DistributionKind::LogNormal),
            "uniform" => Ok(DistributionKind::Uniform),
            other => Err(invalid(field, format!("unknown distribution kind `{other}`"))),
        }
    }
}

/// How to draw one field's values.
///
/// `spread` is a standard deviation for normal and log-normal draws and the
/// full interval width for uniform ones. `bounds`, when set, overrides the
/// uniform interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionSpec {
    pub mean: f64,
    pub spread: f64,
    pub kind: DistributionKind,
    pub bounds: Option<(f64, f64)>,
}

impl Default for DistributionSpec {
    fn default() -> Self {
        Self {
            mean: 0.0,
            spread: 0.0,
            kind: DistributionKind::Normal,
            bounds: None,
        }
    }
}

impl DistributionSpec {
    pub fn normal(mean: f64, stdev: f64) -> Self {
        Self {
            mean,
            spread: stdev,
            kind: DistributionKind::Normal,
            bounds: None,
        }
    }

    pub fn log_normal(mean: f64, stdev: f64) -> Self {
        Self {
            mean,
            spread: stdev,
            kind: DistributionKind::LogNormal,
            bounds: None,
        }
    }

    /// Uniform over `mean ± width / 2`.
    pub fn uniform(mean: f64, width: f64) -> Self {
        Self {
            mean,
            spread: width,
            kind: DistributionKind::Uniform,
            bounds: None,
        }
    }

    pub fn uniform_between(low: f64, high: f64) -> Self {
        Self {
            mean: 0.5 * (low + high),
            spread: high - low,
            kind: DistributionKind::Uniform,
            bounds: Some((low, high)),
        }
    }

    pub fn validate(&self, field: &str) -> Result<()> {
        if !self.mean.is_finite() {
            return Err(invalid(field, format!("mean must be finite, got {}", self.mean)));
        }
        // Explicit bounds replace the spread, so they are checked on their own.
        if let Some((low, high)) = self.bounds {
            if !(low.is_finite() && high.is_finite()) || low > high {
                return Err(invalid(field, format!("invalid bounds [{low}, {high}]")));
            }
        } else if !(self.spread.is_finite() && self.spread >= 0.0) {
            return Err(invalid(
                field,
                format!("spread must be finite and non-negative, got {}", self.spread),
            ));
        }
        if self.kind == DistributionKind::LogNormal && self.mean == 0.0 {
            return Err(invalid(field, "log-normal draws need a non-zero mean"));
        }
        Ok(())
    }

    /// Draws `n` values.
    pub fn sample<R: Rng + ?Sized>(&self, field: &str, n: usize, rng: &mut R) -> Result<Vec<f64>> {
        self.validate(field)?;
        let values = match self.kind {
            DistributionKind::Normal => {
                let dist = Normal::new(self.mean, self.spread)
                    .map_err(|e| invalid(field, e.to_string()))?;
                dist.sample_iter(rng).take(n).collect()
            }
            DistributionKind::LogNormal => {
                let m = self.mean.abs();
                let sigma2 = (1.0 + (self.spread / m).powi(2)).ln();
                let mu = m.ln() - 0.5 * sigma2;
                let dist = LogNormal::new(mu, sigma2.sqrt())
                    .map_err(|e| invalid(field, e.to_string()))?;
                let sign = self.mean.signum();
                dist.sample_iter(rng).take(n).map(|v| sign * v).collect()
            }
            DistributionKind::Uniform => {
                let (low, high) = self
                    .bounds
                    .unwrap_or((self.mean - 0.5 * self.spread, self.mean + 0.5 * self.spread));
                if low == high {
                    vec![low; n]
                } else {
                    Uniform::new_inclusive(low, high).sample_iter(rng).take(n).collect()
                }
            }
        };
        Ok(values)
    }
}

/// Draws `n` values for every field, independently.
///
/// With a seed the ensemble is reproducible; without one it comes from OS entropy.
pub fn generate_ensemble(
    specs: &IndexMap<String, DistributionSpec>,
    n: usize,
    seed: Option<u64>,
) -> Result<IndexMap<String, Vec<f64>>> {
    if n == 0 {
        return Err(EngineError::InvalidSettings(
            "an ensemble needs at least one run".to_string(),
        ));
    }
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut ensemble = IndexMap::with_capacity(specs.len());
    for (field, spec) in specs {
        let values = spec.sample(field, n, &mut rng)?;
        debug!(field = %field, kind = ?spec.kind, n, "drew ensemble values");
        ensemble.insert(field.clone(), values);
    }
    Ok(ensemble)
}

/// Statistics across the parallel-run axis of a recorded history.
/// Every array keeps the (time, region, sectorA, sectorB) axes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatistics {
    pub mean: Array4<f64>,
    /// Population standard deviation.
    pub stdev: Array4<f64>,
    pub min: Array4<f64>,
    pub max: Array4<f64>,
    pub median: Array4<f64>,
}

pub fn run_statistics(history: &Array5<f64>) -> RunStatistics {
    let runs = Axis(1);
    let mean = history.map_axis(runs, |lane| lane_mean(&lane));
    let stdev = history.map_axis(runs, |lane| {
        let m = lane_mean(&lane);
        let var = lane.iter().map(|v| (v - m).powi(2)).sum::<f64>() / lane.len() as f64;
        var.sqrt()
    });
    let min = history.map_axis(runs, |lane| lane.iter().copied().fold(f64::INFINITY, f64::min));
    let max = history.map_axis(runs, |lane| lane.iter().copied().fold(f64::NEG_INFINITY, f64::max));
    let median = history.map_axis(runs, |lane| {
        let mut values = lane.to_vec();
        if values.is_empty() {
            return f64::NAN;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let mid = values.len() / 2;
        if values.len() % 2 == 0 {
            0.5 * (values[mid - 1] + values[mid])
        } else {
            values[mid]
        }
    });
    RunStatistics {
        mean,
        stdev,
        min,
        max,
        median,
    }
}

fn lane_mean(lane: &ArrayView1<'_, f64>) -> f64 {
    lane.sum() / lane.len() as f64
}

fn invalid(field: &str, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidDistribution {
        field: field.to_string(),
        reason: reason.into(),
    }
}
