//! The time loop.
//!
//! Dynamic states are recorded on a fixed grid of `round(Tmax/dt) + 1`
//! points. Adaptive solvers take as many internal steps as they need between
//! two grid points. Histories are allocated once per run; every accepted grid
//! state is written into them in place, together with the Algebraic values
//! evaluated against it.

use crate::engine::EquationSystem;
use crate::error::{EngineError, Result};
use crate::field::{FieldKind, FieldValue};
use crate::model::Model;
use crate::solvers::{AdaptiveSolver, SolverKind, RK4};
use crate::tensor::{self, AxisSizes};
use crate::traits::{DynamicalSystem, Steppable};
use indexmap::IndexMap;
use ndarray::{s, Array5, ArrayView1, ArrayView4, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{info, warn};

/// Step control of the adaptive solvers. Ignored by fixed-step RK4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub rtol: f64,
    pub atol: f64,
    /// Below this internal step size the run is declared diverged.
    pub min_step: f64,
    /// Consecutive rejected steps tolerated before giving up.
    pub max_rejections: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-9,
            min_step: 1e-10,
            max_rejections: 64,
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.rtol.is_finite() && self.rtol >= 0.0, "rtol must be finite and non-negative"),
            (self.atol.is_finite() && self.atol >= 0.0, "atol must be finite and non-negative"),
            (self.rtol > 0.0 || self.atol > 0.0, "rtol and atol cannot both be zero"),
            (self.min_step.is_finite() && self.min_step > 0.0, "min_step must be positive"),
        ];
        for (ok, message) in checks {
            if !ok {
                return Err(EngineError::InvalidSettings(message.to_string()));
            }
        }
        Ok(())
    }
}

/// Recorded history of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub dt: f64,
    /// Length of the time axis.
    pub steps: usize,
    pub runs: usize,
    pub regions: usize,
    /// Labels of every size field, counted sizes numbered from "0".
    pub sector_labels: IndexMap<String, Vec<String>>,
    pub solver: String,
    /// Last time index holding valid data; `steps - 1` on a complete run.
    pub last_valid_index: usize,
    /// Per-field (time, run, region, sectorA, sectorB) values. Parameters and
    /// sizes carry a length-1 time axis.
    pub fields: IndexMap<String, Array5<f64>>,
}

impl RunState {
    pub fn field(&self, name: &str) -> Option<&Array5<f64>> {
        self.fields.get(name)
    }

    pub fn is_complete(&self) -> bool {
        self.last_valid_index + 1 == self.steps
    }

    /// The recorded `time` values of the first run.
    pub fn time(&self) -> Option<ArrayView1<'_, f64>> {
        let time = self.fields.get("time")?;
        Some(time.slice(s![.., 0, 0, 0, 0]))
    }
}

/// A run's history, and the divergence that cut it short if any.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub state: RunState,
    pub divergence: Option<EngineError>,
}

/// Integrates `model` over `axes.steps` grid points spaced by `dt`.
///
/// Setup and evaluation failures are returned as errors. A solver
/// divergence is not: the partial history is returned with it.
pub fn integrate(
    model: &Model,
    axes: AxisSizes,
    solver: SolverKind,
    dt: f64,
    settings: &RunSettings,
) -> Result<Outcome> {
    if solver.tableau().is_some() {
        settings.validate()?;
    }
    if axes.steps == 0 {
        return Err(EngineError::InvalidSettings("a run needs at least one time step".into()));
    }

    let system = EquationSystem::new(model, &axes)?;
    let initial = system.initial_state(model)?;
    let t0 = match model.field("time").and_then(|f| f.initial.as_ref()) {
        Some(FieldValue::Scalar(t)) => *t,
        _ => 0.0,
    };

    info!(
        model = %model.name,
        solver = %solver,
        steps = axes.steps,
        runs = axes.runs,
        regions = axes.regions,
        state = system.dimension(),
        "run started"
    );

    let mut recorder = Recorder::new(model, &system, &axes)?;
    let (last_valid_index, divergence) = match solver.tableau() {
        None => {
            let mut stepper = RK4::new(system.dimension());
            drive(&mut stepper, &mut recorder, initial, t0, dt, axes.steps)?
        }
        Some(tableau) => {
            let mut stepper = AdaptiveSolver::new(tableau, system.dimension(), settings);
            let result = drive(&mut stepper, &mut recorder, initial, t0, dt, axes.steps)?;
            info!(
                accepted = stepper.accepted(),
                rejected = stepper.rejected(),
                "adaptive step statistics"
            );
            result
        }
    };
    let Recorder {
        fields,
        sector_labels,
        ..
    } = recorder;

    if let Some(err) = &divergence {
        warn!(model = %model.name, %err, "run stopped early");
    } else {
        info!(model = %model.name, steps = axes.steps, "run finished");
    }

    Ok(Outcome {
        state: RunState {
            dt,
            steps: axes.steps,
            runs: axes.runs,
            regions: axes.regions,
            sector_labels,
            solver: solver.name().to_string(),
            last_valid_index,
            fields,
        },
        divergence,
    })
}

/// Pre-allocated histories of one run, filled one grid point at a time.
struct Recorder<'a> {
    system: &'a EquationSystem,
    /// Dynamic fields with their slice of the state vector.
    dynamics: Vec<(String, Range<usize>, (usize, usize, usize, usize))>,
    fields: IndexMap<String, Array5<f64>>,
    sector_labels: IndexMap<String, Vec<String>>,
}

impl<'a> Recorder<'a> {
    fn new(model: &Model, system: &'a EquationSystem, axes: &AxisSizes) -> Result<Self> {
        let mut dynamics = Vec::new();
        let mut fields = IndexMap::new();
        let mut sector_labels = IndexMap::new();
        for field in model.fields() {
            let shape = system
                .shape(&field.name)
                .ok_or_else(|| EngineError::unknown(field.name.as_str()))?;
            let steps = match field.kind {
                FieldKind::Dynamic | FieldKind::Algebraic => axes.steps,
                FieldKind::Parameter | FieldKind::Size => 1,
            };
            if field.kind == FieldKind::Dynamic {
                let range = system
                    .state_range(&field.name)
                    .ok_or_else(|| EngineError::unknown(field.name.as_str()))?;
                dynamics.push((field.name.clone(), range, shape.dim()));
            }
            fields.insert(field.name.clone(), tensor::history(&shape, steps));
            if let Some(spec) = &field.sectors {
                sector_labels.insert(field.name.clone(), spec.labels());
            }
        }
        Ok(Self {
            system,
            dynamics,
            fields,
            sector_labels,
        })
    }

    /// Writes grid point `i`: the Dynamic state itself, then every value
    /// evaluated from it. Parameters and sizes are written once, at `i == 0`.
    fn record(&mut self, i: usize, state: &[f64]) -> Result<()> {
        for (name, range, dim) in &self.dynamics {
            let view = ArrayView4::from_shape(*dim, &state[range.clone()])
                .map_err(|e| EngineError::malformed(name, e.to_string()))?;
            if let Some(history) = self.fields.get_mut(name) {
                history.index_axis_mut(Axis(0), i).assign(&view);
            }
        }

        self.system.evaluate(state)?;
        let fields = &mut self.fields;
        self.system.for_each_value(|name, kind, value| {
            let slot = match kind {
                FieldKind::Algebraic => Some(i),
                FieldKind::Parameter | FieldKind::Size if i == 0 => Some(0),
                _ => None,
            };
            if let (Some(slot), Some(history)) = (slot, fields.get_mut(name)) {
                history.index_axis_mut(Axis(0), slot).assign(value);
            }
        });
        Ok(())
    }
}

/// Steps through the grid, recording every accepted state. Returns the last
/// recorded index and the divergence that stopped the loop, if any.
fn drive<S: Steppable<f64>>(
    stepper: &mut S,
    recorder: &mut Recorder<'_>,
    mut state: Vec<f64>,
    t0: f64,
    dt: f64,
    steps: usize,
) -> Result<(usize, Option<EngineError>)> {
    let system = recorder.system;
    recorder.record(0, &state)?;
    let mut t = t0;

    for i in 1..steps {
        match stepper.step(system, &mut t, &mut state, dt) {
            Ok(()) => recorder.record(i, &state)?,
            Err(EngineError::SolverDivergence { time, reason, .. }) => {
                let divergence = EngineError::SolverDivergence {
                    last_valid_index: i - 1,
                    time,
                    reason,
                };
                return Ok((i - 1, Some(divergence)));
            }
            Err(other) => return Err(other),
        }
    }
    Ok((steps - 1, None))
}
