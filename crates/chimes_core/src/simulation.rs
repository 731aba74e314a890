//! The user-facing entry point: load a model, assign values, run, read back.

use crate::error::{EngineError, Result};
use crate::field::{FieldKind, FieldValue};
use crate::integrate::{self, RunSettings, RunState};
use crate::loader::Loader;
use crate::model::{Model, ModelDeclaration};
use crate::registry::Registry;
use crate::resolver::ExecutionOrder;
use crate::sensitivity::{self, DistributionSpec, RunStatistics};
use crate::solvers::SolverKind;
use crate::tensor::{self, AxisSizes};
use indexmap::IndexMap;
use ndarray::{Array4, Array5};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

/// What `set_field` assigns: a fixed value, or one draw per parallel run.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Value(FieldValue),
    Distribution { spec: DistributionSpec, runs: usize },
}

impl From<FieldValue> for Assignment {
    fn from(value: FieldValue) -> Self {
        Assignment::Value(value)
    }
}

impl From<f64> for Assignment {
    fn from(value: f64) -> Self {
        Assignment::Value(FieldValue::Scalar(value))
    }
}

impl From<Vec<f64>> for Assignment {
    fn from(values: Vec<f64>) -> Self {
        Assignment::Value(FieldValue::Runs(values))
    }
}

impl From<Array4<f64>> for Assignment {
    fn from(array: Array4<f64>) -> Self {
        Assignment::Value(FieldValue::Array(array))
    }
}

/// A loaded model together with its current values and its last run.
#[derive(Debug)]
pub struct Simulation {
    model: Model,
    runs: usize,
    regions: usize,
    rng: StdRng,
    state: Option<RunState>,
}

impl Simulation {
    /// Loads and validates `decl`, completing it from `registry`.
    pub fn load(decl: &ModelDeclaration, registry: Registry) -> Result<Self> {
        let runs = numerical_count(&registry, "nx")?;
        let regions = numerical_count(&registry, "nr")?;
        let model = Loader::new(registry).load(decl)?;
        Ok(Self {
            model,
            runs,
            regions,
            rng: StdRng::from_entropy(),
            state: None,
        })
    }

    /// Reseeds the generator used by distribution assignments.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Assigns a Parameter value or a Dynamic initial condition.
    ///
    /// `nx` and `nr` set the run and region counts, `Tini` the initial time.
    pub fn set_field(&mut self, name: &str, assignment: impl Into<Assignment>) -> Result<()> {
        let value = match assignment.into() {
            Assignment::Value(value) => value,
            Assignment::Distribution { spec, runs } => {
                FieldValue::Runs(spec.sample(name, runs, &mut self.rng)?)
            }
        };
        value.to_array(name)?;

        if self.model.field(name).is_none() {
            return self.set_numerical(name, &value);
        }
        let field = self
            .model
            .field_mut(name)
            .ok_or_else(|| EngineError::unknown(name))?;
        match field.kind {
            FieldKind::Dynamic => field.initial = Some(value),
            FieldKind::Parameter => {
                field.function = None;
                field.value = Some(value);
            }
            FieldKind::Algebraic => {
                return Err(EngineError::malformed(
                    name,
                    "is computed from other fields and cannot be assigned",
                ))
            }
            FieldKind::Size => {
                return Err(EngineError::malformed(name, "sizes are fixed when the model loads"))
            }
        }
        debug!(field = %name, "value assigned");
        Ok(())
    }

    /// Applies every assignment of a named preset.
    pub fn set_preset(&mut self, name: &str) -> Result<()> {
        let preset = self
            .model
            .presets()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::unknown_in(name, "presets"))?;
        for (field, value) in preset.fields {
            self.set_field(&field, value)?;
        }
        info!(preset = %name, com = %preset.com, "preset applied");
        Ok(())
    }

    /// Draws `n` values per field and assigns them along the parallel-run axis.
    pub fn set_ensemble(
        &mut self,
        specs: &IndexMap<String, DistributionSpec>,
        n: usize,
        seed: Option<u64>,
    ) -> Result<()> {
        for name in specs.keys() {
            if self.model.field(name).is_none() {
                return Err(EngineError::unknown_in(name.as_str(), "ensemble"));
            }
        }
        let ensemble = sensitivity::generate_ensemble(specs, n, seed)?;
        for (name, values) in ensemble {
            self.set_field(&name, FieldValue::Runs(values))?;
        }
        info!(fields = specs.len(), runs = n, "ensemble assigned");
        Ok(())
    }

    /// Runs with default step control.
    pub fn run(&mut self, solver: &str, dt: f64, tmax: f64) -> Result<&RunState> {
        self.run_with(solver, dt, tmax, &RunSettings::default())
    }

    /// Integrates from the current values over `[Tini, Tini + tmax]`.
    ///
    /// On divergence the partial history stays available through
    /// [`state`](Self::state) and the divergence is returned as the error.
    pub fn run_with(
        &mut self,
        solver: &str,
        dt: f64,
        tmax: f64,
        settings: &RunSettings,
    ) -> Result<&RunState> {
        let kind: SolverKind = solver.parse()?;
        let steps = tensor::time_steps(tmax, dt)?;

        let lengths: Vec<(&str, usize)> = self
            .model
            .fields()
            .filter_map(|f| {
                let value = match f.kind {
                    FieldKind::Dynamic => f.initial.as_ref(),
                    FieldKind::Parameter => f.value.as_ref(),
                    _ => None,
                }?;
                Some((f.name.as_str(), value.runs()))
            })
            .collect();
        let runs = tensor::run_count(self.runs, lengths)?;
        let axes = AxisSizes {
            steps,
            runs,
            regions: self.regions,
        };

        self.state = None;
        let outcome = integrate::integrate(&self.model, axes, kind, dt, settings)?;
        let state = self.state.insert(outcome.state);
        match outcome.divergence {
            Some(err) => Err(err),
            None => Ok(&*state),
        }
    }

    /// History of a field from the last run.
    pub fn get_field(&self, name: &str) -> Result<&Array5<f64>> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| EngineError::InvalidSettings("the model has not been run".into()))?;
        state.field(name).ok_or_else(|| EngineError::unknown(name))
    }

    /// Mean, spread and extremes of a field across the parallel runs.
    pub fn statistics(&self, name: &str) -> Result<RunStatistics> {
        Ok(sensitivity::run_statistics(self.get_field(name)?))
    }

    pub fn state(&self) -> Option<&RunState> {
        self.state.as_ref()
    }

    pub fn order(&self) -> &ExecutionOrder {
        self.model.order()
    }

    pub fn auxiliary(&self) -> &[String] {
        self.model.auxiliary()
    }

    fn set_numerical(&mut self, name: &str, value: &FieldValue) -> Result<()> {
        let FieldValue::Scalar(v) = value else {
            return Err(EngineError::malformed(name, "numerical settings take a single number"));
        };
        match name {
            "nx" => self.runs = positive_count(name, *v)?,
            "nr" => self.regions = positive_count(name, *v)?,
            "Tini" => {
                if let Some(time) = self.model.field_mut("time") {
                    time.initial = Some(FieldValue::Scalar(*v));
                }
            }
            _ => return Err(EngineError::unknown(name)),
        }
        debug!(setting = %name, value = *v, "numerical setting assigned");
        Ok(())
    }
}

fn numerical_count(registry: &Registry, name: &str) -> Result<usize> {
    match registry.numerical(name) {
        Some(v) => positive_count(name, v),
        None => Ok(1),
    }
}

fn positive_count(name: &str, value: f64) -> Result<usize> {
    if value >= 1.0 && value.fract() == 0.0 {
        Ok(value as usize)
    } else {
        Err(EngineError::InvalidSettings(format!(
            "`{name}` must be a positive integer, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDecl;
    use crate::model::Preset;

    fn exponential() -> ModelDeclaration {
        ModelDeclaration::new("exponential")
            .differential(
                "y",
                FieldDecl::new()
                    .func(&["alpha", "itself"], |i| &i.get("alpha") * &i.get("itself"))
                    .initial(1.0),
            )
            .preset("fast", Preset::new("quick growth").with("alpha", 0.5).with("y", 2.0))
    }

    fn load(decl: &ModelDeclaration) -> Simulation {
        Simulation::load(decl, Registry::builtin()).unwrap().with_seed(1)
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected an error");
        assert!(
            err.to_string().contains(needle),
            "error `{err}` does not contain `{needle}`"
        );
    }

    #[test]
    fn exponential_growth_end_to_end() {
        let mut sim = load(&exponential());
        sim.set_field("alpha", 0.1).unwrap();
        let state = sim.run("eRK4-homemade", 0.01, 1.0).unwrap();
        assert_eq!(state.steps, 101);
        let y = sim.get_field("y").unwrap();
        assert!((y[(100, 0, 0, 0, 0)] - (0.1f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn adaptive_solvers_agree_with_rk4() {
        for solver in ["rk23", "rk45", "rk78"] {
            let mut sim = load(&exponential());
            sim.set_field("alpha", 0.1).unwrap();
            let settings = RunSettings {
                rtol: 1e-11,
                atol: 1e-13,
                ..RunSettings::default()
            };
            sim.run_with(solver, 0.1, 1.0, &settings).unwrap();
            let y = sim.get_field("y").unwrap();
            assert!((y[(10, 0, 0, 0, 0)] - (0.1f64).exp()).abs() < 1e-7, "{solver}");
        }
    }

    #[test]
    fn unknown_solver_fails_before_running() {
        let mut sim = load(&exponential());
        assert_eq!(
            sim.run("euler", 0.1, 1.0).unwrap_err(),
            EngineError::UnknownSolver("euler".to_string())
        );
        assert!(sim.state().is_none());
    }

    #[test]
    fn assignment_rules_follow_field_kind() {
        let decl = exponential()
            .statevar("double", FieldDecl::new().func(&["y"], |i| &i.get("y") * 2.0));
        let mut sim = load(&decl);
        assert_err_contains(sim.set_field("double", 1.0), "cannot be assigned");
        assert_err_contains(sim.set_field("nothing", 1.0), "unknown field `nothing`");
        sim.set_field("y", 3.0).unwrap();
        assert_eq!(
            sim.model().field("y").unwrap().initial,
            Some(FieldValue::Scalar(3.0))
        );
        assert_err_contains(sim.set_field("alpha", Vec::<f64>::new()), "empty per-run");
    }

    #[test]
    fn presets_apply_their_values() {
        let mut sim = load(&exponential());
        sim.set_preset("fast").unwrap();
        sim.run("rk4", 0.01, 1.0).unwrap();
        let y = sim.get_field("y").unwrap();
        assert!((y[(100, 0, 0, 0, 0)] - 2.0 * (0.5f64).exp()).abs() < 1e-6);
        assert!(matches!(
            sim.set_preset("slow"),
            Err(EngineError::UnknownField { .. })
        ));
    }

    #[test]
    fn per_run_values_set_the_run_axis() {
        let mut sim = load(&exponential());
        sim.set_field("alpha", vec![0.0, 0.1, 0.2]).unwrap();
        sim.run("rk4", 0.01, 1.0).unwrap();
        let y = sim.get_field("y").unwrap();
        assert_eq!(y.dim(), (101, 3, 1, 1, 1));
        for (run, alpha) in [0.0f64, 0.1, 0.2].iter().enumerate() {
            assert!((y[(100, run, 0, 0, 0)] - alpha.exp()).abs() < 1e-6);
        }

        sim.set_field("y", vec![1.0, 2.0]).unwrap();
        assert!(matches!(
            sim.run("rk4", 0.01, 1.0),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn ensembles_fill_every_run() {
        let mut sim = load(&exponential());
        let mut specs = IndexMap::new();
        specs.insert("alpha".to_string(), DistributionSpec::normal(0.02, 0.002));
        sim.set_ensemble(&specs, 20, Some(5)).unwrap();
        sim.run("rk4", 0.1, 10.0).unwrap();
        let stats = sim.statistics("y").unwrap();
        assert_eq!(stats.mean.dim(), (101, 1, 1, 1));
        assert!(stats.stdev[(100, 0, 0, 0)] > 0.0);
        assert!((stats.mean[(100, 0, 0, 0)] - (0.2f64).exp()).abs() < 0.05);

        specs.insert("ghost".to_string(), DistributionSpec::normal(1.0, 0.1));
        assert!(matches!(
            sim.set_ensemble(&specs, 20, Some(5)),
            Err(EngineError::UnknownField { .. })
        ));
    }

    #[test]
    fn distribution_assignment_draws_one_value_per_run() {
        let mut sim = load(&exponential());
        sim.set_field(
            "alpha",
            Assignment::Distribution {
                spec: DistributionSpec::uniform(0.1, 0.02),
                runs: 8,
            },
        )
        .unwrap();
        sim.run("rk4", 0.1, 1.0).unwrap();
        assert_eq!(sim.state().unwrap().runs, 8);
    }

    #[test]
    fn divergence_keeps_partial_state() {
        let decl = ModelDeclaration::new("blowup").differential(
            "y",
            FieldDecl::new()
                .func(&["itself"], |i| &i.get("itself") * &i.get("itself"))
                .initial(1.0),
        );
        let mut sim = load(&decl);
        let err = sim.run("rk45", 0.1, 2.0).unwrap_err();
        let EngineError::SolverDivergence { last_valid_index, time, .. } = err else {
            panic!("expected a divergence, got {err:?}");
        };
        assert!(time < 1.0);
        let state = sim.state().expect("partial state is kept");
        assert_eq!(state.last_valid_index, last_valid_index);
        assert!(sim.get_field("y").unwrap()[(last_valid_index, 0, 0, 0, 0)].is_finite());
    }

    #[test]
    fn scalar_parameter_times_sector_vector() {
        let decl = ModelDeclaration::new("sectors")
            .size("Nprod", FieldDecl::new().labels(&["energy", "goods", "services"]))
            .parameter(
                "price",
                FieldDecl::new()
                    .value(FieldValue::Sectors(vec![1.0, 2.0, 3.0]))
                    .size(&["Nprod"]),
            )
            .statevar(
                "cost",
                FieldDecl::new()
                    .func(&["price", "markup"], |i| &i.get("price") * &i.get("markup"))
                    .size(&["Nprod"]),
            )
            .parameter("markup", FieldDecl::new().value(1.5));
        let mut sim = load(&decl);
        sim.run("rk4", 0.5, 1.0).unwrap();
        let cost = sim.get_field("cost").unwrap();
        assert_eq!(cost.dim(), (3, 1, 1, 3, 1));
        let goods = sim.model().sector_index("Nprod", "goods").unwrap();
        assert_eq!(cost[(2, 0, 0, goods, 0)], 3.0);
        assert_eq!(
            sim.state().unwrap().sector_labels["Nprod"],
            vec!["energy", "goods", "services"]
        );
    }

    #[test]
    fn numerical_settings_are_assignable() {
        let mut sim = load(&exponential());
        sim.set_field("nx", 4.0).unwrap();
        sim.set_field("nr", 2.0).unwrap();
        sim.set_field("Tini", 1990.0).unwrap();
        sim.run("rk4", 1.0, 10.0).unwrap();
        let state = sim.state().unwrap();
        assert_eq!((state.runs, state.regions), (4, 2));
        assert_eq!(state.time().unwrap()[0], 1990.0);
        assert_err_contains(sim.set_field("nx", 0.5), "positive integer");
    }

    #[test]
    fn get_field_needs_a_run() {
        let sim = load(&exponential());
        assert_err_contains(sim.get_field("y"), "has not been run");
        assert_eq!(sim.order().len(), 0);
        assert!(sim.auxiliary().iter().any(|n| n == "time"));
    }

    #[test]
    fn full_array_values_are_accepted() {
        let mut sim = load(&exponential());
        sim.set_field("alpha", Array4::from_elem((2, 1, 1, 1), 0.1)).unwrap();
        sim.run("rk4", 0.1, 1.0).unwrap();
        assert_eq!(sim.state().unwrap().runs, 2);
    }
}
