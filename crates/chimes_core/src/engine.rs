//! The right-hand side of a loaded model.
//!
//! [`EquationSystem`] flattens every Dynamic field into one state vector and
//! evaluates the Algebraic fields in execution order before computing the
//! derivatives. All field values live in scratch buffers allocated once.

use crate::error::{EngineError, Result};
use crate::field::{FieldKind, Function, Inputs, SELF_REF};
use crate::model::Model;
use crate::tensor::{self, AxisSizes, FieldShape};
use crate::traits::DynamicalSystem;
use ndarray::{Array4, ArrayViewMut4};
use std::cell::RefCell;
use tracing::debug;

/// One field as the evaluator sees it.
#[derive(Debug)]
struct Slot {
    name: String,
    kind: FieldKind,
    shape: FieldShape,
    function: Option<Function>,
    /// Scratch index of every declared input, `itself` included.
    inputs: Vec<usize>,
}

/// Position of a Dynamic field inside the flat state.
#[derive(Debug, Clone, Copy)]
struct StateRange {
    slot: usize,
    offset: usize,
    len: usize,
}

#[derive(Debug)]
struct Scratch {
    values: Vec<Array4<f64>>,
    fresh: Vec<bool>,
}

/// A loaded model bound to concrete axis sizes and parameter values.
#[derive(Debug)]
pub struct EquationSystem {
    slots: Vec<Slot>,
    dynamics: Vec<StateRange>,
    /// Slot indices of the Algebraic fields, in execution order.
    algebraic: Vec<usize>,
    dimension: usize,
    // Interior mutability so `apply` can take `&self` without allocating.
    scratch: RefCell<Scratch>,
}

impl EquationSystem {
    /// Binds `model` to `axes`, materializing every parameter, size and
    /// initial value. Computed parameters are evaluated here, once.
    pub fn new(model: &Model, axes: &AxisSizes) -> Result<Self> {
        let index: std::collections::HashMap<&str, usize> = model
            .fields()
            .enumerate()
            .map(|(i, f)| (f.name.as_str(), i))
            .collect();

        let mut slots = Vec::with_capacity(model.len());
        let mut values = Vec::with_capacity(model.len());
        let mut dynamics = Vec::new();
        let mut offset = 0;

        for (i, field) in model.fields().enumerate() {
            let shape = FieldShape::of(model, field, axes)?;
            let mut inputs = Vec::with_capacity(field.inputs().len());
            for input in field.inputs() {
                let slot = if input == SELF_REF {
                    i
                } else {
                    *index
                        .get(input.as_str())
                        .ok_or_else(|| EngineError::unknown_in(input.as_str(), field.name.as_str()))?
                };
                inputs.push(slot);
            }

            let value = match (field.kind, &field.value, &field.sectors) {
                (FieldKind::Parameter, Some(value), _) => {
                    tensor::value_array(&field.name, value, &shape)?
                }
                (FieldKind::Size, _, Some(spec)) => tensor::size_array(spec, &shape),
                _ => Array4::from_elem(shape.dim(), f64::NAN),
            };

            if field.kind == FieldKind::Dynamic {
                dynamics.push(StateRange {
                    slot: i,
                    offset,
                    len: shape.len(),
                });
                offset += shape.len();
            }

            slots.push(Slot {
                name: field.name.clone(),
                kind: field.kind,
                shape,
                function: field.function.clone(),
                inputs,
            });
            values.push(value);
        }

        let algebraic = model
            .order()
            .iter()
            .map(|name| index[name])
            .collect();
        let fresh = slots
            .iter()
            .map(|s| !matches!(s.kind, FieldKind::Algebraic))
            .collect();

        let system = Self {
            slots,
            dynamics,
            algebraic,
            dimension: offset,
            scratch: RefCell::new(Scratch { values, fresh }),
        };

        for name in model.parameter_order().iter() {
            let slot = index[name];
            if system.slots[slot].function.is_some() {
                system.compute(slot)?;
            }
        }

        debug!(
            fields = system.slots.len(),
            state = system.dimension,
            runs = axes.runs,
            regions = axes.regions,
            "equation system bound"
        );
        Ok(system)
    }

    /// Flat initial state assembled from every Dynamic field's initial value.
    pub fn initial_state(&self, model: &Model) -> Result<Vec<f64>> {
        let mut state = vec![0.0; self.dimension];
        for range in &self.dynamics {
            let slot = &self.slots[range.slot];
            let initial = model
                .field(&slot.name)
                .and_then(|f| f.initial.as_ref())
                .ok_or_else(|| EngineError::malformed(&slot.name, "no initial value"))?;
            let array = tensor::value_array(&slot.name, initial, &slot.shape)?;
            for (dst, src) in state[range.offset..range.offset + range.len]
                .iter_mut()
                .zip(array.iter())
            {
                *dst = *src;
            }
        }
        Ok(state)
    }

    /// Loads `x` into the Dynamic buffers and recomputes every Algebraic field.
    pub fn evaluate(&self, x: &[f64]) -> Result<()> {
        {
            let mut scratch = self.scratch.borrow_mut();
            let Scratch { values, fresh } = &mut *scratch;
            for range in &self.dynamics {
                let buffer = &mut values[range.slot];
                for (dst, src) in buffer
                    .iter_mut()
                    .zip(&x[range.offset..range.offset + range.len])
                {
                    *dst = *src;
                }
            }
            for &slot in &self.algebraic {
                values[slot].fill(f64::NAN);
                fresh[slot] = false;
            }
        }
        for &slot in &self.algebraic {
            self.compute(slot)?;
        }
        Ok(())
    }

    /// Current value of a field, as left by the last evaluation.
    pub fn value(&self, name: &str) -> Option<Array4<f64>> {
        let slot = self.slots.iter().position(|s| s.name == name)?;
        Some(self.scratch.borrow().values[slot].clone())
    }

    /// Runs `f` over the current value of every field, in model order.
    pub fn for_each_value(&self, mut f: impl FnMut(&str, FieldKind, &Array4<f64>)) {
        let scratch = self.scratch.borrow();
        for (slot, value) in self.slots.iter().zip(&scratch.values) {
            f(&slot.name, slot.kind, value);
        }
    }

    pub fn shape(&self, name: &str) -> Option<FieldShape> {
        self.slots.iter().find(|s| s.name == name).map(|s| s.shape)
    }

    /// Flat-state range of a Dynamic field.
    pub fn state_range(&self, name: &str) -> Option<std::ops::Range<usize>> {
        self.dynamics
            .iter()
            .find(|r| self.slots[r.slot].name == name)
            .map(|r| r.offset..r.offset + r.len)
    }

    /// Evaluates the function of `slot` and stores the result in its buffer.
    fn compute(&self, slot: usize) -> Result<()> {
        let output = self.call(slot)?;
        let mut scratch = self.scratch.borrow_mut();
        let field = &self.slots[slot];
        tensor::assign_broadcast(&field.name, scratch.values[slot].view_mut(), output.view())?;
        scratch.fresh[slot] = true;
        Ok(())
    }

    fn call(&self, slot: usize) -> Result<Array4<f64>> {
        let field = &self.slots[slot];
        let Some(function) = &field.function else {
            return Err(EngineError::malformed(&field.name, "has no function"));
        };
        let scratch = self.scratch.borrow();
        for &input in &field.inputs {
            if input != slot && !scratch.fresh[input] {
                return Err(EngineError::StaleInput {
                    field: field.name.clone(),
                    input: self.slots[input].name.clone(),
                });
            }
        }
        let inputs = Inputs::new(function.inputs(), &field.inputs, &scratch.values);
        Ok(function.call(&inputs))
    }
}

impl DynamicalSystem<f64> for EquationSystem {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) -> Result<()> {
        self.evaluate(x)?;
        for range in &self.dynamics {
            let field = &self.slots[range.slot];
            let derivative = self.call(range.slot)?;
            let target = ArrayViewMut4::from_shape(
                field.shape.dim(),
                &mut out[range.offset..range.offset + range.len],
            )
            .map_err(|e| EngineError::malformed(&field.name, e.to_string()))?;
            tensor::assign_broadcast(&field.name, target, derivative.view())?;
        }
        Ok(())
    }
}
