//! Array shapes and allocation.
//!
//! Every field value is an `Array4<f64>` over (run, region, sectorA, sectorB).
//! Histories prepend a time axis and become `Array5<f64>`.

use crate::error::{EngineError, Result};
use crate::field::{Field, FieldKind, FieldValue, SizeSpec, SCALAR_SIZE};
use crate::model::Model;
use ndarray::{Array4, Array5, ArrayView4, ArrayViewMut4};
use serde::{Deserialize, Serialize};

/// Axis lengths shared by every field of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSizes {
    /// Number of stored time points.
    pub steps: usize,
    pub runs: usize,
    pub regions: usize,
}

/// Shape of one field's value at a single time point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldShape {
    pub runs: usize,
    pub regions: usize,
    pub sector_a: usize,
    pub sector_b: usize,
}

impl FieldShape {
    pub fn of(model: &Model, field: &Field, axes: &AxisSizes) -> Result<Self> {
        let (sector_a, sector_b) = match field.kind {
            FieldKind::Size => (1, 1),
            _ => (
                sector_len(model, &field.size[0])?,
                sector_len(model, &field.size[1])?,
            ),
        };
        Ok(Self {
            runs: axes.runs,
            regions: axes.regions,
            sector_a,
            sector_b,
        })
    }

    pub fn dim(&self) -> (usize, usize, usize, usize) {
        (self.runs, self.regions, self.sector_a, self.sector_b)
    }

    pub fn len(&self) -> usize {
        self.runs * self.regions * self.sector_a * self.sector_b
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<usize> {
        vec![self.runs, self.regions, self.sector_a, self.sector_b]
    }
}

/// Upper bound on the stored time points of a single run.
pub const MAX_TIME_STEPS: usize = 50_000_000;

/// Number of stored time points: `round(tmax / dt) + 1`.
pub fn time_steps(tmax: f64, dt: f64) -> Result<usize> {
    if !(dt.is_finite() && dt > 0.0) {
        return Err(EngineError::InvalidSettings(format!(
            "dt must be positive and finite, got {dt}"
        )));
    }
    if !(tmax.is_finite() && tmax >= 0.0) {
        return Err(EngineError::InvalidSettings(format!(
            "Tmax must be non-negative and finite, got {tmax}"
        )));
    }
    let intervals = (tmax / dt).round();
    if !intervals.is_finite() || intervals >= MAX_TIME_STEPS as f64 {
        return Err(EngineError::InvalidSettings(format!(
            "Tmax = {tmax} with dt = {dt} needs more than {MAX_TIME_STEPS} time steps"
        )));
    }
    Ok(intervals as usize + 1)
}

/// Length of the sector axis declared by the size field `size`.
pub fn sector_len(model: &Model, size: &str) -> Result<usize> {
    if size == SCALAR_SIZE {
        return Ok(1);
    }
    let field = model
        .field(size)
        .ok_or_else(|| EngineError::unknown(size))?;
    match &field.sectors {
        Some(spec) => Ok(spec.len()),
        None => Err(EngineError::malformed(size, "is not a size declaration")),
    }
}

/// Parallel-run count: `nx`, unless a per-run assignment is longer.
///
/// Every per-run assignment must have length 1 or the resulting count.
pub fn run_count<'a>(
    nx: usize,
    lengths: impl IntoIterator<Item = (&'a str, usize)>,
) -> Result<usize> {
    let lengths: Vec<(&str, usize)> = lengths.into_iter().collect();
    let longest = lengths.iter().map(|&(_, n)| n).max().unwrap_or(1);
    let runs = if longest > 1 { longest } else { nx.max(1) };
    for (name, n) in lengths {
        if n != 1 && n != runs {
            return Err(EngineError::ShapeMismatch {
                field: name.to_string(),
                expected: vec![runs],
                found: vec![n],
            });
        }
    }
    if nx > 1 && nx != runs {
        return Err(EngineError::ShapeMismatch {
            field: "nx".to_string(),
            expected: vec![runs],
            found: vec![nx],
        });
    }
    Ok(runs)
}

/// Broadcasts `source` to `shape`; axes of length 1 expand.
pub fn broadcast_to(field: &str, source: ArrayView4<'_, f64>, shape: &FieldShape) -> Result<Array4<f64>> {
    match source.broadcast(shape.dim()) {
        Some(view) => Ok(view.to_owned()),
        None => Err(mismatch(field, source.shape(), shape)),
    }
}

/// Writes `source` into `target`, broadcasting along unit axes.
pub fn assign_broadcast(
    field: &str,
    mut target: ArrayViewMut4<'_, f64>,
    source: ArrayView4<'_, f64>,
) -> Result<()> {
    let dim = target.dim();
    match source.broadcast(dim) {
        Some(view) => {
            target.assign(&view);
            Ok(())
        }
        None => Err(EngineError::ShapeMismatch {
            field: field.to_string(),
            expected: vec![dim.0, dim.1, dim.2, dim.3],
            found: source.shape().to_vec(),
        }),
    }
}

/// Materializes a user-supplied value in the field's shape.
pub fn value_array(field: &str, value: &FieldValue, shape: &FieldShape) -> Result<Array4<f64>> {
    let raw = value.to_array(field)?;
    broadcast_to(field, raw.view(), shape)
}

/// Value of a size field: its sector count, repeated over runs and regions.
pub fn size_array(spec: &SizeSpec, shape: &FieldShape) -> Array4<f64> {
    Array4::from_elem(shape.dim(), spec.len() as f64)
}

/// NaN-filled history of `steps` time points.
pub fn history(shape: &FieldShape, steps: usize) -> Array5<f64> {
    Array5::from_elem(
        (steps, shape.runs, shape.regions, shape.sector_a, shape.sector_b),
        f64::NAN,
    )
}

fn mismatch(field: &str, found: &[usize], shape: &FieldShape) -> EngineError {
    EngineError::ShapeMismatch {
        field: field.to_string(),
        expected: shape.to_vec(),
        found: found.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDecl;
    use crate::loader::Loader;
    use crate::model::ModelDeclaration;
    use crate::registry::Registry;
    use ndarray::Axis;

    fn shape(runs: usize, regions: usize, a: usize, b: usize) -> FieldShape {
        FieldShape {
            runs,
            regions,
            sector_a: a,
            sector_b: b,
        }
    }

    #[test]
    fn time_axis_length_counts_both_ends() {
        assert_eq!(time_steps(1.0, 0.01).unwrap(), 101);
        assert_eq!(time_steps(100.0, 0.1).unwrap(), 1001);
        assert_eq!(time_steps(0.0, 0.1).unwrap(), 1);
        assert!(matches!(
            time_steps(1.0, 0.0),
            Err(EngineError::InvalidSettings(_))
        ));
        assert!(time_steps(f64::NAN, 0.1).is_err());
    }

    #[test]
    fn time_step_count_is_bounded() {
        for (tmax, dt) in [(1e10, 1e-300), (1e12, 1.0), (f64::MAX, f64::MIN_POSITIVE)] {
            match time_steps(tmax, dt) {
                Err(EngineError::InvalidSettings(msg)) => assert!(msg.contains("time steps"), "{msg}"),
                other => panic!("expected a rejected step count, got {other:?}"),
            }
        }
        assert_eq!(time_steps((MAX_TIME_STEPS - 1) as f64, 1.0).unwrap(), MAX_TIME_STEPS);
    }

    #[test]
    fn scalar_broadcasts_over_sectors() {
        let target = shape(2, 1, 3, 1);
        let value = value_array("p", &FieldValue::Scalar(4.0), &target).unwrap();
        assert_eq!(value.dim(), (2, 1, 3, 1));
        assert!(value.iter().all(|&v| v == 4.0));
    }

    #[test]
    fn sector_vector_times_scalar_keeps_sector_axis() {
        let sectors = value_array("p", &FieldValue::Sectors(vec![1.0, 2.0, 3.0]), &shape(1, 1, 3, 1))
            .unwrap();
        let scalar = Array4::from_elem((1, 1, 1, 1), 2.0);
        let product = &sectors * &scalar;
        assert_eq!(product.dim(), (1, 1, 3, 1));
        assert_eq!(
            product.index_axis(Axis(0), 0).iter().copied().collect::<Vec<_>>(),
            vec![2.0, 4.0, 6.0]
        );
    }

    #[test]
    fn incompatible_shapes_are_reported() {
        let err = value_array("p", &FieldValue::Sectors(vec![1.0, 2.0]), &shape(1, 1, 3, 1))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::ShapeMismatch {
                field: "p".to_string(),
                expected: vec![1, 1, 3, 1],
                found: vec![1, 1, 2, 1],
            }
        );
    }

    #[test]
    fn run_count_takes_the_longest_list() {
        assert_eq!(run_count(1, [("a", 1), ("b", 4)]).unwrap(), 4);
        assert_eq!(run_count(3, [("a", 1)]).unwrap(), 3);
        assert_eq!(run_count(4, [("a", 4)]).unwrap(), 4);
        assert!(matches!(
            run_count(1, [("a", 2), ("b", 3)]),
            Err(EngineError::ShapeMismatch { ref field, .. }) if field == "a"
        ));
        assert!(run_count(3, [("a", 2)]).is_err());
    }

    #[test]
    fn field_shape_follows_declared_sizes() {
        let decl = ModelDeclaration::new("sectors")
            .size("Nprod", FieldDecl::new().labels(&["energy", "goods"]))
            .size("Ninput", FieldDecl::new().count(3))
            .parameter("a", FieldDecl::new().value(1.0).size(&["Nprod", "Ninput"]))
            .parameter("b", FieldDecl::new().value(1.0).size(&["Ninput"]))
            .parameter("c", FieldDecl::new().value(1.0));
        let model = Loader::new(Registry::builtin()).load(&decl).unwrap();
        let axes = AxisSizes {
            steps: 11,
            runs: 2,
            regions: 1,
        };
        let of = |name: &str| FieldShape::of(&model, model.field(name).unwrap(), &axes).unwrap();
        assert_eq!(of("a").dim(), (2, 1, 2, 3));
        assert_eq!(of("b").dim(), (2, 1, 3, 1));
        assert_eq!(of("c").dim(), (2, 1, 1, 1));
        assert_eq!(of("Nprod").dim(), (2, 1, 1, 1));

        let hist = history(&of("a"), axes.steps);
        assert_eq!(hist.dim(), (11, 2, 1, 2, 3));
        assert!(hist.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn assign_broadcast_fills_a_view() {
        let mut target = Array4::zeros((2, 1, 2, 1));
        let source = Array4::from_shape_vec((1, 1, 2, 1), vec![5.0, 6.0]).unwrap();
        assign_broadcast("x", target.view_mut(), source.view()).unwrap();
        assert_eq!(target[(1, 0, 1, 0)], 6.0);

        let wrong = Array4::zeros((1, 1, 3, 1));
        assert!(assign_broadcast("x", target.view_mut(), wrong.view()).is_err());
    }
}
