//! Field declarations, resolved fields and the input context handed to field functions.
//!
//! A field function never sees the whole model: it receives an [`Inputs`]
//! context bound to exactly the names it declared at registration.

use crate::error::{EngineError, Result};
use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Input name through which a Dynamic field reads its own current value.
pub const SELF_REF: &str = "itself";

/// Name of the implicit size-1 sector axis.
pub const SCALAR_SIZE: &str = "__ONE__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// Integrated through its own derivative.
    Dynamic,
    /// Recomputed from other fields at every evaluation.
    Algebraic,
    /// Fixed for the run, possibly computed once from other parameters.
    Parameter,
    /// Length of a sector axis.
    Size,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FieldKind::Dynamic => "differential",
            FieldKind::Algebraic => "statevar",
            FieldKind::Parameter => "parameter",
            FieldKind::Size => "size",
        };
        f.write_str(label)
    }
}

/// Signature of every field function. Arrays are laid out as (run, region, sectorA, sectorB).
pub type FieldFn = Arc<dyn Fn(&Inputs<'_>) -> Array4<f64> + Send + Sync>;

/// A field function together with its frozen list of declared inputs.
#[derive(Clone)]
pub struct Function {
    inputs: Vec<String>,
    eval: FieldFn,
}

impl Function {
    pub fn new<F>(inputs: &[&str], eval: F) -> Self
    where
        F: Fn(&Inputs<'_>) -> Array4<f64> + Send + Sync + 'static,
    {
        Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            eval: Arc::new(eval),
        }
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn reads_itself(&self) -> bool {
        self.inputs.iter().any(|name| name == SELF_REF)
    }

    pub fn call(&self, inputs: &Inputs<'_>) -> Array4<f64> {
        (self.eval)(inputs)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

/// Read-only view over the current values of one function's declared inputs.
pub struct Inputs<'a> {
    names: &'a [String],
    slots: &'a [usize],
    values: &'a [Array4<f64>],
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(names: &'a [String], slots: &'a [usize], values: &'a [Array4<f64>]) -> Self {
        debug_assert_eq!(names.len(), slots.len());
        Self {
            names,
            slots,
            values,
        }
    }

    /// Current value of a declared input.
    ///
    /// # Panics
    /// If `name` is not part of the function's declared inputs. Declared
    /// inputs are checked at load time, so this only fires on a function body
    /// reading something it never declared.
    pub fn get(&self, name: &str) -> ArrayView4<'a, f64> {
        match self.try_get(name) {
            Some(view) => view,
            None => panic!(
                "input `{}` was not declared (declared: {:?})",
                name, self.names
            ),
        }
    }

    pub fn try_get(&self, name: &str) -> Option<ArrayView4<'a, f64>> {
        let values = self.values;
        self.names
            .iter()
            .position(|n| n == name)
            .map(|pos| values[self.slots[pos]].view())
    }

    /// First element of a declared input, for inputs known to be scalar.
    pub fn scalar(&self, name: &str) -> f64 {
        self.get(name).iter().next().copied().unwrap_or(f64::NAN)
    }

    pub fn names(&self) -> &[String] {
        self.names
    }
}

/// A value assigned to a Parameter or used as a Dynamic initial condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Scalar(f64),
    /// One value per parallel run.
    Runs(Vec<f64>),
    /// A vector along sectorA.
    Sectors(Vec<f64>),
    /// A (sectorA, sectorB) matrix, row-major.
    Matrix(Vec<Vec<f64>>),
    /// A full (run, region, sectorA, sectorB) array.
    Array(Array4<f64>),
}

impl FieldValue {
    /// Materializes the value with unit length on every axis it does not span.
    pub fn to_array(&self, field: &str) -> Result<Array4<f64>> {
        let array = match self {
            FieldValue::Scalar(v) => Array4::from_elem((1, 1, 1, 1), *v),
            FieldValue::Runs(values) => {
                if values.is_empty() {
                    return Err(EngineError::malformed(field, "empty per-run value list"));
                }
                Array4::from_shape_fn((values.len(), 1, 1, 1), |(x, _, _, _)| values[x])
            }
            FieldValue::Sectors(values) => {
                if values.is_empty() {
                    return Err(EngineError::malformed(field, "empty sector vector"));
                }
                Array4::from_shape_fn((1, 1, values.len(), 1), |(_, _, i, _)| values[i])
            }
            FieldValue::Matrix(rows) => {
                let cols = rows.first().map(|r| r.len()).unwrap_or(0);
                if rows.is_empty() || cols == 0 {
                    return Err(EngineError::malformed(field, "empty sector matrix"));
                }
                if rows.iter().any(|r| r.len() != cols) {
                    return Err(EngineError::malformed(field, "ragged sector matrix"));
                }
                Array4::from_shape_fn((1, 1, rows.len(), cols), |(_, _, i, j)| rows[i][j])
            }
            FieldValue::Array(array) => array.clone(),
        };
        Ok(array)
    }

    /// Length along the parallel-run axis.
    pub fn runs(&self) -> usize {
        match self {
            FieldValue::Runs(values) => values.len(),
            FieldValue::Array(array) => array.dim().0,
            _ => 1,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Scalar(value)
    }
}

impl From<Vec<f64>> for FieldValue {
    fn from(values: Vec<f64>) -> Self {
        FieldValue::Runs(values)
    }
}

impl From<Array4<f64>> for FieldValue {
    fn from(array: Array4<f64>) -> Self {
        FieldValue::Array(array)
    }
}

/// Informational metadata. Never enforced at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default)]
    pub com: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub group: String,
}

/// Length of a sector axis, either counted or labelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeSpec {
    Count(usize),
    Labels(Vec<String>),
}

impl SizeSpec {
    pub fn len(&self) -> usize {
        match self {
            SizeSpec::Count(n) => *n,
            SizeSpec::Labels(labels) => labels.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels, generated as "0", "1", ... for counted sizes.
    pub fn labels(&self) -> Vec<String> {
        match self {
            SizeSpec::Count(n) => (0..*n).map(|i| i.to_string()).collect(),
            SizeSpec::Labels(labels) => labels.clone(),
        }
    }
}

/// One raw attribute of a field declaration.
#[derive(Debug, Clone)]
pub enum Attr {
    Func(Function),
    Value(FieldValue),
    Text(String),
    Names(Vec<String>),
}

impl Attr {
    fn type_name(&self) -> &'static str {
        match self {
            Attr::Func(_) => "function",
            Attr::Value(_) => "value",
            Attr::Text(_) => "text",
            Attr::Names(_) => "name list",
        }
    }
}

/// Keys the loader understands.
pub const KNOWN_KEYS: &[&str] = &[
    "func",
    "value",
    "initial",
    "units",
    "com",
    "definition",
    "symbol",
    "group",
    "size",
    "labels",
];

/// Raw declaration of one field: an ordered list of keyed attributes.
///
/// Keys are validated by the loader, not here, so a declaration can carry
/// anything a model file wrote down.
#[derive(Debug, Clone, Default)]
pub struct FieldDecl {
    attrs: Vec<(String, Attr)>,
}

impl FieldDecl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn func<F>(self, inputs: &[&str], eval: F) -> Self
    where
        F: Fn(&Inputs<'_>) -> Array4<f64> + Send + Sync + 'static,
    {
        self.attr("func", Attr::Func(Function::new(inputs, eval)))
    }

    pub fn value(self, value: impl Into<FieldValue>) -> Self {
        self.attr("value", Attr::Value(value.into()))
    }

    pub fn initial(self, value: impl Into<FieldValue>) -> Self {
        self.attr("initial", Attr::Value(value.into()))
    }

    /// Sector count of a size declaration.
    pub fn count(self, n: usize) -> Self {
        self.attr("value", Attr::Value(FieldValue::Scalar(n as f64)))
    }

    /// Ordered sector labels of a size declaration.
    pub fn labels(self, labels: &[&str]) -> Self {
        self.attr(
            "labels",
            Attr::Names(labels.iter().map(|s| s.to_string()).collect()),
        )
    }

    /// Names of the size declarations spanned by sectorA and sectorB.
    pub fn size(self, axes: &[&str]) -> Self {
        self.attr(
            "size",
            Attr::Names(axes.iter().map(|s| s.to_string()).collect()),
        )
    }

    pub fn units(self, units: &str) -> Self {
        self.attr("units", Attr::Text(units.to_string()))
    }

    pub fn com(self, com: &str) -> Self {
        self.attr("com", Attr::Text(com.to_string()))
    }

    pub fn definition(self, definition: &str) -> Self {
        self.attr("definition", Attr::Text(definition.to_string()))
    }

    pub fn symbol(self, symbol: &str) -> Self {
        self.attr("symbol", Attr::Text(symbol.to_string()))
    }

    pub fn group(self, group: &str) -> Self {
        self.attr("group", Attr::Text(group.to_string()))
    }

    pub fn attr(mut self, key: &str, attr: Attr) -> Self {
        self.attrs.push((key.to_string(), attr));
        self
    }

    pub fn attrs(&self) -> &[(String, Attr)] {
        &self.attrs
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Attr> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, a)| a)
    }

    pub(crate) fn function(&self) -> Option<&Function> {
        match self.get("func") {
            Some(Attr::Func(f)) => Some(f),
            _ => None,
        }
    }

    /// Checks keys and attribute types; returns the first problem found.
    pub(crate) fn check_keys(&self, name: &str) -> Result<()> {
        for (index, (key, attr)) in self.attrs.iter().enumerate() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                return Err(EngineError::malformed(
                    name,
                    format!("unrecognized key `{key}`"),
                ));
            }
            if self.attrs[..index].iter().any(|(k, _)| k == key) {
                return Err(EngineError::malformed(
                    name,
                    format!("key `{key}` declared twice"),
                ));
            }
            let ok = match key.as_str() {
                "func" => matches!(attr, Attr::Func(_)),
                "value" => matches!(attr, Attr::Value(_) | Attr::Names(_)),
                "initial" => matches!(attr, Attr::Value(_)),
                "size" | "labels" => matches!(attr, Attr::Names(_)),
                _ => matches!(attr, Attr::Text(_)),
            };
            if !ok {
                return Err(EngineError::malformed(
                    name,
                    format!("key `{key}` cannot hold a {}", attr.type_name()),
                ));
            }
        }
        Ok(())
    }
}

/// A field after registry defaults were merged and its kind was fixed.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub function: Option<Function>,
    /// Parameter value (None for computed parameters until the run computes it).
    pub value: Option<FieldValue>,
    /// Initial condition of a Dynamic field.
    pub initial: Option<FieldValue>,
    /// Size declarations spanned by sectorA and sectorB.
    pub size: [String; 2],
    /// Sector count or labels of a Size field.
    pub sectors: Option<SizeSpec>,
    pub meta: Metadata,
}

impl Field {
    pub fn inputs(&self) -> &[String] {
        self.function.as_ref().map(|f| f.inputs()).unwrap_or(&[])
    }

    pub fn is_computed(&self) -> bool {
        self.function.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn inputs_bind_declared_names_to_slots() {
        let values = vec![
            Array4::from_elem((1, 1, 1, 1), 2.0),
            Array4::from_elem((1, 1, 1, 1), 5.0),
        ];
        let names = vec!["b".to_string(), "a".to_string()];
        let slots = vec![1, 0];
        let inputs = Inputs::new(&names, &slots, &values);
        assert_eq!(inputs.scalar("a"), 2.0);
        assert_eq!(inputs.scalar("b"), 5.0);
        assert!(inputs.try_get("c").is_none());
    }

    #[test]
    #[should_panic(expected = "was not declared")]
    fn inputs_panic_on_undeclared_read() {
        let values: Vec<Array4<f64>> = Vec::new();
        let inputs = Inputs::new(&[], &[], &values);
        inputs.get("K");
    }

    #[test]
    fn field_value_shapes_follow_their_axis() {
        let runs = FieldValue::Runs(vec![1.0, 2.0, 3.0]).to_array("x").unwrap();
        assert_eq!(runs.dim(), (3, 1, 1, 1));
        let sectors = FieldValue::Sectors(vec![1.0, 2.0]).to_array("x").unwrap();
        assert_eq!(sectors.dim(), (1, 1, 2, 1));
        let matrix = FieldValue::Matrix(vec![vec![1.0, 2.0], vec![3.0, 4.0]])
            .to_array("x")
            .unwrap();
        assert_eq!(matrix.dim(), (1, 1, 2, 2));
        assert_eq!(matrix[(0, 0, 1, 0)], 3.0);
    }

    #[test]
    fn ragged_matrix_is_malformed() {
        let err = FieldValue::Matrix(vec![vec![1.0, 2.0], vec![3.0]])
            .to_array("A")
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedField { .. }));
    }

    #[test]
    fn check_keys_rejects_unknown_and_mistyped_keys() {
        let decl = FieldDecl::new().value(1.0).attr("colour", Attr::Text("red".into()));
        let err = decl.check_keys("alpha").unwrap_err();
        assert!(err.to_string().contains("unrecognized key `colour`"));

        let decl = FieldDecl::new().attr("units", Attr::Value(FieldValue::Scalar(1.0)));
        let err = decl.check_keys("alpha").unwrap_err();
        assert!(err.to_string().contains("cannot hold a value"));
    }

    #[test]
    fn size_spec_generates_labels_for_counts() {
        assert_eq!(SizeSpec::Count(2).labels(), vec!["0", "1"]);
        let labels = SizeSpec::Labels(vec!["energy".into(), "goods".into()]);
        assert_eq!(labels.len(), 2);
    }
}
