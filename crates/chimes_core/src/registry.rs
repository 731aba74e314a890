//! Canonical defaults for known field names.
//!
//! Anything a model leaves out (units, a default value, a comment) is taken
//! from here. A `Registry` is an ordinary value: build one, extend it, and
//! hand it to a [`Loader`](crate::loader::Loader).

use crate::field::Metadata;
use anyhow::{bail, Context};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Group name of the fields that configure the run itself.
pub const NUMERICAL_GROUP: &str = "Numerical";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldDefaults {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub initial: Option<f64>,
    #[serde(flatten)]
    pub meta: Metadata,
}

impl FieldDefaults {
    fn numerical(value: f64, units: &str, definition: &str) -> Self {
        Self {
            value: Some(value),
            initial: None,
            meta: Metadata {
                units: units.to_string(),
                definition: definition.to_string(),
                group: NUMERICAL_GROUP.to_string(),
                ..Metadata::default()
            },
        }
    }

    fn parameter(value: f64, units: &str, definition: &str, group: &str) -> Self {
        Self {
            value: Some(value),
            initial: None,
            meta: Metadata {
                units: units.to_string(),
                definition: definition.to_string(),
                group: group.to_string(),
                ..Metadata::default()
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    fields: IndexMap<String, FieldDefaults>,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Numerical settings plus a handful of common macro-economic parameters.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();

        registry.insert("Tini", FieldDefaults::numerical(0.0, "y", "Initial time"));
        registry.insert("Tmax", FieldDefaults::numerical(100.0, "y", "Total simulated time"));
        registry.insert("dt", FieldDefaults::numerical(0.01, "y", "Time between two steps"));
        registry.insert("nx", FieldDefaults::numerical(1.0, "", "Number of parallel runs"));
        registry.insert("nr", FieldDefaults::numerical(1.0, "", "Number of regions"));
        registry.insert(
            "time",
            FieldDefaults {
                value: None,
                initial: Some(0.0),
                meta: Metadata {
                    units: "y".to_string(),
                    definition: "Time vector".to_string(),
                    com: "dtime/dt = 1".to_string(),
                    group: NUMERICAL_GROUP.to_string(),
                    ..Metadata::default()
                },
            },
        );

        registry.insert(
            "alpha",
            FieldDefaults::parameter(0.02, "y^{-1}", "Rate of productivity increase", "Productivity"),
        );
        registry.insert(
            "n",
            FieldDefaults::parameter(0.025, "y^{-1}", "Rate of population growth", "Population"),
        );
        registry.insert(
            "delta",
            FieldDefaults::parameter(0.005, "y^{-1}", "Rate of capital depletion", "Capital"),
        );
        registry.insert(
            "nu",
            FieldDefaults::parameter(3.0, "", "Capital to output ratio", "Capital"),
        );
        registry.insert(
            "phinull",
            FieldDefaults::parameter(
                0.04,
                "",
                "Unemployment rate with no salary increase",
                "Salary Negociation",
            ),
        );
        registry.insert(
            "r",
            FieldDefaults::parameter(0.03, "y^{-1}", "Interest on debt", "Banks"),
        );
        registry.insert(
            "k0",
            FieldDefaults::parameter(-0.0065, "", "Percent of GDP invested when profit is zero", "Investment"),
        );
        registry.insert(
            "k1",
            FieldDefaults::parameter((-5.0f64).exp(), "", "Investment slope", "Investment"),
        );
        registry.insert(
            "k2",
            FieldDefaults::parameter(20.0, "", "Investment power in kappa", "Investment"),
        );

        registry
    }

    pub fn insert(&mut self, name: &str, defaults: FieldDefaults) -> Option<FieldDefaults> {
        self.fields.insert(name.to_string(), defaults)
    }

    pub fn get(&self, name: &str) -> Option<&FieldDefaults> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }

    /// Default value of a numerical setting (`Tini`, `nx`, `nr`, ...).
    pub fn numerical(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(|d| d.value)
    }

    /// Merges a JSON object of `name -> defaults` into the registry.
    /// Existing entries are replaced. Returns the number of entries read.
    pub fn extend_from_json(&mut self, json: &str) -> anyhow::Result<usize> {
        let parsed: IndexMap<String, FieldDefaults> =
            serde_json::from_str(json).context("Failed to parse field registry JSON.")?;
        for (name, defaults) in &parsed {
            if name.is_empty() {
                bail!("Field registry JSON contains an empty field name.");
            }
            if defaults.value.is_some() && defaults.initial.is_some() {
                bail!("Registry entry `{name}` declares both `value` and `initial`.");
            }
        }
        let count = parsed.len();
        self.fields.extend(parsed);
        Ok(count)
    }
}
