//! Model declarations as written by a modeller, and models as the loader returns them.

use crate::field::{Field, FieldDecl, FieldKind, FieldValue};
use crate::resolver::ExecutionOrder;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Named set of value overrides applied through `set_field`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub fields: IndexMap<String, FieldValue>,
    #[serde(default)]
    pub com: String,
}

impl Preset {
    pub fn new(com: &str) -> Self {
        Self {
            fields: IndexMap::new(),
            com: com.to_string(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }
}

/// Raw model declaration, grouped by category.
///
/// The `fields` category holds declarations whose kind is inferred: a
/// function reading `itself` is Dynamic, any other function is Algebraic,
/// a bare value is a Parameter.
#[derive(Debug, Clone, Default)]
pub struct ModelDeclaration {
    pub name: String,
    pub description: String,
    pub differential: IndexMap<String, FieldDecl>,
    pub statevar: IndexMap<String, FieldDecl>,
    pub parameter: IndexMap<String, FieldDecl>,
    pub size: IndexMap<String, FieldDecl>,
    pub fields: IndexMap<String, FieldDecl>,
    pub presets: IndexMap<String, Preset>,
    /// Explicit Algebraic evaluation order. Verified, never trusted.
    pub order: Option<Vec<String>>,
}

impl ModelDeclaration {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn differential(mut self, name: &str, decl: FieldDecl) -> Self {
        self.differential.insert(name.to_string(), decl);
        self
    }

    pub fn statevar(mut self, name: &str, decl: FieldDecl) -> Self {
        self.statevar.insert(name.to_string(), decl);
        self
    }

    pub fn parameter(mut self, name: &str, decl: FieldDecl) -> Self {
        self.parameter.insert(name.to_string(), decl);
        self
    }

    pub fn size(mut self, name: &str, decl: FieldDecl) -> Self {
        self.size.insert(name.to_string(), decl);
        self
    }

    pub fn field(mut self, name: &str, decl: FieldDecl) -> Self {
        self.fields.insert(name.to_string(), decl);
        self
    }

    pub fn preset(mut self, name: &str, preset: Preset) -> Self {
        self.presets.insert(name.to_string(), preset);
        self
    }

    pub fn with_order(mut self, order: &[&str]) -> Self {
        self.order = Some(order.iter().map(|s| s.to_string()).collect());
        self
    }
}

/// A validated model: every field classified, every order resolved.
#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    pub description: String,
    pub(crate) fields: IndexMap<String, Field>,
    pub(crate) presets: IndexMap<String, Preset>,
    pub(crate) sector_lookup: IndexMap<String, IndexMap<String, usize>>,
    pub(crate) order: ExecutionOrder,
    pub(crate) parameter_order: ExecutionOrder,
    pub(crate) auxiliary: Vec<String>,
}

impl Model {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub(crate) fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.get_mut(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Names of every field of `kind`, in declaration order.
    pub fn names_of(&self, kind: FieldKind) -> Vec<&str> {
        self.fields
            .values()
            .filter(|f| f.kind == kind)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Position of a named sector along the axis declared by `size`.
    pub fn sector_index(&self, size: &str, label: &str) -> Option<usize> {
        self.sector_lookup.get(size)?.get(label).copied()
    }

    pub fn presets(&self) -> &IndexMap<String, Preset> {
        &self.presets
    }

    pub fn order(&self) -> &ExecutionOrder {
        &self.order
    }

    pub fn parameter_order(&self) -> &ExecutionOrder {
        &self.parameter_order
    }

    /// Fields whose values no needed function reads.
    pub fn auxiliary(&self) -> &[String] {
        &self.auxiliary
    }
}
