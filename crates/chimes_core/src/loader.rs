//! Model loader and validator.
//!
//! Turns a raw [`ModelDeclaration`] into a [`Model`]: registry defaults are
//! merged in, every field gets a kind, referenced parameters are pulled from
//! the registry, and the evaluation orders are resolved. Everything that can
//! be wrong with a model is reported here, before any time is simulated.

use crate::error::{EngineError, Result};
use crate::field::{
    Attr, Field, FieldDecl, FieldKind, FieldValue, Function, Metadata, SizeSpec, SCALAR_SIZE,
    SELF_REF,
};
use crate::model::{Model, ModelDeclaration};
use crate::registry::{FieldDefaults, Registry};
use crate::resolver::{self, partition_inputs};
use indexmap::IndexMap;
use ndarray::Array4;
use tracing::{debug, info};

/// Declaration category a field was written under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Differential,
    Statevar,
    Parameter,
    Size,
    Unclassified,
}

impl Category {
    fn label(self) -> &'static str {
        match self {
            Category::Differential => "differential",
            Category::Statevar => "statevar",
            Category::Parameter => "parameter",
            Category::Size => "size",
            Category::Unclassified => "fields",
        }
    }
}

/// Owns the registry every model is completed from.
#[derive(Debug, Clone)]
pub struct Loader {
    registry: Registry,
}

impl Loader {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn load(&self, decl: &ModelDeclaration) -> Result<Model> {
        let mut fields: IndexMap<String, Field> = IndexMap::new();
        let mut origin: IndexMap<String, Category> = IndexMap::new();

        let categories = [
            (Category::Differential, &decl.differential),
            (Category::Statevar, &decl.statevar),
            (Category::Unclassified, &decl.fields),
            (Category::Parameter, &decl.parameter),
            (Category::Size, &decl.size),
        ];

        for (category, entries) in categories {
            for (name, field_decl) in entries {
                if let Some(previous) = origin.get(name) {
                    return Err(EngineError::malformed(
                        name,
                        format!(
                            "declared under both `{}` and `{}`",
                            previous.label(),
                            category.label()
                        ),
                    ));
                }
                let field = self.build_field(name, category, field_decl)?;
                debug!(field = %name, kind = %field.kind, inputs = ?field.inputs(), "classified field");
                origin.insert(name.clone(), category);
                fields.insert(name.clone(), field);
            }
        }

        if !fields.contains_key("time") {
            let time = self.time_field();
            fields.shift_insert(0, time.name.clone(), time);
        }

        self.pull_registry_parameters(&mut fields)?;
        check_size_axes(&fields)?;
        for field in fields.values().filter(|f| f.is_computed()) {
            partition_inputs(&fields, field)?;
        }

        let sector_lookup = sector_lookup(&fields)?;
        let parameter_order = resolver::resolve_order(&fields, FieldKind::Parameter)?;
        let order = match &decl.order {
            Some(explicit) => resolver::verify_order(&fields, explicit)?,
            None => resolver::resolve_order(&fields, FieldKind::Algebraic)?,
        };
        let auxiliary = resolver::auxiliary_fields(&fields);

        for (preset_name, preset) in &decl.presets {
            for target in preset.fields.keys() {
                let field = fields.get(target).ok_or_else(|| {
                    EngineError::unknown_in(target.as_str(), format!("preset {preset_name}"))
                })?;
                if field.kind == FieldKind::Algebraic {
                    return Err(EngineError::malformed(
                        target,
                        format!("preset `{preset_name}` overrides a computed field"),
                    ));
                }
            }
        }

        info!(
            model = %decl.name,
            fields = fields.len(),
            algebraic = order.len(),
            "model loaded"
        );

        Ok(Model {
            name: decl.name.clone(),
            description: decl.description.clone(),
            fields,
            presets: decl.presets.clone(),
            sector_lookup,
            order,
            parameter_order,
            auxiliary,
        })
    }

    fn build_field(&self, name: &str, category: Category, decl: &FieldDecl) -> Result<Field> {
        decl.check_keys(name)?;
        let defaults = self.registry.get(name);
        let function = decl.function().cloned();
        let value_attr = decl.get("value");
        let labels = match decl.get("labels") {
            Some(Attr::Names(labels)) => Some(labels.clone()),
            _ => None,
        };

        let kind = match category {
            Category::Differential => FieldKind::Dynamic,
            Category::Statevar => FieldKind::Algebraic,
            Category::Parameter => FieldKind::Parameter,
            Category::Size => FieldKind::Size,
            Category::Unclassified => match &function {
                Some(f) if f.reads_itself() => FieldKind::Dynamic,
                Some(_) => FieldKind::Algebraic,
                None if labels.is_some() => FieldKind::Size,
                None => FieldKind::Parameter,
            },
        };

        if let Some(f) = &function {
            if f.reads_itself() && kind != FieldKind::Dynamic {
                return Err(EngineError::malformed(
                    name,
                    format!("only differential fields may read `{SELF_REF}`"),
                ));
            }
        }

        let mut field = Field {
            name: name.to_string(),
            kind,
            function: None,
            value: None,
            initial: None,
            size: [SCALAR_SIZE.to_string(), SCALAR_SIZE.to_string()],
            sectors: None,
            meta: merge_metadata(decl, defaults),
        };

        match kind {
            FieldKind::Dynamic | FieldKind::Algebraic => {
                let Some(function) = function else {
                    return Err(EngineError::malformed(
                        name,
                        format!("a {kind} field needs a function"),
                    ));
                };
                if value_attr.is_some() {
                    return Err(EngineError::malformed(
                        name,
                        format!("a {kind} field cannot carry a fixed value"),
                    ));
                }
                if kind == FieldKind::Dynamic {
                    field.initial = Some(initial_value(name, decl, defaults)?);
                } else if decl.get("initial").is_some() {
                    return Err(EngineError::malformed(
                        name,
                        "only differential fields take an initial value",
                    ));
                }
                field.function = Some(function);
            }
            FieldKind::Parameter => {
                let value = match value_attr {
                    Some(Attr::Value(v)) => Some(v.clone()),
                    Some(_) => {
                        return Err(EngineError::malformed(name, "parameter value must be numeric"))
                    }
                    None => defaults.and_then(|d| d.value).map(FieldValue::Scalar),
                };
                if function.is_some() {
                    if value_attr.is_some() {
                        return Err(EngineError::malformed(
                            name,
                            "parameter declares both a value and a function",
                        ));
                    }
                    field.function = function;
                } else {
                    field.value = Some(value.ok_or_else(|| {
                        EngineError::malformed(name, "neither a value nor a function is present")
                    })?);
                }
            }
            FieldKind::Size => {
                if function.is_some() {
                    return Err(EngineError::malformed(name, "a size cannot be computed"));
                }
                field.sectors = Some(size_spec(name, value_attr, labels.as_ref())?);
            }
        }

        if let Some(attr) = decl.get("size") {
            let Attr::Names(axes) = attr else {
                return Err(EngineError::malformed(name, "`size` must list size names"));
            };
            if axes.len() > 2 {
                return Err(EngineError::malformed(
                    name,
                    format!("at most two sector axes, got {}", axes.len()),
                ));
            }
            if kind == FieldKind::Size && !axes.is_empty() {
                return Err(EngineError::malformed(name, "a size cannot span sector axes"));
            }
            for (slot, axis) in axes.iter().enumerate() {
                field.size[slot] = axis.clone();
            }
        }

        Ok(field)
    }

    fn time_field(&self) -> Field {
        let defaults = self.registry.get("time");
        let initial = defaults
            .and_then(|d| d.initial)
            .or_else(|| self.registry.numerical("Tini"))
            .unwrap_or(0.0);
        Field {
            name: "time".to_string(),
            kind: FieldKind::Dynamic,
            function: Some(Function::new(&[], |_| Array4::from_elem((1, 1, 1, 1), 1.0))),
            value: None,
            initial: Some(FieldValue::Scalar(initial)),
            size: [SCALAR_SIZE.to_string(), SCALAR_SIZE.to_string()],
            sectors: None,
            meta: defaults.map(|d| d.meta.clone()).unwrap_or_default(),
        }
    }

    /// Adds registry parameters that functions read but the model never declared.
    fn pull_registry_parameters(&self, fields: &mut IndexMap<String, Field>) -> Result<()> {
        let mut wanted: Vec<(String, String)> = Vec::new();
        for field in fields.values() {
            for input in field.inputs() {
                if input == SELF_REF || fields.contains_key(input) {
                    continue;
                }
                if !wanted.iter().any(|(w, _)| w == input) {
                    wanted.push((input.clone(), field.name.clone()));
                }
            }
        }

        for (name, reader) in wanted {
            let defaults = self
                .registry
                .get(&name)
                .ok_or_else(|| EngineError::unknown_in(name.as_str(), reader.as_str()))?;
            let value = defaults.value.ok_or_else(|| {
                EngineError::malformed(&name, "registry entry has no default value")
            })?;
            debug!(field = %name, value, reader = %reader, "parameter taken from registry");
            fields.insert(
                name.clone(),
                Field {
                    name,
                    kind: FieldKind::Parameter,
                    function: None,
                    value: Some(FieldValue::Scalar(value)),
                    initial: None,
                    size: [SCALAR_SIZE.to_string(), SCALAR_SIZE.to_string()],
                    sectors: None,
                    meta: defaults.meta.clone(),
                },
            );
        }
        Ok(())
    }
}

fn merge_metadata(decl: &FieldDecl, defaults: Option<&FieldDefaults>) -> Metadata {
    let mut meta = defaults.map(|d| d.meta.clone()).unwrap_or_default();
    let slots: [(&str, &mut String); 5] = [
        ("units", &mut meta.units),
        ("definition", &mut meta.definition),
        ("com", &mut meta.com),
        ("symbol", &mut meta.symbol),
        ("group", &mut meta.group),
    ];
    for (key, slot) in slots {
        if let Some(Attr::Text(text)) = decl.get(key) {
            *slot = text.clone();
        }
    }
    meta
}

fn initial_value(name: &str, decl: &FieldDecl, defaults: Option<&FieldDefaults>) -> Result<FieldValue> {
    if let Some(Attr::Value(v)) = decl.get("initial") {
        return Ok(v.clone());
    }
    defaults
        .and_then(|d| d.initial.or(d.value))
        .map(FieldValue::Scalar)
        .ok_or_else(|| EngineError::malformed(name, "no initial value in model or registry"))
}

fn size_spec(name: &str, value: Option<&Attr>, labels: Option<&Vec<String>>) -> Result<SizeSpec> {
    let spec = match (value, labels) {
        (Some(_), Some(_)) => {
            return Err(EngineError::malformed(
                name,
                "size declares both a count and labels",
            ))
        }
        (None, Some(labels)) | (Some(Attr::Names(labels)), None) => SizeSpec::Labels(labels.clone()),
        (Some(Attr::Value(FieldValue::Scalar(count))), None) => {
            if *count < 1.0 || count.fract() != 0.0 {
                return Err(EngineError::malformed(
                    name,
                    format!("sector count must be a positive integer, got {count}"),
                ));
            }
            SizeSpec::Count(*count as usize)
        }
        (Some(_), None) => {
            return Err(EngineError::malformed(
                name,
                "size must be an integer count or a label list",
            ))
        }
        (None, None) => {
            return Err(EngineError::malformed(
                name,
                "neither a value nor a function is present",
            ))
        }
    };
    if spec.is_empty() {
        return Err(EngineError::malformed(name, "size has no sectors"));
    }
    Ok(spec)
}

fn check_size_axes(fields: &IndexMap<String, Field>) -> Result<()> {
    for field in fields.values() {
        for axis in &field.size {
            if axis == SCALAR_SIZE {
                continue;
            }
            match fields.get(axis) {
                None => return Err(EngineError::unknown_in(axis.as_str(), field.name.as_str())),
                Some(size) if size.kind != FieldKind::Size => {
                    return Err(EngineError::malformed(
                        &field.name,
                        format!("sector axis `{axis}` is a {} field, not a size", size.kind),
                    ))
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

fn sector_lookup(
    fields: &IndexMap<String, Field>,
) -> Result<IndexMap<String, IndexMap<String, usize>>> {
    let mut lookup = IndexMap::new();
    for field in fields.values() {
        if let Some(SizeSpec::Labels(labels)) = &field.sectors {
            let mut index = IndexMap::new();
            for (i, label) in labels.iter().enumerate() {
                if index.insert(label.clone(), i).is_some() {
                    return Err(EngineError::malformed(
                        &field.name,
                        format!("sector label `{label}` appears twice"),
                    ));
                }
            }
            lookup.insert(field.name.clone(), index);
        }
    }
    Ok(lookup)
}
