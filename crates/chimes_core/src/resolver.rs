//! Dependency resolution between fields.
//!
//! Every function-bearing field declares its inputs up front, so discovering
//! dependencies is a lookup. Algebraic fields are ordered with Kahn's
//! algorithm; ties are broken by declaration order so the same model always
//! yields the same order. A cycle is always an error.

use crate::error::{EngineError, Result};
use crate::field::{Field, FieldKind, SELF_REF};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::debug;

/// Field names in an order where every field follows its dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOrder(Vec<String>);

impl ExecutionOrder {
    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|n| n == name)
    }
}

/// Declared inputs of one field, split by the kind of field they name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputPartition {
    pub parameter: Vec<String>,
    pub dynamic: Vec<String>,
    pub algebraic: Vec<String>,
    pub size: Vec<String>,
    pub itself: bool,
}

pub fn partition_inputs(fields: &IndexMap<String, Field>, field: &Field) -> Result<InputPartition> {
    let mut partition = InputPartition::default();
    for input in field.inputs() {
        if input == SELF_REF {
            if field.kind != FieldKind::Dynamic {
                return Err(EngineError::malformed(
                    &field.name,
                    format!("only differential fields may read `{SELF_REF}`"),
                ));
            }
            partition.itself = true;
            continue;
        }
        if *input == field.name && field.kind == FieldKind::Dynamic {
            return Err(EngineError::malformed(
                &field.name,
                format!("reads its own name; its current value is `{SELF_REF}`"),
            ));
        }
        let dep = fields
            .get(input)
            .ok_or_else(|| EngineError::unknown_in(input.as_str(), field.name.as_str()))?;
        let bucket = match dep.kind {
            FieldKind::Parameter => &mut partition.parameter,
            FieldKind::Dynamic => &mut partition.dynamic,
            FieldKind::Algebraic => &mut partition.algebraic,
            FieldKind::Size => &mut partition.size,
        };
        bucket.push(input.clone());
    }

    if field.kind == FieldKind::Parameter
        && !(partition.dynamic.is_empty() && partition.algebraic.is_empty())
    {
        let offending: Vec<&str> = partition
            .dynamic
            .iter()
            .chain(&partition.algebraic)
            .map(|s| s.as_str())
            .collect();
        return Err(EngineError::malformed(
            &field.name,
            format!("parameter function reads time-varying fields {offending:?}"),
        ));
    }

    Ok(partition)
}

/// Same-kind dependencies of every computed field of `kind`, as local indices.
fn same_kind_edges(
    fields: &IndexMap<String, Field>,
    kind: FieldKind,
) -> Result<(Vec<&str>, Vec<Vec<usize>>)> {
    let nodes: Vec<&Field> = fields
        .values()
        .filter(|f| f.kind == kind && f.is_computed())
        .collect();
    let local: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, f)| (f.name.as_str(), i))
        .collect();

    let mut deps = Vec::with_capacity(nodes.len());
    for field in &nodes {
        let partition = partition_inputs(fields, field)?;
        let same_kind = match kind {
            FieldKind::Algebraic => partition.algebraic,
            FieldKind::Parameter => partition.parameter,
            _ => Vec::new(),
        };
        let mut local_deps: Vec<usize> = same_kind
            .iter()
            .filter_map(|name| local.get(name.as_str()).copied())
            .collect();
        local_deps.sort_unstable();
        local_deps.dedup();
        deps.push(local_deps);
    }

    Ok((nodes.iter().map(|f| f.name.as_str()).collect(), deps))
}

/// Topological order of every computed field of `kind` (Algebraic, or
/// Parameters computed from Parameters).
pub fn resolve_order(fields: &IndexMap<String, Field>, kind: FieldKind) -> Result<ExecutionOrder> {
    let (names, deps) = same_kind_edges(fields, kind)?;
    let n = names.len();

    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, node_deps) in deps.iter().enumerate() {
        in_degree[node] = node_deps.len();
        for &dep in node_deps {
            dependents[dep].push(node);
        }
    }

    // Lowest declaration index first among the ready fields.
    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();
    let mut emitted = Vec::with_capacity(n);

    while let Some(Reverse(node)) = ready.pop() {
        emitted.push(names[node].to_string());
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if emitted.len() != n {
        let remaining: Vec<String> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| names[i].to_string())
            .collect();
        return Err(EngineError::CyclicDependency { fields: remaining });
    }

    debug!(%kind, order = ?emitted, "resolved evaluation order");
    Ok(ExecutionOrder(emitted))
}

/// Checks a model-supplied Algebraic order against every dependency edge.
pub fn verify_order(fields: &IndexMap<String, Field>, order: &[String]) -> Result<ExecutionOrder> {
    let mut seen = HashSet::new();
    for name in order {
        let field = fields
            .get(name)
            .ok_or_else(|| EngineError::unknown_in(name.as_str(), "explicit order"))?;
        if field.kind != FieldKind::Algebraic {
            return Err(EngineError::malformed(
                name,
                format!("explicit order lists a {} field", field.kind),
            ));
        }
        if !seen.insert(name.as_str()) {
            return Err(EngineError::malformed(name, "listed twice in explicit order"));
        }
    }
    if let Some(missing) = fields
        .values()
        .find(|f| f.kind == FieldKind::Algebraic && !seen.contains(f.name.as_str()))
    {
        return Err(EngineError::malformed(
            &missing.name,
            "missing from explicit order",
        ));
    }

    let (names, deps) = same_kind_edges(fields, FieldKind::Algebraic)?;
    let position: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();
    for (node, node_deps) in deps.iter().enumerate() {
        let at = position[names[node]];
        for &dep in node_deps {
            if position[names[dep]] >= at {
                return Err(EngineError::CyclicDependency {
                    fields: vec![names[node].to_string(), names[dep].to_string()],
                });
            }
        }
    }

    debug!(order = ?order, "verified explicit evaluation order");
    Ok(ExecutionOrder(order.to_vec()))
}

/// Function-bearing fields that no needed field reads, iterated to a fixpoint.
pub fn auxiliary_fields(fields: &IndexMap<String, Field>) -> Vec<String> {
    let mut needed: HashSet<&str> = fields
        .values()
        .filter(|f| f.is_computed())
        .map(|f| f.name.as_str())
        .collect();

    loop {
        let dropped: Vec<&str> = needed
            .iter()
            .copied()
            .filter(|&name| {
                !needed.iter().any(|&reader| {
                    reader != name && fields[reader].inputs().iter().any(|i| i == name)
                })
            })
            .collect();
        if dropped.is_empty() {
            break;
        }
        for name in dropped {
            needed.remove(name);
        }
    }

    fields
        .values()
        .filter(|f| f.is_computed() && !needed.contains(f.name.as_str()))
        .map(|f| f.name.clone())
        .collect()
}
