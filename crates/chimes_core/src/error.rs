//! Engine errors.

use thiserror::Error;

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Everything that can go wrong between loading a model and reading back a run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A referenced field has no definition in the model nor in the registry.
    #[error("unknown field `{name}`{}", context_suffix(.context))]
    UnknownField { name: String, context: Option<String> },

    #[error("malformed field `{name}`: {reason}")]
    MalformedField { name: String, reason: String },

    /// No valid evaluation order exists for the listed fields.
    #[error("cyclic dependency between fields: {}", .fields.join(", "))]
    CyclicDependency { fields: Vec<String> },

    /// The adaptive solver could not advance past `last_valid_index`.
    #[error(
        "solver diverged after time index {last_valid_index} (t = {time}): {reason}"
    )]
    SolverDivergence {
        last_valid_index: usize,
        time: f64,
        reason: String,
    },

    #[error("invalid distribution for `{field}`: {reason}")]
    InvalidDistribution { field: String, reason: String },

    #[error("unknown solver `{0}`")]
    UnknownSolver(String),

    #[error("shape mismatch for `{field}`: cannot broadcast {found:?} to {expected:?}")]
    ShapeMismatch {
        field: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// An input was read before it was recomputed in the current evaluation.
    #[error("field `{field}` read stale input `{input}`")]
    StaleInput { field: String, input: String },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

fn context_suffix(context: &Option<String>) -> String {
    match context {
        Some(ctx) => format!(" (referenced by `{ctx}`)"),
        None => String::new(),
    }
}

impl EngineError {
    pub(crate) fn unknown(name: impl Into<String>) -> Self {
        EngineError::UnknownField {
            name: name.into(),
            context: None,
        }
    }

    pub(crate) fn unknown_in(name: impl Into<String>, context: impl Into<String>) -> Self {
        EngineError::UnknownField {
            name: name.into(),
            context: Some(context.into()),
        }
    }

    pub(crate) fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::MalformedField {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
