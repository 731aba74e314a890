//! The `chimes_core` crate resolves a model of named fields into an evaluation
//! graph and integrates it through time, over many parallel runs at once.
//!
//! A model declares Dynamic fields (integrated through a derivative),
//! Algebraic fields (recomputed from other fields at every evaluation),
//! Parameters and sector sizes. Every field function declares its inputs up
//! front, so dependencies are known without running anything.
//!
//! Key components:
//! - **Loader / Resolver**: registry completion, validation, topological evaluation order.
//! - **Engine**: `EquationSystem`, the right-hand side over a flat state vector.
//! - **Solvers**: fixed-step RK4 and embedded adaptive pairs (RK23, RK45, RK78).
//! - **Sensitivity**: ensembles drawn along the parallel-run axis, and their statistics.
//! - **Simulation**: the façade tying it together (`load`, `set_field`, `run`, `get_field`).
pub mod analysis;
pub mod engine;
pub mod error;
pub mod field;
pub mod integrate;
pub mod loader;
pub mod model;
pub mod operators;
pub mod registry;
pub mod resolver;
pub mod sensitivity;
pub mod simulation;
pub mod solvers;
pub mod tensor;
pub mod traits;

pub use error::{EngineError, Result};
pub use field::{FieldDecl, FieldKind, FieldValue, Inputs};
pub use integrate::{RunSettings, RunState};
pub use model::{ModelDeclaration, Preset};
pub use registry::Registry;
pub use sensitivity::{DistributionKind, DistributionSpec};
pub use simulation::{Assignment, Simulation};
