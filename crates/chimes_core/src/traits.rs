use crate::error::Result;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars by the integrators.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// The right-hand side of a system of first-order ODEs over a flat state.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the flat state.
    fn dimension(&self) -> usize;

    /// Evaluates dx/dt.
    /// x: current state
    /// t: current time
    /// out: buffer to write the derivative into
    fn apply(&self, t: T, x: &[T], out: &mut [T]) -> Result<()>;
}

/// A trait for fixed-step solvers that can step a system forward.
pub trait Steppable<T: Scalar> {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    /// dt: step size
    fn step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) -> Result<()>;
}
