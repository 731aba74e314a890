use crate::error::{EngineError, Result};
use crate::integrate::RunSettings;
use crate::traits::{DynamicalSystem, Scalar, Steppable};
use std::fmt;
use std::str::FromStr;

fn lit<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::zero(); dim],
            k2: vec![T::zero(); dim],
            k3: vec![T::zero(); dim],
            k4: vec![T::zero(); dim],
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) -> Result<()> {
        let half = lit::<T>(0.5);
        let sixth = lit::<T>(1.0 / 6.0);
        let two = lit::<T>(2.0);

        let t0 = *t;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1)?;

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2)?;

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3)?;

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4)?;

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
        Ok(())
    }
}

/// Coefficients of an explicit embedded Runge-Kutta pair.
#[derive(Debug, Clone, Copy)]
pub struct ButcherTableau {
    pub name: &'static str,
    /// Order of the lower of the two embedded solutions; sets the step-size exponent.
    pub error_order: u32,
    pub c: &'static [f64],
    pub a: &'static [&'static [f64]],
    /// Weights of the propagated solution.
    pub b: &'static [f64],
    /// Propagated weights minus embedded weights.
    pub err: &'static [f64],
}

impl ButcherTableau {
    pub fn stages(&self) -> usize {
        self.c.len()
    }
}

/// Bogacki-Shampine 3(2).
pub const BOGACKI_SHAMPINE: ButcherTableau = ButcherTableau {
    name: "eRK2-adaptive",
    error_order: 2,
    c: &[0.0, 0.5, 0.75, 1.0],
    a: &[
        &[],
        &[0.5],
        &[0.0, 0.75],
        &[2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0],
    ],
    b: &[2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0, 0.0],
    err: &[-5.0 / 72.0, 1.0 / 12.0, 1.0 / 9.0, -1.0 / 8.0],
};

/// Dormand-Prince 5(4).
pub const DORMAND_PRINCE: ButcherTableau = ButcherTableau {
    name: "eRK4-adaptive",
    error_order: 4,
    c: &[0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0],
    a: &[
        &[],
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[
            19372.0 / 6561.0,
            -25360.0 / 2187.0,
            64448.0 / 6561.0,
            -212.0 / 729.0,
        ],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
        &[
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ],
    err: &[
        71.0 / 57600.0,
        0.0,
        -71.0 / 16695.0,
        71.0 / 1920.0,
        -17253.0 / 339200.0,
        22.0 / 525.0,
        -1.0 / 40.0,
    ],
};

/// Runge-Kutta-Fehlberg 7(8), propagating the 8th order solution.
pub const FEHLBERG_78: ButcherTableau = ButcherTableau {
    name: "eRK8-adaptive",
    error_order: 7,
    c: &[
        0.0,
        2.0 / 27.0,
        1.0 / 9.0,
        1.0 / 6.0,
        5.0 / 12.0,
        1.0 / 2.0,
        5.0 / 6.0,
        1.0 / 6.0,
        2.0 / 3.0,
        1.0 / 3.0,
        1.0,
        0.0,
        1.0,
    ],
    a: &[
        &[],
        &[2.0 / 27.0],
        &[1.0 / 36.0, 1.0 / 12.0],
        &[1.0 / 24.0, 0.0, 1.0 / 8.0],
        &[5.0 / 12.0, 0.0, -25.0 / 16.0, 25.0 / 16.0],
        &[1.0 / 20.0, 0.0, 0.0, 1.0 / 4.0, 1.0 / 5.0],
        &[-25.0 / 108.0, 0.0, 0.0, 125.0 / 108.0, -65.0 / 27.0, 125.0 / 54.0],
        &[31.0 / 300.0, 0.0, 0.0, 0.0, 61.0 / 225.0, -2.0 / 9.0, 13.0 / 900.0],
        &[
            2.0,
            0.0,
            0.0,
            -53.0 / 6.0,
            704.0 / 45.0,
            -107.0 / 9.0,
            67.0 / 90.0,
            3.0,
        ],
        &[
            -91.0 / 108.0,
            0.0,
            0.0,
            23.0 / 108.0,
            -976.0 / 135.0,
            311.0 / 54.0,
            -19.0 / 60.0,
            17.0 / 6.0,
            -1.0 / 12.0,
        ],
        &[
            2383.0 / 4100.0,
            0.0,
            0.0,
            -341.0 / 164.0,
            4496.0 / 1025.0,
            -301.0 / 82.0,
            2133.0 / 4100.0,
            45.0 / 82.0,
            45.0 / 164.0,
            18.0 / 41.0,
        ],
        &[
            3.0 / 205.0,
            0.0,
            0.0,
            0.0,
            0.0,
            -6.0 / 41.0,
            -3.0 / 205.0,
            -3.0 / 41.0,
            3.0 / 41.0,
            6.0 / 41.0,
            0.0,
        ],
        &[
            -1777.0 / 4100.0,
            0.0,
            0.0,
            -341.0 / 164.0,
            4496.0 / 1025.0,
            -289.0 / 82.0,
            2193.0 / 4100.0,
            51.0 / 82.0,
            33.0 / 164.0,
            12.0 / 41.0,
            0.0,
            1.0,
        ],
    ],
    b: &[
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        34.0 / 105.0,
        9.0 / 35.0,
        9.0 / 35.0,
        9.0 / 280.0,
        9.0 / 280.0,
        0.0,
        41.0 / 840.0,
        41.0 / 840.0,
    ],
    err: &[
        41.0 / 840.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        41.0 / 840.0,
        -41.0 / 840.0,
        -41.0 / 840.0,
    ],
};

/// Integration methods selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SolverKind {
    /// Fixed-step classical RK4.
    Rk4,
    Rk23,
    Rk45,
    Rk78,
}

impl SolverKind {
    pub fn name(&self) -> &'static str {
        match self {
            SolverKind::Rk4 => "eRK4-homemade",
            SolverKind::Rk23 => BOGACKI_SHAMPINE.name,
            SolverKind::Rk45 => DORMAND_PRINCE.name,
            SolverKind::Rk78 => FEHLBERG_78.name,
        }
    }

    /// Embedded pair driving the adaptive methods; `None` for fixed-step RK4.
    pub fn tableau(&self) -> Option<&'static ButcherTableau> {
        match self {
            SolverKind::Rk4 => None,
            SolverKind::Rk23 => Some(&BOGACKI_SHAMPINE),
            SolverKind::Rk45 => Some(&DORMAND_PRINCE),
            SolverKind::Rk78 => Some(&FEHLBERG_78),
        }
    }
}

impl FromStr for SolverKind {
    type Err = EngineError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "eRK4-homemade" | "rk4" => Ok(SolverKind::Rk4),
            "eRK2-adaptive" | "rk23" => Ok(SolverKind::Rk23),
            "eRK4-adaptive" | "rk45" => Ok(SolverKind::Rk45),
            "eRK8-adaptive" | "rk78" => Ok(SolverKind::Rk78),
            other => Err(EngineError::UnknownSolver(other.to_string())),
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Embedded Runge-Kutta integrator with error-controlled step size.
///
/// [`Steppable::step`] advances by exactly `dt`, taking as many internal
/// steps as the tolerances require. On failure it returns
/// [`EngineError::SolverDivergence`] with `last_valid_index` 0, i.e. the
/// state at the start of the requested step; the caller offsets it onto its
/// own time grid.
pub struct AdaptiveSolver<T: Scalar> {
    tableau: &'static ButcherTableau,
    c: Vec<T>,
    a: Vec<Vec<T>>,
    b: Vec<T>,
    err: Vec<T>,
    k: Vec<Vec<T>>,
    tmp: Vec<T>,
    candidate: Vec<T>,
    rtol: T,
    atol: T,
    min_step: T,
    max_rejections: usize,
    /// Step size suggested by the last accepted step.
    next_h: Option<T>,
    accepted: usize,
    rejected: usize,
}

impl<T: Scalar> AdaptiveSolver<T> {
    pub fn new(tableau: &'static ButcherTableau, dim: usize, settings: &RunSettings) -> Self {
        let convert = |row: &[f64]| row.iter().map(|&v| lit::<T>(v)).collect::<Vec<T>>();
        Self {
            tableau,
            c: convert(tableau.c),
            a: tableau.a.iter().map(|row| convert(row)).collect(),
            b: convert(tableau.b),
            err: convert(tableau.err),
            k: vec![vec![T::zero(); dim]; tableau.stages()],
            tmp: vec![T::zero(); dim],
            candidate: vec![T::zero(); dim],
            rtol: lit(settings.rtol),
            atol: lit(settings.atol),
            min_step: lit(settings.min_step),
            max_rejections: settings.max_rejections,
            next_h: None,
            accepted: 0,
            rejected: 0,
        }
    }

    pub fn tableau(&self) -> &'static ButcherTableau {
        self.tableau
    }

    /// Internal steps accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// One trial step of size `h` from `(t, state)` into `self.candidate`.
    /// Returns the scaled RMS error estimate.
    fn attempt(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: T,
        state: &[T],
        h: T,
    ) -> Result<T> {
        let n = state.len();
        for s in 0..self.c.len() {
            for i in 0..n {
                let mut acc = T::zero();
                for (j, &a) in self.a[s].iter().enumerate() {
                    acc = acc + a * self.k[j][i];
                }
                self.tmp[i] = state[i] + h * acc;
            }
            system.apply(t + self.c[s] * h, &self.tmp, &mut self.k[s])?;
        }

        let mut sum = T::zero();
        for i in 0..n {
            let mut high = T::zero();
            let mut delta = T::zero();
            for s in 0..self.c.len() {
                high = high + self.b[s] * self.k[s][i];
                delta = delta + self.err[s] * self.k[s][i];
            }
            let next = state[i] + h * high;
            self.candidate[i] = next;
            let scale = self.atol + self.rtol * state[i].abs().max(next.abs());
            let e = h * delta / scale;
            sum = sum + e * e;
        }

        if n == 0 {
            return Ok(T::zero());
        }
        let norm = (sum / lit::<T>(n as f64)).sqrt();
        if self.candidate.iter().any(|v| !v.is_finite()) {
            return Ok(T::infinity());
        }
        Ok(norm)
    }

    fn diverged(&self, t: T, reason: String) -> EngineError {
        EngineError::SolverDivergence {
            last_valid_index: 0,
            time: t.to_f64().unwrap_or(f64::NAN),
            reason,
        }
    }
}

impl<T: Scalar> Steppable<T> for AdaptiveSolver<T> {
    fn step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) -> Result<()> {
        let t0 = *t;
        let t_end = t0 + dt;
        let exponent = T::one() / lit::<T>(f64::from(self.tableau.error_order + 1));
        let safety = lit::<T>(0.9);
        let shrink = lit::<T>(0.2);
        let grow = lit::<T>(5.0);

        // A leftover shorter than this is folded into the current step.
        let snap = self.min_step.max(dt * lit::<T>(1e-9));

        let mut now = t0;
        let mut h = self.next_h.unwrap_or(dt).min(dt);
        let mut rejections = 0;

        while now < t_end {
            let remaining = t_end - now;
            let wanted = h;
            let last = h >= remaining || remaining - h < snap;
            if last {
                h = remaining;
            }
            if !h.is_finite() || h < self.min_step {
                return Err(self.diverged(
                    t0,
                    format!("step size {h:?} fell below the minimum at t = {now:?}"),
                ));
            }

            let error = self.attempt(system, now, state, h)?;
            let factor = if error == T::zero() {
                grow
            } else {
                (safety * error.powf(-exponent)).max(shrink).min(grow)
            };

            if error <= T::one() {
                state.copy_from_slice(&self.candidate);
                now = if last { t_end } else { now + h };
                self.accepted += 1;
                rejections = 0;
                let suggested = h * factor;
                self.next_h = Some(if last { suggested.max(wanted) } else { suggested });
                h = suggested;
            } else {
                self.rejected += 1;
                rejections += 1;
                if rejections > self.max_rejections {
                    return Err(self.diverged(
                        t0,
                        format!("{rejections} consecutive rejected steps at t = {now:?}"),
                    ));
                }
                // NaN errors fall through `max` to the shrink factor.
                h = h * factor.min(T::one()).max(shrink);
            }
        }

        *t = t_end;
        Ok(())
    }
}
