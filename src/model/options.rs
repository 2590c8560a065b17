/// Explicit integration scheme, selected once at construction.
///
/// The naming follows the usual `RKp(p̂)s` convention: order, embedded order
/// used for the local error estimate, number of stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegratorType {
    /// Forwards Euler. No embedded error estimate; the step size is fixed by
    /// configuration (see [`SolverOptions::euler_dt`]) or the diffusion
    /// stability bound.
    Rk101,
    /// Heun's method with an embedded Euler estimate.
    Rk212,
    /// Three-stage Shu-Osher SSP scheme with an embedded second-order
    /// estimate.
    Rk323,
    /// Five-stage low-storage 3S* scheme with an embedded third-order
    /// estimate.
    Rk435,
}

impl IntegratorType {
    /// Order of the scheme, used as the exponent `1/p` in the adaptive
    /// step-size controller.
    pub fn order(self) -> u32 {
        match self {
            IntegratorType::Rk101 => 1,
            IntegratorType::Rk212 => 2,
            IntegratorType::Rk323 => 3,
            IntegratorType::Rk435 => 4,
        }
    }
}

/// Maximum allowed local error for one adaptive step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorTolerances {
    /// Maximum absolute difference between the solution and its embedded
    /// lower-order estimate.
    pub abs: f64,
    /// Maximum relative difference, normalised by the mean of the new and
    /// old concentrations.
    pub rel: f64,
}

impl Default for ErrorTolerances {
    fn default() -> Self {
        ErrorTolerances {
            abs: f64::INFINITY,
            rel: 0.005,
        }
    }
}

/// Engine configuration, immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    pub integrator: IntegratorType,
    pub tolerances: ErrorTolerances,
    /// Upper bound for any single sub-step, adaptive or not.
    pub max_timestep: f64,
    /// Fixed step size for [`IntegratorType::Rk101`]. When unset the step is
    /// the global diffusion stability bound.
    pub euler_dt: Option<f64>,
    /// Split per-cell evaluation across a bounded worker pool.
    pub enable_multithreading: bool,
    /// Worker count; defaults to the host's available parallelism.
    pub max_threads: Option<usize>,
    /// Cells per parallel work item. Chunks are static and disjoint, so
    /// results are independent of thread count and scheduling order.
    pub grain_size: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            integrator: IntegratorType::Rk212,
            tolerances: ErrorTolerances::default(),
            max_timestep: f64::INFINITY,
            euler_dt: None,
            enable_multithreading: false,
            max_threads: None,
            grain_size: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_orders() {
        assert_eq!(IntegratorType::Rk101.order(), 1);
        assert_eq!(IntegratorType::Rk212.order(), 2);
        assert_eq!(IntegratorType::Rk323.order(), 3);
        assert_eq!(IntegratorType::Rk435.order(), 4);
    }

    #[test]
    fn default_options_are_adaptive_single_threaded() {
        let opts = SolverOptions::default();
        assert_eq!(opts.integrator, IntegratorType::Rk212);
        assert!(!opts.enable_multithreading);
        assert!(opts.max_timestep.is_infinite());
        assert_eq!(opts.tolerances.rel, 0.005);
    }
}
