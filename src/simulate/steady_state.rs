use crate::simulate::pixel_sim::PixelSim;
use crate::simulate::Simulator;
use image::RgbImage;

/// Floor for the norm denominator, so a model relaxing towards zero
/// concentration can still converge.
const NORM_EPSILON: f64 = 1e-12;

/// Decorates a [`PixelSim`] with a convergence test on the rate of change
/// of the global concentration vector, for run-until-equilibrium workflows.
///
/// After each [`run`](PixelSimSteadyState::run) call the decorator computes
/// `||(c_new - c_old) / dt||_2 / max(||c_new||_2, eps)` over the
/// concatenation of all compartments' species concentrations. Once the norm
/// stays below the tolerance for the configured number of consecutive
/// calls, the simulation is judged converged and further stepping is
/// suppressed through the stop flag. A non-finite norm is a fatal failure.
pub struct PixelSimSteadyState {
    sim: PixelSim,
    tolerance: f64,
    required_consecutive: u32,
    consecutive_below: u32,
    converged: bool,
    latest_norm: f64,
    error_message: String,
}

impl PixelSimSteadyState {
    /// Wraps `sim`; `required_consecutive` below-tolerance evaluations in a
    /// row are needed before the simulation counts as converged.
    pub fn new(sim: PixelSim, tolerance: f64, required_consecutive: u32) -> Self {
        PixelSimSteadyState {
            sim,
            tolerance,
            required_consecutive: required_consecutive.max(1),
            consecutive_below: 0,
            converged: false,
            latest_norm: f64::INFINITY,
            error_message: String::new(),
        }
    }

    pub fn has_converged(&self) -> bool {
        self.converged
    }

    /// Relative rate-of-change norm from the most recent evaluation.
    pub fn latest_relative_norm(&self) -> f64 {
        self.latest_norm
    }

    pub fn pixel_sim(&self) -> &PixelSim {
        &self.sim
    }

    pub fn pixel_sim_mut(&mut self) -> &mut PixelSim {
        &mut self.sim
    }

    /// Runs the inner simulator, then evaluates the convergence criterion
    /// once (not per internal sub-step). Returns the completed step count.
    pub fn run(
        &mut self,
        time: f64,
        timeout_ms: f64,
        stop_callback: Option<&dyn Fn() -> bool>,
    ) -> u64 {
        if !self.error_message.is_empty() {
            return 0;
        }
        let time_before = self.sim.current_time();
        let old = self.sim.species_concentration_vector();
        let steps = self.sim.run(time, timeout_ms, stop_callback);
        let dt = self.sim.current_time() - time_before;
        if dt <= 0.0 {
            return steps;
        }

        let new = self.sim.species_concentration_vector();
        let mut change_sq = 0.0;
        let mut norm_sq = 0.0;
        for (new_c, old_c) in new.iter().zip(&old) {
            let rate = (new_c - old_c) / dt;
            change_sq += rate * rate;
            norm_sq += new_c * new_c;
        }
        let norm = change_sq.sqrt() / norm_sq.sqrt().max(NORM_EPSILON);
        self.latest_norm = norm;
        log::debug!(
            "steady state: norm = {norm:.3e}, tolerance = {:.3e}, consecutive = {}",
            self.tolerance,
            self.consecutive_below
        );

        if !norm.is_finite() {
            self.error_message =
                "Simulation failed: steady-state rate of change is not finite".to_string();
            self.consecutive_below = 0;
            log::warn!("{}", self.error_message);
        } else if norm < self.tolerance {
            self.consecutive_below += 1;
            if self.consecutive_below >= self.required_consecutive && !self.converged {
                self.converged = true;
                self.sim.request_stop();
                log::info!(
                    "steady state reached at t = {:.6e} (norm = {norm:.3e})",
                    self.sim.current_time()
                );
            }
        } else {
            self.consecutive_below = 0;
        }
        steps
    }
}

impl Simulator for PixelSimSteadyState {
    fn run(
        &mut self,
        time: f64,
        timeout_ms: f64,
        stop_callback: Option<&dyn Fn() -> bool>,
    ) -> u64 {
        PixelSimSteadyState::run(self, time, timeout_ms, stop_callback)
    }

    fn concentrations(&self, compartment: usize) -> Vec<f64> {
        Simulator::concentrations(&self.sim, compartment)
    }

    fn concentration_padding(&self) -> usize {
        self.sim.concentration_padding()
    }

    fn error_message(&self) -> &str {
        if !self.error_message.is_empty() {
            return &self.error_message;
        }
        Simulator::error_message(&self.sim)
    }

    fn error_images(&self) -> &[RgbImage] {
        self.sim.error_images()
    }

    fn request_stop(&self) {
        self.sim.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::layout::CompartmentLayout;
    use crate::model::spec::{
        CompartmentSpec, InitialConcentration, ModelSpec, ReactionSpec, SpeciesSpec,
    };
    use crate::model::{IntegratorType, SolverOptions};
    use crate::simulate::pixel_sim::PixelSim;

    /// dA/dt = k * (1 - A): relaxes to A = 1 from any start.
    fn relaxation_model() -> ModelSpec {
        let mut species = SpeciesSpec::new("A", 0.0);
        species.initial_concentration = InitialConcentration::Uniform(0.2);
        let mut reaction = ReactionSpec::new("relax", "k * (1 - A)", vec![("A".into(), 1.0)]);
        reaction.parameters.push(("k".into(), 1.0));
        ModelSpec {
            compartments: vec![CompartmentSpec {
                layout: CompartmentLayout::rectangle("c", 2, 1).unwrap(),
                pixel_width: 1.0,
                species: vec![species],
                reactions: vec![reaction],
            }],
            membranes: vec![],
        }
    }

    fn euler_options(dt: f64) -> SolverOptions {
        SolverOptions {
            integrator: IntegratorType::Rk101,
            euler_dt: Some(dt),
            ..SolverOptions::default()
        }
    }

    #[test]
    fn relaxing_system_converges_after_consecutive_low_norms() {
        let sim = PixelSim::new(&relaxation_model(), euler_options(0.05)).unwrap();
        let mut steady = PixelSimSteadyState::new(sim, 1e-4, 2);
        let mut runs = 0;
        while !steady.has_converged() && runs < 60 {
            steady.run(1.0, -1.0, None);
            runs += 1;
        }
        assert!(steady.has_converged(), "no convergence after {runs} runs");
        assert!(steady.latest_relative_norm() < 1e-4);
        assert!(Simulator::error_message(&steady).is_empty());
        // once converged, the stop flag suppresses further stepping
        assert_eq!(steady.run(1.0, -1.0, None), 0);
    }

    #[test]
    fn nan_concentration_is_a_fatal_failure() {
        let sim = PixelSim::new(&relaxation_model(), euler_options(0.05)).unwrap();
        let mut steady = PixelSimSteadyState::new(sim, 1e-4, 2);
        steady.run(0.5, -1.0, None);
        let n = Simulator::concentrations(steady.pixel_sim(), 0).len();
        let mut poisoned = vec![f64::NAN; n];
        poisoned[1] = 1.0;
        steady
            .pixel_sim_mut()
            .set_concentrations(0, &poisoned)
            .unwrap();
        steady.run(0.5, -1.0, None);
        assert!(!steady.has_converged());
        assert!(!Simulator::error_message(&steady).is_empty());
        // fatal: later runs are suppressed
        assert_eq!(steady.run(0.5, -1.0, None), 0);
    }
}
