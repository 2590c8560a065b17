use crate::model::options::{IntegratorType, SolverOptions};
use crate::model::spec::ModelSpec;
use crate::simulate::compartment::{RkError, SimCompartment};
use crate::simulate::membrane::SimMembrane;
use crate::simulate::reac_eval::detect_pseudo_variables;
use crate::simulate::{SetupError, Simulator};
use image::RgbImage;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sticky message after a wall-clock timeout.
pub const MSG_TIMEOUT: &str = "Simulation timeout";
/// Sticky message after the cancellation predicate returned true.
pub const MSG_CANCELLED: &str = "Simulation cancelled";
/// Sticky message after a stop request from another thread.
pub const MSG_STOPPED: &str = "Simulation stopped early";

/// Regularisation added to the relative-error denominator.
const RK_EPSILON: f64 = 1e-20;
/// An adaptive timestep below this fraction of the requested step means the
/// integrator cannot converge.
const TIMESTEP_UNDERFLOW: f64 = 1e-20;
/// Relative slack when deciding that the requested time span has elapsed,
/// avoiding an extra sliver step from floating-point drift.
const TIME_FRACTION_EPSILON: f64 = 1e-12;
/// Safety factor on the error-based next-step estimate.
const SAFETY_FACTOR: f64 = 0.95;

// RK4(3)5[3S*] coefficients from table 3 of Ketcheson,
// "Runge-Kutta methods with minimum storage implementations",
// J. Comput. Phys. 229 (2010), https://doi.org/10.1016/j.jcp.2009.11.006
const RK435_G1: [f64; 5] = [
    0.0,
    -0.497531095840104,
    1.010070514199942,
    -3.196559004608766,
    1.717835630267259,
];
const RK435_G2: [f64; 5] = [
    1.0,
    1.384996869124138,
    3.878155713328178,
    -2.324512951813145,
    -0.514633322274467,
];
const RK435_G3: [f64; 5] = [0.0, 0.0, 0.0, 1.642598936063715, 0.188295940828347];
const RK435_BETA: [f64; 5] = [
    0.075152045700771,
    0.211361016946069,
    1.100713347634329,
    0.728537814675568,
    0.393172889823198,
];
const RK435_DELTA: [f64; 7] = [
    1.0,
    0.081252332929194,
    -1.083849060586449,
    -1.096110881845602,
    2.859440022030827,
    -0.655568367959557,
    -0.194421504490852,
];

fn pair_mut(
    compartments: &mut [SimCompartment],
    a: usize,
    b: Option<usize>,
) -> (&mut SimCompartment, Option<&mut SimCompartment>) {
    match b {
        None => (&mut compartments[a], None),
        Some(b) if a < b => {
            let (lo, hi) = compartments.split_at_mut(b);
            (&mut lo[a], Some(&mut hi[0]))
        }
        Some(b) => {
            let (lo, hi) = compartments.split_at_mut(a);
            (&mut hi[0], Some(&mut lo[b]))
        }
    }
}

/// Scans every reaction in the model for references to the time/space
/// pseudo-variables, so all compartments can share one padding layout.
fn detect_global_pseudo_variables(model: &ModelSpec) -> Result<(bool, bool), SetupError> {
    let mut use_time = false;
    let mut use_space = false;
    for compartment in &model.compartments {
        let known: HashSet<String> = compartment.species.iter().map(|s| s.id.clone()).collect();
        for reaction in &compartment.reactions {
            let (t, s) = detect_pseudo_variables(reaction, &known)?;
            use_time |= t;
            use_space |= s;
        }
    }
    for membrane in &model.membranes {
        let mut known: HashSet<String> = HashSet::new();
        if let Some(spec_a) = model.compartment(&membrane.compartment_a) {
            known.extend(spec_a.species.iter().map(|s| s.id.clone()));
        }
        if let Some(spec_b) = membrane
            .compartment_b
            .as_ref()
            .and_then(|id| model.compartment(id))
        {
            known.extend(spec_b.species.iter().map(|s| s.id.clone()));
        }
        for reaction in &membrane.reactions {
            let (t, s) = detect_pseudo_variables(reaction, &known)?;
            use_time |= t;
            use_space |= s;
        }
    }
    Ok((use_time, use_space))
}

/// Explicit-time-stepping reaction-diffusion solver over a collection of
/// compartment and membrane units.
///
/// Owns all units, the adaptive step-size controller and the concurrency
/// policy. Constructed once from a read-only [`ModelSpec`]; driven through
/// [`run`](PixelSim::run) or the [`Simulator`] contract.
pub struct PixelSim {
    compartments: Vec<SimCompartment>,
    membranes: Vec<SimMembrane>,
    options: SolverOptions,
    pool: Option<ThreadPool>,
    padding: usize,
    /// Minimum of the per-compartment diffusion stability bounds.
    max_stable_timestep: f64,
    next_timestep: f64,
    discarded_steps: u64,
    last_error: Option<RkError>,
    t: f64,
    failed: bool,
    error_message: String,
    error_images: Vec<RgbImage>,
    stop_requested: Arc<AtomicBool>,
}

impl PixelSim {
    pub fn new(model: &ModelSpec, options: SolverOptions) -> Result<Self, SetupError> {
        model.validate()?;
        let tol = options.tolerances;
        if !(tol.abs > 0.0) || !(tol.rel > 0.0) {
            return Err(SetupError::InvalidTolerances {
                abs: tol.abs,
                rel: tol.rel,
            });
        }

        let (use_time, use_space) = detect_global_pseudo_variables(model)?;
        let compartments = model
            .compartments
            .iter()
            .map(|spec| SimCompartment::new(spec, use_time, use_space))
            .collect::<Result<Vec<_>, _>>()?;
        let membranes = model
            .membranes
            .iter()
            .map(|spec| {
                let index_a = model
                    .compartments
                    .iter()
                    .position(|c| c.layout.id == spec.compartment_a)
                    .expect("validated membrane compartment");
                let index_b = spec.compartment_b.as_ref().map(|id| {
                    model
                        .compartments
                        .iter()
                        .position(|c| c.layout.id == *id)
                        .expect("validated membrane compartment")
                });
                SimMembrane::new(
                    spec,
                    (index_a, &model.compartments[index_a]),
                    index_b.map(|i| (i, &model.compartments[i])),
                    use_time,
                    use_space,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let pool = match options.enable_multithreading {
            false => None,
            true => {
                let num_threads = options.max_threads.unwrap_or_else(|| {
                    std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(1)
                });
                Some(
                    ThreadPoolBuilder::new()
                        .num_threads(num_threads)
                        .build()?,
                )
            }
        };

        let max_stable_timestep = compartments
            .iter()
            .map(SimCompartment::max_stable_timestep)
            .fold(f64::INFINITY, f64::min);
        let next_timestep = options.max_timestep.min(max_stable_timestep);
        let padding = usize::from(use_time) + 2 * usize::from(use_space);

        log::info!(
            "pixel simulator: {} compartments, {} membranes, {} cells, integrator {:?}, threads {}",
            compartments.len(),
            membranes.len(),
            compartments.iter().map(SimCompartment::n_cells).sum::<usize>(),
            options.integrator,
            pool.as_ref().map_or(1, ThreadPool::current_num_threads),
        );

        Ok(PixelSim {
            compartments,
            membranes,
            options,
            pool,
            padding,
            max_stable_timestep,
            next_timestep,
            discarded_steps: 0,
            last_error: None,
            t: 0.0,
            failed: false,
            error_message: String::new(),
            error_images: Vec::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Rebuilds the worker pool with an explicit thread count, enabling
    /// multithreaded evaluation if it was off.
    pub fn set_num_threads(&mut self, num_threads: usize) -> Result<(), SetupError> {
        self.pool = Some(ThreadPoolBuilder::new().num_threads(num_threads).build()?);
        Ok(())
    }

    pub fn n_compartments(&self) -> usize {
        self.compartments.len()
    }

    pub fn compartment(&self, index: usize) -> &SimCompartment {
        &self.compartments[index]
    }

    /// Simulated time advanced since construction.
    pub fn current_time(&self) -> f64 {
        self.t
    }

    /// Adaptive steps rejected and retried so far. Purely diagnostic.
    pub fn discarded_steps(&self) -> u64 {
        self.discarded_steps
    }

    /// Local error of the most recent adaptive step, accepted or not.
    pub fn last_error(&self) -> Option<RkError> {
        self.last_error
    }

    /// Overwrites one compartment's concentration field from a flat
    /// `[cell][slot]` array of the same layout as
    /// [`concentrations`](Simulator::concentrations).
    pub fn set_concentrations(
        &mut self,
        compartment: usize,
        values: &[f64],
    ) -> Result<(), SetupError> {
        self.compartments[compartment].set_concentrations(values)
    }

    /// Species concentrations of every compartment concatenated, padding
    /// slots excluded; used by steady-state convergence norms.
    pub fn species_concentration_vector(&self) -> Vec<f64> {
        let mut out = Vec::new();
        for compartment in &self.compartments {
            compartment.append_species_concentrations(&mut out);
        }
        out
    }

    /// A clonable handle to the stop flag, so another thread can cancel a
    /// running simulation.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    /// Clears a previously honoured stop request so stepping can resume.
    pub fn clear_stop(&self) {
        self.stop_requested.store(false, Ordering::Relaxed);
    }

    /// One derivative evaluation of the whole system, in the required stage
    /// order: per-compartment reactions and diffusion, then membrane
    /// contributions, then spatial averaging of non-spatial species.
    fn calculate_dcdt(&mut self) {
        for compartment in &mut self.compartments {
            compartment.refresh_pseudo_variables(self.t);
        }
        match &self.pool {
            Some(pool) => {
                for compartment in &mut self.compartments {
                    compartment
                        .evaluate_reactions_and_diffusion_parallel(pool, self.options.grain_size);
                }
            }
            None => {
                for compartment in &mut self.compartments {
                    compartment.evaluate_reactions_and_diffusion();
                }
            }
        }
        let compartments = &mut self.compartments;
        for membrane in &mut self.membranes {
            let (a, b) = pair_mut(compartments, membrane.compartment_a(), membrane.compartment_b());
            membrane.evaluate_reactions(a, b);
        }
        for compartment in &mut self.compartments {
            compartment.spatially_average_dcdt();
        }
    }

    /// RK1(0)1: forwards Euler, no error estimate, always accepted. The
    /// step is the configured `euler_dt` or the diffusion stability bound.
    fn do_euler_timestep(&mut self, dt_max: f64) -> f64 {
        let dt = dt_max.min(self.options.euler_dt.unwrap_or(self.max_stable_timestep));
        self.calculate_dcdt();
        for compartment in &mut self.compartments {
            compartment.do_forwards_euler_timestep(dt);
        }
        dt
    }

    /// RK2(1)2: Heun's method in Shu-Osher form. The first-stage solution
    /// is kept in `s2` as the embedded Euler estimate.
    fn do_rk212(&mut self, dt: f64) {
        self.calculate_dcdt();
        for compartment in &mut self.compartments {
            compartment.do_rk_init();
            compartment.do_rk_substep(dt, 1.0, 0.0, 0.0, 1.0, 0.0);
        }
        self.calculate_dcdt();
        for compartment in &mut self.compartments {
            compartment.do_rk_substep(dt, 0.5, 0.0, 0.5, 0.5, 1.0);
        }
    }

    /// RK3(2)3: the Shu-Osher SSP three-stage scheme. The embedded
    /// second-order estimate is `2 u2 - u0`, assembled in `s2`.
    fn do_rk323(&mut self, dt: f64) {
        self.calculate_dcdt();
        for compartment in &mut self.compartments {
            compartment.do_rk_init();
            compartment.do_rk_substep(dt, 1.0, 0.0, 0.0, 1.0, 0.0);
        }
        self.calculate_dcdt();
        for compartment in &mut self.compartments {
            compartment.do_rk_substep(dt, 0.25, 0.0, 0.75, 0.25, 0.0);
        }
        self.calculate_dcdt();
        for compartment in &mut self.compartments {
            compartment.do_rk_substep(dt, 2.0 / 3.0, 0.0, 1.0 / 3.0, 2.0 / 3.0, 1.0);
            compartment.do_rk_finalise(0.0, 2.0, -1.0);
        }
    }

    /// RK4(3)5: five-stage low-storage 3S* scheme with embedded third-order
    /// estimate.
    fn do_rk435(&mut self, dt: f64) {
        for compartment in &mut self.compartments {
            compartment.do_rk_init();
        }
        for i in 0..5 {
            self.calculate_dcdt();
            for compartment in &mut self.compartments {
                compartment.do_rk_substep(
                    dt,
                    RK435_G1[i],
                    RK435_G2[i],
                    RK435_G3[i],
                    RK435_BETA[i],
                    RK435_DELTA[i],
                );
            }
        }
        let delta_sum: f64 = RK435_DELTA.iter().sum();
        for compartment in &mut self.compartments {
            compartment.do_rk_finalise(
                RK435_DELTA[5] / delta_sum,
                1.0 / delta_sum,
                RK435_DELTA[6] / delta_sum,
            );
        }
    }

    /// One accepted adaptive step of at most `dt_max`. Returns the step
    /// actually taken, or 0 after a fatal non-convergence.
    fn do_rk_adaptive(&mut self, dt_max: f64) -> f64 {
        let tol = self.options.tolerances;
        let order = self.options.integrator.order();
        loop {
            let dt = self.next_timestep.min(dt_max);
            match self.options.integrator {
                IntegratorType::Rk212 => self.do_rk212(dt),
                IntegratorType::Rk323 => self.do_rk323(dt),
                IntegratorType::Rk435 => self.do_rk435(dt),
                IntegratorType::Rk101 => unreachable!("euler steps are not adaptive"),
            }
            let err = self
                .compartments
                .iter()
                .map(|c| c.calculate_rk_error(RK_EPSILON))
                .fold(RkError::default(), RkError::max);
            self.last_error = Some(err);
            if !err.abs.is_finite() || !err.rel.is_finite() {
                self.fail_non_convergence(format!(
                    "non-finite local error after step of {dt:.3e}"
                ));
                return 0.0;
            }
            let err_factor =
                (tol.abs / err.abs).min(tol.rel / err.rel).powf(1.0 / f64::from(order));
            self.next_timestep = (SAFETY_FACTOR * dt * err_factor).min(dt_max);
            if self.next_timestep < TIMESTEP_UNDERFLOW * dt_max {
                self.fail_non_convergence(format!(
                    "adaptive timestep collapsed to {:.3e}",
                    self.next_timestep
                ));
                return 0.0;
            }
            if err.abs > tol.abs || err.rel > tol.rel {
                for compartment in &mut self.compartments {
                    compartment.undo_rk_step();
                }
                self.discarded_steps += 1;
                log::trace!(
                    "discarded step dt = {dt:.3e}: err.abs = {:.3e}, err.rel = {:.3e}, retrying with {:.3e}",
                    err.abs,
                    err.rel,
                    self.next_timestep
                );
                continue;
            }
            return dt;
        }
    }

    /// Marks the simulation as numerically failed: sticky message plus a
    /// per-cell relative-error image naming the worst species.
    fn fail_non_convergence(&mut self, reason: String) {
        let max_rel = self
            .compartments
            .iter()
            .map(|c| c.calculate_rk_error(RK_EPSILON).rel)
            .fold(0.0, f64::max);
        let (width, height) = self
            .compartments
            .iter()
            .map(SimCompartment::image_extent)
            .fold((0, 0), |(w, h), (cw, ch)| (w.max(cw), h.max(ch)));
        let mut worst: Option<(String, f64)> = None;
        if width > 0 && height > 0 {
            let mut img = RgbImage::new(width, height);
            for compartment in &self.compartments {
                if let Some((slot, rel)) = compartment.plot_rk_error(&mut img, max_rel, RK_EPSILON)
                {
                    if worst.as_ref().map_or(true, |&(_, w)| rel > w) {
                        worst = Some((compartment.species_ids()[slot].clone(), rel));
                    }
                }
            }
            self.error_images.push(img);
        }
        self.failed = true;
        self.error_message = match &worst {
            Some((species, rel)) => format!(
                "Simulation failed: {reason}, max relative error {rel:.3e} for species '{species}'"
            ),
            None => format!("Simulation failed: {reason}"),
        };
        log::warn!("{}", self.error_message);
    }

    /// Advances the simulation by `time`, in one or more internal sub-steps.
    ///
    /// Stops early on a wall-clock timeout (`timeout_ms > 0`), when the
    /// cancellation predicate returns true (polled once per accepted step),
    /// when [`request_stop`](PixelSim::request_stop) was called from any
    /// thread, or on numerical non-convergence. The sticky
    /// [`error_message`](Simulator::error_message) distinguishes the four.
    /// Returns the number of completed sub-steps.
    pub fn run(
        &mut self,
        time: f64,
        timeout_ms: f64,
        stop_callback: Option<&dyn Fn() -> bool>,
    ) -> u64 {
        if self.failed {
            return 0;
        }
        self.error_message.clear();
        self.error_images.clear();
        let deadline = (timeout_ms > 0.0 && timeout_ms.is_finite())
            .then(|| Instant::now() + Duration::from_secs_f64(timeout_ms * 1e-3));
        log::debug!("run: time = {time:.3e}, timeout = {timeout_ms} ms");

        let mut elapsed = 0.0_f64;
        let mut steps = 0_u64;
        while elapsed < time * (1.0 - TIME_FRACTION_EPSILON) {
            if self.stop_requested.load(Ordering::Relaxed) {
                self.error_message = MSG_STOPPED.to_string();
                break;
            }
            let dt_max = (time - elapsed).min(self.options.max_timestep);
            let dt = match self.options.integrator {
                IntegratorType::Rk101 => self.do_euler_timestep(dt_max),
                _ => self.do_rk_adaptive(dt_max),
            };
            if self.failed {
                break;
            }
            elapsed += dt;
            self.t += dt;
            steps += 1;
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.error_message = MSG_TIMEOUT.to_string();
                    break;
                }
            }
            if let Some(callback) = stop_callback {
                if callback() {
                    self.error_message = MSG_CANCELLED.to_string();
                    break;
                }
            }
        }
        log::debug!(
            "run finished: {steps} steps, t = {:.6e}, discarded = {}",
            self.t,
            self.discarded_steps
        );
        steps
    }
}

impl Simulator for PixelSim {
    fn run(
        &mut self,
        time: f64,
        timeout_ms: f64,
        stop_callback: Option<&dyn Fn() -> bool>,
    ) -> u64 {
        PixelSim::run(self, time, timeout_ms, stop_callback)
    }

    fn concentrations(&self, compartment: usize) -> Vec<f64> {
        self.compartments[compartment].concentrations()
    }

    fn concentration_padding(&self) -> usize {
        self.padding
    }

    fn error_message(&self) -> &str {
        &self.error_message
    }

    fn error_images(&self) -> &[RgbImage] {
        &self.error_images
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::layout::CompartmentLayout;
    use crate::model::spec::{
        CompartmentSpec, InitialConcentration, ReactionSpec, SpeciesSpec,
    };
    use approx::assert_relative_eq;

    fn decay_model(k: f64) -> ModelSpec {
        let mut species = SpeciesSpec::new("A", 0.0);
        species.initial_concentration = InitialConcentration::Uniform(1.0);
        let mut reaction = ReactionSpec::new("decay", "k * A", vec![("A".into(), -1.0)]);
        reaction.parameters.push(("k".into(), k));
        ModelSpec {
            compartments: vec![CompartmentSpec {
                layout: CompartmentLayout::rectangle("c", 2, 2).unwrap(),
                pixel_width: 1.0,
                species: vec![species],
                reactions: vec![reaction],
            }],
            membranes: vec![],
        }
    }

    #[test]
    fn euler_takes_fixed_configured_steps() {
        let options = SolverOptions {
            integrator: IntegratorType::Rk101,
            euler_dt: Some(0.25),
            ..SolverOptions::default()
        };
        let mut sim = PixelSim::new(&decay_model(0.0), options).unwrap();
        let steps = sim.run(1.0, -1.0, None);
        assert_eq!(steps, 4);
        assert_relative_eq!(sim.current_time(), 1.0);
        assert!(sim.error_message().is_empty());
    }

    #[test]
    fn cancellation_callback_stops_after_one_step() {
        let options = SolverOptions {
            integrator: IntegratorType::Rk101,
            euler_dt: Some(0.01),
            ..SolverOptions::default()
        };
        let mut sim = PixelSim::new(&decay_model(1.0), options).unwrap();
        let cancel = || true;
        let steps = sim.run(10.0, -1.0, Some(&cancel));
        assert_eq!(steps, 1);
        assert_eq!(sim.error_message(), MSG_CANCELLED);
    }

    #[test]
    fn stop_request_is_honoured_and_clearable() {
        let options = SolverOptions {
            integrator: IntegratorType::Rk101,
            euler_dt: Some(0.5),
            ..SolverOptions::default()
        };
        let mut sim = PixelSim::new(&decay_model(0.0), options).unwrap();
        sim.request_stop();
        let steps = sim.run(1.0, -1.0, None);
        assert_eq!(steps, 0);
        assert_eq!(sim.error_message(), MSG_STOPPED);
        sim.clear_stop();
        assert_eq!(sim.run(1.0, -1.0, None), 2);
        assert!(sim.error_message().is_empty());
    }

    #[test]
    fn timeout_interrupts_a_long_run() {
        let options = SolverOptions {
            integrator: IntegratorType::Rk101,
            euler_dt: Some(1.0),
            ..SolverOptions::default()
        };
        let mut sim = PixelSim::new(&decay_model(0.0), options).unwrap();
        // effectively unbounded simulated time, so only the timeout can end it
        let steps = sim.run(1e15, 20.0, None);
        assert!(steps > 0);
        assert_eq!(sim.error_message(), MSG_TIMEOUT);
    }

    #[test]
    fn adaptive_decay_matches_analytic_solution() {
        for integrator in [
            IntegratorType::Rk212,
            IntegratorType::Rk323,
            IntegratorType::Rk435,
        ] {
            let options = SolverOptions {
                integrator,
                tolerances: crate::model::ErrorTolerances {
                    abs: f64::INFINITY,
                    rel: 1e-6,
                },
                ..SolverOptions::default()
            };
            let mut sim = PixelSim::new(&decay_model(1.0), options).unwrap();
            let steps = sim.run(2.0, -1.0, None);
            assert!(steps > 0);
            assert!(sim.error_message().is_empty(), "{:?}", integrator);
            let conc = Simulator::concentrations(&sim, 0);
            for &c in &conc {
                assert_relative_eq!(c, (-2.0_f64).exp(), max_relative = 1e-3);
            }
        }
    }

    #[test]
    fn invalid_tolerances_are_rejected() {
        let options = SolverOptions {
            tolerances: crate::model::ErrorTolerances { abs: 0.0, rel: 1.0 },
            ..SolverOptions::default()
        };
        assert!(matches!(
            PixelSim::new(&decay_model(1.0), options),
            Err(SetupError::InvalidTolerances { .. })
        ));
    }
}
