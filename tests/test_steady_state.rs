use pixel_rd::{
    CompartmentLayout, CompartmentSpec, InitialConcentration, IntegratorType, ModelSpec, PixelSim,
    PixelSimSteadyState, ReactionSpec, Simulator, SolverOptions, SpeciesSpec,
};

/// A single well-mixed decaying species: dA/dt = -k * A.
fn decaying_model() -> ModelSpec {
    let mut species = SpeciesSpec::new("A", 0.0);
    species.initial_concentration = InitialConcentration::Uniform(1.0);
    species.is_spatial = false;
    let mut reaction = ReactionSpec::new("decay", "k * A", vec![("A".into(), -1.0)]);
    reaction.parameters.push(("k".into(), 1.0));
    ModelSpec {
        compartments: vec![CompartmentSpec {
            layout: CompartmentLayout::rectangle("c", 1, 1).unwrap(),
            pixel_width: 1.0,
            species: vec![species],
            reactions: vec![reaction],
        }],
        membranes: vec![],
    }
}

fn options() -> SolverOptions {
    SolverOptions {
        integrator: IntegratorType::Rk101,
        euler_dt: Some(0.5),
        ..SolverOptions::default()
    }
}

#[test]
fn decaying_species_eventually_converges() {
    let sim = PixelSim::new(&decaying_model(), options()).unwrap();
    let mut steady = PixelSimSteadyState::new(sim, 1e-3, 3);
    let mut runs = 0;
    while !steady.has_converged() && runs < 100 {
        let steps = steady.run(1.0, -1.0, None);
        if steady.has_converged() {
            break;
        }
        assert!(steps > 0, "stepping stalled before convergence");
        runs += 1;
    }
    assert!(steady.has_converged(), "no convergence after {runs} runs");
    assert!(steady.latest_relative_norm() < 1e-3);
    assert!(Simulator::error_message(&steady).is_empty());
    // the concentration has fully decayed
    let conc = Simulator::concentrations(&steady, 0);
    assert!(conc[0] < 1e-12);
}

#[test]
fn injected_nan_fails_instead_of_converging() {
    let sim = PixelSim::new(&decaying_model(), options()).unwrap();
    let mut steady = PixelSimSteadyState::new(sim, 1e-3, 3);
    steady.run(1.0, -1.0, None);
    assert!(Simulator::error_message(&steady).is_empty());

    steady
        .pixel_sim_mut()
        .set_concentrations(0, &[f64::NAN])
        .unwrap();
    steady.run(1.0, -1.0, None);
    assert!(!steady.has_converged());
    assert!(!Simulator::error_message(&steady).is_empty());
    assert_eq!(steady.run(1.0, -1.0, None), 0);
}
