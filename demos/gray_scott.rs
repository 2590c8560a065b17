//! Gray-Scott pattern formation on a 128x128 plate.
//!
//! Runs the classic two-species autocatalytic system to t = 2000 with
//! forwards Euler and writes the final `v` field to `gray_scott.png`.
//!
//!     cargo run --release --example gray_scott

use pixel_rd::{
    CompartmentLayout, CompartmentSpec, InitialConcentration, IntegratorType, ModelSpec, PixelSim,
    ReactionSpec, Simulator, SolverOptions, SpeciesSpec,
};

const N: usize = 128;

fn model() -> ModelSpec {
    let mut u = SpeciesSpec::new("u", 0.16);
    u.initial_concentration = InitialConcentration::Uniform(1.0);

    // a small seed square of the activator in the middle of the plate
    let mut v = SpeciesSpec::new("v", 0.08);
    let mut v_init = vec![0.0; N * N];
    for y in N / 2 - 4..N / 2 + 4 {
        for x in N / 2 - 4..N / 2 + 4 {
            v_init[y * N + x] = 0.5;
        }
    }
    v.initial_concentration = InitialConcentration::PerCell(v_init);

    let autocatalysis = ReactionSpec::new(
        "autocatalysis",
        "u * v^2",
        vec![("u".into(), -1.0), ("v".into(), 1.0)],
    );
    let mut feed = ReactionSpec::new("feed", "f * (1 - u)", vec![("u".into(), 1.0)]);
    feed.parameters.push(("f".into(), 0.035));
    let mut kill = ReactionSpec::new("kill", "(f + kd) * v", vec![("v".into(), -1.0)]);
    kill.parameters.push(("f".into(), 0.035));
    kill.parameters.push(("kd".into(), 0.065));

    ModelSpec {
        compartments: vec![CompartmentSpec {
            layout: CompartmentLayout::rectangle("plate", N, N).unwrap(),
            pixel_width: 1.0,
            species: vec![u, v],
            reactions: vec![autocatalysis, feed, kill],
        }],
        membranes: vec![],
    }
}

fn main() {
    env_logger::init();

    let options = SolverOptions {
        integrator: IntegratorType::Rk101,
        euler_dt: Some(1.0),
        enable_multithreading: true,
        ..SolverOptions::default()
    };
    let mut sim = PixelSim::new(&model(), options).expect("model is valid");

    for _ in 0..20 {
        let steps = sim.run(100.0, -1.0, None);
        if !sim.error_message().is_empty() {
            eprintln!("simulation stopped: {}", sim.error_message());
            return;
        }
        println!(
            "t = {:6.0}  ({} steps in this chunk)",
            sim.current_time(),
            steps
        );
    }

    // paint the v field; stride is 2 (u, v), no padding for these kinetics
    let conc = Simulator::concentrations(&sim, 0);
    let v_max = conc
        .chunks(2)
        .map(|cell| cell[1])
        .fold(f64::MIN_POSITIVE, f64::max);
    let mut img = image::RgbImage::new(N as u32, N as u32);
    for (cell, chunk) in conc.chunks(2).enumerate() {
        let value = (chunk[1] / v_max).clamp(0.0, 1.0);
        let level = (255.0 * value) as u8;
        let (x, y) = ((cell % N) as u32, (cell / N) as u32);
        img.put_pixel(x, y, image::Rgb([level, level / 2, 255 - level]));
    }
    img.save("gray_scott.png").expect("write png");
    println!("wrote gray_scott.png");
}
