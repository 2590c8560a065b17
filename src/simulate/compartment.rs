use crate::model::layout::CompartmentLayout;
use crate::model::spec::{CompartmentSpec, InitialConcentration};
use crate::simulate::reac_eval::{detect_pseudo_variables, ReacEval};
use crate::simulate::SetupError;
use image::{Rgb, RgbImage};
use ndarray::Array2;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::HashSet;

/// Maximum local error of one adaptive step, both absolute and relative.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RkError {
    pub abs: f64,
    pub rel: f64,
}

impl RkError {
    /// Componentwise maximum, used to combine per-compartment errors into
    /// the global one.
    pub fn max(self, other: RkError) -> RkError {
        RkError {
            abs: self.abs.max(other.abs),
            rel: self.rel.max(other.rel),
        }
    }
}

/// Simulation state of one compartment: the concentration field, derivative
/// and integrator scratch buffers, diffusion constants and compiled reaction
/// kinetics for every non-constant species.
///
/// All buffers share the shape `(n_cells, stride)` where
/// `stride = n_species + padding`; the padding slots carry the time/space
/// pseudo-variables when any reaction references them. Every operation here
/// mutates only this compartment's own arrays; cross-compartment coupling
/// happens exclusively through [`SimMembrane`](crate::simulate::SimMembrane).
#[derive(Debug, Clone)]
pub struct SimCompartment {
    layout: CompartmentLayout,
    species_ids: Vec<String>,
    is_spatial: Vec<bool>,
    /// Diffusion constants divided by the pixel width squared.
    diff: Vec<f64>,
    reac_eval: ReacEval,
    n_species: usize,
    padding: usize,
    stride: usize,
    pixel_width: f64,
    use_time: bool,
    use_space: bool,
    conc: Array2<f64>,
    dcdt: Array2<f64>,
    s2: Array2<f64>,
    s3: Array2<f64>,
    max_stable_timestep: f64,
}

fn flat(a: &Array2<f64>) -> &[f64] {
    a.as_slice().expect("owned arrays are standard layout")
}

fn flat_mut(a: &mut Array2<f64>) -> &mut [f64] {
    a.as_slice_mut().expect("owned arrays are standard layout")
}

/// Reaction plus 6-point Laplacian for a contiguous range of cells. The
/// Laplacian is accumulated as a sum of neighbour differences, so a
/// self-referencing (no-flux) neighbour contributes exactly zero and a
/// uniform field has an exactly zero Laplacian.
fn evaluate_cells(
    out: &mut [f64],
    first_cell: usize,
    conc: &[f64],
    reac_eval: &ReacEval,
    diff: &[f64],
    layout: &CompartmentLayout,
    stride: usize,
) {
    if stride == 0 {
        // every species is constant, nothing to integrate
        return;
    }
    for (row, out_row) in out.chunks_mut(stride).enumerate() {
        let cell = first_cell + row;
        let input = &conc[cell * stride..(cell + 1) * stride];
        reac_eval.evaluate(out_row, input);
        for (s, &d) in diff.iter().enumerate() {
            if d == 0.0 {
                continue;
            }
            let c = input[s];
            let lap = (conc[layout.up_x[cell] * stride + s] - c)
                + (conc[layout.dn_x[cell] * stride + s] - c)
                + (conc[layout.up_y[cell] * stride + s] - c)
                + (conc[layout.dn_y[cell] * stride + s] - c)
                + (conc[layout.up_z[cell] * stride + s] - c)
                + (conc[layout.dn_z[cell] * stride + s] - c);
            out_row[s] += d * lap;
        }
    }
}

impl SimCompartment {
    /// Builds the compartment state from its read-only description.
    ///
    /// `use_time`/`use_space` request padding slots for the pseudo-variables
    /// even if this compartment's own reactions do not reference them (the
    /// simulator keeps the padding uniform across compartments); usage by
    /// this compartment's reactions is detected here and added on top.
    pub fn new(
        spec: &CompartmentSpec,
        use_time: bool,
        use_space: bool,
    ) -> Result<Self, SetupError> {
        spec.layout
            .validate()
            .map_err(crate::model::ModelError::from)?;
        let n_cells = spec.layout.n_cells();

        let mut species_ids = Vec::new();
        let mut is_spatial = Vec::new();
        let mut diff = Vec::new();
        let mut initial = Vec::new();
        let mut constants = Vec::new();
        for species in &spec.species {
            if species.is_constant {
                let value = match species.initial_concentration {
                    InitialConcentration::Uniform(v) => v,
                    // rejected by ModelSpec::validate
                    InitialConcentration::PerCell(_) => 0.0,
                };
                constants.push((species.id.clone(), value));
            } else {
                species_ids.push(species.id.clone());
                is_spatial.push(species.is_spatial);
                diff.push(species.diffusion_constant / (spec.pixel_width * spec.pixel_width));
                initial.push(species.initial_concentration.clone());
            }
        }
        let n_species = species_ids.len();

        let mut known: HashSet<String> = spec.species.iter().map(|s| s.id.clone()).collect();
        known.extend(constants.iter().map(|(name, _)| name.clone()));
        let mut use_time = use_time;
        let mut use_space = use_space;
        for reaction in &spec.reactions {
            let (t, s) = detect_pseudo_variables(reaction, &known)?;
            use_time |= t;
            use_space |= s;
        }

        let mut variables = species_ids.clone();
        if use_time {
            variables.push("t".to_string());
        }
        if use_space {
            variables.push("x".to_string());
            variables.push("y".to_string());
        }
        let reac_eval = ReacEval::new(&variables, &spec.reactions, &constants, 1.0, n_species)?;

        let padding = usize::from(use_time) + 2 * usize::from(use_space);
        let stride = n_species + padding;
        let mut conc = Array2::zeros((n_cells, stride));
        for (s, init) in initial.iter().enumerate() {
            match init {
                InitialConcentration::Uniform(v) => conc.column_mut(s).fill(*v),
                InitialConcentration::PerCell(samples) => {
                    for (cell, &v) in samples.iter().enumerate() {
                        conc[(cell, s)] = v;
                    }
                }
            }
        }

        let max_stable_timestep = diff
            .iter()
            .filter(|&&d| d > 0.0)
            .map(|&d| 1.0 / (4.0 * d))
            .fold(f64::INFINITY, f64::min);

        let mut compartment = SimCompartment {
            layout: spec.layout.clone(),
            species_ids,
            is_spatial,
            diff,
            reac_eval,
            n_species,
            padding,
            stride,
            pixel_width: spec.pixel_width,
            use_time,
            use_space,
            conc,
            dcdt: Array2::zeros((n_cells, stride)),
            s2: Array2::zeros((n_cells, stride)),
            s3: Array2::zeros((n_cells, stride)),
            max_stable_timestep,
        };
        compartment.refresh_pseudo_variables(0.0);
        Ok(compartment)
    }

    pub fn id(&self) -> &str {
        &self.layout.id
    }

    pub fn n_cells(&self) -> usize {
        self.layout.n_cells()
    }

    /// Non-constant species, in slot order.
    pub fn species_ids(&self) -> &[String] {
        &self.species_ids
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    /// Extra non-species slots per cell.
    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Concentration field, shape `(n_cells, stride)`.
    pub fn conc(&self) -> &Array2<f64> {
        &self.conc
    }

    /// Derivative field from the most recent evaluation.
    pub fn dcdt(&self) -> &Array2<f64> {
        &self.dcdt
    }

    /// Largest explicit time step for which forwards-Euler diffusion is
    /// stable in this compartment.
    pub fn max_stable_timestep(&self) -> f64 {
        self.max_stable_timestep
    }

    /// Overwrites the concentration field from a flat `[cell][slot]` array.
    pub fn set_concentrations(&mut self, values: &[f64]) -> Result<(), SetupError> {
        let expected = self.conc.len();
        if values.len() != expected {
            return Err(SetupError::ConcentrationLength {
                got: values.len(),
                expected,
            });
        }
        flat_mut(&mut self.conc).copy_from_slice(values);
        Ok(())
    }

    /// Writes the pseudo-variable slots (current time, physical cell
    /// coordinates) of every cell. Called before each derivative
    /// evaluation; also re-anchors the coordinate slots against the
    /// floating-point drift of the integrator's affine combinations.
    pub(crate) fn refresh_pseudo_variables(&mut self, t: f64) {
        if self.padding == 0 {
            return;
        }
        let n_species = self.n_species;
        let use_time = self.use_time;
        let use_space = self.use_space;
        let pixel_width = self.pixel_width;
        let points = &self.layout.cell_points;
        for (cell, mut row) in self.conc.rows_mut().into_iter().enumerate() {
            let mut slot = n_species;
            if use_time {
                row[slot] = t;
                slot += 1;
            }
            if use_space {
                let (px, py) = points.get(cell).copied().unwrap_or((0, 0));
                row[slot] = f64::from(px) * pixel_width;
                row[slot + 1] = f64::from(py) * pixel_width;
            }
        }
    }

    /// Evaluates reactions and the discrete Laplacian into `dcdt` for every
    /// cell, sequentially.
    pub fn evaluate_reactions_and_diffusion(&mut self) {
        let stride = self.stride;
        let Self {
            conc,
            dcdt,
            reac_eval,
            diff,
            layout,
            ..
        } = self;
        let conc = flat(conc);
        let out = flat_mut(dcdt);
        evaluate_cells(out, 0, conc, reac_eval, diff, layout, stride);
    }

    /// Parallel variant: cells are partitioned into fixed-size chunks
    /// processed independently on the pool. Chunks write disjoint `dcdt`
    /// rows and read the shared `conc` field, so no synchronisation is
    /// needed and results are identical to the sequential variant.
    pub fn evaluate_reactions_and_diffusion_parallel(
        &mut self,
        pool: &ThreadPool,
        grain_size: usize,
    ) {
        let stride = self.stride;
        if stride == 0 {
            return;
        }
        let grain = grain_size.max(1);
        let Self {
            conc,
            dcdt,
            reac_eval,
            diff,
            layout,
            ..
        } = self;
        let conc: &[f64] = flat(conc);
        let out = flat_mut(dcdt);
        let reac_eval: &ReacEval = reac_eval;
        let diff: &[f64] = diff;
        let layout: &CompartmentLayout = layout;
        pool.install(|| {
            out.par_chunks_mut(grain * stride)
                .enumerate()
                .for_each(|(chunk, out_chunk)| {
                    evaluate_cells(
                        out_chunk,
                        chunk * grain,
                        conc,
                        reac_eval,
                        diff,
                        layout,
                        stride,
                    );
                });
        });
    }

    /// Replaces `dcdt` of every non-spatial species by its mean over all
    /// cells, approximating instantaneous mixing.
    pub fn spatially_average_dcdt(&mut self) {
        let n_cells = self.layout.n_cells();
        for (s, _) in self.is_spatial.iter().enumerate().filter(|(_, &sp)| !sp) {
            let mean = self.dcdt.column(s).sum() / n_cells as f64;
            self.dcdt.column_mut(s).fill(mean);
        }
    }

    /// `conc += dt * dcdt`.
    pub fn do_forwards_euler_timestep(&mut self, dt: f64) {
        let Self { conc, dcdt, .. } = self;
        let conc = flat_mut(conc);
        let dcdt = flat(dcdt);
        for (c, &d) in conc.iter_mut().zip(dcdt) {
            *c += dt * d;
        }
    }

    /// Snapshots `conc` into `s3` and zeroes `s2`, starting a multi-stage
    /// step.
    pub fn do_rk_init(&mut self) {
        self.s3.assign(&self.conc);
        self.s2.fill(0.0);
    }

    /// One low-storage stage:
    /// `s2 += delta * conc`, then
    /// `conc = g1 * conc + g2 * s2 + g3 * s3 + beta * dt * dcdt`.
    pub fn do_rk_substep(&mut self, dt: f64, g1: f64, g2: f64, g3: f64, beta: f64, delta: f64) {
        let beta_dt = beta * dt;
        let Self { conc, dcdt, s2, s3, .. } = self;
        let conc = flat_mut(conc);
        let s2 = flat_mut(s2);
        let s3 = flat(s3);
        let dcdt = flat(dcdt);
        for i in 0..conc.len() {
            s2[i] += delta * conc[i];
            conc[i] = g1 * conc[i] + g2 * s2[i] + g3 * s3[i] + beta_dt * dcdt[i];
        }
    }

    /// Writes the embedded lower-order estimate into `s2`:
    /// `s2 = c_factor * conc + s2_factor * s2 + s3_factor * s3`.
    pub fn do_rk_finalise(&mut self, c_factor: f64, s2_factor: f64, s3_factor: f64) {
        let Self { conc, s2, s3, .. } = self;
        let conc = flat(conc);
        let s2 = flat_mut(s2);
        let s3 = flat(s3);
        for i in 0..s2.len() {
            s2[i] = c_factor * conc[i] + s2_factor * s2[i] + s3_factor * s3[i];
        }
    }

    /// Restores `conc` from the `s3` snapshot after a rejected step.
    pub fn undo_rk_step(&mut self) {
        self.conc.assign(&self.s3);
    }

    /// Maximum difference between `conc` and the embedded lower-order
    /// estimate in `s2`, absolute and relative. The relative error is
    /// normalised by `0.5 * (conc + s3 + epsilon)`, which avoids division by
    /// zero near zero concentration. Padding slots are excluded.
    pub fn calculate_rk_error(&self, epsilon: f64) -> RkError {
        let conc = flat(&self.conc);
        let s2 = flat(&self.s2);
        let s3 = flat(&self.s3);
        let mut err = RkError::default();
        for cell in 0..self.layout.n_cells() {
            let base = cell * self.stride;
            for s in 0..self.n_species {
                let i = base + s;
                let diff = (conc[i] - s2[i]).abs();
                err.abs = err.abs.max(diff);
                err.rel = err.rel.max(diff / (0.5 * (conc[i] + s3[i] + epsilon)));
            }
        }
        err
    }

    /// Paints the per-cell relative error into `img` (green = no error, red
    /// = `max_rel_err`) and returns the species slot and value of the worst
    /// error, if any.
    pub fn plot_rk_error(
        &self,
        img: &mut RgbImage,
        max_rel_err: f64,
        epsilon: f64,
    ) -> Option<(usize, f64)> {
        let conc = flat(&self.conc);
        let s2 = flat(&self.s2);
        let s3 = flat(&self.s3);
        let mut worst: Option<(usize, f64)> = None;
        for (cell, &(px, py)) in self.layout.cell_points.iter().enumerate() {
            let base = cell * self.stride;
            let mut cell_err = 0.0_f64;
            for s in 0..self.n_species {
                let i = base + s;
                let rel = (conc[i] - s2[i]).abs() / (0.5 * (conc[i] + s3[i] + epsilon));
                cell_err = cell_err.max(rel);
                if worst.map_or(true, |(_, w)| rel > w) {
                    worst = Some((s, rel));
                }
            }
            let intensity = if max_rel_err > 0.0 {
                (cell_err / max_rel_err).clamp(0.0, 1.0)
            } else {
                0.0
            };
            if px < img.width() && py < img.height() {
                let r = (255.0 * intensity) as u8;
                let g = (255.0 * (1.0 - intensity)) as u8;
                img.put_pixel(px, py, Rgb([r, g, 0]));
            }
        }
        worst
    }

    /// Flat clone of the concentration field, `[cell][slot]` order.
    pub fn concentrations(&self) -> Vec<f64> {
        flat(&self.conc).to_vec()
    }

    /// Smallest image size covering this compartment's cell points;
    /// `(0, 0)` when no points are available.
    pub(crate) fn image_extent(&self) -> (u32, u32) {
        self.layout
            .cell_points
            .iter()
            .fold((0, 0), |(w, h), &(x, y)| (w.max(x + 1), h.max(y + 1)))
    }

    /// Full `[slot]` row of one cell, species then padding.
    pub(crate) fn row(&self, cell: usize) -> &[f64] {
        let base = cell * self.stride;
        &flat(&self.conc)[base..base + self.stride]
    }

    /// Adds one rate per species into a cell's `dcdt` row.
    pub(crate) fn add_rates(&mut self, cell: usize, rates: &[f64]) {
        let base = cell * self.stride;
        let dcdt = flat_mut(&mut self.dcdt);
        for (s, &rate) in rates.iter().enumerate() {
            dcdt[base + s] += rate;
        }
    }

    /// Appends the species concentrations (padding excluded) of every cell
    /// to `out`; used for global norms.
    pub(crate) fn append_species_concentrations(&self, out: &mut Vec<f64>) {
        let conc = flat(&self.conc);
        for cell in 0..self.layout.n_cells() {
            let base = cell * self.stride;
            out.extend_from_slice(&conc[base..base + self.n_species]);
        }
    }
}
