use crate::model::spec::{CompartmentSpec, InitialConcentration, MembraneSpec};
use crate::simulate::compartment::SimCompartment;
use crate::simulate::reac_eval::ReacEval;
use crate::simulate::SetupError;

/// Flux/transport kinetics between two adjacent compartments, applied at
/// their paired boundary cells.
///
/// Holds non-owning indices into the simulator's compartment collection;
/// the simulator resolves them and passes the units in for evaluation. A
/// membrane may reference only one real compartment when the other side is
/// outside the simulated domain.
#[derive(Debug, Clone)]
pub struct SimMembrane {
    id: String,
    comp_a: usize,
    comp_b: Option<usize>,
    pairs: Vec<(usize, usize)>,
    reac_eval: ReacEval,
    n_a: usize,
    n_b: usize,
    padding: usize,
    scratch_in: Vec<f64>,
    scratch_out: Vec<f64>,
}

fn non_constant_ids(spec: &CompartmentSpec) -> Vec<String> {
    spec.species
        .iter()
        .filter(|s| !s.is_constant)
        .map(|s| s.id.clone())
        .collect()
}

fn constant_values(spec: &CompartmentSpec, out: &mut Vec<(String, f64)>) {
    for species in spec.species.iter().filter(|s| s.is_constant) {
        let value = match species.initial_concentration {
            InitialConcentration::Uniform(v) => v,
            InitialConcentration::PerCell(_) => 0.0, // rejected by validation
        };
        out.push((species.id.clone(), value));
    }
}

impl SimMembrane {
    /// Compiles the membrane kinetics over the joint species vector:
    /// compartment A species, compartment B species, then any time/space
    /// pseudo-variables (shared with the compartments).
    pub fn new(
        spec: &MembraneSpec,
        comp_a: (usize, &CompartmentSpec),
        comp_b: Option<(usize, &CompartmentSpec)>,
        use_time: bool,
        use_space: bool,
    ) -> Result<Self, SetupError> {
        let (index_a, spec_a) = comp_a;
        let ids_a = non_constant_ids(spec_a);
        let ids_b = comp_b.map(|(_, s)| non_constant_ids(s)).unwrap_or_default();
        let n_a = ids_a.len();
        let n_b = ids_b.len();

        let mut variables = ids_a;
        variables.extend(ids_b);
        if use_time {
            variables.push("t".to_string());
        }
        if use_space {
            variables.push("x".to_string());
            variables.push("y".to_string());
        }
        let mut constants = Vec::new();
        constant_values(spec_a, &mut constants);
        if let Some((_, spec_b)) = comp_b {
            constant_values(spec_b, &mut constants);
        }

        let reac_eval = ReacEval::new(
            &variables,
            &spec.reactions,
            &constants,
            spec.rate_scale,
            n_a + n_b,
        )?;

        let padding = usize::from(use_time) + 2 * usize::from(use_space);
        Ok(SimMembrane {
            id: spec.id.clone(),
            comp_a: index_a,
            comp_b: comp_b.map(|(index, _)| index),
            pairs: spec.cell_pairs.clone(),
            reac_eval,
            n_a,
            n_b,
            padding,
            scratch_in: vec![0.0; n_a + n_b + padding],
            scratch_out: vec![0.0; n_a + n_b],
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Index of compartment A in the simulator's compartment collection.
    pub fn compartment_a(&self) -> usize {
        self.comp_a
    }

    /// Index of compartment B, `None` for a membrane to the outside.
    pub fn compartment_b(&self) -> Option<usize> {
        self.comp_b
    }

    /// Evaluates the membrane kinetics at every paired boundary cell and
    /// adds the resulting rates into both compartments' `dcdt`.
    ///
    /// Must run after each compartment's own reaction/diffusion evaluation
    /// (it adds, never overwrites) and before any time-stepping primitive.
    pub fn evaluate_reactions(
        &mut self,
        comp_a: &mut SimCompartment,
        mut comp_b: Option<&mut SimCompartment>,
    ) {
        for &(cell_a, cell_b) in &self.pairs {
            let row_a = comp_a.row(cell_a);
            self.scratch_in[..self.n_a].copy_from_slice(&row_a[..self.n_a]);
            if self.padding > 0 {
                let pads = &row_a[comp_a.n_species()..comp_a.n_species() + self.padding];
                self.scratch_in[self.n_a + self.n_b..].copy_from_slice(pads);
            }
            if let Some(b) = comp_b.as_deref() {
                self.scratch_in[self.n_a..self.n_a + self.n_b]
                    .copy_from_slice(&b.row(cell_b)[..self.n_b]);
            }
            self.reac_eval
                .evaluate(&mut self.scratch_out, &self.scratch_in);
            comp_a.add_rates(cell_a, &self.scratch_out[..self.n_a]);
            if let Some(b) = comp_b.as_deref_mut() {
                b.add_rates(cell_b, &self.scratch_out[self.n_a..]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::layout::CompartmentLayout;
    use crate::model::spec::{ReactionSpec, SpeciesSpec};
    use approx::assert_relative_eq;

    fn compartment(id: &str, species: &str, n: usize, init: f64) -> CompartmentSpec {
        let mut sp = SpeciesSpec::new(species, 0.0);
        sp.initial_concentration = InitialConcentration::Uniform(init);
        CompartmentSpec {
            layout: CompartmentLayout::rectangle(id, n, 1).unwrap(),
            pixel_width: 1.0,
            species: vec![sp],
            reactions: vec![],
        }
    }

    #[test]
    fn transfer_rates_are_added_to_both_compartments() {
        let spec_a = compartment("left", "A", 3, 1.0);
        let spec_b = compartment("right", "B", 2, 0.0);
        let mut reaction = ReactionSpec::new(
            "transfer",
            "k * A",
            vec![("A".into(), -1.0), ("B".into(), 1.0)],
        );
        reaction.parameters.push(("k".into(), 2.0));
        let membrane_spec = MembraneSpec {
            id: "m".into(),
            compartment_a: "left".into(),
            compartment_b: Some("right".into()),
            cell_pairs: vec![(2, 0)],
            reactions: vec![reaction],
            rate_scale: 0.5,
        };

        let mut comp_a = SimCompartment::new(&spec_a, false, false).unwrap();
        let mut comp_b = SimCompartment::new(&spec_b, false, false).unwrap();
        let mut membrane =
            SimMembrane::new(&membrane_spec, (0, &spec_a), Some((1, &spec_b)), false, false)
                .unwrap();

        comp_a.evaluate_reactions_and_diffusion();
        comp_b.evaluate_reactions_and_diffusion();
        membrane.evaluate_reactions(&mut comp_a, Some(&mut comp_b));

        // rate = scale * k * A = 0.5 * 2 * 1 = 1, at the paired cells only
        assert_relative_eq!(comp_a.dcdt()[(2, 0)], -1.0);
        assert_relative_eq!(comp_b.dcdt()[(0, 0)], 1.0);
        assert_eq!(comp_a.dcdt()[(0, 0)], 0.0);
        assert_eq!(comp_a.dcdt()[(1, 0)], 0.0);
        assert_eq!(comp_b.dcdt()[(1, 0)], 0.0);
    }

    #[test]
    fn outside_membrane_touches_only_compartment_a() {
        let spec_a = compartment("cells", "A", 2, 3.0);
        let membrane_spec = MembraneSpec {
            id: "m".into(),
            compartment_a: "cells".into(),
            compartment_b: None,
            cell_pairs: vec![(1, 0)],
            reactions: vec![ReactionSpec::new("efflux", "A", vec![("A".into(), -1.0)])],
            rate_scale: 1.0,
        };
        let mut comp_a = SimCompartment::new(&spec_a, false, false).unwrap();
        let mut membrane =
            SimMembrane::new(&membrane_spec, (0, &spec_a), None, false, false).unwrap();
        comp_a.evaluate_reactions_and_diffusion();
        membrane.evaluate_reactions(&mut comp_a, None);
        assert_relative_eq!(comp_a.dcdt()[(1, 0)], -3.0);
        assert_eq!(comp_a.dcdt()[(0, 0)], 0.0);
    }
}
