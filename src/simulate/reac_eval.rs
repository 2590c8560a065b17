use crate::model::spec::{ReactionSpec, RESERVED_NAMES};
use crate::simulate::SetupError;
use meval::{Context, ContextProvider, Expr};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

thread_local! {
    // Built-in functions and constants (exp, sin, pi, ...). meval's Context
    // is not Sync, so each worker thread keeps its own copy.
    static BUILTINS: Context<'static> = Context::new();
}

/// Resolves expression variables against the per-cell state slice, then the
/// reaction's named constants.
struct SlotContext<'a> {
    slots: &'a HashMap<String, usize>,
    state: &'a [f64],
    constants: &'a HashMap<String, f64>,
}

impl ContextProvider for SlotContext<'_> {
    fn get_var(&self, name: &str) -> Option<f64> {
        if let Some(&slot) = self.slots.get(name) {
            return Some(self.state[slot]);
        }
        self.constants.get(name).copied()
    }
}

/// Binds every known identifier to zero; used once at construction to
/// surface unknown identifiers before any stepping happens.
struct ProbeContext<'a> {
    known: &'a HashSet<String>,
}

impl ContextProvider for ProbeContext<'_> {
    fn get_var(&self, name: &str) -> Option<f64> {
        self.known.contains(name).then_some(0.0)
    }
}

#[derive(Debug, Clone)]
struct CompiledReaction {
    id: String,
    expr: Expr,
    /// `(output slot, stoichiometric coefficient)`
    stoich: Vec<(usize, f64)>,
    constants: HashMap<String, f64>,
}

/// Compiled reaction kinetics for a fixed ordered list of variables.
///
/// Compiles every rate expression once at construction;
/// [`evaluate`](ReacEval::evaluate) is a pure call writing one derivative
/// value per output species into the caller's buffer. All reaction rates are
/// multiplied by a uniform scale factor, used by membranes to convert a flux
/// per unit length into a volumetric rate.
#[derive(Debug, Clone)]
pub struct ReacEval {
    slots: HashMap<String, usize>,
    reactions: Vec<CompiledReaction>,
    n_outputs: usize,
    scale: f64,
}

impl ReacEval {
    /// `variables` are the input slot names in order: output species first
    /// (the first `n_outputs` slots receive derivatives), then any
    /// pseudo-variables. `constants` are names resolvable in every
    /// expression, typically constant-species values.
    pub fn new(
        variables: &[String],
        reactions: &[ReactionSpec],
        constants: &[(String, f64)],
        scale: f64,
        n_outputs: usize,
    ) -> Result<Self, SetupError> {
        let slots: HashMap<String, usize> = variables
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let shared: HashMap<String, f64> = constants.iter().cloned().collect();

        let mut compiled = Vec::with_capacity(reactions.len());
        for reaction in reactions {
            let expr = Expr::from_str(&reaction.expression).map_err(|source| {
                SetupError::ExpressionCompile {
                    reaction: reaction.id.clone(),
                    source,
                }
            })?;
            let mut reaction_constants = shared.clone();
            reaction_constants.extend(reaction.parameters.iter().cloned());
            let stoich = reaction
                .stoichiometry
                .iter()
                .map(|(species, coefficient)| {
                    let slot = slots
                        .get(species)
                        .copied()
                        .filter(|&slot| slot < n_outputs)
                        .ok_or_else(|| SetupError::UnknownIdentifier {
                            reaction: reaction.id.clone(),
                            name: species.clone(),
                        })?;
                    Ok((slot, *coefficient))
                })
                .collect::<Result<Vec<_>, SetupError>>()?;
            compiled.push(CompiledReaction {
                id: reaction.id.clone(),
                expr,
                stoich,
                constants: reaction_constants,
            });
        }

        let eval = ReacEval {
            slots,
            reactions: compiled,
            n_outputs,
            scale,
        };
        eval.check_identifiers(variables)?;
        Ok(eval)
    }

    /// Trial-evaluates every expression with all identifiers bound, so a
    /// typo in an expression fails here instead of mid-simulation.
    fn check_identifiers(&self, variables: &[String]) -> Result<(), SetupError> {
        let mut known: HashSet<String> = variables.iter().cloned().collect();
        known.extend(RESERVED_NAMES.iter().map(|s| s.to_string()));
        for reaction in &self.reactions {
            let mut bound: HashSet<String> = reaction.constants.keys().cloned().collect();
            bound.extend(known.iter().cloned());
            let probe = ProbeContext { known: &bound };
            let result =
                BUILTINS.with(|builtins| reaction.expr.eval_with_context((probe, builtins)));
            match result {
                Ok(_) => {}
                Err(meval::Error::UnknownVariable(name)) => {
                    return Err(SetupError::UnknownIdentifier {
                        reaction: reaction.id.clone(),
                        name,
                    });
                }
                Err(source) => {
                    return Err(SetupError::ExpressionCompile {
                        reaction: reaction.id.clone(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of output slots written by [`evaluate`](ReacEval::evaluate).
    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    /// Evaluates all reaction-rate contributions at one spatial location.
    ///
    /// `input` holds one value per variable; the first `n_outputs` entries
    /// of `output` receive `scale * sum_r stoich(s, r) * rate_r`. Entries
    /// past `n_outputs` are left untouched.
    pub fn evaluate(&self, output: &mut [f64], input: &[f64]) {
        output[..self.n_outputs].fill(0.0);
        BUILTINS.with(|builtins| {
            for reaction in &self.reactions {
                let ctx = SlotContext {
                    slots: &self.slots,
                    state: input,
                    constants: &reaction.constants,
                };
                // Expressions are validated at construction; a non-finite
                // result here (e.g. division by zero) propagates as NaN and
                // is caught by the integrator's error control.
                let rate = reaction
                    .expr
                    .eval_with_context((ctx, builtins))
                    .unwrap_or(f64::NAN);
                for &(slot, coefficient) in &reaction.stoich {
                    output[slot] += self.scale * coefficient * rate;
                }
            }
        });
    }
}

/// Determines whether a reaction expression references the time or space
/// pseudo-variables, given every other known identifier.
pub(crate) fn detect_pseudo_variables(
    reaction: &ReactionSpec,
    known: &HashSet<String>,
) -> Result<(bool, bool), SetupError> {
    let expr =
        Expr::from_str(&reaction.expression).map_err(|source| SetupError::ExpressionCompile {
            reaction: reaction.id.clone(),
            source,
        })?;
    let mut bound: HashSet<String> = known.clone();
    bound.extend(reaction.parameters.iter().map(|(name, _)| name.clone()));
    let mut uses_time = false;
    let mut uses_space = false;
    // Each failed evaluation reports one unknown variable; bind it and retry
    // until the expression evaluates or a genuinely unknown name appears.
    for _ in 0..=RESERVED_NAMES.len() {
        let outcome = BUILTINS.with(|builtins| {
            let probe = ProbeContext { known: &bound };
            expr.eval_with_context((probe, builtins))
        });
        match outcome {
            Ok(_) => return Ok((uses_time, uses_space)),
            Err(meval::Error::UnknownVariable(name)) => {
                match name.as_str() {
                    "t" => uses_time = true,
                    "x" | "y" => uses_space = true,
                    _ => {
                        return Err(SetupError::UnknownIdentifier {
                            reaction: reaction.id.clone(),
                            name,
                        });
                    }
                }
                bound.insert(name);
            }
            Err(source) => {
                return Err(SetupError::ExpressionCompile {
                    reaction: reaction.id.clone(),
                    source,
                });
            }
        }
    }
    Ok((uses_time, uses_space))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn names(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn evaluates_mass_action_with_parameters_and_scale() {
        let mut reaction = ReactionSpec::new(
            "r1",
            "k * A * B",
            vec![("A".into(), -1.0), ("B".into(), -1.0), ("C".into(), 2.0)],
        );
        reaction.parameters.push(("k".into(), 3.0));
        let eval = ReacEval::new(&names(&["A", "B", "C"]), &[reaction], &[], 0.5, 3).unwrap();

        let mut out = vec![f64::NAN; 3];
        eval.evaluate(&mut out, &[2.0, 4.0, 0.0]);
        // rate = 3 * 2 * 4 = 24, scaled by 0.5
        assert_relative_eq!(out[0], -12.0);
        assert_relative_eq!(out[1], -12.0);
        assert_relative_eq!(out[2], 24.0);
    }

    #[test]
    fn constant_species_resolve_as_named_constants() {
        let reaction = ReactionSpec::new("r1", "E * A", vec![("A".into(), -1.0)]);
        let eval = ReacEval::new(
            &names(&["A"]),
            &[reaction],
            &[("E".to_string(), 10.0)],
            1.0,
            1,
        )
        .unwrap();
        let mut out = [0.0];
        eval.evaluate(&mut out, &[0.5]);
        assert_relative_eq!(out[0], -5.0);
    }

    #[test]
    fn builtin_functions_are_available() {
        let reaction = ReactionSpec::new("r1", "exp(-A) + sin(0) + pi * 0", vec![("A".into(), 1.0)]);
        let eval = ReacEval::new(&names(&["A"]), &[reaction], &[], 1.0, 1).unwrap();
        let mut out = [0.0];
        eval.evaluate(&mut out, &[0.0]);
        assert_relative_eq!(out[0], 1.0);
    }

    #[test]
    fn parse_error_is_fatal_at_construction() {
        let reaction = ReactionSpec::new("bad", "A + * 2", vec![("A".into(), 1.0)]);
        let err = ReacEval::new(&names(&["A"]), &[reaction], &[], 1.0, 1).unwrap_err();
        assert!(matches!(err, SetupError::ExpressionCompile { .. }));
    }

    #[test]
    fn unknown_identifier_is_fatal_at_construction() {
        let reaction = ReactionSpec::new("bad", "A * missing", vec![("A".into(), 1.0)]);
        let err = ReacEval::new(&names(&["A"]), &[reaction], &[], 1.0, 1).unwrap_err();
        match err {
            SetupError::UnknownIdentifier { name, .. } => assert_eq!(name, "missing"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn pseudo_variable_detection() {
        let known: HashSet<String> = ["A".to_string()].into();
        let reaction = ReactionSpec::new("r", "A * t", vec![]);
        assert_eq!(
            detect_pseudo_variables(&reaction, &known).unwrap(),
            (true, false)
        );
        let reaction = ReactionSpec::new("r", "A * x + y", vec![]);
        assert_eq!(
            detect_pseudo_variables(&reaction, &known).unwrap(),
            (false, true)
        );
        let reaction = ReactionSpec::new("r", "A", vec![]);
        assert_eq!(
            detect_pseudo_variables(&reaction, &known).unwrap(),
            (false, false)
        );
        let reaction = ReactionSpec::new("r", "A * oops", vec![]);
        assert!(detect_pseudo_variables(&reaction, &known).is_err());
    }

    #[test]
    fn zero_reactions_write_zero_derivatives() {
        let eval = ReacEval::new(&names(&["A"]), &[], &[], 1.0, 1).unwrap();
        let mut out = [f64::NAN];
        eval.evaluate(&mut out, &[1.0]);
        assert_eq!(out[0], 0.0);
    }
}
