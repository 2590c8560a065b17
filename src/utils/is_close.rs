use ndarray::{ArrayBase, Data, Dimension};

/// Elementwise closeness check with combined absolute/relative tolerance,
/// reporting every offending element on failure.
pub trait IsClose<Rhs: ?Sized = Self> {
    fn is_close(&self, other: &Rhs, abs_tol: f64, rel_tol: f64) -> Result<(), String>;
}

fn scalar_close(a: f64, b: f64, abs_tol: f64, rel_tol: f64) -> Option<String> {
    let abs_diff = (a - b).abs();
    let max_abs = a.abs().max(b.abs());
    let tolerance = rel_tol.mul_add(max_abs, abs_tol).max(abs_tol);
    (abs_diff > tolerance || abs_diff.is_nan())
        .then(|| format!("actual {a}, expected {b}, abs_diff {abs_diff}, tolerance {tolerance}"))
}

impl IsClose<f64> for f64 {
    fn is_close(&self, other: &f64, abs_tol: f64, rel_tol: f64) -> Result<(), String> {
        match scalar_close(*self, *other, abs_tol, rel_tol) {
            Some(err) => Err(format!("Scalar differs: {err}")),
            None => Ok(()),
        }
    }
}

impl IsClose<[f64]> for [f64] {
    fn is_close(&self, other: &[f64], abs_tol: f64, rel_tol: f64) -> Result<(), String> {
        if self.len() != other.len() {
            return Err(format!(
                "Slice lengths differ: actual {}, expected {}",
                self.len(),
                other.len()
            ));
        }
        let errors: Vec<String> = self
            .iter()
            .zip(other)
            .enumerate()
            .filter_map(|(idx, (a, b))| {
                scalar_close(*a, *b, abs_tol, rel_tol)
                    .map(|err| format!("Element at index {idx} differs: {err}"))
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("\n"))
        }
    }
}

impl<S1, S2, D> IsClose<ArrayBase<S2, D>> for ArrayBase<S1, D>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    D: Dimension,
{
    fn is_close(&self, other: &ArrayBase<S2, D>, abs_tol: f64, rel_tol: f64) -> Result<(), String> {
        if self.shape() != other.shape() {
            return Err(format!(
                "Array shapes differ: actual {:?}, expected {:?}",
                self.shape(),
                other.shape()
            ));
        }
        let errors: Vec<String> = self
            .iter()
            .zip(other.iter())
            .enumerate()
            .filter_map(|(idx, (a, b))| {
                scalar_close(*a, *b, abs_tol, rel_tol)
                    .map(|err| format!("Element at index {idx} differs: {err}"))
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn scalars() {
        1.0.is_close(&1.0, 0.0, 0.0).unwrap();
        1.0.is_close(&1.001, 0.0, 1e-2).unwrap();
        assert!(1.0.is_close(&1.1, 1e-3, 1e-3).is_err());
        assert!(f64::NAN.is_close(&1.0, 1e5, 1e5).is_err());
    }

    #[test]
    fn slices_report_offending_indices() {
        let a = [1.0, 2.0, 3.0];
        a[..].is_close(&a[..], 0.0, 0.0).unwrap();
        let b = [1.0, 2.5, 3.0];
        let err = a[..].is_close(&b[..], 1e-6, 1e-6).unwrap_err();
        assert!(err.contains("index 1"));
        assert!(a[..].is_close(&b[..2], 1.0, 1.0).is_err());
    }

    #[test]
    fn arrays() {
        let a = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let b = arr2(&[[1.0, 2.0], [3.0, 4.0 + 1e-9]]);
        a.is_close(&b, 1e-6, 0.0).unwrap();
    }
}
