use std::collections::HashMap;
use std::fmt;

use itertools::Itertools;

use crate::analysis::simplify_many;
use crate::expression::{EvaluationError, Expression};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InversionError {
    #[error("matrix is singular: determinant simplifies to zero")]
    Singular,

    #[error("inversion of {0}x{0} matrices is not supported")]
    UnsupportedDimension(usize),

    #[error("matrix with {rows} rows and {cols} columns is not square")]
    NotSquare { rows: usize, cols: usize },
}

/// A dense row-major matrix of expressions.
#[derive(Clone, PartialEq)]
pub struct ExpressionMatrix {
    rows: Vec<Vec<Expression>>,
}

impl ExpressionMatrix {
    pub fn from_rows(rows: Vec<Vec<Expression>>) -> Self {
        ExpressionMatrix { rows }
    }

    pub fn identity(n: usize) -> Self {
        let rows = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| if i == j { Expression::one() } else { Expression::zero() })
                    .collect()
            })
            .collect();
        ExpressionMatrix { rows }
    }

    /// `J[i][j] = d functions[i] / d variables[j]`, simplified in one pass.
    pub fn jacobian<S: AsRef<str>>(functions: &[Expression], variables: &[S]) -> Self {
        let raw = functions
            .iter()
            .cartesian_product(variables.iter())
            .map(|(f, v)| f.differentiate(v))
            .collect::<Vec<_>>();
        let cols = variables.len().max(1);
        let rows = simplify_many(&raw)
            .into_iter()
            .chunks(cols)
            .into_iter()
            .map(|row| row.collect())
            .collect();
        ExpressionMatrix { rows }
    }

    pub fn nrows(&self) -> usize {
        self.rows.len()
    }

    pub fn ncols(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    pub fn is_square(&self) -> bool {
        self.rows.iter().all(|row| row.len() == self.nrows())
    }

    pub fn get(&self, row: usize, col: usize) -> &Expression {
        &self.rows[row][col]
    }

    pub fn rows(&self) -> &[Vec<Expression>] {
        &self.rows
    }

    pub fn entries(&self) -> impl Iterator<Item = &Expression> {
        self.rows.iter().flatten()
    }

    fn check_square(&self) -> Result<usize, InversionError> {
        if self.is_square() {
            Ok(self.nrows())
        } else {
            Err(InversionError::NotSquare {
                rows: self.nrows(),
                cols: self.ncols(),
            })
        }
    }

    /// The matrix without row `row` and column `col`.
    pub fn minor(&self, row: usize, col: usize) -> Self {
        let rows = self
            .rows
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != row)
            .map(|(_, r)| {
                r.iter()
                    .enumerate()
                    .filter(|(j, _)| *j != col)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .collect();
        ExpressionMatrix { rows }
    }

    /// Unsimplified cofactor expansion along the first row.
    fn expand_determinant(&self) -> Expression {
        match self.nrows() {
            0 => Expression::one(),
            1 => self.rows[0][0].clone(),
            2 => {
                &self.rows[0][0] * &self.rows[1][1] - &self.rows[0][1] * &self.rows[1][0]
            }
            n => (0..n)
                .filter(|j| !self.rows[0][*j].is_zero())
                .map(|j| {
                    let term = &self.rows[0][j] * self.minor(0, j).expand_determinant();
                    (j, term)
                })
                .fold(Expression::zero(), |acc, (j, term)| {
                    if j % 2 == 0 {
                        acc + term
                    } else {
                        acc - term
                    }
                }),
        }
    }

    pub fn determinant(&self) -> Result<Expression, InversionError> {
        self.check_square()?;
        Ok(self.expand_determinant().simplify())
    }

    /// Transposed cofactor matrix, unsimplified.
    fn expand_adjugate(&self) -> Vec<Vec<Expression>> {
        let n = self.nrows();
        if n == 1 {
            return vec![vec![Expression::one()]];
        }
        (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| {
                        let cofactor = self.minor(j, i).expand_determinant();
                        if (i + j) % 2 == 0 {
                            cofactor
                        } else {
                            -cofactor
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Symbolic inverse as `adj(M) / det(M)`.
    ///
    /// Sizes 2 to 4 are supported. All entries are simplified together so
    /// that shared subterms are interned once.
    pub fn inverse(&self) -> Result<SymbolicInverse, InversionError> {
        let n = self.check_square()?;
        if !(2..=4).contains(&n) {
            return Err(InversionError::UnsupportedDimension(n));
        }

        let mut raw = vec![self.expand_determinant()];
        raw.extend(self.expand_adjugate().into_iter().flatten());
        let mut simplified = simplify_many(&raw).into_iter();
        let determinant = simplified.next().ok_or(InversionError::Singular)?;
        if determinant.is_zero() {
            return Err(InversionError::Singular);
        }

        let rows = simplified
            .chunks(n)
            .into_iter()
            .map(|row| row.collect())
            .collect();
        Ok(SymbolicInverse {
            determinant,
            adjugate: ExpressionMatrix { rows },
        })
    }

    pub fn mul_vector(&self, v: &[Expression]) -> Vec<Expression> {
        self.rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(v)
                    .filter(|(m, x)| !m.is_zero() && !x.is_zero())
                    .fold(Expression::zero(), |acc, (m, x)| acc + m * x)
            })
            .collect()
    }

    pub fn substitute_variables(&self, bindings: &HashMap<String, Expression>) -> Self {
        let rows = self
            .rows
            .iter()
            .map(|row| row.iter().map(|e| e.substitute_variables(bindings)).collect())
            .collect();
        ExpressionMatrix { rows }
    }

    pub fn eval(&self, args: &HashMap<&str, f64>) -> Result<Vec<Vec<f64>>, EvaluationError> {
        self.rows
            .iter()
            .map(|row| row.iter().map(|e| e.eval(args)).collect())
            .collect()
    }
}

impl fmt::Debug for ExpressionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[")?;
        for row in &self.rows {
            writeln!(f, "  [{}]", row.iter().join(", "))?;
        }
        write!(f, "]")
    }
}

/// `M^-1 = adjugate / determinant`, kept apart so that `1 / det` is
/// computed once.
#[derive(Clone, Debug, PartialEq)]
pub struct SymbolicInverse {
    pub determinant: Expression,
    pub adjugate: ExpressionMatrix,
}

impl SymbolicInverse {
    pub fn dim(&self) -> usize {
        self.adjugate.nrows()
    }

    /// The explicit inverse with each entry divided by the determinant.
    pub fn to_matrix(&self) -> ExpressionMatrix {
        let rows = self
            .adjugate
            .rows()
            .iter()
            .map(|row| row.iter().map(|e| e / &self.determinant).collect())
            .collect();
        ExpressionMatrix::from_rows(rows)
    }

    /// `M^-1 v`, with the determinant divided out after the product.
    pub fn apply(&self, v: &[Expression]) -> Vec<Expression> {
        self.adjugate
            .mul_vector(v)
            .into_iter()
            .map(|e| e / &self.determinant)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parse;
    use approx::assert_relative_eq;

    fn matrix(rows: &[&[&str]]) -> ExpressionMatrix {
        ExpressionMatrix::from_rows(
            rows.iter()
                .map(|r| r.iter().map(|s| parse(s).unwrap()).collect())
                .collect(),
        )
    }

    fn product(a: &[Vec<f64>], b: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let n = a.len();
        (0..n)
            .map(|i| (0..n).map(|j| (0..n).map(|k| a[i][k] * b[k][j]).sum()).collect())
            .collect()
    }

    fn assert_inverts(m: &ExpressionMatrix, args: &HashMap<&str, f64>) {
        let inverse = m.inverse().unwrap().to_matrix();
        let p = product(&m.eval(args).unwrap(), &inverse.eval(args).unwrap());
        for (i, row) in p.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(*v, expected, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn polar_jacobian() {
        let forward = [parse("sqrt(x^2 + y^2)").unwrap(), parse("atan2(y, x)").unwrap()];
        let j = ExpressionMatrix::jacobian(&forward, &["x", "y"]);
        let args = HashMap::from([("x", 3.0), ("y", 4.0)]);
        let values = j.eval(&args).unwrap();
        assert_relative_eq!(values[0][0], 0.6, epsilon = 1e-12);
        assert_relative_eq!(values[0][1], 0.8, epsilon = 1e-12);
        assert_relative_eq!(values[1][0], -4.0 / 25.0, epsilon = 1e-12);
        assert_relative_eq!(values[1][1], 3.0 / 25.0, epsilon = 1e-12);
        assert_inverts(&j, &args);
    }

    #[test]
    fn inverts_three_and_four_dimensional_matrices() {
        let m3 = matrix(&[&["x", "1", "0"], &["0", "y", "2"], &["1", "0", "x * y"]]);
        assert_inverts(&m3, &HashMap::from([("x", 1.5), ("y", -0.5)]));

        let m4 = matrix(&[
            &["0", "1", "0", "0"],
            &["x", "0", "0", "1"],
            &["0", "0", "cos(y)", "0"],
            &["0", "0", "0", "2"],
        ]);
        assert_inverts(&m4, &HashMap::from([("x", 2.0), ("y", 0.3)]));
    }

    #[test]
    fn detects_singular_and_bad_shapes() {
        let rank_one = ExpressionMatrix::jacobian(&[parse("x").unwrap(), parse("x").unwrap()], &["x", "y"]);
        assert_eq!(rank_one.inverse(), Err(InversionError::Singular));

        let dependent = matrix(&[&["x", "y"], &["x", "y"]]);
        assert_eq!(dependent.inverse(), Err(InversionError::Singular));

        let wide = matrix(&[&["1", "2", "3"], &["4", "5", "6"]]);
        assert_eq!(wide.inverse(), Err(InversionError::NotSquare { rows: 2, cols: 3 }));
        assert_eq!(
            ExpressionMatrix::identity(5).inverse(),
            Err(InversionError::UnsupportedDimension(5))
        );
    }

    #[test]
    fn determinant_of_rotation_is_one() {
        let m = matrix(&[&["cos(t)", "-sin(t)"], &["sin(t)", "cos(t)"]]);
        let det = m.determinant().unwrap();
        let args = HashMap::from([("t", 0.7)]);
        assert_relative_eq!(det.eval(&args).unwrap(), 1.0, epsilon = 1e-12);
    }
}
