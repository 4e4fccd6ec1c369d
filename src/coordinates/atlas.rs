use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::codegen::ir::ShaderBinaryOp;
use crate::codegen::{CodeGenResult, CodeGenerator, ShaderExpr};
use crate::expression::{EvaluationError, Expression};
use crate::functions::{BinaryFunction, NamedConstant, UnaryFunction};

/// A cap chart owns the points where `|U| > 1 - POLAR_CAP_TOLERANCE` for an
/// `acos(U)` or `asin(U)` in the forward transforms.
pub const POLAR_CAP_TOLERANCE: f64 = 1e-6;

/// Region predicate over Cartesian positions.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Always,
    /// `|lhs| >= |rhs|`
    AbsAtLeast(Expression, Expression),
    /// `|lhs| < |rhs|`
    AbsBelow(Expression, Expression),
    /// `|arg| > limit`
    AbsAbove(Expression, f64),
}

impl Predicate {
    pub fn is_always(&self) -> bool {
        matches!(self, Predicate::Always)
    }

    pub fn eval(&self, args: &HashMap<&str, f64>) -> Result<bool, EvaluationError> {
        Ok(match self {
            Predicate::Always => true,
            Predicate::AbsAtLeast(lhs, rhs) => lhs.eval(args)?.abs() >= rhs.eval(args)?.abs(),
            Predicate::AbsBelow(lhs, rhs) => lhs.eval(args)?.abs() < rhs.eval(args)?.abs(),
            Predicate::AbsAbove(arg, limit) => arg.eval(args)?.abs() > *limit,
        })
    }

    pub fn emit(&self, gen: &mut CodeGenerator) -> CodeGenResult<ShaderExpr> {
        let mut abs = |e: &Expression| -> CodeGenResult<ShaderExpr> {
            Ok(ShaderExpr::call("abs", vec![gen.build_expression(e)?]))
        };
        Ok(match self {
            Predicate::Always => ShaderExpr::Bool(true),
            Predicate::AbsAtLeast(lhs, rhs) => ShaderExpr::binary(ShaderBinaryOp::Ge, abs(lhs)?, abs(rhs)?),
            Predicate::AbsBelow(lhs, rhs) => ShaderExpr::binary(ShaderBinaryOp::Lt, abs(lhs)?, abs(rhs)?),
            Predicate::AbsAbove(arg, limit) => {
                ShaderExpr::binary(ShaderBinaryOp::Gt, abs(arg)?, ShaderExpr::Float(*limit))
            }
        })
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Always => f.write_str("true"),
            Predicate::AbsAtLeast(lhs, rhs) => write!(f, "|{}| >= |{}|", lhs, rhs),
            Predicate::AbsBelow(lhs, rhs) => write!(f, "|{}| < |{}|", lhs, rhs),
            Predicate::AbsAbove(arg, limit) => write!(f, "|{}| > {}", arg, limit),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChartKind {
    Primary,
    /// The last `atan2(a, b)` rewritten as `pi/2 - atan2(b, a)`.
    Swapped,
    /// Near a polar axis. The Jacobian is taken at a point displaced along
    /// positional component `direction`.
    PolarCap { direction: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Chart {
    pub predicate: Predicate,
    pub forward: Vec<Expression>,
    pub kind: ChartKind,
}

/// Ordered charts, tried first-match. The last chart takes every point the
/// others reject.
#[derive(Clone, Debug, PartialEq)]
pub struct Atlas {
    charts: Vec<Chart>,
}

fn is_atan2(e: &Expression) -> bool {
    matches!(e, Expression::Function(BinaryFunction::Atan2, _, _))
}

fn is_inverse_trig(e: &Expression) -> bool {
    matches!(e, Expression::Unary(UnaryFunction::Acos | UnaryFunction::Asin, _))
}

/// The positional axis along which `arg` is furthest from `|arg| = 1`.
fn cap_direction(arg: &Expression, positional: &[&str]) -> usize {
    let mut best = (0, f64::INFINITY);
    for k in 0..positional.len() {
        let point: HashMap<&str, f64> = positional
            .iter()
            .enumerate()
            .map(|(i, name)| (*name, if i == k { 1.0 } else { 0.0 }))
            .collect();
        if let Ok(value) = arg.eval(&point) {
            if value.is_finite() && value.abs() < best.1 {
                best = (k, value.abs());
            }
        }
    }
    best.0
}

impl Atlas {
    pub fn single(forward: &[Expression]) -> Self {
        Atlas {
            charts: vec![Chart {
                predicate: Predicate::Always,
                forward: forward.to_vec(),
                kind: ChartKind::Primary,
            }],
        }
    }

    pub fn generate(forward: &[Expression], positional: &[&str]) -> Self {
        let mut charts = Vec::new();

        let mut caps: Vec<&Expression> = Vec::new();
        for f in forward {
            for found in f.find_all(is_inverse_trig) {
                if !caps.contains(&found) {
                    caps.push(found);
                }
            }
        }
        for cap in caps {
            let Expression::Unary(_, arg) = cap else { continue };
            charts.push(Chart {
                predicate: Predicate::AbsAbove(arg.as_ref().clone(), 1.0 - POLAR_CAP_TOLERANCE),
                forward: forward.to_vec(),
                kind: ChartKind::PolarCap {
                    direction: cap_direction(arg, positional),
                },
            });
        }

        let last_atan2 = forward.iter().flat_map(|f| f.find_all(is_atan2)).last().cloned();
        match last_atan2 {
            Some(Expression::Function(_, a, b)) => {
                let (a, b) = (a.as_ref(), b.as_ref());
                let half_pi = Expression::Constant(NamedConstant::Pi) / Expression::from_float(2.0);
                let swapped = half_pi - Expression::atan2(b.clone(), a.clone());
                let occurrence = Expression::atan2(a.clone(), b.clone());
                charts.push(Chart {
                    predicate: Predicate::AbsAtLeast(b.clone(), a.clone()),
                    forward: forward.to_vec(),
                    kind: ChartKind::Primary,
                });
                charts.push(Chart {
                    predicate: Predicate::AbsBelow(b.clone(), a.clone()),
                    forward: forward.iter().map(|f| f.substitute(&occurrence, &swapped)).collect(),
                    kind: ChartKind::Swapped,
                });
            }
            _ => charts.push(Chart {
                predicate: Predicate::Always,
                forward: forward.to_vec(),
                kind: ChartKind::Primary,
            }),
        }

        debug!(charts = charts.len(), "generated atlas");
        Atlas { charts }
    }

    pub fn charts(&self) -> &[Chart] {
        &self.charts
    }

    pub fn len(&self) -> usize {
        self.charts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.charts.is_empty()
    }

    pub fn has_polar_caps(&self) -> bool {
        self.charts
            .iter()
            .any(|c| matches!(c.kind, ChartKind::PolarCap { .. }))
    }

    /// Index of the chart that owns `point`.
    pub fn select(&self, point: &HashMap<&str, f64>) -> Result<usize, EvaluationError> {
        for (i, chart) in self.charts.iter().enumerate() {
            if chart.predicate.eval(point)? {
                return Ok(i);
            }
        }
        Ok(self.charts.len().saturating_sub(1))
    }

    /// Whether some chart predicate holds at `point`.
    pub fn covers(&self, point: &HashMap<&str, f64>) -> Result<bool, EvaluationError> {
        for chart in &self.charts {
            if chart.predicate.eval(point)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parse;
    use approx::assert_relative_eq;

    fn forward(sources: &[&str]) -> Vec<Expression> {
        sources.iter().map(|s| parse(s).unwrap()).collect()
    }

    #[test]
    fn cartesian_has_single_chart() {
        let atlas = Atlas::generate(&forward(&["x", "y"]), &["x", "y"]);
        assert_eq!(atlas.len(), 1);
        assert!(atlas.charts()[0].predicate.is_always());
    }

    #[test]
    fn polar_swaps_the_angle_near_the_y_axis() {
        let f = forward(&["sqrt(x^2 + y^2)", "atan2(y, x)"]);
        let atlas = Atlas::generate(&f, &["x", "y"]);
        assert_eq!(atlas.len(), 2);
        assert_eq!(atlas.charts()[1].kind, ChartKind::Swapped);

        let east = HashMap::from([("x", 1.0), ("y", 0.0)]);
        let north = HashMap::from([("x", 0.0), ("y", 1.0)]);
        assert_eq!(atlas.select(&east).unwrap(), 0);
        assert_eq!(atlas.select(&north).unwrap(), 1);

        let point = HashMap::from([("x", 0.3), ("y", 0.9)]);
        let swapped = atlas.charts()[1].forward[1].eval(&point).unwrap();
        assert_relative_eq!(swapped, 0.9f64.atan2(0.3), epsilon = 1e-12);
    }

    #[test]
    fn spherical_gets_a_polar_cap_along_x() {
        let f = forward(&[
            "sqrt(x^2 + y^2 + z^2)",
            "acos(z / sqrt(x^2 + y^2 + z^2))",
            "atan2(y, x)",
        ]);
        let atlas = Atlas::generate(&f, &["x", "y", "z"]);
        assert_eq!(atlas.len(), 3);
        assert!(atlas.has_polar_caps());
        assert_eq!(atlas.charts()[0].kind, ChartKind::PolarCap { direction: 0 });

        let pole = HashMap::from([("x", 0.0), ("y", 0.0), ("z", 2.0)]);
        assert_eq!(atlas.select(&pole).unwrap(), 0);
        let equator = HashMap::from([("x", 1.0), ("y", 0.5), ("z", 0.0)]);
        assert_eq!(atlas.select(&equator).unwrap(), 1);
    }

    #[test]
    fn only_the_last_atan2_is_swapped() {
        let f = forward(&["atan2(y, x)", "atan2(z, x)", "z"]);
        let atlas = Atlas::generate(&f, &["x", "y", "z"]);
        let swapped = &atlas.charts()[1].forward;
        assert_eq!(swapped[0], f[0]);
        assert_ne!(swapped[1], f[1]);
    }
}
