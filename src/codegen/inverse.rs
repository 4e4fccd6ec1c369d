//! Shader-side matrix inversion, emitted fully unrolled.

use super::ir::{Place, ShaderBinaryOp, ShaderExpr, ShaderFunction, ShaderType, Stmt};
use super::module::ShaderModule;
use crate::matrix::InversionError;

pub const DEFAULT_PIVOT_EPSILON: f64 = 1e-4;

/// Name of the module constant holding the pivot epsilon.
pub const PIVOT_EPSILON: &str = "PIVOT_EPSILON";

pub fn inverse_function_name(n: usize) -> String {
    format!("invertMatrix{}", n)
}

/// Adds `invertMatrixN` and the epsilon constant it reads, once per `n`.
pub fn add_runtime_inverse(
    module: &mut ShaderModule,
    n: usize,
    epsilon: f64,
) -> Result<String, InversionError> {
    let name = inverse_function_name(n);
    if !module.contains_function(&name) {
        let function = runtime_inverse(n)?;
        module.add_constant(PIVOT_EPSILON, ShaderType::Float, ShaderExpr::Float(epsilon));
        module.add_function(function);
    }
    Ok(name)
}

/// `p = sign(p) * eps` whenever `|p| < eps`, treating zero as positive.
fn clamp_pivot(name: &str) -> Stmt {
    let p = ShaderExpr::var(name);
    let eps = ShaderExpr::var(PIVOT_EPSILON);
    Stmt::If {
        cond: ShaderExpr::binary(
            ShaderBinaryOp::Lt,
            ShaderExpr::call("abs", vec![p.clone()]),
            eps.clone(),
        ),
        then: vec![Stmt::If {
            cond: ShaderExpr::binary(ShaderBinaryOp::Lt, p, ShaderExpr::Float(0.0)),
            then: vec![Stmt::assign(Place::Var(name.into()), ShaderExpr::neg(eps.clone()))],
            otherwise: vec![Stmt::assign(Place::Var(name.into()), eps)],
        }],
        otherwise: vec![],
    }
}

pub fn runtime_inverse(n: usize) -> Result<ShaderFunction, InversionError> {
    let body = match n {
        2 => closed_form_2x2(),
        3 | 4 => gauss_jordan(n),
        n => return Err(InversionError::UnsupportedDimension(n)),
    };
    Ok(ShaderFunction::new(
        inverse_function_name(n),
        vec![(ShaderType::Mat(n), "m".into())],
        ShaderType::Mat(n),
    )
    .with_body(body))
}

fn closed_form_2x2() -> Vec<Stmt> {
    let m = |c, r| ShaderExpr::element("m", c, r);
    vec![
        Stmt::let_(
            ShaderType::Float,
            "det",
            ShaderExpr::sub(ShaderExpr::mul(m(0, 0), m(1, 1)), ShaderExpr::mul(m(1, 0), m(0, 1))),
        ),
        clamp_pivot("det"),
        Stmt::Return(ShaderExpr::div(
            ShaderExpr::Construct(
                ShaderType::Mat(2),
                vec![m(1, 1), ShaderExpr::neg(m(0, 1)), ShaderExpr::neg(m(1, 0)), m(0, 0)],
            ),
            ShaderExpr::var("det"),
        )),
    ]
}

fn swap(matrix: &str, cols: std::ops::Range<usize>, r1: usize, r2: usize, out: &mut Vec<Stmt>) {
    for c in cols {
        out.push(Stmt::assign(Place::Var("s".into()), ShaderExpr::element(matrix, c, r1)));
        out.push(Stmt::assign(
            Place::Element(matrix.into(), c, r1),
            ShaderExpr::element(matrix, c, r2),
        ));
        out.push(Stmt::assign(Place::Element(matrix.into(), c, r2), ShaderExpr::var("s")));
    }
}

/// Gauss-Jordan on `[a | inv]` with rows addressed as `x[col][row]`.
/// Columns of `a` left of the pivot are already zero below and above it and
/// are skipped.
fn gauss_jordan(n: usize) -> Vec<Stmt> {
    let mut body = vec![
        Stmt::let_(ShaderType::Mat(n), "a", ShaderExpr::var("m")),
        Stmt::let_(
            ShaderType::Mat(n),
            "inv",
            ShaderExpr::Construct(ShaderType::Mat(n), vec![ShaderExpr::Float(1.0)]),
        ),
        Stmt::let_(ShaderType::Float, "s", ShaderExpr::Float(0.0)),
        Stmt::let_(ShaderType::Float, "p", ShaderExpr::Float(0.0)),
        Stmt::let_(ShaderType::Float, "f", ShaderExpr::Float(0.0)),
    ];
    let abs = |c, r| ShaderExpr::call("abs", vec![ShaderExpr::element("a", c, r)]);

    for k in 0..n {
        body.push(Stmt::Comment(format!("column {}", k)));
        for r in k + 1..n {
            let mut swaps = Vec::new();
            swap("a", k..n, k, r, &mut swaps);
            swap("inv", 0..n, k, r, &mut swaps);
            body.push(Stmt::If {
                cond: ShaderExpr::binary(ShaderBinaryOp::Gt, abs(k, r), abs(k, k)),
                then: swaps,
                otherwise: vec![],
            });
        }

        body.push(Stmt::assign(Place::Var("p".into()), ShaderExpr::element("a", k, k)));
        body.push(clamp_pivot("p"));
        for (matrix, first) in [("a", k), ("inv", 0)] {
            for c in first..n {
                body.push(Stmt::assign(
                    Place::Element(matrix.into(), c, k),
                    ShaderExpr::div(ShaderExpr::element(matrix, c, k), ShaderExpr::var("p")),
                ));
            }
        }

        for r in (0..n).filter(|r| *r != k) {
            body.push(Stmt::assign(Place::Var("f".into()), ShaderExpr::element("a", k, r)));
            for (matrix, first) in [("a", k), ("inv", 0)] {
                for c in first..n {
                    body.push(Stmt::assign(
                        Place::Element(matrix.into(), c, r),
                        ShaderExpr::sub(
                            ShaderExpr::element(matrix, c, r),
                            ShaderExpr::mul(ShaderExpr::var("f"), ShaderExpr::element(matrix, c, k)),
                        ),
                    ));
                }
            }
        }
    }

    body.push(Stmt::Return(ShaderExpr::var("inv")));
    body
}
