//! Emission of `transformToNative`, `transformToCartesian` and
//! `transformVelocityToCartesian`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::atlas::{Chart, ChartKind};
use super::CoordinateSystem;
use crate::codegen::ir::{Place, ShaderBinaryOp};
use crate::codegen::{
    inverse_function_name, Bindings, CodeGenResult, CodeGenerator, ShaderExpr, ShaderFunction,
    ShaderType, Stmt, TEMPORARY_PREFIX,
};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::expression::Expression;
use crate::matrix::{ExpressionMatrix, InversionError, SymbolicInverse};

pub const TO_NATIVE: &str = "transformToNative";
pub const TO_CARTESIAN: &str = "transformToCartesian";
pub const VELOCITY_TO_CARTESIAN: &str = "transformVelocityToCartesian";

const NUDGE_SCALE: f64 = 1e-3;
const NUDGE_OFFSET: f64 = 1e-6;

/// Bounds for the Newton loop of an iterative inverse transform.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InverseSolverOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for InverseSolverOptions {
    fn default() -> Self {
        InverseSolverOptions {
            max_iterations: 10,
            tolerance: 1e-6,
        }
    }
}

/// How `transformToCartesian` is produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InverseStrategy {
    Identity,
    Explicit,
    Newton,
    Missing,
}

impl CoordinateSystem {
    pub fn inverse_strategy(&self) -> InverseStrategy {
        if self.is_cartesian() {
            InverseStrategy::Identity
        } else if self.inverse().is_some() {
            InverseStrategy::Explicit
        } else if self.use_iterative_solver() {
            InverseStrategy::Newton
        } else {
            InverseStrategy::Missing
        }
    }

    /// Forward-transform primitives whose derivative is taken as zero.
    pub fn non_differentiable_calls(&self) -> Vec<&'static str> {
        let mut calls = std::collections::BTreeSet::new();
        for f in self.forward() {
            for var in self.positional() {
                calls.extend(f.non_differentiable_calls(var));
            }
        }
        calls.into_iter().collect()
    }
}

fn vec_of(n: usize) -> ShaderType {
    ShaderType::Vec(n)
}

fn emit_components(
    gen: &mut CodeGenerator,
    exprs: &[Expression],
) -> CodeGenResult<(Vec<Stmt>, ShaderExpr)> {
    gen.prepare(exprs);
    let components = exprs
        .iter()
        .map(|e| gen.build_expression(e))
        .collect::<CodeGenResult<Vec<_>>>()?;
    Ok((gen.take_statements(), ShaderExpr::Construct(vec_of(exprs.len()), components)))
}

pub fn emit_to_native(system: &CoordinateSystem) -> CodeGenResult<ShaderFunction> {
    let n = system.dimensions();
    let function = ShaderFunction::new(TO_NATIVE, vec![(vec_of(n), "pos".into())], vec_of(n));
    if system.is_cartesian() {
        return Ok(function.with_body(vec![Stmt::Return(ShaderExpr::var("pos"))]));
    }

    let mut bindings = Bindings::new();
    bindings.bind_vector(system.positional(), "pos");
    let mut gen = CodeGenerator::new(&bindings)
        .with_hoisting(TEMPORARY_PREFIX)
        .with_clamped_inverse_trig();
    let (mut body, native) = emit_components(&mut gen, system.forward())?;
    body.push(Stmt::Return(native));
    Ok(function.with_body(body))
}

/// Column-major `matN(...)` built from a row-major expression matrix.
fn construct_matrix(gen: &mut CodeGenerator, m: &ExpressionMatrix) -> CodeGenResult<ShaderExpr> {
    let n = m.nrows();
    gen.prepare(m.entries());
    let mut columns = Vec::with_capacity(n * n);
    for c in 0..n {
        for r in 0..n {
            columns.push(gen.build_expression(m.get(r, c))?);
        }
    }
    Ok(ShaderExpr::Construct(ShaderType::Mat(n), columns))
}

/// Emits `transformToCartesian`. A Newton inverse calls
/// `invertMatrixN` and `transformToNative`, which the caller must place
/// earlier in the module.
pub fn emit_to_cartesian(
    system: &CoordinateSystem,
    options: &InverseSolverOptions,
    diagnostics: &mut Diagnostics,
) -> CodeGenResult<ShaderFunction> {
    let n = system.dimensions();
    let function = ShaderFunction::new(TO_CARTESIAN, vec![(vec_of(n), "native".into())], vec_of(n));

    let body = match system.inverse_strategy() {
        InverseStrategy::Identity => vec![Stmt::Return(ShaderExpr::var("native"))],
        InverseStrategy::Explicit => {
            let mut bindings = Bindings::new();
            bindings.bind_vector(&system.labels(), "native");
            let mut gen = CodeGenerator::new(&bindings)
                .with_hoisting(TEMPORARY_PREFIX)
                .with_clamped_inverse_trig();
            let inverse = system.inverse().unwrap_or_default();
            let (mut body, cartesian) = emit_components(&mut gen, inverse)?;
            body.push(Stmt::Return(cartesian));
            body
        }
        InverseStrategy::Newton => {
            let lossy = system.non_differentiable_calls();
            if !lossy.is_empty() {
                diagnostics.push(
                    DiagnosticKind::JacobianNonDifferentiable,
                    format!(
                        "forward transforms of `{}` use {}; their derivatives are taken as zero",
                        system.name(),
                        lossy.join(", ")
                    ),
                );
            }
            newton_inverse(system, options)?
        }
        InverseStrategy::Missing => {
            diagnostics.push(
                DiagnosticKind::InverseMissingFallbackIdentity,
                format!("`{}` has no inverse transform; using the identity", system.name()),
            );
            vec![
                Stmt::Comment("no inverse transform available, identity fallback".into()),
                Stmt::Return(ShaderExpr::var("native")),
            ]
        }
    };
    Ok(function.with_body(body))
}

fn newton_inverse(system: &CoordinateSystem, options: &InverseSolverOptions) -> CodeGenResult<Vec<Stmt>> {
    let n = system.dimensions();
    let mut bindings = Bindings::new();
    bindings.bind_vector(system.positional(), "guess");
    let mut gen = CodeGenerator::new(&bindings)
        .with_hoisting(TEMPORARY_PREFIX)
        .with_clamped_inverse_trig();
    let jacobian = construct_matrix(&mut gen, &system.jacobian())?;

    let mut step = vec![
        Stmt::let_(
            vec_of(n),
            "residual",
            ShaderExpr::sub(
                ShaderExpr::call(TO_NATIVE, vec![ShaderExpr::var("guess")]),
                ShaderExpr::var("native"),
            ),
        ),
        Stmt::If {
            cond: ShaderExpr::binary(
                ShaderBinaryOp::Lt,
                ShaderExpr::call("length", vec![ShaderExpr::var("residual")]),
                ShaderExpr::Float(options.tolerance),
            ),
            then: vec![Stmt::Break],
            otherwise: vec![],
        },
    ];
    step.extend(gen.take_statements());
    step.push(Stmt::let_(ShaderType::Mat(n), "jac", jacobian));
    step.push(Stmt::assign(
        Place::Var("guess".into()),
        ShaderExpr::sub(
            ShaderExpr::var("guess"),
            ShaderExpr::mul(
                ShaderExpr::call(inverse_function_name(n), vec![ShaderExpr::var("jac")]),
                ShaderExpr::var("residual"),
            ),
        ),
    ));

    Ok(vec![
        Stmt::Comment("Newton iteration on transformToNative(guess) = native".into()),
        Stmt::let_(vec_of(n), "guess", ShaderExpr::var("native")),
        Stmt::For {
            count: options.max_iterations,
            body: step,
        },
        Stmt::Return(ShaderExpr::var("guess")),
    ])
}

/// Statements for one chart, ending in a `return`.
fn chart_body(
    chart: &Chart,
    inverse: &Result<SymbolicInverse, InversionError>,
    system: &CoordinateSystem,
) -> CodeGenResult<Vec<Stmt>> {
    let n = system.dimensions();
    let mut body = Vec::new();

    let base = match chart.kind {
        ChartKind::PolarCap { direction } => {
            body.push(Stmt::Comment("near the polar axis: Jacobian taken off-axis".into()));
            body.push(Stmt::let_(vec_of(n), "nudged", ShaderExpr::var("pos")));
            let offset = ShaderExpr::add(
                ShaderExpr::mul(
                    ShaderExpr::Float(NUDGE_SCALE),
                    ShaderExpr::call("length", vec![ShaderExpr::var("pos")]),
                ),
                ShaderExpr::Float(NUDGE_OFFSET),
            );
            body.push(Stmt::assign(
                Place::Component("nudged".into(), direction),
                ShaderExpr::add(ShaderExpr::component("nudged", direction), offset),
            ));
            "nudged"
        }
        ChartKind::Primary | ChartKind::Swapped => "pos",
    };

    let inverse = match inverse {
        Ok(inverse) => inverse,
        Err(e) => {
            body.push(Stmt::Comment(format!("{}; identity fallback", e)));
            body.push(Stmt::Return(ShaderExpr::var("velNative")));
            return Ok(body);
        }
    };

    let mut bindings = Bindings::new();
    bindings.bind_vector(system.positional(), base);
    let mut gen = CodeGenerator::new(&bindings)
        .with_hoisting(TEMPORARY_PREFIX)
        .with_clamped_inverse_trig();
    gen.prepare(std::iter::once(&inverse.determinant).chain(inverse.adjugate.entries()));

    let determinant = gen.build_expression(&inverse.determinant)?;
    let mut components = Vec::with_capacity(n);
    for row in inverse.adjugate.rows() {
        let mut terms = Vec::new();
        for (j, entry) in row.iter().enumerate() {
            if entry.is_zero() {
                continue;
            }
            let velocity = ShaderExpr::component("velNative", j);
            terms.push(if entry.is_one() {
                velocity
            } else {
                ShaderExpr::mul(gen.build_expression(entry)?, velocity)
            });
        }
        components.push(ShaderExpr::mul(ShaderExpr::sum(terms), ShaderExpr::var("invDet")));
    }

    body.extend(gen.take_statements());
    body.push(Stmt::let_(
        ShaderType::Float,
        "invDet",
        ShaderExpr::div(ShaderExpr::Float(1.0), determinant),
    ));
    body.push(Stmt::Return(ShaderExpr::Construct(vec_of(n), components)));
    Ok(body)
}

/// Emits `transformVelocityToCartesian(velNative, pos)`, which maps a
/// native-space velocity at Cartesian `pos` through the inverse Jacobian of
/// the chart that owns `pos`.
pub fn emit_velocity_to_cartesian(
    system: &CoordinateSystem,
    diagnostics: &mut Diagnostics,
) -> CodeGenResult<ShaderFunction> {
    let n = system.dimensions();
    let function = ShaderFunction::new(
        VELOCITY_TO_CARTESIAN,
        vec![(vec_of(n), "velNative".into()), (vec_of(n), "pos".into())],
        vec_of(n),
    );
    if system.is_cartesian() {
        return Ok(function.with_body(vec![Stmt::Return(ShaderExpr::var("velNative"))]));
    }

    let lossy = system.non_differentiable_calls();
    if !lossy.is_empty() {
        diagnostics.push(
            DiagnosticKind::JacobianNonDifferentiable,
            format!(
                "Jacobian of `{}` treats {} as constant",
                system.name(),
                lossy.join(", ")
            ),
        );
    }

    let mut inverses: HashMap<String, Result<SymbolicInverse, InversionError>> = HashMap::new();
    let mut branches = Vec::new();
    for (index, chart) in system.atlas().charts().iter().enumerate() {
        let key = chart
            .forward
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(";");
        let inverse = inverses.entry(key).or_insert_with(|| {
            ExpressionMatrix::jacobian(&chart.forward, system.positional()).inverse()
        });
        if let Err(e) = inverse {
            diagnostics.push(
                DiagnosticKind::JacobianSingular,
                format!("chart {} of `{}`: {}; velocity transform falls back to the identity", index, system.name(), e),
            );
        }
        if let ChartKind::PolarCap { .. } = chart.kind {
            diagnostics.push(
                DiagnosticKind::PolarCapApproximation,
                format!(
                    "chart {} of `{}` evaluates the Jacobian off the polar axis where {}",
                    index,
                    system.name(),
                    chart.predicate
                ),
            );
        }
        branches.push((chart, chart_body(chart, inverse, system)?));
    }
    debug!(charts = branches.len(), system = system.name(), "emitted velocity transform");

    let mut pos_bindings = Bindings::new();
    pos_bindings.bind_vector(system.positional(), "pos");
    let mut gen = CodeGenerator::new(&pos_bindings);

    // The last chart becomes the final `else`.
    let mut body = match branches.pop() {
        Some((_, last)) => last,
        None => vec![Stmt::Return(ShaderExpr::var("velNative"))],
    };
    while let Some((chart, then)) = branches.pop() {
        body = vec![Stmt::If {
            cond: chart.predicate.emit(&mut gen)?,
            then,
            otherwise: body,
        }];
    }
    Ok(function.with_body(body))
}
