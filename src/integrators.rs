//! Integration schemes, each emitted as `vecN integrate(vecN pos, float h)`
//! on top of the module's `get_velocity(pos)`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codegen::ir::Place;
use crate::codegen::{
    inverse_function_name, Bindings, CodeGenResult, CodeGenerator, ShaderExpr, ShaderFunction,
    ShaderType, Stmt, TEMPORARY_PREFIX,
};
use crate::coordinates::positional_variables;
use crate::matrix::ExpressionMatrix;

pub const GET_VELOCITY: &str = "get_velocity";
pub const VELOCITY_JACOBIAN: &str = "velocityJacobian";
pub const INTEGRATE: &str = "integrate";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegratorKind {
    #[default]
    Euler,
    #[serde(alias = "midpoint")]
    Rk2,
    Rk4,
    ImplicitEuler,
    ImplicitMidpoint,
    Trapezoidal,
    #[serde(alias = "implicit-rk4")]
    GaussLegendre,
    #[serde(alias = "symplectic")]
    SymplecticEuler,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImplicitMethod {
    #[default]
    FixedPoint,
    Newton,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stability {
    /// Explicit; stable only for small enough steps.
    Conditional,
    AStable,
    LStable,
    /// Preserves phase-space volume; energy error stays bounded.
    Symplectic,
}

impl fmt::Display for Stability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stability::Conditional => "conditionally stable",
            Stability::AStable => "A-stable",
            Stability::LStable => "L-stable",
            Stability::Symplectic => "symplectic",
        })
    }
}

impl IntegratorKind {
    pub const ALL: [IntegratorKind; 8] = [
        IntegratorKind::Euler,
        IntegratorKind::Rk2,
        IntegratorKind::Rk4,
        IntegratorKind::ImplicitEuler,
        IntegratorKind::ImplicitMidpoint,
        IntegratorKind::Trapezoidal,
        IntegratorKind::GaussLegendre,
        IntegratorKind::SymplecticEuler,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            IntegratorKind::Euler => "euler",
            IntegratorKind::Rk2 => "rk2",
            IntegratorKind::Rk4 => "rk4",
            IntegratorKind::ImplicitEuler => "implicit-euler",
            IntegratorKind::ImplicitMidpoint => "implicit-midpoint",
            IntegratorKind::Trapezoidal => "trapezoidal",
            IntegratorKind::GaussLegendre => "gauss-legendre",
            IntegratorKind::SymplecticEuler => "symplectic-euler",
        }
    }

    pub fn order(&self) -> u8 {
        match self {
            IntegratorKind::Euler
            | IntegratorKind::ImplicitEuler
            | IntegratorKind::SymplecticEuler => 1,
            IntegratorKind::Rk2 | IntegratorKind::ImplicitMidpoint | IntegratorKind::Trapezoidal => 2,
            IntegratorKind::Rk4 | IntegratorKind::GaussLegendre => 4,
        }
    }

    pub fn stability(&self) -> Stability {
        match self {
            IntegratorKind::Euler | IntegratorKind::Rk2 | IntegratorKind::Rk4 => Stability::Conditional,
            IntegratorKind::ImplicitEuler => Stability::LStable,
            IntegratorKind::Trapezoidal => Stability::AStable,
            IntegratorKind::ImplicitMidpoint
            | IntegratorKind::GaussLegendre
            | IntegratorKind::SymplecticEuler => Stability::Symplectic,
        }
    }

    pub fn is_implicit(&self) -> bool {
        self.default_iterations() > 0
    }

    /// Fixed-point or Newton iteration count used when none is configured.
    pub fn default_iterations(&self) -> usize {
        match self {
            IntegratorKind::ImplicitEuler => 3,
            IntegratorKind::ImplicitMidpoint | IntegratorKind::Trapezoidal => 4,
            IntegratorKind::GaussLegendre => 5,
            _ => 0,
        }
    }

    /// Only implicit Euler has a Newton variant.
    pub fn supports_newton(&self) -> bool {
        matches!(self, IntegratorKind::ImplicitEuler)
    }
}

impl fmt::Display for IntegratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn velocity(arg: ShaderExpr) -> ShaderExpr {
    ShaderExpr::call(GET_VELOCITY, vec![arg])
}

fn var(name: &str) -> ShaderExpr {
    ShaderExpr::var(name)
}

fn scaled(factor: ShaderExpr, v: ShaderExpr) -> ShaderExpr {
    ShaderExpr::mul(factor, v)
}

fn half_h() -> ShaderExpr {
    ShaderExpr::mul(var("h"), ShaderExpr::Float(0.5))
}

/// `pos + h * v`
fn step(v: ShaderExpr) -> ShaderExpr {
    ShaderExpr::add(var("pos"), scaled(var("h"), v))
}

fn assign(name: &str, value: ShaderExpr) -> Stmt {
    Stmt::assign(Place::Var(name.into()), value)
}

/// Emits `integrate` for `kind`. `iterations` only matters for implicit
/// schemes; `method` only for implicit Euler, whose Newton form expects
/// `velocityJacobian` and `invertMatrixN` in the module.
pub fn emit_integrate(
    kind: IntegratorKind,
    dimensions: usize,
    iterations: usize,
    method: ImplicitMethod,
) -> ShaderFunction {
    let n = dimensions;
    let vec_n = ShaderType::Vec(n);
    let body = match kind {
        IntegratorKind::Euler => vec![Stmt::Return(step(velocity(var("pos"))))],
        IntegratorKind::Rk2 => vec![
            Stmt::let_(vec_n, "k1", velocity(var("pos"))),
            Stmt::let_(
                vec_n,
                "k2",
                velocity(ShaderExpr::add(var("pos"), scaled(half_h(), var("k1")))),
            ),
            Stmt::Return(step(var("k2"))),
        ],
        IntegratorKind::Rk4 => {
            let two = |name: &str| scaled(ShaderExpr::Float(2.0), var(name));
            vec![
                Stmt::let_(vec_n, "k1", velocity(var("pos"))),
                Stmt::let_(vec_n, "k2", velocity(ShaderExpr::add(var("pos"), scaled(half_h(), var("k1"))))),
                Stmt::let_(vec_n, "k3", velocity(ShaderExpr::add(var("pos"), scaled(half_h(), var("k2"))))),
                Stmt::let_(vec_n, "k4", velocity(step(var("k3")))),
                Stmt::Return(ShaderExpr::add(
                    var("pos"),
                    scaled(
                        ShaderExpr::div(var("h"), ShaderExpr::Float(6.0)),
                        ShaderExpr::sum([var("k1"), two("k2"), two("k3"), var("k4")]),
                    ),
                )),
            ]
        }
        IntegratorKind::ImplicitEuler if method == ImplicitMethod::Newton => vec![
            Stmt::let_(vec_n, "x", step(velocity(var("pos")))),
            Stmt::For {
                count: iterations,
                body: vec![
                    Stmt::let_(
                        vec_n,
                        "residual",
                        ShaderExpr::sub(
                            ShaderExpr::sub(var("x"), var("pos")),
                            scaled(var("h"), velocity(var("x"))),
                        ),
                    ),
                    Stmt::let_(
                        ShaderType::Mat(n),
                        "jac",
                        ShaderExpr::sub(
                            ShaderExpr::Construct(ShaderType::Mat(n), vec![ShaderExpr::Float(1.0)]),
                            scaled(var("h"), ShaderExpr::call(VELOCITY_JACOBIAN, vec![var("x")])),
                        ),
                    ),
                    assign(
                        "x",
                        ShaderExpr::sub(
                            var("x"),
                            ShaderExpr::mul(
                                ShaderExpr::call(inverse_function_name(n), vec![var("jac")]),
                                var("residual"),
                            ),
                        ),
                    ),
                ],
            },
            Stmt::Return(var("x")),
        ],
        IntegratorKind::ImplicitEuler => vec![
            Stmt::let_(vec_n, "x", step(velocity(var("pos")))),
            Stmt::For {
                count: iterations,
                body: vec![assign("x", step(velocity(var("x"))))],
            },
            Stmt::Return(var("x")),
        ],
        IntegratorKind::ImplicitMidpoint => vec![
            Stmt::let_(vec_n, "x", step(velocity(var("pos")))),
            Stmt::For {
                count: iterations,
                body: vec![assign(
                    "x",
                    step(velocity(scaled(
                        ShaderExpr::Float(0.5),
                        ShaderExpr::add(var("pos"), var("x")),
                    ))),
                )],
            },
            Stmt::Return(var("x")),
        ],
        IntegratorKind::Trapezoidal => vec![
            Stmt::let_(vec_n, "f0", velocity(var("pos"))),
            Stmt::let_(vec_n, "x", step(var("f0"))),
            Stmt::For {
                count: iterations,
                body: vec![assign(
                    "x",
                    ShaderExpr::add(
                        var("pos"),
                        scaled(half_h(), ShaderExpr::add(var("f0"), velocity(var("x")))),
                    ),
                )],
            },
            Stmt::Return(var("x")),
        ],
        IntegratorKind::GaussLegendre => gauss_legendre(n, iterations),
        IntegratorKind::SymplecticEuler => symplectic_euler(n),
    };

    ShaderFunction::new(
        INTEGRATE,
        vec![(vec_n, "pos".into()), (ShaderType::Float, "h".into())],
        vec_n,
    )
    .with_body(body)
}

/// Two-stage Gauss-Legendre with stages solved by fixed-point iteration.
fn gauss_legendre(n: usize, iterations: usize) -> Vec<Stmt> {
    let root3_6 = 3f64.sqrt() / 6.0;
    let a = [[0.25, 0.25 - root3_6], [0.25 + root3_6, 0.25]];
    let vec_n = ShaderType::Vec(n);
    let stage = |row: [f64; 2]| {
        velocity(step(ShaderExpr::add(
            scaled(ShaderExpr::Float(row[0]), var("k1")),
            scaled(ShaderExpr::Float(row[1]), var("k2")),
        )))
    };
    vec![
        Stmt::let_(vec_n, "k1", velocity(var("pos"))),
        Stmt::let_(vec_n, "k2", var("k1")),
        Stmt::For {
            count: iterations,
            body: vec![
                Stmt::let_(vec_n, "n1", stage(a[0])),
                Stmt::let_(vec_n, "n2", stage(a[1])),
                assign("k1", var("n1")),
                assign("k2", var("n2")),
            ],
        },
        Stmt::Return(ShaderExpr::add(
            var("pos"),
            scaled(half_h(), ShaderExpr::add(var("k1"), var("k2"))),
        )),
    ]
}

/// Components `(2i, 2i + 1)` are (position, momentum) pairs. Momenta move
/// first; positions then move with the updated momenta. An odd trailing
/// component takes an explicit Euler step.
fn symplectic_euler(n: usize) -> Vec<Stmt> {
    let vec_n = ShaderType::Vec(n);
    let euler = |target: &str, source: &str, i: usize| {
        Stmt::assign(
            Place::Component(target.into(), i),
            ShaderExpr::add(
                ShaderExpr::component("pos", i),
                ShaderExpr::mul(var("h"), ShaderExpr::component(source, i)),
            ),
        )
    };

    let mut body = vec![
        Stmt::let_(vec_n, "next", var("pos")),
        Stmt::let_(vec_n, "v", velocity(var("pos"))),
    ];
    body.extend((1..n).step_by(2).map(|p| euler("next", "v", p)));
    body.push(Stmt::let_(vec_n, "moved", velocity(var("next"))));
    body.extend((0..n - n % 2).step_by(2).map(|q| euler("next", "moved", q)));
    if n % 2 == 1 {
        body.push(euler("next", "v", n - 1));
    }
    body.push(Stmt::Return(var("next")));
    body
}

/// Emits `matN velocityJacobian(vecN pos)` from `J[i][j] = d f_i / d x_j`
/// over positional variables, with `a` bound to `alpha`.
pub fn emit_velocity_jacobian(jacobian: &ExpressionMatrix, alpha: &str) -> CodeGenResult<ShaderFunction> {
    let n = jacobian.nrows();
    let mut bindings = Bindings::new();
    bindings
        .bind_vector(positional_variables(n), "pos")
        .bind(crate::coordinates::ALPHA_VARIABLE, ShaderExpr::var(alpha));
    let mut gen = CodeGenerator::new(&bindings)
        .with_hoisting(TEMPORARY_PREFIX)
        .with_clamped_inverse_trig();
    gen.prepare(jacobian.entries());

    let mut columns = Vec::with_capacity(n * n);
    for c in 0..n {
        for r in 0..n {
            columns.push(gen.build_expression(jacobian.get(r, c))?);
        }
    }
    let mut body = gen.take_statements();
    body.push(Stmt::Return(ShaderExpr::Construct(ShaderType::Mat(n), columns)));
    Ok(ShaderFunction::new(
        VELOCITY_JACOBIAN,
        vec![(ShaderType::Vec(n), "pos".into())],
        ShaderType::Mat(n),
    )
    .with_body(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{add_runtime_inverse, Evaluator, ShaderModule, Value};
    use crate::expression::Expression;
    use crate::syntax::parse;
    use approx::assert_relative_eq;

    /// A module with `get_velocity` for `f` over `x, y`.
    fn module_with(f: &[&str], kind: IntegratorKind, iterations: usize, method: ImplicitMethod) -> ShaderModule {
        let exprs: Vec<Expression> = f.iter().map(|s| parse(s).unwrap()).collect();
        let n = exprs.len();
        let mut bindings = Bindings::new();
        bindings.bind_vector(positional_variables(n), "pos");
        let mut gen = CodeGenerator::new(&bindings);
        let components = exprs.iter().map(|e| gen.build_expression(e).unwrap()).collect();

        let mut module = ShaderModule::new();
        if method == ImplicitMethod::Newton {
            add_runtime_inverse(&mut module, n, 1e-4).unwrap();
        }
        module.add_function(
            ShaderFunction::new(GET_VELOCITY, vec![(ShaderType::Vec(n), "pos".into())], ShaderType::Vec(n))
                .with_body(vec![Stmt::Return(ShaderExpr::Construct(ShaderType::Vec(n), components))]),
        );
        if method == ImplicitMethod::Newton {
            let j = ExpressionMatrix::jacobian(&exprs, positional_variables(n));
            module.add_function(emit_velocity_jacobian(&j, "u_alpha").unwrap());
        }
        module.add_function(emit_integrate(kind, n, iterations, method));
        module
    }

    fn run(module: &ShaderModule, start: &[f64], h: f64, steps: usize) -> Vec<f64> {
        let eval = Evaluator::new(module).unwrap();
        let mut pos = Value::vector(start);
        for _ in 0..steps {
            pos = eval.call(INTEGRATE, &[pos, Value::Float(h)]).unwrap();
        }
        match pos {
            Value::Vec(v) => v,
            other => panic!("expected a vector, found {:?}", other),
        }
    }

    const OSCILLATOR: [&str; 2] = ["y", "-x"];

    #[test]
    fn explicit_schemes_converge_at_their_order() {
        let exact = [1f64.cos(), -1f64.sin()];
        for (kind, tolerance) in [
            (IntegratorKind::Euler, 1e-2),
            (IntegratorKind::Rk2, 1e-4),
            (IntegratorKind::Rk4, 1e-9),
        ] {
            let module = module_with(&OSCILLATOR, kind, 0, ImplicitMethod::FixedPoint);
            let end = run(&module, &[1.0, 0.0], 0.001, 1000);
            assert_relative_eq!(end[0], exact[0], epsilon = tolerance);
            assert_relative_eq!(end[1], exact[1], epsilon = tolerance);
        }
    }

    #[test]
    fn newton_matches_exact_implicit_euler_on_linear_systems() {
        let module = module_with(&OSCILLATOR, IntegratorKind::ImplicitEuler, 2, ImplicitMethod::Newton);
        let h = 0.1;
        let end = run(&module, &[1.0, 0.0], h, 1);
        // (I - hA) x1 = x0 with A = [[0, 1], [-1, 0]]
        let det = 1.0 + h * h;
        assert_relative_eq!(end[0], 1.0 / det, epsilon = 1e-12);
        assert_relative_eq!(end[1], -h / det, epsilon = 1e-12);
    }

    #[test]
    fn implicit_schemes_track_the_oscillator() {
        for kind in [
            IntegratorKind::ImplicitEuler,
            IntegratorKind::ImplicitMidpoint,
            IntegratorKind::Trapezoidal,
            IntegratorKind::GaussLegendre,
        ] {
            let module = module_with(&OSCILLATOR, kind, kind.default_iterations(), ImplicitMethod::FixedPoint);
            let end = run(&module, &[1.0, 0.0], 0.01, 100);
            assert_relative_eq!(end[0], 1f64.cos(), epsilon = 1e-2);
            assert_relative_eq!(end[1], -1f64.sin(), epsilon = 1e-2);
        }
    }

    #[test]
    fn symplectic_euler_updates_momentum_first() {
        let module = module_with(&OSCILLATOR, IntegratorKind::SymplecticEuler, 0, ImplicitMethod::FixedPoint);
        let h = 0.5;
        let end = run(&module, &[1.0, 0.0], h, 1);
        let momentum = 0.0 - h * 1.0;
        assert_relative_eq!(end[1], momentum);
        assert_relative_eq!(end[0], 1.0 + h * momentum);

        let odd = module_with(&["y", "-x", "z"], IntegratorKind::SymplecticEuler, 0, ImplicitMethod::FixedPoint);
        let end = run(&odd, &[1.0, 0.0, 2.0], 0.5, 1);
        assert_relative_eq!(end[2], 3.0);
    }

    #[test]
    fn metadata_per_scheme() {
        assert_eq!(IntegratorKind::Rk4.order(), 4);
        assert_eq!(IntegratorKind::GaussLegendre.default_iterations(), 5);
        assert!(IntegratorKind::Trapezoidal.is_implicit());
        assert!(!IntegratorKind::SymplecticEuler.is_implicit());
        assert_eq!(IntegratorKind::ImplicitEuler.stability().to_string(), "L-stable");
        let parsed: IntegratorKind = serde_json::from_str("\"symplectic\"").unwrap();
        assert_eq!(parsed, IntegratorKind::SymplecticEuler);
        let parsed: IntegratorKind = serde_json::from_str("\"implicit-midpoint\"").unwrap();
        assert_eq!(parsed, IntegratorKind::ImplicitMidpoint);
    }
}
