//! End-to-end checks that run compiled programs through the CPU evaluator.

use std::collections::HashMap;
use std::sync::OnceLock;

use approx::assert_relative_eq;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::codegen::{Bindings, CodeGenerator, Value};
use crate::compiler::{compile, CompileConfig, CompileErrorKind, CompileOutput};
use crate::coordinates::{
    ChartKind, CoordinateSystem, CoordinateSystemRecord, VariableLabel, TO_CARTESIAN, TO_NATIVE,
    VELOCITY_TO_CARTESIAN,
};
use crate::diagnostics::DiagnosticKind;
use crate::expression::Expression;
use crate::functions::{BinaryFunction, BinaryOp, NamedConstant, UnaryFunction};
use crate::integrators::{ImplicitMethod, IntegratorKind, GET_VELOCITY, INTEGRATE};
use crate::syntax::parse;

fn call(out: &CompileOutput, name: &str, args: &[Value]) -> Vec<f64> {
    out.evaluator()
        .unwrap()
        .call(name, args)
        .unwrap()
        .as_vec()
        .unwrap()
        .to_vec()
}

fn integrate(out: &CompileOutput, start: &[f64], h: f64, steps: usize) -> Vec<Vec<f64>> {
    let eval = out.evaluator().unwrap();
    let mut pos = start.to_vec();
    let mut path = vec![pos.clone()];
    for _ in 0..steps {
        let next = eval
            .call(INTEGRATE, &[Value::vector(&pos), Value::Float(h)])
            .unwrap();
        pos = next.as_vec().unwrap().to_vec();
        path.push(pos.clone());
    }
    path
}

fn sample_point(rng: &mut StdRng, n: usize) -> Vec<f64> {
    (0..n)
        .map(|_| if rng.gen_bool(0.2) { 0.0 } else { rng.gen_range(-3.0..3.0) })
        .collect()
}

#[test]
fn polar_radial_outflow_points_away_from_origin() {
    let config = CompileConfig::new(2, &["r", "0"]).with_preset("polar2d");
    let out = compile(&config).unwrap();
    assert_eq!(out.metadata.chart_count, 2);

    let east = call(&out, GET_VELOCITY, &[Value::vector(&[1.0, 0.0])]);
    assert_relative_eq!(east[0], 1.0, epsilon = 1e-6);
    assert_relative_eq!(east[1], 0.0, epsilon = 1e-6);

    let north = call(&out, GET_VELOCITY, &[Value::vector(&[0.0, 1.0])]);
    assert_relative_eq!(north[0], 0.0, epsilon = 1e-6);
    assert_relative_eq!(north[1], 1.0, epsilon = 1e-6);
}

#[test]
fn polar_rigid_rotation_follows_the_circle() {
    let config = CompileConfig::new(2, &["0", "1"])
        .with_preset("polar2d")
        .with_integrator(IntegratorKind::Rk4);
    let out = compile(&config).unwrap();

    let path = integrate(&out, &[1.0, 0.0], 0.01, 628);
    let end = path.last().unwrap();
    // 628 steps of 0.01 stop just short of a full turn.
    assert_relative_eq!(end[0], 6.28f64.cos(), epsilon = 1e-3);
    assert_relative_eq!(end[1], 6.28f64.sin(), epsilon = 1e-3);
    for pos in &path {
        assert_relative_eq!(pos[0].hypot(pos[1]), 1.0, epsilon = 1e-3);
    }

    // A short tail step completes the turn and closes the orbit.
    let tail = std::f64::consts::TAU - 628.0 * 0.01;
    let closed = call(&out, INTEGRATE, &[Value::vector(end), Value::Float(tail)]);
    assert!((closed[0] - 1.0).hypot(closed[1]) < 1e-3, "orbit ends at {:?}", closed);
}

#[test]
fn symplectic_oscillator_keeps_its_energy() {
    let config = CompileConfig::new(2, &["y", "-x"])
        .with_preset("cartesian2d")
        .with_integrator(IntegratorKind::SymplecticEuler);
    let out = compile(&config).unwrap();
    assert!(out.diagnostics.is_empty());

    let path = integrate(&out, &[1.0, 0.0], 0.01, 10_000);
    let drift = path
        .iter()
        .map(|p| (p[0] * p[0] + p[1] * p[1] - 1.0).abs())
        .fold(0.0, f64::max);
    assert!(drift < 0.01, "energy drifted by {}", drift);
}

#[test]
fn newton_falls_back_on_non_differentiable_velocity() {
    let config = CompileConfig::new(2, &["abs(x)", "-y"])
        .with_integrator(IntegratorKind::ImplicitEuler)
        .with_method(ImplicitMethod::Newton);
    let out = compile(&config).unwrap();
    assert!(out.has_diagnostic(DiagnosticKind::JacobianNonDifferentiable));
    assert_eq!(out.metadata.implicit_method, Some(ImplicitMethod::FixedPoint));
    assert!(!out.module.contains_function("velocityJacobian"));

    let next = call(&out, INTEGRATE, &[Value::vector(&[-1.0, 2.0]), Value::Float(0.01)]);
    assert!(next.iter().all(|c| c.is_finite()));
    assert_relative_eq!(next[0], -1.0 / 1.01, epsilon = 1e-6);
    assert_relative_eq!(next[1], 2.0 / 1.01, epsilon = 1e-6);
}

#[test]
fn newton_implicit_euler_solves_linear_decay_exactly() {
    let config = CompileConfig::new(2, &["-x", "-2 * y"])
        .with_integrator(IntegratorKind::ImplicitEuler)
        .with_method(ImplicitMethod::Newton);
    let out = compile(&config).unwrap();
    assert!(out.diagnostics.is_empty());
    assert_eq!(out.metadata.implicit_method, Some(ImplicitMethod::Newton));

    let next = call(&out, INTEGRATE, &[Value::vector(&[1.0, 1.0]), Value::Float(0.5)]);
    assert_relative_eq!(next[0], 1.0 / 1.5, epsilon = 1e-9);
    assert_relative_eq!(next[1], 1.0 / 2.0, epsilon = 1e-9);
}

#[test]
fn newton_in_polar_composes_the_inverse_jacobian() {
    let config = CompileConfig::new(2, &["0", "1"])
        .with_preset("polar2d")
        .with_integrator(IntegratorKind::ImplicitEuler)
        .with_method(ImplicitMethod::Newton);
    let out = compile(&config).unwrap();
    assert_eq!(out.metadata.implicit_method, Some(ImplicitMethod::Newton));
    let next = call(&out, INTEGRATE, &[Value::vector(&[1.0, 0.0]), Value::Float(0.01)]);
    // Backward Euler on a rotation: (1, h) / (1 + h^2).
    assert_relative_eq!(next[0], 1.0 / 1.0001, epsilon = 1e-6);
    assert_relative_eq!(next[1], 0.01 / 1.0001, epsilon = 1e-6);
}

#[test]
fn rank_deficient_system_falls_back_to_identity() {
    let record = CoordinateSystemRecord {
        name: "collapsed".into(),
        dimensions: 2,
        variables: vec![VariableLabel::new("p", "p"), VariableLabel::new("q", "q")],
        forward_transforms: vec!["x".into(), "x".into()],
        inverse_transforms: None,
        use_iterative_solver: false,
    };
    let config = CompileConfig::new(2, &["p", "q"]).with_coordinate_system(record);
    let out = compile(&config).unwrap();
    assert!(out.has_diagnostic(DiagnosticKind::JacobianSingular));
    assert!(out.has_diagnostic(DiagnosticKind::InverseMissingFallbackIdentity));

    let v = call(
        &out,
        VELOCITY_TO_CARTESIAN,
        &[Value::vector(&[0.3, 0.7]), Value::vector(&[1.0, 2.0])],
    );
    assert_eq!(v, vec![0.3, 0.7]);
}

#[test]
fn atlas_switches_charts_away_from_the_x_axis() {
    let system = CoordinateSystem::preset("polar2d").unwrap();
    let atlas = system.atlas();
    let east = HashMap::from([("x", 1.0), ("y", 0.0)]);
    let north = HashMap::from([("x", 0.0), ("y", 1.0)]);
    assert_eq!(atlas.charts()[atlas.select(&east).unwrap()].kind, ChartKind::Primary);
    assert_eq!(atlas.charts()[atlas.select(&north).unwrap()].kind, ChartKind::Swapped);

    let out = compile(&CompileConfig::new(2, &["0", "0"]).with_preset("polar2d")).unwrap();
    let radial = Value::vector(&[1.0, 0.0]);
    let at_east = call(&out, VELOCITY_TO_CARTESIAN, &[radial.clone(), Value::vector(&[1.0, 0.0])]);
    let at_north = call(&out, VELOCITY_TO_CARTESIAN, &[radial, Value::vector(&[0.0, 1.0])]);
    assert_relative_eq!(at_east[0], 1.0, epsilon = 1e-5);
    assert_relative_eq!(at_east[1], 0.0, epsilon = 1e-5);
    assert_relative_eq!(at_north[0], 0.0, epsilon = 1e-5);
    assert_relative_eq!(at_north[1], 1.0, epsilon = 1e-5);

    // Where both charts are valid they must agree.
    let shared = HashMap::from([("x", 0.6), ("y", 0.8)]);
    let velocities: Vec<Vec<f64>> = atlas
        .charts()
        .iter()
        .map(|chart| {
            let jacobian = crate::matrix::ExpressionMatrix::jacobian(&chart.forward, system.positional());
            let inverse = jacobian.inverse().unwrap().to_matrix();
            let native = [Expression::one(), Expression::from_float(0.5)];
            inverse
                .mul_vector(&native)
                .iter()
                .map(|e| e.eval(&shared).unwrap())
                .collect()
        })
        .collect();
    assert_relative_eq!(velocities[0][0], velocities[1][0], epsilon = 1e-5);
    assert_relative_eq!(velocities[0][1], velocities[1][1], epsilon = 1e-5);
}

#[test]
fn cartesian_velocity_transform_is_the_identity() {
    let mut rng = StdRng::seed_from_u64(2);
    for (n, preset) in [(2, "cartesian2d"), (3, "cartesian3d"), (4, "cartesian4d")] {
        let config = CompileConfig::new(n, &vec!["0"; n]).with_preset(preset);
        let out = compile(&config).unwrap();
        for _ in 0..50 {
            let v = sample_point(&mut rng, n);
            let pos = sample_point(&mut rng, n);
            let result = call(&out, VELOCITY_TO_CARTESIAN, &[Value::vector(&v), Value::vector(&pos)]);
            assert_eq!(result, v);
        }
    }
}

#[test]
fn atlases_cover_every_sample_point() {
    let mut rng = StdRng::seed_from_u64(3);
    for name in CoordinateSystem::preset_names() {
        let system = CoordinateSystem::preset(name).unwrap();
        let positional = system.positional();
        for _ in 0..500 {
            let point = sample_point(&mut rng, system.dimensions());
            let args: HashMap<&str, f64> = positional.iter().copied().zip(point).collect();
            assert!(system.atlas().covers(&args).unwrap(), "{} misses {:?}", name, args);
        }
    }
}

#[test]
fn emitted_inverses_undo_the_forward_transforms() {
    let mut rng = StdRng::seed_from_u64(4);
    for name in ["polar2d", "cylindrical3d", "spherical3d", "hyperspherical4d"] {
        let system = CoordinateSystem::preset(name).unwrap();
        let n = system.dimensions();
        let out = compile(&CompileConfig::new(n, &vec!["0"; n]).with_preset(name)).unwrap();
        let eval = out.evaluator().unwrap();
        for _ in 0..100 {
            // Radius first, then angles away from the polar axes.
            let native: Vec<f64> = (0..n)
                .map(|i| if i == 0 { rng.gen_range(0.5..2.0) } else { rng.gen_range(0.2..2.9) })
                .collect();
            let cartesian = eval.call(TO_CARTESIAN, &[Value::vector(&native)]).unwrap();
            let back = eval.call(TO_NATIVE, &[cartesian]).unwrap();
            for (got, want) in back.as_vec().unwrap().iter().zip(&native) {
                assert_relative_eq!(*got, *want, epsilon = 1e-4);
            }
        }
    }
}

#[test]
fn rejects_one_and_five_dimensions() {
    for n in [1, 5] {
        let failure = compile(&CompileConfig::new(n, &vec!["x"; n])).unwrap_err();
        assert!(failure.contains(CompileErrorKind::DimensionMismatch));
    }
}

#[test]
fn boundary_expressions_compile() {
    let config = CompileConfig::new(2, &["-x + 0^y", "x*-2 - atan2(0, 0) + y^0"]);
    let out = compile(&config).unwrap();
    let v = call(&out, GET_VELOCITY, &[Value::vector(&[1.5, 2.0])]);
    assert_relative_eq!(v[0], -1.5, epsilon = 1e-12);
    assert_relative_eq!(v[1], -2.0, epsilon = 1e-12);
}

fn leaf() -> impl Strategy<Value = Expression> {
    prop_oneof![
        Just(Expression::var("x")),
        Just(Expression::var("y")),
        (-5.0..5.0f64).prop_map(Expression::from_float),
        Just(Expression::Constant(NamedConstant::Pi)),
    ]
}

fn expression() -> impl Strategy<Value = Expression> {
    leaf().prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (prop::sample::select(UnaryFunction::ALL.to_vec()), inner.clone())
                .prop_map(|(f, arg)| Expression::unary(f, arg)),
            (prop::sample::select(BinaryFunction::ALL.to_vec()), inner.clone(), inner.clone())
                .prop_map(|(f, a, b)| Expression::function(f, a, b)),
            (
                prop::sample::select(vec![BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div, BinaryOp::Mod]),
                inner.clone(),
                inner.clone()
            )
                .prop_map(|(op, a, b)| Expression::binary(op, a, b)),
            (inner, -3.0..3.0f64).prop_map(|(base, p)| Expression::pow(base, Expression::from_float(p))),
        ]
    })
}

fn same_value(a: f64, b: f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b || (a - b).abs() <= 1e-9 * a.abs().max(1.0)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn emitted_source_parses_back_to_the_same_function(expr in expression(), seed in any::<u64>()) {
        let bindings = Bindings::identity(&["x", "y"]);
        let emitted = CodeGenerator::new(&bindings).build_expression(&expr).unwrap().to_string();
        let reparsed = parse(&emitted).unwrap();

        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..1000 {
            let args = HashMap::from([("x", rng.gen_range(-4.0..4.0)), ("y", rng.gen_range(-4.0..4.0))]);
            let want = expr.eval(&args).unwrap();
            let got = reparsed.eval(&args).unwrap();
            prop_assert!(same_value(want, got), "{} vs {} at {:?}: {} != {}", expr, emitted, args, want, got);
        }
    }
}

/// `(label, f, df/dx, df/dy)` for every differentiable primitive.
fn derivative_table() -> &'static [(String, Expression, Expression, Expression)] {
    static TABLE: OnceLock<Vec<(String, Expression, Expression, Expression)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let x = Expression::var("x");
        let y = Expression::var("y");
        let arg = &x * &y / Expression::from_float(2.0);
        let mut functions: Vec<(String, Expression)> = UnaryFunction::ALL
            .iter()
            .filter(|f| f.is_differentiable())
            .map(|f| (f.name().to_string(), Expression::unary(*f, arg.clone())))
            .collect();
        functions.extend(
            BinaryFunction::ALL
                .iter()
                .filter(|f| f.is_differentiable())
                .map(|f| (f.name().to_string(), Expression::function(*f, x.clone(), y.clone()))),
        );
        functions.extend(
            [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div, BinaryOp::Pow]
                .into_iter()
                .map(|op| (format!("{:?}", op), Expression::binary(op, x.clone(), y.clone()))),
        );
        functions
            .into_iter()
            .map(|(label, f)| {
                let dx = f.derivative("x");
                let dy = f.derivative("y");
                (label, f, dx, dy)
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn derivatives_match_central_differences(x in 0.2..0.8f64, y in 0.3..1.5f64) {
        let h = 1e-5;
        let at = |x: f64, y: f64| HashMap::from([("x", x), ("y", y)]);
        for (label, f, dx, dy) in derivative_table() {
            let numeric_x = (f.eval(&at(x + h, y)).unwrap() - f.eval(&at(x - h, y)).unwrap()) / (2.0 * h);
            let numeric_y = (f.eval(&at(x, y + h)).unwrap() - f.eval(&at(x, y - h)).unwrap()) / (2.0 * h);
            let symbolic_x = dx.eval(&at(x, y)).unwrap();
            let symbolic_y = dy.eval(&at(x, y)).unwrap();
            prop_assert!((symbolic_x - numeric_x).abs() <= 1e-5 * symbolic_x.abs().max(1.0),
                "d{}/dx = {} gives {}, expected {}", label, dx, symbolic_x, numeric_x);
            prop_assert!((symbolic_y - numeric_y).abs() <= 1e-5 * symbolic_y.abs().max(1.0),
                "d{}/dy = {} gives {}, expected {}", label, dy, symbolic_y, numeric_y);
        }
    }
}
