//! The compile driver: configuration in, GLSL and diagnostics out.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::codegen::inverse::PIVOT_EPSILON;
use crate::codegen::{
    add_runtime_inverse, is_valid_identifier, TEMPORARY_PREFIX, Bindings, CodeGenerator, EmitError, EvalError,
    Evaluator, ShaderExpr, ShaderFunction, ShaderModule, ShaderType, Stmt, DEFAULT_PIVOT_EPSILON,
};
use crate::coordinates::{
    emit_to_cartesian, emit_to_native, emit_velocity_to_cartesian, positional_variables,
    velocity_variables, CoordinateError, CoordinateSystem, CoordinateSystemRecord,
    InverseSolverOptions, InverseStrategy, ALPHA_VARIABLE, MAX_DIMENSIONS, MIN_DIMENSIONS,
    TO_CARTESIAN, TO_NATIVE, VELOCITY_TO_CARTESIAN,
};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::expression::Expression;
use crate::integrators::{
    emit_integrate, emit_velocity_jacobian, ImplicitMethod, IntegratorKind, Stability, GET_VELOCITY,
    INTEGRATE, VELOCITY_JACOBIAN,
};
use crate::matrix::ExpressionMatrix;
use crate::syntax::{find_identifier, parse, SyntaxError};

pub const COLOR_FUNCTION: &str = "evaluateColorExpression";

/// Parameters and locals of the emitted functions. A uniform with one of
/// these names would be shadowed inside the function body.
const EMITTED_LOCALS: &[&str] = &[
    "pos", "h", "i", "x", "m", "a", "inv", "det", "s", "p", "f", "f0", "k1", "k2", "k3", "k4",
    "n1", "n2", "next", "v", "moved", "jac", "residual", "guess", "native", "velNative",
    "velocity", "nudged", "invDet",
];

/// Whether `name` is already taken by something the compiler emits.
fn collides_with_emitted(name: &str) -> bool {
    let numbered = |prefix: &str| {
        name.strip_prefix(prefix)
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
    };
    EMITTED_LOCALS.contains(&name)
        || [
            COLOR_FUNCTION,
            PIVOT_EPSILON,
            TO_NATIVE,
            TO_CARTESIAN,
            VELOCITY_TO_CARTESIAN,
            GET_VELOCITY,
            VELOCITY_JACOBIAN,
            INTEGRATE,
        ]
        .contains(&name)
        || numbered(TEMPORARY_PREFIX)
        || numbered("invertMatrix")
}

/// A preset key or a full coordinate system record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoordinateSystemSpec {
    Preset(String),
    Record(CoordinateSystemRecord),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntegratorParams {
    pub iterations: Option<usize>,
    pub method: ImplicitMethod,
    /// Cartesian-space velocity expressions used for the Newton Jacobian.
    pub newton_expressions: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UniformNames {
    pub alpha_name: String,
}

impl Default for UniformNames {
    fn default() -> Self {
        UniformNames {
            alpha_name: "u_alpha".to_string(),
        }
    }
}

fn default_pivot_epsilon() -> f64 {
    DEFAULT_PIVOT_EPSILON
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileConfig {
    pub dimensions: usize,
    pub derivatives: Vec<String>,
    /// Cartesian of `dimensions` when absent.
    #[serde(default)]
    pub coordinate_system: Option<CoordinateSystemSpec>,
    #[serde(default)]
    pub integrator: IntegratorKind,
    #[serde(default)]
    pub integrator_params: IntegratorParams,
    #[serde(default)]
    pub uniforms: UniformNames,
    #[serde(default = "default_pivot_epsilon")]
    pub pivot_epsilon: f64,
    #[serde(default)]
    pub inverse_solver: InverseSolverOptions,
    #[serde(default)]
    pub color_expression: Option<String>,
}

impl CompileConfig {
    pub fn new<S: AsRef<str>>(dimensions: usize, derivatives: &[S]) -> Self {
        CompileConfig {
            dimensions,
            derivatives: derivatives.iter().map(|d| d.as_ref().to_string()).collect(),
            coordinate_system: None,
            integrator: IntegratorKind::default(),
            integrator_params: IntegratorParams::default(),
            uniforms: UniformNames::default(),
            pivot_epsilon: DEFAULT_PIVOT_EPSILON,
            inverse_solver: InverseSolverOptions::default(),
            color_expression: None,
        }
    }

    pub fn with_preset(mut self, name: &str) -> Self {
        self.coordinate_system = Some(CoordinateSystemSpec::Preset(name.to_string()));
        self
    }

    pub fn with_coordinate_system(mut self, record: CoordinateSystemRecord) -> Self {
        self.coordinate_system = Some(CoordinateSystemSpec::Record(record));
        self
    }

    pub fn with_integrator(mut self, integrator: IntegratorKind) -> Self {
        self.integrator = integrator;
        self
    }

    pub fn with_method(mut self, method: ImplicitMethod) -> Self {
        self.integrator_params.method = method;
        self
    }

    pub fn from_json(text: &str) -> Result<Self, CompileFailure> {
        serde_json::from_str(text).map_err(|e| {
            CompileFailure::single(CompileError::new(
                CompileErrorKind::ParseError,
                format!("malformed configuration: {}", e),
            ))
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum CompileErrorKind {
    LexicalError,
    ParseError,
    UnknownIdentifier,
    ArityError,
    DimensionMismatch,
    UnsupportedFeature,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(d) = self.dimension {
            write!(f, " in dimension {}", d)?;
        }
        if let Some(p) = self.position {
            write!(f, " at position {}", p)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for CompileError {}

impl CompileError {
    pub fn new<S: Into<String>>(kind: CompileErrorKind, message: S) -> Self {
        CompileError {
            kind,
            message: message.into(),
            dimension: None,
            position: None,
        }
    }

    pub fn in_dimension(mut self, dimension: Option<usize>) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn at(mut self, position: Option<usize>) -> Self {
        self.position = position;
        self
    }
}

impl From<SyntaxError> for CompileError {
    fn from(e: SyntaxError) -> Self {
        let kind = match &e {
            e if e.is_lexical() => CompileErrorKind::LexicalError,
            SyntaxError::Arity { .. } => CompileErrorKind::ArityError,
            SyntaxError::UnknownFunction { .. } => CompileErrorKind::UnknownIdentifier,
            _ => CompileErrorKind::ParseError,
        };
        CompileError::new(kind, e.to_string()).at(e.position())
    }
}

impl From<CoordinateError> for CompileError {
    fn from(e: CoordinateError) -> Self {
        match e {
            CoordinateError::Syntax { source, .. } => {
                let position = source.position();
                let mut error = CompileError::from(source);
                error.message = format!("coordinate system: {}", error.message);
                error.at(position)
            }
            CoordinateError::UnsupportedDimension(_) | CoordinateError::CountMismatch { .. } => {
                CompileError::new(CompileErrorKind::DimensionMismatch, e.to_string())
            }
            CoordinateError::UnknownIdentifier { .. } => {
                CompileError::new(CompileErrorKind::UnknownIdentifier, e.to_string())
            }
            CoordinateError::Json(_) => CompileError::new(CompileErrorKind::ParseError, e.to_string()),
            CoordinateError::UnknownPreset(_)
            | CoordinateError::InvalidLabel(_)
            | CoordinateError::DuplicateLabel(_) => {
                CompileError::new(CompileErrorKind::UnsupportedFeature, e.to_string())
            }
        }
    }
}

impl From<EmitError> for CompileError {
    fn from(e: EmitError) -> Self {
        let kind = match e {
            EmitError::UnknownIdentifier { .. } => CompileErrorKind::UnknownIdentifier,
            EmitError::Inversion(_) => CompileErrorKind::UnsupportedFeature,
        };
        CompileError::new(kind, e.to_string())
    }
}

/// Every fatal error found, across all dimensions.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("compilation failed: {}", join_errors(.errors))]
pub struct CompileFailure {
    pub errors: Vec<CompileError>,
}

fn join_errors(errors: &[CompileError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl CompileFailure {
    pub fn single(error: CompileError) -> Self {
        CompileFailure { errors: vec![error] }
    }

    pub fn contains(&self, kind: CompileErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }
}

impl From<EmitError> for CompileFailure {
    fn from(e: EmitError) -> Self {
        CompileFailure::single(e.into())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileMetadata {
    pub dimensions: usize,
    pub coordinate_system: String,
    pub chart_count: usize,
    pub inverse_strategy: InverseStrategy,
    pub integrator: IntegratorKind,
    pub order: u8,
    pub stability: Stability,
    /// `None` for explicit schemes.
    pub implicit_method: Option<ImplicitMethod>,
    pub iterations: usize,
    pub alpha_uniform: String,
    pub functions: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct CompileOutput {
    pub shader_source: String,
    pub module: ShaderModule,
    pub diagnostics: Vec<Diagnostic>,
    pub metadata: CompileMetadata,
}

impl CompileOutput {
    /// A CPU interpreter for the emitted program.
    pub fn evaluator(&self) -> Result<Evaluator<'_>, EvalError> {
        Evaluator::new(&self.module)
    }

    pub fn has_diagnostic(&self, kind: DiagnosticKind) -> bool {
        self.diagnostics.iter().any(|d| d.kind == kind)
    }
}

/// Parsed and validated inputs.
struct Validated {
    system: CoordinateSystem,
    derivatives: Vec<Expression>,
    newton_expressions: Option<Vec<Expression>>,
    color: Option<Expression>,
}

/// Parses `source` and checks that it only names `allowed` identifiers.
fn parse_checked(
    source: &str,
    allowed: &BTreeSet<String>,
    dimension: Option<usize>,
    what: &str,
    errors: &mut Vec<CompileError>,
) -> Option<Expression> {
    let expr = match parse(source) {
        Ok(expr) => expr,
        Err(e) => {
            let mut error = CompileError::from(e).in_dimension(dimension);
            error.message = format!("{}: {}", what, error.message);
            errors.push(error);
            return None;
        }
    };
    let unknown: Vec<String> = expr
        .variables()
        .into_iter()
        .filter(|v| !allowed.contains(v))
        .collect();
    for identifier in &unknown {
        errors.push(
            CompileError::new(
                CompileErrorKind::UnknownIdentifier,
                format!("{}: unknown identifier `{}`", what, identifier),
            )
            .in_dimension(dimension)
            .at(find_identifier(source, identifier)),
        );
    }
    unknown.is_empty().then_some(expr)
}

fn validate(config: &CompileConfig) -> Result<Validated, CompileFailure> {
    let n = config.dimensions;
    if !(MIN_DIMENSIONS..=MAX_DIMENSIONS).contains(&n) {
        return Err(CompileFailure::single(CompileError::new(
            CompileErrorKind::DimensionMismatch,
            format!("dimensions must be between {} and {}, found {}", MIN_DIMENSIONS, MAX_DIMENSIONS, n),
        )));
    }

    let mut errors = Vec::new();
    if config.derivatives.len() != n {
        errors.push(CompileError::new(
            CompileErrorKind::DimensionMismatch,
            format!("expected {} derivative expressions, found {}", n, config.derivatives.len()),
        ));
    }
    let alpha_name = &config.uniforms.alpha_name;
    if !is_valid_identifier(alpha_name) {
        errors.push(CompileError::new(
            CompileErrorKind::UnsupportedFeature,
            format!("`{}` is not a usable uniform name", alpha_name),
        ));
    } else if collides_with_emitted(alpha_name) {
        errors.push(CompileError::new(
            CompileErrorKind::UnsupportedFeature,
            format!("uniform name `{}` clashes with a name in the generated shader", alpha_name),
        ));
    }
    if !(config.pivot_epsilon.is_finite() && config.pivot_epsilon > 0.0) {
        errors.push(CompileError::new(
            CompileErrorKind::UnsupportedFeature,
            format!("pivot epsilon must be positive, found {}", config.pivot_epsilon),
        ));
    }
    if !(config.inverse_solver.tolerance.is_finite() && config.inverse_solver.tolerance > 0.0) {
        errors.push(CompileError::new(
            CompileErrorKind::UnsupportedFeature,
            format!("inverse solver tolerance must be positive, found {}", config.inverse_solver.tolerance),
        ));
    }

    let system = match &config.coordinate_system {
        None => CoordinateSystem::cartesian(n),
        Some(CoordinateSystemSpec::Preset(name)) => CoordinateSystem::preset(name),
        Some(CoordinateSystemSpec::Record(record)) => CoordinateSystem::from_record(record),
    };
    let system = match system {
        Ok(system) if system.dimensions() != n => {
            errors.push(CompileError::new(
                CompileErrorKind::DimensionMismatch,
                format!(
                    "coordinate system `{}` has {} dimensions, expected {}",
                    system.name(),
                    system.dimensions(),
                    n
                ),
            ));
            None
        }
        Ok(system) => Some(system),
        Err(e) => {
            errors.push(e.into());
            None
        }
    };

    let positional: BTreeSet<String> = positional_variables(n).iter().map(|v| v.to_string()).collect();
    let alpha = BTreeSet::from([ALPHA_VARIABLE.to_string()]);
    let labels: BTreeSet<String> = match &system {
        Some(system) => system.labels().iter().map(|l| l.to_string()).collect(),
        None => BTreeSet::new(),
    };

    let state: BTreeSet<String> = positional.iter().chain(&labels).chain(&alpha).cloned().collect();
    let derivatives: Vec<_> = config
        .derivatives
        .iter()
        .enumerate()
        .map(|(i, source)| parse_checked(source, &state, Some(i), "derivative", &mut errors))
        .collect();

    let cartesian: BTreeSet<String> = positional.iter().chain(&alpha).cloned().collect();
    let newton_expressions = match &config.integrator_params.newton_expressions {
        Some(sources) if sources.len() != n => {
            errors.push(CompileError::new(
                CompileErrorKind::DimensionMismatch,
                format!("expected {} Newton expressions, found {}", n, sources.len()),
            ));
            None
        }
        Some(sources) => Some(
            sources
                .iter()
                .enumerate()
                .map(|(i, source)| parse_checked(source, &cartesian, Some(i), "Newton expression", &mut errors))
                .collect::<Vec<_>>(),
        ),
        None => None,
    };

    let color = config.color_expression.as_ref().and_then(|source| {
        let velocity: BTreeSet<String> = velocity_variables(n).into_iter().collect();
        let allowed = cartesian.union(&velocity).cloned().collect();
        parse_checked(source, &allowed, None, "color expression", &mut errors)
    });

    match system {
        Some(system) if errors.is_empty() => Ok(Validated {
            system,
            derivatives: derivatives.into_iter().flatten().collect(),
            newton_expressions: newton_expressions.map(|exprs| exprs.into_iter().flatten().collect()),
            color,
        }),
        _ => Err(CompileFailure { errors }),
    }
}

/// Cartesian-space velocity expressions for the Newton Jacobian, in order of
/// preference: caller-supplied, the derivatives themselves in a Cartesian
/// system, or `J_F^-1 g(F(x))`.
fn newton_velocity(validated: &Validated) -> Option<Vec<Expression>> {
    if let Some(exprs) = &validated.newton_expressions {
        return Some(exprs.clone());
    }
    let system = &validated.system;
    if system.is_cartesian() {
        return Some(validated.derivatives.clone());
    }

    let inverse = system.jacobian().inverse().ok()?;
    let forward: HashMap<String, Expression> = system
        .labels()
        .iter()
        .zip(system.forward())
        .map(|(label, f)| (label.to_string(), f.clone()))
        .collect();
    let native: Vec<Expression> = validated
        .derivatives
        .iter()
        .map(|d| d.substitute_variables(&forward))
        .collect();
    Some(inverse.apply(&native))
}

fn emit_get_velocity(validated: &Validated, alpha: &str) -> Result<ShaderFunction, EmitError> {
    let system = &validated.system;
    let n = system.dimensions();
    let vec_n = ShaderType::Vec(n);

    let mut bindings = Bindings::new();
    bindings
        .bind_vector(system.positional(), "pos")
        .bind(ALPHA_VARIABLE, ShaderExpr::var(alpha));
    let cartesian = system.is_cartesian();
    if !cartesian {
        // Native labels shadow positional names.
        bindings.bind_vector(&system.labels(), "native");
    }

    let mut gen = CodeGenerator::new(&bindings)
        .with_hoisting(TEMPORARY_PREFIX)
        .with_clamped_inverse_trig();
    gen.prepare(&validated.derivatives);
    let components = validated
        .derivatives
        .iter()
        .map(|d| gen.build_expression(d))
        .collect::<Result<Vec<_>, _>>()?;
    let derivative = ShaderExpr::Construct(vec_n, components);

    let mut body = Vec::new();
    if !cartesian {
        body.push(Stmt::let_(vec_n, "native", ShaderExpr::call(TO_NATIVE, vec![ShaderExpr::var("pos")])));
    }
    body.extend(gen.take_statements());
    if cartesian {
        body.push(Stmt::Return(derivative));
    } else {
        body.push(Stmt::let_(vec_n, "velNative", derivative));
        body.push(Stmt::Return(ShaderExpr::call(
            VELOCITY_TO_CARTESIAN,
            vec![ShaderExpr::var("velNative"), ShaderExpr::var("pos")],
        )));
    }
    Ok(ShaderFunction::new(GET_VELOCITY, vec![(vec_n, "pos".into())], vec_n).with_body(body))
}

fn emit_color(color: &Expression, n: usize, alpha: &str) -> Result<ShaderFunction, EmitError> {
    let mut bindings = Bindings::new();
    bindings
        .bind_vector(positional_variables(n), "pos")
        .bind_vector(&velocity_variables(n), "velocity")
        .bind(ALPHA_VARIABLE, ShaderExpr::var(alpha));
    let mut gen = CodeGenerator::new(&bindings)
        .with_hoisting(TEMPORARY_PREFIX)
        .with_clamped_inverse_trig();
    gen.prepare([color]);
    let value = gen.build_expression(color)?;
    let mut body = gen.take_statements();
    body.push(Stmt::Return(value));
    Ok(ShaderFunction::new(
        COLOR_FUNCTION,
        vec![(ShaderType::Vec(n), "pos".into()), (ShaderType::Vec(n), "velocity".into())],
        ShaderType::Float,
    )
    .with_body(body))
}

/// Compiles an ODE system into a self-contained GLSL program.
///
/// All per-dimension errors are reported together. Anything that only
/// degrades the output is recorded as a diagnostic instead.
#[instrument(skip(config), fields(dimensions = config.dimensions, integrator = %config.integrator))]
pub fn compile(config: &CompileConfig) -> Result<CompileOutput, CompileFailure> {
    let validated = validate(config)?;
    let system = &validated.system;
    let n = system.dimensions();
    let alpha = config.uniforms.alpha_name.as_str();
    let kind = config.integrator;
    let iterations = config
        .integrator_params
        .iterations
        .unwrap_or_else(|| kind.default_iterations());
    debug!(system = system.name(), charts = system.atlas().len(), "validated");

    let mut diagnostics = Diagnostics::new();
    for (i, derivative) in validated.derivatives.iter().enumerate() {
        let lossy: BTreeSet<_> = system
            .positional()
            .iter()
            .chain(system.labels().iter())
            .flat_map(|v| derivative.non_differentiable_calls(v))
            .collect();
        if !lossy.is_empty() && kind.is_implicit() && config.integrator_params.method == ImplicitMethod::Newton {
            diagnostics.push_for_dimension(
                DiagnosticKind::JacobianNonDifferentiable,
                i,
                format!(
                    "derivative uses {}; Newton iteration is replaced by fixed-point iteration",
                    lossy.into_iter().collect::<Vec<_>>().join(", ")
                ),
            );
        }
    }

    let mut method = match kind.is_implicit() {
        true => config.integrator_params.method,
        false => ImplicitMethod::FixedPoint,
    };
    if method == ImplicitMethod::Newton && !kind.supports_newton() {
        diagnostics.push(
            DiagnosticKind::NewtonUnsupportedByIntegrator,
            format!("{} has no Newton variant; using fixed-point iteration", kind),
        );
        method = ImplicitMethod::FixedPoint;
    }
    if method == ImplicitMethod::Newton && diagnostics.contains(DiagnosticKind::JacobianNonDifferentiable) {
        method = ImplicitMethod::FixedPoint;
    }

    let mut velocity_jacobian = None;
    if method == ImplicitMethod::Newton {
        match newton_velocity(&validated) {
            Some(exprs) => {
                let mut lossy = BTreeSet::new();
                for e in &exprs {
                    for v in system.positional() {
                        lossy.extend(e.non_differentiable_calls(v));
                    }
                }
                if lossy.is_empty() {
                    let jacobian = ExpressionMatrix::jacobian(&exprs, system.positional());
                    velocity_jacobian = Some(emit_velocity_jacobian(&jacobian, alpha)?);
                } else {
                    diagnostics.push(
                        DiagnosticKind::JacobianNonDifferentiable,
                        format!(
                            "Newton expressions use {}; using fixed-point iteration",
                            lossy.into_iter().collect::<Vec<_>>().join(", ")
                        ),
                    );
                }
            }
            None => diagnostics.push(
                DiagnosticKind::NewtonExpressionsMissing,
                "no Cartesian velocity Jacobian could be built; using fixed-point iteration",
            ),
        }
        if velocity_jacobian.is_none() {
            method = ImplicitMethod::FixedPoint;
        }
    }

    let mut module = ShaderModule::new();
    module.add_uniform(alpha, ShaderType::Float);

    if let Some(color) = &validated.color {
        module.add_function(emit_color(color, n, alpha)?);
    }
    if method == ImplicitMethod::Newton || system.inverse_strategy() == InverseStrategy::Newton {
        let name = add_runtime_inverse(&mut module, n, config.pivot_epsilon).map_err(EmitError::from)?;
        debug!(helper = %name, "emitted runtime inverse");
    }

    module.add_function(emit_to_native(system)?);
    module.add_function(emit_to_cartesian(system, &config.inverse_solver, &mut diagnostics)?);
    module.add_function(emit_velocity_to_cartesian(system, &mut diagnostics)?);
    module.add_function(emit_get_velocity(&validated, alpha)?);
    if let Some(jacobian) = velocity_jacobian {
        module.add_function(jacobian);
    }
    module.add_function(emit_integrate(kind, n, iterations, method));

    let metadata = CompileMetadata {
        dimensions: n,
        coordinate_system: system.name().to_string(),
        chart_count: system.atlas().len(),
        inverse_strategy: system.inverse_strategy(),
        integrator: kind,
        order: kind.order(),
        stability: kind.stability(),
        implicit_method: kind.is_implicit().then_some(method),
        iterations: if kind.is_implicit() { iterations } else { 0 },
        alpha_uniform: alpha.to_string(),
        functions: module.function_names(),
    };
    debug!(functions = metadata.functions.len(), diagnostics = diagnostics.len(), "compiled");

    Ok(CompileOutput {
        shader_source: module.to_string(),
        module,
        diagnostics: diagnostics.into_vec(),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_functions_in_contract_order() {
        let mut config = CompileConfig::new(2, &["-r", "1"])
            .with_preset("polar2d")
            .with_integrator(IntegratorKind::ImplicitEuler)
            .with_method(ImplicitMethod::Newton);
        config.color_expression = Some("sqrt(dx^2 + dy^2) * a".into());
        let out = compile(&config).unwrap();
        assert_eq!(
            out.metadata.functions,
            vec![
                COLOR_FUNCTION,
                "invertMatrix2",
                "transformToNative",
                "transformToCartesian",
                "transformVelocityToCartesian",
                "get_velocity",
                "velocityJacobian",
                "integrate",
            ]
        );
        assert_eq!(out.metadata.implicit_method, Some(ImplicitMethod::Newton));
        assert!(out.shader_source.starts_with("const float PIVOT_EPSILON = 0.0001;\nuniform float u_alpha;\n"));
        assert_eq!(out.shader_source.matches("mat2 invertMatrix2(").count(), 1);
    }

    #[test]
    fn aggregates_errors_across_dimensions() {
        let config = CompileConfig::new(3, &["x +", "q * 2", "sin(x, y)"]);
        let failure = compile(&config).unwrap_err();
        let kinds: Vec<_> = failure.errors.iter().map(|e| (e.kind, e.dimension)).collect();
        assert_eq!(
            kinds,
            vec![
                (CompileErrorKind::ParseError, Some(0)),
                (CompileErrorKind::UnknownIdentifier, Some(1)),
                (CompileErrorKind::ArityError, Some(2)),
            ]
        );
        assert_eq!(failure.errors[1].position, Some(0));
    }

    #[test]
    fn classifies_lexical_and_unknown_function_errors() {
        let failure = compile(&CompileConfig::new(2, &["x $ 2", "foo(y)"])).unwrap_err();
        assert_eq!(failure.errors[0].kind, CompileErrorKind::LexicalError);
        assert_eq!(failure.errors[0].position, Some(2));
        assert_eq!(failure.errors[1].kind, CompileErrorKind::UnknownIdentifier);
    }

    #[test]
    fn rejects_out_of_range_dimensions() {
        for n in [1, 5] {
            let derivatives = vec!["0"; n];
            let failure = compile(&CompileConfig::new(n, &derivatives)).unwrap_err();
            assert!(failure.contains(CompileErrorKind::DimensionMismatch));
        }
        let failure = compile(&CompileConfig::new(3, &["0", "0", "0"]).with_preset("polar2d")).unwrap_err();
        assert!(failure.contains(CompileErrorKind::DimensionMismatch));
    }

    #[test]
    fn velocity_variables_belong_to_the_color_expression_only() {
        let failure = compile(&CompileConfig::new(2, &["dx", "0"])).unwrap_err();
        assert!(failure.contains(CompileErrorKind::UnknownIdentifier));
    }

    #[test]
    fn reads_camel_case_json_configuration() {
        let config = CompileConfig::from_json(
            r#"{
                "dimensions": 2,
                "derivatives": ["y", "-x"],
                "coordinateSystem": "cartesian2d",
                "integrator": "gauss-legendre",
                "integratorParams": {"iterations": 7},
                "uniforms": {"alphaName": "u_time"},
                "pivotEpsilon": 1e-6,
                "somethingNew": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.integrator, IntegratorKind::GaussLegendre);
        assert_eq!(config.inverse_solver, InverseSolverOptions::default());
        let out = compile(&config).unwrap();
        assert_eq!(out.metadata.iterations, 7);
        assert_eq!(out.metadata.alpha_uniform, "u_time");
        assert!(out.shader_source.contains("uniform float u_time;"));
        assert!(out.shader_source.contains("for (int i = 0; i < 7; i++)"));

        let record = r#"{"dimensions": 2, "derivatives": ["0", "0"],
            "coordinateSystem": {"name": "shear", "dimensions": 2,
                "variables": [{"label": "p"}, {"label": "q"}],
                "forwardTransforms": ["x + y", "y"],
                "inverseTransforms": ["p - q", "q"]}}"#;
        let out = compile(&CompileConfig::from_json(record).unwrap()).unwrap();
        assert_eq!(out.metadata.coordinate_system, "shear");
        assert_eq!(out.metadata.inverse_strategy, InverseStrategy::Explicit);
    }

    #[test]
    fn alpha_binds_to_the_uniform() {
        let out = compile(&CompileConfig::new(2, &["a * y", "0"])).unwrap();
        assert!(out.shader_source.contains("(u_alpha * pos.y)"));
        let mut eval = out.evaluator().unwrap();
        eval.set_uniform("u_alpha", crate::codegen::Value::Float(2.0));
        let v = eval
            .call(GET_VELOCITY, &[crate::codegen::Value::vector(&[0.0, 3.0])])
            .unwrap();
        assert_eq!(v, crate::codegen::Value::vector(&[6.0, 0.0]));
    }

    #[test]
    fn rejects_alpha_names_taken_by_the_generated_shader() {
        for name in ["t0", "t12", "pos", "h", "velNative", "float", "vec2", "return", "integrate",
            "PIVOT_EPSILON", "invertMatrix3"]
        {
            let mut config = CompileConfig::new(2, &["a * sin(x) + sin(x)", "0"]);
            config.uniforms.alpha_name = name.to_string();
            let failure = compile(&config).unwrap_err();
            assert!(failure.contains(CompileErrorKind::UnsupportedFeature), "{} accepted", name);
        }

        let mut config = CompileConfig::new(2, &["a * sin(x) + sin(x)", "0"]);
        config.uniforms.alpha_name = "time".to_string();
        let out = compile(&config).unwrap();
        assert!(out.shader_source.contains("float t0 = sin(pos.x);"));
        let mut eval = out.evaluator().unwrap();
        eval.set_uniform("time", crate::codegen::Value::Float(2.0));
        let v = eval
            .call(GET_VELOCITY, &[crate::codegen::Value::vector(&[1.0, 0.0])])
            .unwrap();
        let v = v.as_vec().unwrap();
        assert!((v[0] - 3.0 * 1f64.sin()).abs() < 1e-12);
    }

    #[test]
    fn reports_newton_requests_the_scheme_cannot_honour() {
        for kind in [
            IntegratorKind::ImplicitMidpoint,
            IntegratorKind::Trapezoidal,
            IntegratorKind::GaussLegendre,
        ] {
            let config = CompileConfig::new(2, &["y", "-x"])
                .with_integrator(kind)
                .with_method(ImplicitMethod::Newton);
            let out = compile(&config).unwrap();
            assert!(out.has_diagnostic(DiagnosticKind::NewtonUnsupportedByIntegrator));
            assert_eq!(out.metadata.implicit_method, Some(ImplicitMethod::FixedPoint));
        }

        let explicit = compile(
            &CompileConfig::new(2, &["y", "-x"])
                .with_integrator(IntegratorKind::Rk4)
                .with_method(ImplicitMethod::Newton),
        )
        .unwrap();
        assert!(explicit.diagnostics.is_empty());
    }
}
