//! Compiles systems of ordinary differential equations, written as plain
//! math in Cartesian or curvilinear coordinates, into GLSL ES 3.00 particle
//! integrators.

mod analysis;
pub mod codegen;
pub mod compiler;
pub mod coordinates;
pub mod diagnostics;
pub mod expression;
pub mod functions;
pub mod integrators;
pub mod matrix;
pub mod syntax;

#[cfg(test)]
mod scenario_tests;

pub use analysis::{simplify, simplify_many};
pub use compiler::{
    compile, CompileConfig, CompileError, CompileErrorKind, CompileFailure, CompileMetadata,
    CompileOutput, CoordinateSystemSpec, IntegratorParams, UniformNames,
};
pub use coordinates::{CoordinateError, CoordinateSystem, CoordinateSystemRecord, InverseSolverOptions};
pub use diagnostics::{Diagnostic, DiagnosticKind};
pub use expression::Expression;
pub use integrators::{ImplicitMethod, IntegratorKind, Stability};
pub use matrix::{ExpressionMatrix, InversionError, SymbolicInverse};
pub use syntax::{parse, SyntaxError};
