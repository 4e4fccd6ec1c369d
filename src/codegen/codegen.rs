use std::collections::HashMap;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::expression::Expression;
use crate::functions::{BinaryOp, UnaryFunction};
use crate::matrix::InversionError;

use super::builtins::{function_name, unary_name, Builtins};
use super::ir::{ShaderBinaryOp, ShaderExpr, ShaderType, Stmt};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EmitError {
    #[error("unknown identifier `{identifier}`")]
    UnknownIdentifier { identifier: String },

    #[error(transparent)]
    Inversion(#[from] InversionError),
}

pub type CodeGenResult<T> = Result<T, EmitError>;

/// Prefix of hoisted `float tN` temporaries.
pub const TEMPORARY_PREFIX: &str = "t";

/// Maps expression variables onto shader expressions.
#[derive(Clone, Debug, Default)]
pub struct Bindings {
    map: HashMap<String, ShaderExpr>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<S: Into<String>>(&mut self, name: S, expr: ShaderExpr) -> &mut Self {
        self.map.insert(name.into(), expr);
        self
    }

    /// Binds `names[i]` to component `i` of the vector `base`.
    pub fn bind_vector<S: AsRef<str>>(&mut self, names: &[S], base: &str) -> &mut Self {
        for (i, name) in names.iter().enumerate() {
            self.bind(name.as_ref(), ShaderExpr::component(base, i));
        }
        self
    }

    /// Binds every name to a shader variable of the same name.
    pub fn identity<S: AsRef<str>>(names: &[S]) -> Self {
        let mut bindings = Self::new();
        for name in names {
            bindings.bind(name.as_ref(), ShaderExpr::var(name.as_ref()));
        }
        bindings
    }

    pub fn get(&self, name: &str) -> Option<&ShaderExpr> {
        self.map.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }
}

/// Lowers expression trees to shader IR.
///
/// With hoisting enabled, a non-trivial subtree that occurs more than once
/// across everything passed to [`CodeGenerator::prepare`] is computed once
/// into a `float` temporary. The temporaries are collected with
/// [`CodeGenerator::take_statements`] and must precede the code that uses
/// the returned expressions.
#[derive(Debug)]
pub struct CodeGenerator<'b> {
    bindings: &'b Bindings,
    hoist_prefix: Option<String>,
    clamp_inverse_trig: bool,
    occurrences: FxHashMap<String, usize>,
    expressions: IndexMap<String, String>,
    statements: Vec<Stmt>,
}

impl<'b> CodeGenerator<'b> {
    pub fn new(bindings: &'b Bindings) -> Self {
        CodeGenerator {
            bindings,
            hoist_prefix: None,
            clamp_inverse_trig: false,
            occurrences: FxHashMap::default(),
            expressions: IndexMap::new(),
            statements: Vec::new(),
        }
    }

    pub fn with_hoisting<S: Into<String>>(mut self, prefix: S) -> Self {
        self.hoist_prefix = Some(prefix.into());
        self
    }

    /// Clamp `asin`/`acos` arguments into `[-1, 1]`.
    pub fn with_clamped_inverse_trig(mut self) -> Self {
        self.clamp_inverse_trig = true;
        self
    }

    /// Counts subtree occurrences so that shared ones can be hoisted.
    pub fn prepare<'e, I: IntoIterator<Item = &'e Expression>>(&mut self, exprs: I) {
        if self.hoist_prefix.is_none() {
            return;
        }
        for expr in exprs {
            self.count(expr);
        }
    }

    fn count(&mut self, expr: &Expression) {
        if is_leaf(expr) {
            return;
        }
        let seen = self.occurrences.entry(expr.to_string()).or_insert(0);
        *seen += 1;
        if *seen > 1 {
            // Children of a repeated subtree are counted once, through it.
            return;
        }
        match expr {
            Expression::Unary(_, arg) => self.count(arg),
            Expression::Function(_, lhs, rhs) | Expression::Binary(_, lhs, rhs) => {
                self.count(lhs);
                self.count(rhs);
            }
            _ => {}
        }
    }

    pub fn take_statements(&mut self) -> Vec<Stmt> {
        std::mem::take(&mut self.statements)
    }

    pub fn build_expression(&mut self, expr: &Expression) -> CodeGenResult<ShaderExpr> {
        let key = match &self.hoist_prefix {
            Some(_) if !is_leaf(expr) => Some(expr.to_string()),
            _ => None,
        };
        if let Some(key) = &key {
            if let Some(name) = self.expressions.get(key) {
                return Ok(ShaderExpr::var(name.clone()));
            }
        }

        let value = self.lower(expr)?;

        match key {
            Some(key) if self.occurrences.get(&key).copied().unwrap_or(0) > 1 => {
                Ok(self.hoist(key, value))
            }
            _ => Ok(value),
        }
    }

    fn hoist(&mut self, key: String, value: ShaderExpr) -> ShaderExpr {
        let prefix = self.hoist_prefix.as_deref().unwrap_or(TEMPORARY_PREFIX);
        let name = format!("{}{}", prefix, self.expressions.len());
        self.statements
            .push(Stmt::let_(ShaderType::Float, name.clone(), value));
        self.expressions.insert(key, name.clone());
        ShaderExpr::var(name)
    }

    fn lower(&mut self, expr: &Expression) -> CodeGenResult<ShaderExpr> {
        Ok(match expr {
            Expression::Number(n) => ShaderExpr::Float(*n),
            Expression::Constant(c) => ShaderExpr::Float(c.value()),
            Expression::Variable(name) => match self.bindings.get(name) {
                Some(bound) => bound.clone(),
                None => {
                    return Err(EmitError::UnknownIdentifier {
                        identifier: name.clone(),
                    })
                }
            },
            Expression::Unary(f, arg) => {
                let mut arg = self.build_expression(arg)?;
                if self.clamp_inverse_trig
                    && matches!(f, UnaryFunction::Asin | UnaryFunction::Acos)
                {
                    arg = ShaderExpr::call(
                        Builtins::Clamp.to_str(),
                        vec![arg, ShaderExpr::Float(-1.0), ShaderExpr::Float(1.0)],
                    );
                }
                ShaderExpr::call(unary_name(*f), vec![arg])
            }
            Expression::Function(f, lhs, rhs) => {
                let lhs = self.build_expression(lhs)?;
                let rhs = self.build_expression(rhs)?;
                ShaderExpr::call(function_name(*f), vec![lhs, rhs])
            }
            Expression::Binary(BinaryOp::Pow, base, exponent) => {
                self.build_power(base, exponent)?
            }
            Expression::Binary(op, lhs, rhs) => {
                let lhs = self.build_expression(lhs)?;
                let rhs = self.build_expression(rhs)?;
                match op {
                    BinaryOp::Add => ShaderExpr::binary(ShaderBinaryOp::Add, lhs, rhs),
                    BinaryOp::Sub => ShaderExpr::binary(ShaderBinaryOp::Sub, lhs, rhs),
                    BinaryOp::Mul => ShaderExpr::binary(ShaderBinaryOp::Mul, lhs, rhs),
                    BinaryOp::Div => ShaderExpr::binary(ShaderBinaryOp::Div, lhs, rhs),
                    BinaryOp::Mod => ShaderExpr::call(Builtins::Mod.to_str(), vec![lhs, rhs]),
                    BinaryOp::Pow => ShaderExpr::call(Builtins::Pow.to_str(), vec![lhs, rhs]),
                }
            }
        })
    }

    /// Small integer powers unroll into products; everything else calls
    /// `pow`.
    fn build_power(&mut self, base: &Expression, exponent: &Expression) -> CodeGenResult<ShaderExpr> {
        let small = match exponent {
            Expression::Number(n) if n.fract() == 0.0 && n.abs() >= 1.0 && n.abs() <= 4.0 => {
                Some(*n as i32)
            }
            _ => None,
        };

        let Some(n) = small else {
            let base = self.build_expression(base)?;
            let exponent = self.build_expression(exponent)?;
            return Ok(ShaderExpr::call(Builtins::Pow.to_str(), vec![base, exponent]));
        };

        let mut factor = self.build_expression(base)?;
        if !factor.is_trivial() && n.abs() > 1 && self.hoist_prefix.is_some() {
            let key = format!("{}#base", base);
            factor = match self.expressions.get(&key) {
                Some(name) => ShaderExpr::var(name.clone()),
                None => self.hoist(key, factor),
            };
        }
        let product = (1..n.abs())
            .fold(factor.clone(), |acc, _| ShaderExpr::mul(acc, factor.clone()));
        Ok(if n < 0 {
            ShaderExpr::div(ShaderExpr::Float(1.0), product)
        } else {
            product
        })
    }
}

fn is_leaf(expr: &Expression) -> bool {
    matches!(
        expr,
        Expression::Number(_) | Expression::Constant(_) | Expression::Variable(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parse;

    fn emit_expr(expr: &Expression) -> String {
        let bindings = Bindings::identity(&["x", "y"]);
        let mut gen = CodeGenerator::new(&bindings);
        gen.build_expression(expr).unwrap().to_string()
    }

    fn emit(src: &str) -> String {
        emit_expr(&parse(src).unwrap())
    }

    #[test]
    fn emits_glsl_spellings() {
        assert_eq!(emit("x + 2"), "(x + 2.0)");
        assert_eq!(emit("x % 3"), "mod(x, 3.0)");
        assert_eq!(emit("atan2(y, x)"), "atan(y, x)");
        assert_eq!(emit("x ^ 3"), "((x * x) * x)");
        let inverse_square = Expression::pow(Expression::var("x"), Expression::from_float(-2.0));
        assert_eq!(emit_expr(&inverse_square), "(1.0 / (x * x))");
        assert_eq!(emit("x ^ 5"), "pow(x, 5.0)");
        assert_eq!(emit("x ^ 0.5"), "pow(x, 0.5)");
        assert!(emit("pi").starts_with("3.14159265358979"));
    }

    #[test]
    fn binds_swizzles_and_rejects_unknown_names() {
        let mut bindings = Bindings::new();
        bindings.bind_vector(&["x", "y"], "pos").bind("a", ShaderExpr::var("u_alpha"));
        let mut gen = CodeGenerator::new(&bindings);
        let out = gen.build_expression(&parse("y * a").unwrap()).unwrap();
        assert_eq!(out.to_string(), "(pos.y * u_alpha)");
        assert_eq!(
            gen.build_expression(&parse("q + 1").unwrap()),
            Err(EmitError::UnknownIdentifier { identifier: "q".into() })
        );
    }

    #[test]
    fn clamps_inverse_trig_when_requested() {
        let bindings = Bindings::identity(&["x"]);
        let mut gen = CodeGenerator::new(&bindings).with_clamped_inverse_trig();
        let out = gen.build_expression(&parse("acos(x)").unwrap()).unwrap();
        assert_eq!(out.to_string(), "acos(clamp(x, (-1.0), 1.0))");
    }

    #[test]
    fn hoists_shared_subtrees_once() {
        let bindings = Bindings::identity(&["x", "y"]);
        let a = parse("sin(x * y) + 1").unwrap();
        let b = parse("sin(x * y) * 2").unwrap();
        let mut gen = CodeGenerator::new(&bindings).with_hoisting("t");
        gen.prepare([&a, &b]);
        let ea = gen.build_expression(&a).unwrap();
        let eb = gen.build_expression(&b).unwrap();
        let lets = gen.take_statements();
        assert_eq!(lets.len(), 1);
        assert_eq!(ea.to_string(), "(t0 + 1.0)");
        assert_eq!(eb.to_string(), "(t0 * 2.0)");
    }
}
