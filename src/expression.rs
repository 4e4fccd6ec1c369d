use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use crate::analysis::simplify;
use crate::functions::{BinaryFunction, BinaryOp, NamedConstant, UnaryFunction};

/// An immutable expression tree over real scalars.
///
/// Children are owned exclusively; transformations always build a new tree.
#[derive(Clone, PartialEq)]
pub enum Expression {
    Number(f64),
    Constant(NamedConstant),
    Variable(String),
    Unary(UnaryFunction, Box<Expression>),
    Function(BinaryFunction, Box<Expression>, Box<Expression>),
    Binary(BinaryOp, Box<Expression>, Box<Expression>),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("variable `{0}` is not bound")]
    UnboundVariable(String),
}

impl Expression {
    pub fn zero() -> Self {
        Expression::Number(0.0)
    }

    pub fn one() -> Self {
        Expression::Number(1.0)
    }

    pub fn from_float(f: f64) -> Self {
        Expression::Number(f)
    }

    pub fn var<S: Into<String>>(name: S) -> Self {
        Expression::Variable(name.into())
    }

    pub fn unary(f: UnaryFunction, arg: Expression) -> Self {
        Expression::Unary(f, Box::new(arg))
    }

    pub fn function(f: BinaryFunction, lhs: Expression, rhs: Expression) -> Self {
        Expression::Function(f, Box::new(lhs), Box::new(rhs))
    }

    pub fn binary(op: BinaryOp, lhs: Expression, rhs: Expression) -> Self {
        Expression::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn pow(base: Expression, exponent: Expression) -> Self {
        Expression::binary(BinaryOp::Pow, base, exponent)
    }

    pub fn sqrt(arg: Expression) -> Self {
        Expression::unary(UnaryFunction::Sqrt, arg)
    }

    pub fn sin(arg: Expression) -> Self {
        Expression::unary(UnaryFunction::Sin, arg)
    }

    pub fn cos(arg: Expression) -> Self {
        Expression::unary(UnaryFunction::Cos, arg)
    }

    pub fn atan2(y: Expression, x: Expression) -> Self {
        Expression::function(BinaryFunction::Atan2, y, x)
    }

    /// The numeric value of a literal or named constant.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expression::Number(n) => Some(*n),
            Expression::Constant(c) => Some(c.value()),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expression::Number(n) if *n == 0.0)
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Expression::Number(n) if *n == 1.0)
    }

    /// True when the tree contains no variables at all.
    pub fn is_constant(&self) -> bool {
        match self {
            Expression::Number(_) | Expression::Constant(_) => true,
            Expression::Variable(_) => false,
            Expression::Unary(_, arg) => arg.is_constant(),
            Expression::Function(_, lhs, rhs) | Expression::Binary(_, lhs, rhs) => {
                lhs.is_constant() && rhs.is_constant()
            }
        }
    }

    pub fn contains_variable<T: AsRef<str>>(&self, var: T) -> bool {
        let var = var.as_ref();
        match self {
            Expression::Number(_) | Expression::Constant(_) => false,
            Expression::Variable(v) => v == var,
            Expression::Unary(_, arg) => arg.contains_variable(var),
            Expression::Function(_, lhs, rhs) | Expression::Binary(_, lhs, rhs) => {
                lhs.contains_variable(var) || rhs.contains_variable(var)
            }
        }
    }

    /// Every distinct variable name, in sorted order.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.gather_variables(&mut out);
        out
    }

    fn gather_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expression::Number(_) | Expression::Constant(_) => {}
            Expression::Variable(v) => {
                out.insert(v.clone());
            }
            Expression::Unary(_, arg) => arg.gather_variables(out),
            Expression::Function(_, lhs, rhs) | Expression::Binary(_, lhs, rhs) => {
                lhs.gather_variables(out);
                rhs.gather_variables(out);
            }
        }
    }

    pub fn node_count(&self) -> usize {
        match self {
            Expression::Number(_) | Expression::Constant(_) | Expression::Variable(_) => 1,
            Expression::Unary(_, arg) => 1 + arg.node_count(),
            Expression::Function(_, lhs, rhs) | Expression::Binary(_, lhs, rhs) => {
                1 + lhs.node_count() + rhs.node_count()
            }
        }
    }

    /// Collects every subtree satisfying `pred`, in pre-order.
    pub fn find_all<F: Fn(&Expression) -> bool>(&self, pred: F) -> Vec<&Expression> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if pred(e) {
                out.push(e);
            }
        });
        out
    }

    fn visit<'a, F: FnMut(&'a Expression)>(&'a self, f: &mut F) {
        f(self);
        match self {
            Expression::Number(_) | Expression::Constant(_) | Expression::Variable(_) => {}
            Expression::Unary(_, arg) => arg.visit(f),
            Expression::Function(_, lhs, rhs) | Expression::Binary(_, lhs, rhs) => {
                lhs.visit(f);
                rhs.visit(f);
            }
        }
    }

    pub fn eval(&self, args: &HashMap<&str, f64>) -> Result<f64, EvaluationError> {
        Ok(match self {
            Expression::Number(n) => *n,
            Expression::Constant(c) => c.value(),
            Expression::Variable(var) => match args.get(var.as_str()) {
                Some(val) => *val,
                None => return Err(EvaluationError::UnboundVariable(var.clone())),
            },
            Expression::Unary(f, arg) => f.apply(arg.eval(args)?),
            Expression::Function(f, lhs, rhs) => f.apply(lhs.eval(args)?, rhs.eval(args)?),
            Expression::Binary(op, lhs, rhs) => op.apply(lhs.eval(args)?, rhs.eval(args)?),
        })
    }

    /// Replaces every subtree structurally equal to `original`.
    pub fn substitute<S: AsRef<Expression>, T: AsRef<Expression>>(
        &self,
        original: S,
        substitution: T,
    ) -> Self {
        let original = original.as_ref();
        let substitution = substitution.as_ref();
        if self == original {
            return substitution.clone();
        }
        match self {
            Expression::Number(_) | Expression::Constant(_) | Expression::Variable(_) => {
                self.clone()
            }
            Expression::Unary(f, arg) => {
                Expression::unary(*f, arg.substitute(original, substitution))
            }
            Expression::Function(f, lhs, rhs) => Expression::function(
                *f,
                lhs.substitute(original, substitution),
                rhs.substitute(original, substitution),
            ),
            Expression::Binary(op, lhs, rhs) => Expression::binary(
                *op,
                lhs.substitute(original, substitution),
                rhs.substitute(original, substitution),
            ),
        }
    }

    /// Simultaneously replaces variables by name.
    pub fn substitute_variables(&self, bindings: &HashMap<String, Expression>) -> Self {
        match self {
            Expression::Variable(var) => match bindings.get(var) {
                Some(e) => e.clone(),
                None => self.clone(),
            },
            Expression::Number(_) | Expression::Constant(_) => self.clone(),
            Expression::Unary(f, arg) => Expression::unary(*f, arg.substitute_variables(bindings)),
            Expression::Function(f, lhs, rhs) => Expression::function(
                *f,
                lhs.substitute_variables(bindings),
                rhs.substitute_variables(bindings),
            ),
            Expression::Binary(op, lhs, rhs) => Expression::binary(
                *op,
                lhs.substitute_variables(bindings),
                rhs.substitute_variables(bindings),
            ),
        }
    }

    pub fn rename_variable<S: AsRef<str>, T: AsRef<str>>(&self, original: S, new: T) -> Self {
        let mut bindings = HashMap::new();
        bindings.insert(
            original.as_ref().to_string(),
            Expression::var(new.as_ref()),
        );
        self.substitute_variables(&bindings)
    }

    /// Names of non-differentiable primitives whose argument depends on `wrt`.
    pub fn non_differentiable_calls<S: AsRef<str>>(&self, wrt: S) -> BTreeSet<&'static str> {
        let wrt = wrt.as_ref();
        let mut out = BTreeSet::new();
        self.visit(&mut |e| match e {
            Expression::Unary(f, arg) if !f.is_differentiable() && arg.contains_variable(wrt) => {
                out.insert(f.name());
            }
            Expression::Function(f, lhs, rhs)
                if !f.is_differentiable()
                    && (lhs.contains_variable(wrt) || rhs.contains_variable(wrt)) =>
            {
                out.insert(f.name());
            }
            _ => {}
        });
        out
    }

    /// The raw symbolic derivative. Non-differentiable primitives
    /// contribute zero and log a warning.
    pub fn differentiate<S: AsRef<str>>(&self, wrt: S) -> Self {
        let wrt = wrt.as_ref();
        match self {
            Expression::Number(_) | Expression::Constant(_) => Expression::zero(),
            Expression::Variable(var) => {
                if var == wrt {
                    Expression::one()
                } else {
                    Expression::zero()
                }
            }
            Expression::Binary(op, lhs, rhs) => {
                let (u, v) = (lhs.as_ref(), rhs.as_ref());
                match op {
                    BinaryOp::Add => u.differentiate(wrt) + v.differentiate(wrt),
                    BinaryOp::Sub => u.differentiate(wrt) - v.differentiate(wrt),
                    BinaryOp::Mul => u.differentiate(wrt) * v + u * v.differentiate(wrt),
                    BinaryOp::Div => {
                        (u.differentiate(wrt) * v - u * v.differentiate(wrt))
                            / Expression::pow(v.clone(), Expression::from_float(2.0))
                    }
                    BinaryOp::Pow => differentiate_power(u, v, wrt),
                    // a mod b = a - b * floor(a / b), with floor piecewise constant.
                    BinaryOp::Mod => {
                        u.differentiate(wrt)
                            - v.differentiate(wrt)
                                * Expression::unary(UnaryFunction::Floor, u / v)
                    }
                }
            }
            Expression::Unary(f, arg) => {
                if !arg.contains_variable(wrt) {
                    return Expression::zero();
                }
                if !f.is_differentiable() {
                    warn!(function = f.name(), wrt, "non-differentiable primitive, derivative taken as zero");
                    return Expression::zero();
                }
                unary_derivative(*f, arg) * arg.differentiate(wrt)
            }
            Expression::Function(f, lhs, rhs) => {
                if !lhs.contains_variable(wrt) && !rhs.contains_variable(wrt) {
                    return Expression::zero();
                }
                match f {
                    BinaryFunction::Atan2 => {
                        let (y, x) = (lhs.as_ref(), rhs.as_ref());
                        let two = Expression::from_float(2.0);
                        (x * y.differentiate(wrt) - y * x.differentiate(wrt))
                            / (Expression::pow(x.clone(), two.clone())
                                + Expression::pow(y.clone(), two))
                    }
                    BinaryFunction::Dot => {
                        lhs.differentiate(wrt) * rhs.as_ref() + lhs.as_ref() * rhs.differentiate(wrt)
                    }
                    BinaryFunction::Min | BinaryFunction::Max => {
                        warn!(function = f.name(), wrt, "non-differentiable primitive, derivative taken as zero");
                        Expression::zero()
                    }
                }
            }
        }
    }

    /// Simplified derivative.
    pub fn derivative<S: AsRef<str>>(&self, wrt: S) -> Self {
        simplify(&self.differentiate(wrt))
    }

    pub fn simplify(&self) -> Self {
        simplify(self)
    }
}

fn differentiate_power(u: &Expression, v: &Expression, wrt: &str) -> Expression {
    let base_fn_x = u.contains_variable(wrt);
    let exponent_fn_x = v.contains_variable(wrt);
    let power = Expression::pow(u.clone(), v.clone());
    let ln_u = Expression::unary(UnaryFunction::Log, u.clone());

    match (base_fn_x, exponent_fn_x) {
        (false, false) => Expression::zero(),
        (true, false) => {
            let reduced = match v {
                Expression::Number(n) => Expression::from_float(n - 1.0),
                _ => v - Expression::one(),
            };
            v * Expression::pow(u.clone(), reduced) * u.differentiate(wrt)
        }
        (false, true) => power * ln_u * v.differentiate(wrt),
        (true, true) => power * (v.differentiate(wrt) * ln_u + v * u.differentiate(wrt) / u),
    }
}

/// d/du f(u), before the chain rule factor.
fn unary_derivative(f: UnaryFunction, u: &Expression) -> Expression {
    let one = Expression::one;
    let two = || Expression::from_float(2.0);
    let square = |e: &Expression| Expression::pow(e.clone(), two());
    match f {
        UnaryFunction::Sin => Expression::cos(u.clone()),
        UnaryFunction::Cos => -Expression::sin(u.clone()),
        UnaryFunction::Tan => one() / square(&Expression::cos(u.clone())),
        UnaryFunction::Asin => one() / Expression::sqrt(one() - square(u)),
        UnaryFunction::Acos => -(one() / Expression::sqrt(one() - square(u))),
        UnaryFunction::Atan => one() / (one() + square(u)),
        UnaryFunction::Sinh => Expression::unary(UnaryFunction::Cosh, u.clone()),
        UnaryFunction::Cosh => Expression::unary(UnaryFunction::Sinh, u.clone()),
        UnaryFunction::Tanh => {
            one() - square(&Expression::unary(UnaryFunction::Tanh, u.clone()))
        }
        UnaryFunction::Exp => Expression::unary(UnaryFunction::Exp, u.clone()),
        UnaryFunction::Log => one() / u,
        UnaryFunction::Log2 => {
            one() / (u * Expression::unary(UnaryFunction::Log, two()))
        }
        UnaryFunction::Sqrt => one() / (two() * Expression::sqrt(u.clone())),
        UnaryFunction::Abs
        | UnaryFunction::Floor
        | UnaryFunction::Ceil
        | UnaryFunction::Fract
        | UnaryFunction::Sign
        | UnaryFunction::Length
        | UnaryFunction::Normalize => Expression::zero(),
    }
}

/// Formats a literal so that the surface parser reads it back unchanged.
pub(crate) fn format_literal(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Expression {
    /// Fully parenthesised infix form in the input grammar.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Number(n) if *n < 0.0 => write!(f, "(-{})", format_literal(-n)),
            Expression::Number(n) => f.write_str(&format_literal(*n)),
            Expression::Constant(c) => f.write_str(c.name()),
            Expression::Variable(v) => f.write_str(v),
            Expression::Unary(func, arg) => write!(f, "{}({})", func, arg),
            Expression::Function(func, lhs, rhs) => write!(f, "{}({}, {})", func, lhs, rhs),
            Expression::Binary(op, lhs, rhs) => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
        }
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl AsRef<Expression> for Expression {
    fn as_ref(&self) -> &Expression {
        self
    }
}

impl std::ops::Add<Expression> for Expression {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        &self + &other
    }
}

impl std::ops::Add<&Expression> for Expression {
    type Output = Expression;

    fn add(self, other: &Expression) -> Expression {
        &self + other
    }
}

impl std::ops::Add<Expression> for &Expression {
    type Output = Expression;

    fn add(self, other: Expression) -> Expression {
        self + &other
    }
}

impl std::ops::Add<&Expression> for &Expression {
    type Output = Expression;

    fn add(self, other: &Expression) -> Expression {
        if let (Expression::Number(a), Expression::Number(b)) = (self, other) {
            return Expression::Number(a + b);
        }
        if other.is_zero() {
            self.clone()
        } else if self.is_zero() {
            other.clone()
        } else {
            Expression::binary(BinaryOp::Add, self.clone(), other.clone())
        }
    }
}

impl std::ops::Sub<Expression> for Expression {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        &self - &other
    }
}

impl std::ops::Sub<&Expression> for Expression {
    type Output = Expression;

    fn sub(self, other: &Expression) -> Expression {
        &self - other
    }
}

impl std::ops::Sub<Expression> for &Expression {
    type Output = Expression;

    fn sub(self, other: Expression) -> Expression {
        self - &other
    }
}

impl std::ops::Sub<&Expression> for &Expression {
    type Output = Expression;

    fn sub(self, other: &Expression) -> Expression {
        if let (Expression::Number(a), Expression::Number(b)) = (self, other) {
            return Expression::Number(a - b);
        }
        if other.is_zero() {
            self.clone()
        } else {
            Expression::binary(BinaryOp::Sub, self.clone(), other.clone())
        }
    }
}

impl std::ops::Mul<Expression> for Expression {
    type Output = Self;

    fn mul(self, other: Self) -> Self {
        &self * &other
    }
}

impl std::ops::Mul<&Expression> for Expression {
    type Output = Expression;

    fn mul(self, other: &Expression) -> Expression {
        &self * other
    }
}

impl std::ops::Mul<Expression> for &Expression {
    type Output = Expression;

    fn mul(self, other: Expression) -> Expression {
        self * &other
    }
}

impl std::ops::Mul<&Expression> for &Expression {
    type Output = Expression;

    fn mul(self, other: &Expression) -> Expression {
        if let (Expression::Number(a), Expression::Number(b)) = (self, other) {
            return Expression::Number(a * b);
        }
        if other.is_zero() || self.is_zero() {
            Expression::zero()
        } else if other.is_one() {
            self.clone()
        } else if self.is_one() {
            other.clone()
        } else {
            Expression::binary(BinaryOp::Mul, self.clone(), other.clone())
        }
    }
}

impl std::ops::Div<Expression> for Expression {
    type Output = Self;

    fn div(self, other: Self) -> Self {
        &self / &other
    }
}

impl std::ops::Div<&Expression> for Expression {
    type Output = Expression;

    fn div(self, other: &Expression) -> Expression {
        &self / other
    }
}

impl std::ops::Div<Expression> for &Expression {
    type Output = Expression;

    fn div(self, other: Expression) -> Expression {
        self / &other
    }
}

impl std::ops::Div<&Expression> for &Expression {
    type Output = Expression;

    fn div(self, other: &Expression) -> Expression {
        match (self, other) {
            (Expression::Number(a), Expression::Number(b)) if *b != 0.0 => {
                Expression::Number(a / b)
            }
            _ if other.is_one() => self.clone(),
            _ if self.is_zero() && !other.is_zero() => Expression::zero(),
            _ => Expression::binary(BinaryOp::Div, self.clone(), other.clone()),
        }
    }
}

impl std::ops::Neg for Expression {
    type Output = Self;

    fn neg(self) -> Self {
        -&self
    }
}

impl std::ops::Neg for &Expression {
    type Output = Expression;

    /// Negation is `0 - x`; there is no dedicated node.
    fn neg(self) -> Expression {
        match self {
            Expression::Number(n) => Expression::Number(-n),
            _ => Expression::binary(BinaryOp::Sub, Expression::zero(), self.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn x() -> Expression {
        Expression::var("x")
    }

    fn at(e: &Expression, x: f64) -> f64 {
        let mut args = HashMap::new();
        args.insert("x", x);
        e.eval(&args).unwrap()
    }

    #[test]
    fn derivative_of_sin_squared() {
        let e = Expression::pow(Expression::sin(x()), Expression::from_float(2.0));
        let d = e.derivative("x");
        for &p in &[0.1, 0.7, 2.3] {
            assert_relative_eq!(at(&d, p), 2.0 * p.sin() * p.cos(), epsilon = 1e-12);
        }
    }

    #[test]
    fn integer_power_avoids_log() {
        let e = Expression::pow(x(), Expression::from_float(3.0));
        let d = e.differentiate("x");
        assert!(d.find_all(|n| matches!(n, Expression::Unary(UnaryFunction::Log, _))).is_empty());
        assert_relative_eq!(at(&d, -2.0), 12.0);
    }

    #[test]
    fn atan2_derivative_matches_quotient_rule() {
        let y = Expression::var("y");
        let e = Expression::atan2(y.clone(), x());
        let dx = e.differentiate("x");
        let mut args = HashMap::new();
        args.insert("x", 1.5);
        args.insert("y", -0.5);
        let expected = 0.5 / (1.5f64 * 1.5 + 0.25);
        assert_relative_eq!(dx.eval(&args).unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn non_differentiable_functions_contribute_zero() {
        let e = Expression::unary(UnaryFunction::Abs, x()) + x();
        assert_eq!(
            e.non_differentiable_calls("x").into_iter().collect::<Vec<_>>(),
            vec!["abs"]
        );
        assert_relative_eq!(at(&e.differentiate("x"), 3.0), 1.0);
        assert!(e.non_differentiable_calls("y").is_empty());
    }

    #[test]
    fn unbound_variable_is_an_error() {
        let e = x() + Expression::var("q");
        let mut args = HashMap::new();
        args.insert("x", 1.0);
        assert_eq!(
            e.eval(&args),
            Err(EvaluationError::UnboundVariable("q".to_string()))
        );
    }

    #[test]
    fn display_is_fully_parenthesised() {
        let e = Expression::binary(
            BinaryOp::Mul,
            Expression::from_float(-2.0),
            x() + Expression::Constant(NamedConstant::Pi),
        );
        assert_eq!(e.to_string(), "((-2) * (x + pi))");
    }

    #[test]
    fn substitution_replaces_all_occurrences() {
        let e = Expression::sin(x()) * x();
        let s = e.substitute(x(), Expression::var("r"));
        assert!(!s.contains_variable("x"));
        assert_eq!(s.variables().len(), 1);
    }
}
