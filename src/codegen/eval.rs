//! CPU reference interpreter for [`ShaderModule`]s.
//!
//! Runs the same IR that is rendered to GLSL, in `f64`, so hosts can preview
//! trajectories and tests can check emitted programs numerically.

use std::collections::HashMap;

use super::builtins::Builtins;
use super::ir::{Place, ShaderBinaryOp, ShaderExpr, ShaderType, ShaderUnaryOp, Stmt};
use super::module::ShaderModule;
use crate::functions::{shader_mod, shader_sign, UnaryFunction};

const MAX_CALL_DEPTH: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Float(f64),
    Bool(bool),
    Vec(Vec<f64>),
    /// Column-major `n x n` matrix.
    Mat(usize, Vec<f64>),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("type mismatch in {context}: {detail}")]
    TypeMismatch { context: String, detail: String },

    #[error("`{name}` expects {expected} argument(s), found {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("function `{0}` finished without returning")]
    MissingReturn(String),

    #[error("call depth exceeded in `{0}`")]
    RecursionLimit(String),
}

pub type EvalResult<T> = Result<T, EvalError>;

fn mismatch<T>(context: &str, detail: String) -> EvalResult<T> {
    Err(EvalError::TypeMismatch {
        context: context.to_string(),
        detail,
    })
}

impl Value {
    pub fn vector(components: &[f64]) -> Self {
        Value::Vec(components.to_vec())
    }

    pub fn identity(n: usize) -> Self {
        Value::diagonal(n, 1.0)
    }

    pub fn diagonal(n: usize, value: f64) -> Self {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = value;
        }
        Value::Mat(n, data)
    }

    pub fn ty(&self) -> ShaderType {
        match self {
            Value::Float(_) => ShaderType::Float,
            Value::Bool(_) => ShaderType::Bool,
            Value::Vec(v) => ShaderType::Vec(v.len()),
            Value::Mat(n, _) => ShaderType::Mat(*n),
        }
    }

    pub fn zero(ty: ShaderType) -> Self {
        match ty {
            ShaderType::Float => Value::Float(0.0),
            ShaderType::Bool => Value::Bool(false),
            ShaderType::Vec(n) => Value::Vec(vec![0.0; n]),
            ShaderType::Mat(n) => Value::Mat(n, vec![0.0; n * n]),
        }
    }

    pub fn as_float(&self) -> EvalResult<f64> {
        match self {
            Value::Float(v) => Ok(*v),
            other => mismatch("scalar", format!("expected float, found {}", other.ty())),
        }
    }

    pub fn as_bool(&self) -> EvalResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => mismatch("condition", format!("expected bool, found {}", other.ty())),
        }
    }

    pub fn as_vec(&self) -> EvalResult<&[f64]> {
        match self {
            Value::Vec(v) => Ok(v),
            other => mismatch("vector", format!("expected vector, found {}", other.ty())),
        }
    }

    /// Element `(col, row)` of a matrix.
    pub fn at(&self, col: usize, row: usize) -> EvalResult<f64> {
        match self {
            Value::Mat(n, data) if col < *n && row < *n => Ok(data[col * n + row]),
            other => mismatch("matrix element", format!("[{}][{}] of {}", col, row, other.ty())),
        }
    }

    fn map(&self, context: &str, f: impl Fn(f64) -> f64) -> EvalResult<Value> {
        match self {
            Value::Float(v) => Ok(Value::Float(f(*v))),
            Value::Vec(v) => Ok(Value::Vec(v.iter().map(|x| f(*x)).collect())),
            Value::Mat(n, data) => Ok(Value::Mat(*n, data.iter().map(|x| f(*x)).collect())),
            Value::Bool(_) => mismatch(context, "bool operand".to_string()),
        }
    }
}

/// Componentwise combination with scalar broadcast.
fn zip(context: &str, a: &Value, b: &Value, f: impl Fn(f64, f64) -> f64) -> EvalResult<Value> {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(f(*x, *y))),
        (Value::Vec(x), Value::Vec(y)) if x.len() == y.len() => {
            Ok(Value::Vec(x.iter().zip(y).map(|(p, q)| f(*p, *q)).collect()))
        }
        (Value::Mat(n, x), Value::Mat(m, y)) if n == m => {
            Ok(Value::Mat(*n, x.iter().zip(y).map(|(p, q)| f(*p, *q)).collect()))
        }
        (Value::Float(s), other) => other.map(context, |x| f(*s, x)),
        (other, Value::Float(s)) => other.map(context, |x| f(x, *s)),
        (a, b) => mismatch(context, format!("{} and {}", a.ty(), b.ty())),
    }
}

fn multiply(a: &Value, b: &Value) -> EvalResult<Value> {
    match (a, b) {
        (Value::Mat(n, m), Value::Vec(v)) if v.len() == *n => Ok(Value::Vec(
            (0..*n)
                .map(|r| (0..*n).map(|c| m[c * n + r] * v[c]).sum())
                .collect(),
        )),
        (Value::Vec(v), Value::Mat(n, m)) if v.len() == *n => Ok(Value::Vec(
            (0..*n)
                .map(|c| (0..*n).map(|r| v[r] * m[c * n + r]).sum())
                .collect(),
        )),
        (Value::Mat(n, x), Value::Mat(m, y)) if n == m => {
            let n = *n;
            let mut out = vec![0.0; n * n];
            for c in 0..n {
                for r in 0..n {
                    out[c * n + r] = (0..n).map(|k| x[k * n + r] * y[c * n + k]).sum();
                }
            }
            Ok(Value::Mat(n, out))
        }
        _ => zip("*", a, b, |x, y| x * y),
    }
}

fn flatten(context: &str, args: &[Value]) -> EvalResult<Vec<f64>> {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            Value::Float(v) => out.push(*v),
            Value::Vec(v) => out.extend_from_slice(v),
            Value::Mat(_, data) => out.extend_from_slice(data),
            Value::Bool(_) => return mismatch(context, "bool constructor argument".to_string()),
        }
    }
    Ok(out)
}

fn construct(ty: ShaderType, args: &[Value]) -> EvalResult<Value> {
    let context = ty.to_string();
    let flat = flatten(&context, args)?;
    match ty {
        ShaderType::Float if !flat.is_empty() => Ok(Value::Float(flat[0])),
        ShaderType::Vec(n) if flat.len() == 1 => Ok(Value::Vec(vec![flat[0]; n])),
        ShaderType::Vec(n) if flat.len() >= n => Ok(Value::Vec(flat[..n].to_vec())),
        ShaderType::Mat(n) if flat.len() == 1 => Ok(Value::diagonal(n, flat[0])),
        ShaderType::Mat(n) if flat.len() == n * n => Ok(Value::Mat(n, flat)),
        _ => mismatch(&context, format!("{} scalar argument(s)", flat.len())),
    }
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn builtin(builtin: Builtins, name: &str, args: &[Value]) -> EvalResult<Value> {
    if !builtin.accepts(args.len()) {
        return Err(EvalError::Arity {
            name: name.to_string(),
            expected: match builtin {
                Builtins::Clamp => 3,
                Builtins::Unary(_) | Builtins::Atan => 1,
                _ => 2,
            },
            found: args.len(),
        });
    }
    match builtin {
        Builtins::Unary(UnaryFunction::Length) => match &args[0] {
            Value::Vec(v) => Ok(Value::Float(norm(v))),
            other => other.map(name, f64::abs),
        },
        Builtins::Unary(UnaryFunction::Normalize) => match &args[0] {
            Value::Vec(v) => {
                let len = norm(v);
                Ok(Value::Vec(v.iter().map(|x| x / len).collect()))
            }
            other => other.map(name, shader_sign),
        },
        Builtins::Unary(f) => args[0].map(name, |x| f.apply(x)),
        Builtins::Atan if args.len() == 1 => args[0].map(name, f64::atan),
        Builtins::Atan => zip(name, &args[0], &args[1], f64::atan2),
        Builtins::Min => zip(name, &args[0], &args[1], f64::min),
        Builtins::Max => zip(name, &args[0], &args[1], f64::max),
        Builtins::Pow => zip(name, &args[0], &args[1], f64::powf),
        Builtins::Mod => zip(name, &args[0], &args[1], shader_mod),
        Builtins::Dot => match (&args[0], &args[1]) {
            (Value::Vec(a), Value::Vec(b)) if a.len() == b.len() => {
                Ok(Value::Float(a.iter().zip(b).map(|(x, y)| x * y).sum()))
            }
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a * b)),
            (a, b) => mismatch(name, format!("{} and {}", a.ty(), b.ty())),
        },
        Builtins::Clamp => {
            let lower = zip(name, &args[0], &args[1], f64::max)?;
            zip(name, &lower, &args[2], f64::min)
        }
    }
}

enum Flow {
    Normal,
    Break,
    Return(Value),
}

type Env = HashMap<String, Value>;

pub struct Evaluator<'m> {
    module: &'m ShaderModule,
    globals: HashMap<String, Value>,
}

impl<'m> Evaluator<'m> {
    /// Evaluates the module constants; uniforms start at zero.
    pub fn new(module: &'m ShaderModule) -> EvalResult<Self> {
        let mut evaluator = Evaluator {
            module,
            globals: HashMap::new(),
        };
        for uniform in module.uniforms() {
            evaluator
                .globals
                .insert(uniform.name.clone(), Value::zero(uniform.ty));
        }
        for constant in module.constants() {
            let value = evaluator.eval(&constant.value, &Env::new(), 0)?;
            evaluator.globals.insert(constant.name.clone(), value);
        }
        Ok(evaluator)
    }

    pub fn set_uniform<S: Into<String>>(&mut self, name: S, value: Value) -> &mut Self {
        self.globals.insert(name.into(), value);
        self
    }

    pub fn call(&self, name: &str, args: &[Value]) -> EvalResult<Value> {
        self.call_function(name, args.to_vec(), 0)
    }

    fn call_function(&self, name: &str, args: Vec<Value>, depth: usize) -> EvalResult<Value> {
        if depth > MAX_CALL_DEPTH {
            return Err(EvalError::RecursionLimit(name.to_string()));
        }
        let function = self
            .module
            .function(name)
            .ok_or_else(|| EvalError::UnknownFunction(name.to_string()))?;
        if function.params.len() != args.len() {
            return Err(EvalError::Arity {
                name: name.to_string(),
                expected: function.params.len(),
                found: args.len(),
            });
        }

        let mut env = Env::new();
        for ((ty, param), arg) in function.params.iter().zip(args) {
            if arg.ty() != *ty {
                return mismatch(name, format!("parameter `{}` is {}, found {}", param, ty, arg.ty()));
            }
            env.insert(param.clone(), arg);
        }

        match self.exec_block(&function.body, &mut env, depth)? {
            Flow::Return(value) => Ok(value),
            Flow::Normal | Flow::Break => Err(EvalError::MissingReturn(name.to_string())),
        }
    }

    fn exec_block(&self, stmts: &[Stmt], env: &mut Env, depth: usize) -> EvalResult<Flow> {
        for stmt in stmts {
            match self.exec(stmt, env, depth)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&self, stmt: &Stmt, env: &mut Env, depth: usize) -> EvalResult<Flow> {
        match stmt {
            Stmt::Let { name, value, .. } => {
                let value = self.eval(value, env, depth)?;
                env.insert(name.clone(), value);
            }
            Stmt::Assign { place, value } => {
                let value = self.eval(value, env, depth)?;
                self.assign(place, value, env)?;
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let branch = if self.eval(cond, env, depth)?.as_bool()? {
                    then
                } else {
                    otherwise
                };
                return self.exec_block(branch, env, depth);
            }
            Stmt::For { count, body } => {
                for _ in 0..*count {
                    match self.exec_block(body, env, depth)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
            }
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Return(value) => return Ok(Flow::Return(self.eval(value, env, depth)?)),
            Stmt::Comment(_) => {}
        }
        Ok(Flow::Normal)
    }

    fn assign(&self, place: &Place, value: Value, env: &mut Env) -> EvalResult<()> {
        let name = match place {
            Place::Var(name) | Place::Component(name, _) | Place::Element(name, _, _) => name,
        };
        let slot = env
            .get_mut(name)
            .ok_or_else(|| EvalError::UnknownVariable(name.clone()))?;
        match (place, slot) {
            (Place::Var(_), slot) => *slot = value,
            (Place::Component(_, i), Value::Vec(v)) if *i < v.len() => v[*i] = value.as_float()?,
            (Place::Element(_, c, r), Value::Mat(n, data)) if *c < *n && *r < *n => {
                data[*c * *n + *r] = value.as_float()?
            }
            (place, slot) => {
                return mismatch("assignment", format!("{} into {}", place, slot.ty()));
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str, env: &Env) -> EvalResult<Value> {
        env.get(name)
            .or_else(|| self.globals.get(name))
            .cloned()
            .ok_or_else(|| EvalError::UnknownVariable(name.to_string()))
    }

    fn eval(&self, expr: &ShaderExpr, env: &Env, depth: usize) -> EvalResult<Value> {
        Ok(match expr {
            ShaderExpr::Float(v) => Value::Float(*v),
            ShaderExpr::Bool(b) => Value::Bool(*b),
            ShaderExpr::Var(name) => self.lookup(name, env)?,
            ShaderExpr::Component(base, i) => match self.eval(base, env, depth)? {
                Value::Vec(v) if *i < v.len() => Value::Float(v[*i]),
                other => return mismatch("swizzle", format!("component {} of {}", i, other.ty())),
            },
            ShaderExpr::Element(base, col, row) => {
                Value::Float(self.eval(base, env, depth)?.at(*col, *row)?)
            }
            ShaderExpr::Unary(ShaderUnaryOp::Neg, operand) => {
                self.eval(operand, env, depth)?.map("negation", |x| -x)?
            }
            ShaderExpr::Unary(ShaderUnaryOp::Not, operand) => {
                Value::Bool(!self.eval(operand, env, depth)?.as_bool()?)
            }
            ShaderExpr::Binary(op, lhs, rhs) => {
                let a = self.eval(lhs, env, depth)?;
                let b = self.eval(rhs, env, depth)?;
                match op {
                    ShaderBinaryOp::Add => zip("+", &a, &b, |x, y| x + y)?,
                    ShaderBinaryOp::Sub => zip("-", &a, &b, |x, y| x - y)?,
                    ShaderBinaryOp::Mul => multiply(&a, &b)?,
                    ShaderBinaryOp::Div => zip("/", &a, &b, |x, y| x / y)?,
                    ShaderBinaryOp::Lt => Value::Bool(a.as_float()? < b.as_float()?),
                    ShaderBinaryOp::Le => Value::Bool(a.as_float()? <= b.as_float()?),
                    ShaderBinaryOp::Gt => Value::Bool(a.as_float()? > b.as_float()?),
                    ShaderBinaryOp::Ge => Value::Bool(a.as_float()? >= b.as_float()?),
                    ShaderBinaryOp::And => Value::Bool(a.as_bool()? && b.as_bool()?),
                    ShaderBinaryOp::Or => Value::Bool(a.as_bool()? || b.as_bool()?),
                }
            }
            ShaderExpr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a, env, depth))
                    .collect::<EvalResult<Vec<_>>>()?;
                match self.module.function(name) {
                    Some(_) => self.call_function(name, args, depth + 1)?,
                    None => match Builtins::from_str(name) {
                        Some(b) => builtin(b, name, &args)?,
                        None => return Err(EvalError::UnknownFunction(name.clone())),
                    },
                }
            }
            ShaderExpr::Construct(ty, args) => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a, env, depth))
                    .collect::<EvalResult<Vec<_>>>()?;
                construct(*ty, &args)?
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::ir::ShaderFunction;
    use approx::assert_relative_eq;

    fn module_with(function: ShaderFunction) -> ShaderModule {
        let mut module = ShaderModule::new();
        module.add_uniform("u_alpha", ShaderType::Float);
        module.add_function(function);
        module
    }

    #[test]
    fn matrix_vector_product_is_column_major() {
        // columns (1, 3) and (2, 4): rows [[1, 2], [3, 4]]
        let m = Value::Mat(2, vec![1.0, 3.0, 2.0, 4.0]);
        let v = Value::vector(&[1.0, 1.0]);
        assert_eq!(multiply(&m, &v).unwrap(), Value::vector(&[3.0, 7.0]));
        assert_eq!(m.at(1, 0).unwrap(), 2.0);
        let id = construct(ShaderType::Mat(2), &[Value::Float(1.0)]).unwrap();
        assert_eq!(multiply(&id, &m).unwrap(), m);
    }

    #[test]
    fn runs_loops_branches_and_uniforms() {
        let body = vec![
            Stmt::let_(ShaderType::Vec(2), "acc", ShaderExpr::var("pos")),
            Stmt::For {
                count: 10,
                body: vec![
                    Stmt::assign(
                        Place::Component("acc".into(), 0),
                        ShaderExpr::add(ShaderExpr::component("acc", 0), ShaderExpr::var("u_alpha")),
                    ),
                    Stmt::If {
                        cond: ShaderExpr::binary(
                            ShaderBinaryOp::Ge,
                            ShaderExpr::component("acc", 0),
                            ShaderExpr::Float(3.0),
                        ),
                        then: vec![Stmt::Break],
                        otherwise: vec![],
                    },
                ],
            },
            Stmt::Return(ShaderExpr::var("acc")),
        ];
        let f = ShaderFunction::new("step", vec![(ShaderType::Vec(2), "pos".into())], ShaderType::Vec(2))
            .with_body(body);
        let module = module_with(f);
        let mut eval = Evaluator::new(&module).unwrap();
        eval.set_uniform("u_alpha", Value::Float(1.0));
        let out = eval.call("step", &[Value::vector(&[0.5, 2.0])]).unwrap();
        assert_eq!(out, Value::vector(&[3.5, 2.0]));
    }

    #[test]
    fn evaluates_builtins_like_glsl() {
        let call = |name: &str, args: &[Value]| {
            builtin(Builtins::from_str(name).unwrap(), name, args).unwrap()
        };
        assert_relative_eq!(
            call("atan", &[Value::Float(1.0), Value::Float(-1.0)]).as_float().unwrap(),
            3.0 * std::f64::consts::FRAC_PI_4
        );
        assert_eq!(call("mod", &[Value::Float(-1.0), Value::Float(3.0)]), Value::Float(2.0));
        assert_eq!(
            call("clamp", &[Value::Float(1.5), Value::Float(-1.0), Value::Float(1.0)]),
            Value::Float(1.0)
        );
        assert_eq!(call("length", &[Value::vector(&[3.0, 4.0])]), Value::Float(5.0));
    }

    #[test]
    fn reports_missing_return_and_unknown_names() {
        let f = ShaderFunction::new("noop", vec![], ShaderType::Float)
            .with_body(vec![Stmt::Comment("nothing".into())]);
        let module = module_with(f);
        let eval = Evaluator::new(&module).unwrap();
        assert_eq!(eval.call("noop", &[]), Err(EvalError::MissingReturn("noop".into())));
        assert_eq!(eval.call("missing", &[]), Err(EvalError::UnknownFunction("missing".into())));
        assert!(matches!(
            eval.call("noop", &[Value::Float(1.0)]),
            Err(EvalError::Arity { expected: 0, found: 1, .. })
        ));
    }
}
