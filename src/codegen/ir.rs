//! A small typed IR for the emitted shader, rendered to GLSL ES 3.00.

use std::fmt;
use std::fmt::Write as _;

const COMPONENTS: [char; 4] = ['x', 'y', 'z', 'w'];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderType {
    Float,
    Bool,
    Vec(usize),
    Mat(usize),
}

impl fmt::Display for ShaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderType::Float => f.write_str("float"),
            ShaderType::Bool => f.write_str("bool"),
            ShaderType::Vec(n) => write!(f, "vec{}", n),
            ShaderType::Mat(n) => write!(f, "mat{}", n),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderUnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl ShaderBinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ShaderBinaryOp::Add => "+",
            ShaderBinaryOp::Sub => "-",
            ShaderBinaryOp::Mul => "*",
            ShaderBinaryOp::Div => "/",
            ShaderBinaryOp::Lt => "<",
            ShaderBinaryOp::Le => "<=",
            ShaderBinaryOp::Gt => ">",
            ShaderBinaryOp::Ge => ">=",
            ShaderBinaryOp::And => "&&",
            ShaderBinaryOp::Or => "||",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ShaderExpr {
    Float(f64),
    Bool(bool),
    Var(String),
    /// `v.x`, `v.y`, ...
    Component(Box<ShaderExpr>, usize),
    /// `m[col][row]`
    Element(Box<ShaderExpr>, usize, usize),
    Unary(ShaderUnaryOp, Box<ShaderExpr>),
    Binary(ShaderBinaryOp, Box<ShaderExpr>, Box<ShaderExpr>),
    /// A builtin or a function defined in the module.
    Call(String, Vec<ShaderExpr>),
    Construct(ShaderType, Vec<ShaderExpr>),
}

impl ShaderExpr {
    pub fn var<S: Into<String>>(name: S) -> Self {
        ShaderExpr::Var(name.into())
    }

    pub fn component<S: Into<String>>(name: S, index: usize) -> Self {
        ShaderExpr::Component(Box::new(ShaderExpr::Var(name.into())), index)
    }

    pub fn element<S: Into<String>>(name: S, col: usize, row: usize) -> Self {
        ShaderExpr::Element(Box::new(ShaderExpr::Var(name.into())), col, row)
    }

    pub fn call<S: Into<String>>(name: S, args: Vec<ShaderExpr>) -> Self {
        ShaderExpr::Call(name.into(), args)
    }

    pub fn binary(op: ShaderBinaryOp, lhs: ShaderExpr, rhs: ShaderExpr) -> Self {
        ShaderExpr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn add(lhs: ShaderExpr, rhs: ShaderExpr) -> Self {
        Self::binary(ShaderBinaryOp::Add, lhs, rhs)
    }

    pub fn sub(lhs: ShaderExpr, rhs: ShaderExpr) -> Self {
        Self::binary(ShaderBinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(lhs: ShaderExpr, rhs: ShaderExpr) -> Self {
        Self::binary(ShaderBinaryOp::Mul, lhs, rhs)
    }

    pub fn div(lhs: ShaderExpr, rhs: ShaderExpr) -> Self {
        Self::binary(ShaderBinaryOp::Div, lhs, rhs)
    }

    pub fn neg(operand: ShaderExpr) -> Self {
        ShaderExpr::Unary(ShaderUnaryOp::Neg, Box::new(operand))
    }

    /// Left-folded sum; an empty sum is `0.0`.
    pub fn sum<I: IntoIterator<Item = ShaderExpr>>(terms: I) -> Self {
        terms
            .into_iter()
            .reduce(ShaderExpr::add)
            .unwrap_or(ShaderExpr::Float(0.0))
    }

    /// Whether the expression is a literal, a name or a swizzle, so that
    /// repeating it costs nothing.
    pub fn is_trivial(&self) -> bool {
        match self {
            ShaderExpr::Float(_) | ShaderExpr::Bool(_) | ShaderExpr::Var(_) => true,
            ShaderExpr::Component(base, _) | ShaderExpr::Element(base, _, _) => base.is_trivial(),
            _ => false,
        }
    }
}

/// Formats a float literal: always with a decimal point, never in exponent
/// form, and parenthesised when negative.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "(0.0 / 0.0)".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 {
            "(1.0 / 0.0)".to_string()
        } else {
            "(-1.0 / 0.0)".to_string()
        };
    }
    let mut text = format!("{}", value.abs());
    if !text.contains('.') {
        text.push_str(".0");
    }
    if value.is_sign_negative() && value != 0.0 {
        format!("(-{})", text)
    } else {
        text
    }
}

impl fmt::Display for ShaderExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderExpr::Float(v) => f.write_str(&format_float(*v)),
            ShaderExpr::Bool(b) => write!(f, "{}", b),
            ShaderExpr::Var(name) => f.write_str(name),
            ShaderExpr::Component(base, i) => write!(f, "{}.{}", base, COMPONENTS[*i]),
            ShaderExpr::Element(base, col, row) => write!(f, "{}[{}][{}]", base, col, row),
            ShaderExpr::Unary(ShaderUnaryOp::Neg, operand) => write!(f, "(-{})", operand),
            ShaderExpr::Unary(ShaderUnaryOp::Not, operand) => write!(f, "(!{})", operand),
            ShaderExpr::Binary(op, lhs, rhs) => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            ShaderExpr::Call(name, args) => write_call(f, name, args),
            ShaderExpr::Construct(ty, args) => write_call(f, &ty.to_string(), args),
        }
    }
}

fn write_call(f: &mut fmt::Formatter<'_>, name: &str, args: &[ShaderExpr]) -> fmt::Result {
    write!(f, "{}(", name)?;
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", arg)?;
    }
    f.write_str(")")
}

#[derive(Clone, Debug, PartialEq)]
pub enum Place {
    Var(String),
    Component(String, usize),
    Element(String, usize, usize),
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Var(name) => f.write_str(name),
            Place::Component(name, i) => write!(f, "{}.{}", name, COMPONENTS[*i]),
            Place::Element(name, col, row) => write!(f, "{}[{}][{}]", name, col, row),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Let {
        ty: ShaderType,
        name: String,
        value: ShaderExpr,
    },
    Assign {
        place: Place,
        value: ShaderExpr,
    },
    If {
        cond: ShaderExpr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    /// `for (int i = 0; i < count; i++)`
    For {
        count: usize,
        body: Vec<Stmt>,
    },
    Break,
    Return(ShaderExpr),
    Comment(String),
}

impl Stmt {
    pub fn let_<S: Into<String>>(ty: ShaderType, name: S, value: ShaderExpr) -> Self {
        Stmt::Let {
            ty,
            name: name.into(),
            value,
        }
    }

    pub fn assign(place: Place, value: ShaderExpr) -> Self {
        Stmt::Assign { place, value }
    }

    fn render(&self, out: &mut String, depth: usize) -> fmt::Result {
        let indent = "    ".repeat(depth);
        match self {
            Stmt::Let { ty, name, value } => writeln!(out, "{}{} {} = {};", indent, ty, name, value),
            Stmt::Assign { place, value } => writeln!(out, "{}{} = {};", indent, place, value),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                writeln!(out, "{}if ({}) {{", indent, cond)?;
                render_block(then, out, depth + 1)?;
                let mut otherwise = otherwise;
                loop {
                    match otherwise.as_slice() {
                        [] => break,
                        [Stmt::If {
                            cond,
                            then,
                            otherwise: rest,
                        }] => {
                            writeln!(out, "{}}} else if ({}) {{", indent, cond)?;
                            render_block(then, out, depth + 1)?;
                            otherwise = rest;
                        }
                        block => {
                            writeln!(out, "{}}} else {{", indent)?;
                            render_block(block, out, depth + 1)?;
                            break;
                        }
                    }
                }
                writeln!(out, "{}}}", indent)
            }
            Stmt::For { count, body } => {
                writeln!(out, "{}for (int i = 0; i < {}; i++) {{", indent, count)?;
                render_block(body, out, depth + 1)?;
                writeln!(out, "{}}}", indent)
            }
            Stmt::Break => writeln!(out, "{}break;", indent),
            Stmt::Return(value) => writeln!(out, "{}return {};", indent, value),
            Stmt::Comment(text) => writeln!(out, "{}// {}", indent, text),
        }
    }
}

fn render_block(stmts: &[Stmt], out: &mut String, depth: usize) -> fmt::Result {
    for stmt in stmts {
        stmt.render(out, depth)?;
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
pub struct ShaderFunction {
    pub name: String,
    pub params: Vec<(ShaderType, String)>,
    pub ret: ShaderType,
    pub body: Vec<Stmt>,
}

impl ShaderFunction {
    pub fn new<S: Into<String>>(name: S, params: Vec<(ShaderType, String)>, ret: ShaderType) -> Self {
        ShaderFunction {
            name: name.into(),
            params,
            ret,
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<Stmt>) -> Self {
        self.body = body;
        self
    }
}

impl fmt::Display for ShaderFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(|(ty, name)| format!("{} {}", ty, name))
            .collect::<Vec<_>>()
            .join(", ");
        let mut body = String::new();
        render_block(&self.body, &mut body, 1)?;
        write!(f, "{} {}({}) {{\n{}}}\n", self.ret, self.name, params, body)
    }
}
