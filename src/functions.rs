//! The fixed tables of named constants and builtin functions.
//!
//! These are process-wide constants: the lexer uses them to tag identifiers,
//! the parser to check arity, the differentiator for its derivative table
//! and the code generator for shader names.

use std::fmt;

/// Reserved identifiers that denote numeric constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NamedConstant {
    Pi,
    E,
}

impl NamedConstant {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pi" | "PI" => Some(Self::Pi),
            "e" | "E" => Some(Self::E),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pi => "pi",
            Self::E => "e",
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Self::Pi => std::f64::consts::PI,
            Self::E => std::f64::consts::E,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryFunction {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Log,
    Log2,
    Sqrt,
    Abs,
    Floor,
    Ceil,
    Fract,
    Sign,
    Length,
    Normalize,
}

impl UnaryFunction {
    pub const ALL: [UnaryFunction; 20] = [
        Self::Sin,
        Self::Cos,
        Self::Tan,
        Self::Asin,
        Self::Acos,
        Self::Atan,
        Self::Sinh,
        Self::Cosh,
        Self::Tanh,
        Self::Exp,
        Self::Log,
        Self::Log2,
        Self::Sqrt,
        Self::Abs,
        Self::Floor,
        Self::Ceil,
        Self::Fract,
        Self::Sign,
        Self::Length,
        Self::Normalize,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Asin => "asin",
            Self::Acos => "acos",
            Self::Atan => "atan",
            Self::Sinh => "sinh",
            Self::Cosh => "cosh",
            Self::Tanh => "tanh",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Log2 => "log2",
            Self::Sqrt => "sqrt",
            Self::Abs => "abs",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Fract => "fract",
            Self::Sign => "sign",
            Self::Length => "length",
            Self::Normalize => "normalize",
        }
    }

    /// Scalar semantics, matching the shader builtins on `float`.
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Tan => x.tan(),
            Self::Asin => x.asin(),
            Self::Acos => x.acos(),
            Self::Atan => x.atan(),
            Self::Sinh => x.sinh(),
            Self::Cosh => x.cosh(),
            Self::Tanh => x.tanh(),
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Log2 => x.log2(),
            Self::Sqrt => x.sqrt(),
            Self::Abs | Self::Length => x.abs(),
            Self::Floor => x.floor(),
            Self::Ceil => x.ceil(),
            Self::Fract => x - x.floor(),
            Self::Sign | Self::Normalize => shader_sign(x),
        }
    }

    /// Whether the derivative table has an entry for this function.
    pub fn is_differentiable(&self) -> bool {
        !matches!(
            self,
            Self::Abs
                | Self::Floor
                | Self::Ceil
                | Self::Fract
                | Self::Sign
                | Self::Length
                | Self::Normalize
        )
    }
}

impl fmt::Display for UnaryFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryFunction {
    Min,
    Max,
    Dot,
    Atan2,
}

impl BinaryFunction {
    pub const ALL: [BinaryFunction; 4] = [Self::Min, Self::Max, Self::Dot, Self::Atan2];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Dot => "dot",
            Self::Atan2 => "atan2",
        }
    }

    pub fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            Self::Min => a.min(b),
            Self::Max => a.max(b),
            Self::Dot => a * b,
            Self::Atan2 => a.atan2(b),
        }
    }

    pub fn is_differentiable(&self) -> bool {
        !matches!(self, Self::Min | Self::Max)
    }
}

impl fmt::Display for BinaryFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Mod,
}

impl BinaryOp {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Self::Add),
            '-' => Some(Self::Sub),
            '*' => Some(Self::Mul),
            '/' => Some(Self::Div),
            '^' => Some(Self::Pow),
            '%' => Some(Self::Mod),
            _ => None,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            Self::Add => '+',
            Self::Sub => '-',
            Self::Mul => '*',
            Self::Div => '/',
            Self::Pow => '^',
            Self::Mod => '%',
        }
    }

    /// Shunting-yard precedence. Unary minus sits between `*` and `^`.
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Add | Self::Sub => 1,
            Self::Mul | Self::Div | Self::Mod => 2,
            Self::Pow => 4,
        }
    }

    pub fn is_right_associative(&self) -> bool {
        matches!(self, Self::Pow)
    }

    pub fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Pow => a.powf(b),
            Self::Mod => shader_mod(a, b),
        }
    }
}

/// How an identifier that names a function may be called.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Callable {
    Unary(UnaryFunction),
    Binary(BinaryFunction),
    /// `pow(a, b)` and `mod(a, b)` are spellings of `^` and `%`.
    Operator(BinaryOp),
    /// `atan` takes one argument, or two when it means `atan2`.
    Atan,
}

impl Callable {
    pub fn lookup(name: &str) -> Option<Self> {
        match name {
            "atan" => Some(Self::Atan),
            "pow" => Some(Self::Operator(BinaryOp::Pow)),
            "mod" => Some(Self::Operator(BinaryOp::Mod)),
            _ => UnaryFunction::from_name(name)
                .map(Self::Unary)
                .or_else(|| BinaryFunction::from_name(name).map(Self::Binary)),
        }
    }

    pub fn accepts(&self, argc: usize) -> bool {
        match self {
            Self::Unary(_) => argc == 1,
            Self::Binary(_) | Self::Operator(_) => argc == 2,
            Self::Atan => argc == 1 || argc == 2,
        }
    }

    pub fn expected_arity(&self) -> usize {
        match self {
            Self::Unary(_) | Self::Atan => 1,
            Self::Binary(_) | Self::Operator(_) => 2,
        }
    }
}

/// `mod` as the shader defines it: `a - b * floor(a / b)`.
pub fn shader_mod(a: f64, b: f64) -> f64 {
    a - b * (a / b).floor()
}

pub fn shader_sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}
