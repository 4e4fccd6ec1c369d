use crate::functions::{BinaryFunction, UnaryFunction};

/// GLSL builtins the emitter may call, keyed by their shader names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtins {
    Unary(UnaryFunction),
    /// `atan(x)` or `atan(y, x)`.
    Atan,
    Min,
    Max,
    Dot,
    Pow,
    Mod,
    Clamp,
}

impl Builtins {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "atan" => Some(Self::Atan),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "dot" => Some(Self::Dot),
            "pow" => Some(Self::Pow),
            "mod" => Some(Self::Mod),
            "clamp" => Some(Self::Clamp),
            _ => UnaryFunction::from_name(s).map(Self::Unary),
        }
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Unary(f) => unary_name(*f),
            Self::Atan => "atan",
            Self::Min => "min",
            Self::Max => "max",
            Self::Dot => "dot",
            Self::Pow => "pow",
            Self::Mod => "mod",
            Self::Clamp => "clamp",
        }
    }

    pub fn accepts(&self, argc: usize) -> bool {
        match self {
            Self::Unary(_) => argc == 1,
            Self::Atan => argc == 1 || argc == 2,
            Self::Min | Self::Max | Self::Dot | Self::Pow | Self::Mod => argc == 2,
            Self::Clamp => argc == 3,
        }
    }
}

/// Shader spelling of a unary function; every entry shares the GLSL name.
pub fn unary_name(f: UnaryFunction) -> &'static str {
    f.name()
}

pub fn function_name(f: BinaryFunction) -> &'static str {
    match f {
        BinaryFunction::Atan2 => Builtins::Atan.to_str(),
        BinaryFunction::Min => Builtins::Min.to_str(),
        BinaryFunction::Max => Builtins::Max.to_str(),
        BinaryFunction::Dot => Builtins::Dot.to_str(),
    }
}
