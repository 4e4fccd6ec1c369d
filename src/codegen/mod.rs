mod builtins;
mod codegen;
pub mod eval;
pub mod inverse;
pub mod ir;
mod module;

pub use builtins::Builtins;
pub use codegen::{Bindings, CodeGenResult, CodeGenerator, EmitError, TEMPORARY_PREFIX};
pub use eval::{EvalError, Evaluator, Value};
pub use inverse::{add_runtime_inverse, inverse_function_name, DEFAULT_PIVOT_EPSILON};
pub use ir::{Place, ShaderExpr, ShaderFunction, ShaderType, Stmt};
pub use module::{ShaderConstant, ShaderModule, Uniform};

/// GLSL ES 3.00 keywords, type names and reserved words.
const GLSL_RESERVED: &[&str] = &[
    "attribute", "const", "uniform", "varying", "layout", "centroid", "flat", "smooth",
    "noperspective", "break", "continue", "do", "for", "while", "switch", "case", "default",
    "if", "else", "in", "out", "inout", "invariant", "discard", "return", "struct", "true",
    "false", "void", "bool", "int", "uint", "float", "double", "vec2", "vec3", "vec4", "ivec2",
    "ivec3", "ivec4", "bvec2", "bvec3", "bvec4", "uvec2", "uvec3", "uvec4", "dvec2", "dvec3",
    "dvec4", "mat2", "mat3", "mat4", "mat2x2", "mat2x3", "mat2x4", "mat3x2", "mat3x3",
    "mat3x4", "mat4x2", "mat4x3", "mat4x4", "lowp", "mediump", "highp", "precision",
    "sampler2D", "sampler3D", "samplerCube", "sampler2DShadow", "samplerCubeShadow",
    "sampler2DArray", "sampler2DArrayShadow", "isampler2D", "isampler3D", "isamplerCube",
    "isampler2DArray", "usampler2D", "usampler3D", "usamplerCube", "usampler2DArray",
    "coherent", "volatile", "restrict", "readonly", "writeonly", "resource", "atomic_uint",
    "patch", "sample", "subroutine", "common", "partition", "active", "asm", "class", "union",
    "enum", "typedef", "template", "this", "goto", "inline", "noinline", "public", "static",
    "extern", "external", "interface", "long", "short", "half", "fixed", "unsigned", "superp",
    "input", "output", "hvec2", "hvec3", "hvec4", "fvec2", "fvec3", "fvec4", "filter",
    "sizeof", "cast", "namespace", "using",
];

pub fn is_glsl_reserved(name: &str) -> bool {
    GLSL_RESERVED.contains(&name)
}

/// Whether `name` can be used as a GLSL identifier for a host-chosen
/// uniform or helper.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    head_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("gl_")
        && !name.contains("__")
        && Builtins::from_str(name).is_none()
        && !is_glsl_reserved(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_identifiers() {
        assert!(is_valid_identifier("u_alpha"));
        assert!(is_valid_identifier("_time2"));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("gl_Position"));
        assert!(!is_valid_identifier("a__b"));
        assert!(!is_valid_identifier("sin"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("float"));
        assert!(!is_valid_identifier("vec2"));
        assert!(!is_valid_identifier("mat3"));
        assert!(!is_valid_identifier("return"));
        assert!(is_valid_identifier("floaty"));
    }
}
