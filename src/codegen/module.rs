use std::fmt;

use indexmap::IndexMap;

use super::ir::{ShaderExpr, ShaderFunction, ShaderType};

#[derive(Clone, Debug, PartialEq)]
pub struct ShaderConstant {
    pub name: String,
    pub ty: ShaderType,
    pub value: ShaderExpr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Uniform {
    pub name: String,
    pub ty: ShaderType,
}

/// An ordered collection of constants, uniforms and functions.
///
/// Functions are keyed by name and keep their insertion order, which is also
/// the order they are rendered in; a callee must be added before its caller.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShaderModule {
    constants: Vec<ShaderConstant>,
    uniforms: Vec<Uniform>,
    functions: IndexMap<String, ShaderFunction>,
}

impl ShaderModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_constant<S: Into<String>>(&mut self, name: S, ty: ShaderType, value: ShaderExpr) {
        let name = name.into();
        if self.constants.iter().all(|c| c.name != name) {
            self.constants.push(ShaderConstant { name, ty, value });
        }
    }

    pub fn add_uniform<S: Into<String>>(&mut self, name: S, ty: ShaderType) {
        let name = name.into();
        if self.uniforms.iter().all(|u| u.name != name) {
            self.uniforms.push(Uniform { name, ty });
        }
    }

    /// Adds a function unless one with the same name already exists.
    /// Returns whether it was added.
    pub fn add_function(&mut self, function: ShaderFunction) -> bool {
        if self.functions.contains_key(&function.name) {
            return false;
        }
        self.functions.insert(function.name.clone(), function);
        true
    }

    pub fn contains_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn function(&self, name: &str) -> Option<&ShaderFunction> {
        self.functions.get(name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &ShaderFunction> {
        self.functions.values()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn constants(&self) -> &[ShaderConstant] {
        &self.constants
    }

    pub fn uniforms(&self) -> &[Uniform] {
        &self.uniforms
    }
}

impl fmt::Display for ShaderModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for constant in &self.constants {
            writeln!(f, "const {} {} = {};", constant.ty, constant.name, constant.value)?;
        }
        for uniform in &self.uniforms {
            writeln!(f, "uniform {} {};", uniform.ty, uniform.name)?;
        }
        for function in self.functions.values() {
            writeln!(f)?;
            write!(f, "{}", function)?;
        }
        Ok(())
    }
}
