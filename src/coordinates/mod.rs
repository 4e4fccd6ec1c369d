//! Coordinate systems: forward and inverse transforms, presets, and the
//! chart atlas used to stay clear of coordinate singularities.

mod atlas;
mod transforms;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expression::Expression;
use crate::functions::{Callable, NamedConstant};
use crate::matrix::ExpressionMatrix;
use crate::syntax::{parse, SyntaxError};

pub use atlas::{Atlas, Chart, ChartKind, Predicate, POLAR_CAP_TOLERANCE};
pub use transforms::{
    emit_to_cartesian, emit_to_native, emit_velocity_to_cartesian, InverseSolverOptions,
    InverseStrategy, TO_CARTESIAN, TO_NATIVE, VELOCITY_TO_CARTESIAN,
};

/// Positional variable names, in dimension order.
pub const POSITIONAL: [&str; 6] = ["x", "y", "z", "w", "u", "v"];

/// The animation parameter, bound to a uniform by the driver.
pub const ALPHA_VARIABLE: &str = "a";

pub const MIN_DIMENSIONS: usize = 2;
pub const MAX_DIMENSIONS: usize = 4;

pub fn positional_variables(dimensions: usize) -> &'static [&'static str] {
    &POSITIONAL[..dimensions.min(POSITIONAL.len())]
}

/// `dx`, `dy`, ... for the first `dimensions` positional variables.
pub fn velocity_variables(dimensions: usize) -> Vec<String> {
    positional_variables(dimensions)
        .iter()
        .map(|v| format!("d{}", v))
        .collect()
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoordinateError {
    #[error("unknown coordinate system preset `{0}`")]
    UnknownPreset(String),

    #[error("coordinate systems must have between 2 and 4 dimensions, found {0}")]
    UnsupportedDimension(usize),

    #[error("expected {expected} {what}, found {found}")]
    CountMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid variable label `{0}`")]
    InvalidLabel(String),

    #[error("duplicate variable label `{0}`")]
    DuplicateLabel(String),

    #[error("{what} {index}: {source}")]
    Syntax {
        what: &'static str,
        index: usize,
        #[source]
        source: SyntaxError,
    },

    #[error("{what} {index} references unknown identifier `{identifier}`")]
    UnknownIdentifier {
        what: &'static str,
        index: usize,
        identifier: String,
    },

    #[error("malformed coordinate system record: {0}")]
    Json(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableLabel {
    pub label: String,
    #[serde(default)]
    pub display_label: String,
}

impl VariableLabel {
    pub fn new(label: &str, display_label: &str) -> Self {
        VariableLabel {
            label: label.to_string(),
            display_label: display_label.to_string(),
        }
    }
}

/// The persisted form of a coordinate system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinateSystemRecord {
    pub name: String,
    pub dimensions: usize,
    pub variables: Vec<VariableLabel>,
    pub forward_transforms: Vec<String>,
    #[serde(default)]
    pub inverse_transforms: Option<Vec<String>>,
    #[serde(default)]
    pub use_iterative_solver: bool,
}

impl CoordinateSystemRecord {
    pub fn from_json(text: &str) -> Result<Self, CoordinateError> {
        serde_json::from_str(text).map_err(|e| CoordinateError::Json(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // A record holds only strings, numbers and booleans.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateSystem {
    name: String,
    variables: Vec<VariableLabel>,
    forward: Vec<Expression>,
    inverse: Option<Vec<Expression>>,
    use_iterative_solver: bool,
    atlas: Atlas,
}

const PRESETS: [&str; 7] = [
    "cartesian2d",
    "cartesian3d",
    "cartesian4d",
    "polar2d",
    "cylindrical3d",
    "spherical3d",
    "hyperspherical4d",
];

fn preset_record(name: &str) -> Option<CoordinateSystemRecord> {
    let record = |dims: usize,
                  vars: &[(&str, &str)],
                  forward: &[&str],
                  inverse: &[&str]| CoordinateSystemRecord {
        name: name.to_string(),
        dimensions: dims,
        variables: vars.iter().map(|(l, d)| VariableLabel::new(l, d)).collect(),
        forward_transforms: forward.iter().map(|s| s.to_string()).collect(),
        inverse_transforms: Some(inverse.iter().map(|s| s.to_string()).collect()),
        use_iterative_solver: false,
    };
    let cartesian = |dims: usize| {
        let names = positional_variables(dims);
        let vars: Vec<_> = names.iter().map(|n| (*n, *n)).collect();
        record(dims, &vars, names, names)
    };

    Some(match name {
        "cartesian2d" => cartesian(2),
        "cartesian3d" => cartesian(3),
        "cartesian4d" => cartesian(4),
        "polar2d" => record(
            2,
            &[("r", "r"), ("theta", "θ")],
            &["sqrt(x^2 + y^2)", "atan2(y, x)"],
            &["r * cos(theta)", "r * sin(theta)"],
        ),
        "cylindrical3d" => record(
            3,
            &[("r", "r"), ("theta", "θ"), ("z", "z")],
            &["sqrt(x^2 + y^2)", "atan2(y, x)", "z"],
            &["r * cos(theta)", "r * sin(theta)", "z"],
        ),
        "spherical3d" => record(
            3,
            &[("r", "r"), ("theta", "θ"), ("phi", "φ")],
            &[
                "sqrt(x^2 + y^2 + z^2)",
                "acos(z / sqrt(x^2 + y^2 + z^2))",
                "atan2(y, x)",
            ],
            &[
                "r * sin(theta) * cos(phi)",
                "r * sin(theta) * sin(phi)",
                "r * cos(theta)",
            ],
        ),
        "hyperspherical4d" => record(
            4,
            &[("r", "r"), ("psi", "ψ"), ("theta", "θ"), ("phi", "φ")],
            &[
                "sqrt(x^2 + y^2 + z^2 + w^2)",
                "acos(w / sqrt(x^2 + y^2 + z^2 + w^2))",
                "acos(z / sqrt(x^2 + y^2 + z^2))",
                "atan2(y, x)",
            ],
            &[
                "r * sin(psi) * sin(theta) * cos(phi)",
                "r * sin(psi) * sin(theta) * sin(phi)",
                "r * sin(psi) * cos(theta)",
                "r * cos(psi)",
            ],
        ),
        _ => return None,
    })
}

fn is_label(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name != ALPHA_VARIABLE
        && NamedConstant::from_name(name).is_none()
        && Callable::lookup(name).is_none()
}

fn parse_all(
    what: &'static str,
    sources: &[String],
    allowed: &BTreeSet<&str>,
) -> Result<Vec<Expression>, CoordinateError> {
    sources
        .iter()
        .enumerate()
        .map(|(index, source)| {
            let expr = parse(source).map_err(|source| CoordinateError::Syntax { what, index, source })?;
            if let Some(identifier) = expr.variables().into_iter().find(|v| !allowed.contains(v.as_str())) {
                return Err(CoordinateError::UnknownIdentifier {
                    what,
                    index,
                    identifier,
                });
            }
            Ok(expr)
        })
        .collect()
}

impl CoordinateSystem {
    pub fn preset_names() -> &'static [&'static str] {
        &PRESETS
    }

    pub fn preset(name: &str) -> Result<Self, CoordinateError> {
        let record = preset_record(name).ok_or_else(|| CoordinateError::UnknownPreset(name.to_string()))?;
        Self::from_record(&record)
    }

    pub fn cartesian(dimensions: usize) -> Result<Self, CoordinateError> {
        match dimensions {
            2 => Self::preset("cartesian2d"),
            3 => Self::preset("cartesian3d"),
            4 => Self::preset("cartesian4d"),
            n => Err(CoordinateError::UnsupportedDimension(n)),
        }
    }

    /// Validates a record and builds its atlas.
    ///
    /// Forward transforms may use only positional variables; inverse
    /// transforms only the record's own labels.
    pub fn from_record(record: &CoordinateSystemRecord) -> Result<Self, CoordinateError> {
        let dims = record.dimensions;
        if !(MIN_DIMENSIONS..=MAX_DIMENSIONS).contains(&dims) {
            return Err(CoordinateError::UnsupportedDimension(dims));
        }
        let check_count = |what, found: usize| {
            if found == dims {
                Ok(())
            } else {
                Err(CoordinateError::CountMismatch {
                    what,
                    expected: dims,
                    found,
                })
            }
        };
        check_count("variables", record.variables.len())?;
        check_count("forward transforms", record.forward_transforms.len())?;
        if let Some(inverse) = &record.inverse_transforms {
            check_count("inverse transforms", inverse.len())?;
        }

        let mut labels = BTreeSet::new();
        for var in &record.variables {
            if !is_label(&var.label) {
                return Err(CoordinateError::InvalidLabel(var.label.clone()));
            }
            if !labels.insert(var.label.as_str()) {
                return Err(CoordinateError::DuplicateLabel(var.label.clone()));
            }
        }

        let positional = positional_variables(dims).iter().copied().collect();
        let forward = parse_all("forward transform", &record.forward_transforms, &positional)?;
        let inverse = match &record.inverse_transforms {
            Some(sources) => Some(parse_all("inverse transform", sources, &labels)?),
            None => None,
        };

        let variables = record
            .variables
            .iter()
            .map(|v| VariableLabel {
                label: v.label.clone(),
                display_label: if v.display_label.is_empty() {
                    v.label.clone()
                } else {
                    v.display_label.clone()
                },
            })
            .collect();

        let atlas = Atlas::generate(&forward, positional_variables(dims));
        Ok(CoordinateSystem {
            name: record.name.clone(),
            variables,
            forward,
            inverse,
            use_iterative_solver: record.use_iterative_solver,
            atlas,
        })
    }

    pub fn to_record(&self) -> CoordinateSystemRecord {
        CoordinateSystemRecord {
            name: self.name.clone(),
            dimensions: self.dimensions(),
            variables: self.variables.clone(),
            forward_transforms: self.forward.iter().map(|e| e.to_string()).collect(),
            inverse_transforms: self
                .inverse
                .as_ref()
                .map(|inv| inv.iter().map(|e| e.to_string()).collect()),
            use_iterative_solver: self.use_iterative_solver,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> usize {
        self.forward.len()
    }

    pub fn variables(&self) -> &[VariableLabel] {
        &self.variables
    }

    pub fn labels(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.label.as_str()).collect()
    }

    pub fn positional(&self) -> &'static [&'static str] {
        positional_variables(self.dimensions())
    }

    pub fn forward(&self) -> &[Expression] {
        &self.forward
    }

    pub fn inverse(&self) -> Option<&[Expression]> {
        self.inverse.as_deref()
    }

    pub fn use_iterative_solver(&self) -> bool {
        self.use_iterative_solver
    }

    pub fn atlas(&self) -> &Atlas {
        &self.atlas
    }

    /// Identity forward transforms over labels equal to the positional names.
    pub fn is_cartesian(&self) -> bool {
        self.positional()
            .iter()
            .zip(&self.forward)
            .zip(&self.variables)
            .all(|((p, f), v)| v.label == *p && *f == Expression::var(*p))
    }

    /// `J[i][j] = d native_i / d positional_j` for the primary chart.
    pub fn jacobian(&self) -> ExpressionMatrix {
        ExpressionMatrix::jacobian(&self.forward, self.positional())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn every_preset_builds() {
        for name in CoordinateSystem::preset_names() {
            let system = CoordinateSystem::preset(name).unwrap();
            assert_eq!(system.name(), *name);
            assert!(system.inverse().is_some());
            assert_eq!(system.is_cartesian(), name.starts_with("cartesian"), "{}", name);
        }
        assert_eq!(
            CoordinateSystem::preset("toroidal"),
            Err(CoordinateError::UnknownPreset("toroidal".into()))
        );
    }

    #[test]
    fn records_round_trip_through_json() {
        let system = CoordinateSystem::preset("spherical3d").unwrap();
        let json = system.to_record().to_json();
        assert!(json.contains("\"forwardTransforms\""));
        assert!(json.contains("\"displayLabel\": \"φ\""));
        let back = CoordinateSystem::from_record(&CoordinateSystemRecord::from_json(&json).unwrap()).unwrap();
        assert_eq!(back, system);
    }

    #[test]
    fn optional_fields_default_and_unknown_fields_are_ignored() {
        let json = r#"{
            "name": "skew",
            "dimensions": 2,
            "variables": [{"label": "p"}, {"label": "q", "displayLabel": "Q"}],
            "forwardTransforms": ["x + y", "y"],
            "futureField": 42
        }"#;
        let record = CoordinateSystemRecord::from_json(json).unwrap();
        assert_eq!(record.inverse_transforms, None);
        assert!(!record.use_iterative_solver);
        let system = CoordinateSystem::from_record(&record).unwrap();
        assert_eq!(system.variables()[0].display_label, "p");
        assert_eq!(system.atlas().charts().len(), 1);
    }

    #[test]
    fn rejects_inconsistent_records() {
        let mut record = preset_record("polar2d").unwrap();
        record.forward_transforms.push("x".into());
        assert!(matches!(
            CoordinateSystem::from_record(&record),
            Err(CoordinateError::CountMismatch { what: "forward transforms", expected: 2, found: 3 })
        ));

        let mut record = preset_record("polar2d").unwrap();
        record.forward_transforms[1] = "atan2(y, q)".into();
        assert!(matches!(
            CoordinateSystem::from_record(&record),
            Err(CoordinateError::UnknownIdentifier { index: 1, .. })
        ));

        let mut record = preset_record("polar2d").unwrap();
        record.variables[1].label = "sin".into();
        assert_eq!(
            CoordinateSystem::from_record(&record),
            Err(CoordinateError::InvalidLabel("sin".into()))
        );

        let mut record = preset_record("polar2d").unwrap();
        record.dimensions = 5;
        assert_eq!(
            CoordinateSystem::from_record(&record),
            Err(CoordinateError::UnsupportedDimension(5))
        );
    }

    #[test]
    fn polar_jacobian_matches_closed_form() {
        let system = CoordinateSystem::preset("polar2d").unwrap();
        let j = system.jacobian().eval(&HashMap::from([("x", 0.0), ("y", 2.0)])).unwrap();
        assert!((j[0][1] - 1.0).abs() < 1e-12);
        assert!((j[1][0] + 0.5).abs() < 1e-12);
    }
}
