use std::fmt;

use serde::Serialize;
use tracing::warn;

/// Non-fatal issues. The shader is still emitted, in a degraded form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum DiagnosticKind {
    /// A chart's Jacobian could not be inverted; that chart uses the identity.
    JacobianSingular,
    /// A derivative met `abs`, `floor`, `min` and the like, taken as zero.
    JacobianNonDifferentiable,
    /// No inverse transform is available; `transformToCartesian` is the identity.
    InverseMissingFallbackIdentity,
    /// Newton iteration was requested but no Jacobian could be built.
    NewtonExpressionsMissing,
    /// Newton iteration was requested for a scheme that only iterates to a
    /// fixed point.
    NewtonUnsupportedByIntegrator,
    /// Near a polar axis the Jacobian is evaluated at a slightly displaced point.
    PolarCapApproximation,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dimension {
            Some(d) => write!(f, "{} (dimension {}): {}", self.kind, d, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<S: Into<String>>(&mut self, kind: DiagnosticKind, message: S) {
        self.record(Diagnostic {
            kind,
            message: message.into(),
            dimension: None,
        });
    }

    pub fn push_for_dimension<S: Into<String>>(&mut self, kind: DiagnosticKind, dimension: usize, message: S) {
        self.record(Diagnostic {
            kind,
            message: message.into(),
            dimension: Some(dimension),
        });
    }

    fn record(&mut self, diagnostic: Diagnostic) {
        warn!(kind = %diagnostic.kind, dimension = ?diagnostic.dimension, "{}", diagnostic.message);
        self.items.push(diagnostic);
    }

    pub fn contains(&self, kind: DiagnosticKind) -> bool {
        self.items.iter().any(|d| d.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}
