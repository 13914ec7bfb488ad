//! Target identity and the qualification policy.

use std::fmt;

use serde::Serialize;

/// Annotation carrying the legacy ingress class.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Annotation that opts a target out of monitoring when set to `"true"`.
pub const OPT_OUT_ANNOTATION: &str = "http-keepalive-monitor/ignore";

/// Stable identity of a monitored target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TargetId {
    pub namespace: String,
    pub name: String,
}

impl TargetId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What discovery reports about one target on each reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub id: TargetId,
    pub class_annotation: Option<String>,
    pub explicit_class: Option<String>,
    pub opt_out: bool,
    pub deletion_requested: bool,
}

impl TargetSpec {
    pub fn new(id: TargetId) -> Self {
        Self {
            id,
            class_annotation: None,
            explicit_class: None,
            opt_out: false,
            deletion_requested: false,
        }
    }

    /// The explicit class wins over the annotation; empty strings count as unset.
    pub fn effective_class(&self) -> Option<&str> {
        self.explicit_class
            .as_deref()
            .filter(|c| !c.is_empty())
            .or_else(|| self.class_annotation.as_deref().filter(|c| !c.is_empty()))
    }
}

/// Class filter applied to every target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassPolicy {
    /// Monitor targets that carry no class at all.
    pub default_class_qualifies: bool,
    /// Only monitor targets of this class; `None` means no restriction.
    pub restrict_to: Option<String>,
}

/// Outcome of evaluating a target against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Qualification {
    Qualifies,
    Deleted,
    OptedOut,
    Unclassified,
    ClassMismatch { want: String, have: String },
}

impl Qualification {
    pub fn qualifies(&self) -> bool {
        matches!(self, Qualification::Qualifies)
    }
}

impl ClassPolicy {
    pub fn new(default_class_qualifies: bool, restrict_to: impl Into<String>) -> Self {
        let restrict_to = restrict_to.into();
        Self {
            default_class_qualifies,
            restrict_to: (!restrict_to.is_empty()).then_some(restrict_to),
        }
    }

    pub fn evaluate(&self, spec: &TargetSpec) -> Qualification {
        if spec.deletion_requested {
            return Qualification::Deleted;
        }
        if spec.opt_out {
            return Qualification::OptedOut;
        }
        match (spec.effective_class(), self.restrict_to.as_deref()) {
            (None, _) if self.default_class_qualifies => Qualification::Qualifies,
            (None, _) => Qualification::Unclassified,
            (Some(have), Some(want)) if have != want => Qualification::ClassMismatch {
                want: want.to_string(),
                have: have.to_string(),
            },
            (Some(_), _) => Qualification::Qualifies,
        }
    }
}
