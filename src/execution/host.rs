//! The seam to the managed runtime that actually executes rewritten code.
//!
//! The sandbox prepares classes and state; a [`HostRuntime`] defines the
//! sandboxed classes, runs their code and reports what it threw.

use std::fmt;

use thiserror::Error;

use crate::costing::ThresholdViolation;
use crate::execution::context::SandboxRuntimeContext;
use crate::loader::LoadedClass;

/// Error raised by the runtime when a cost threshold is breached.
pub const THRESHOLD_VIOLATION_ERROR: &str = "sandbox/ThresholdViolationError";
/// Error raised by the runtime for a rule broken at execution time.
pub const RULE_VIOLATION_ERROR: &str = "sandbox/RuleViolationError";

/// Category of a throwable, deciding how it crosses the boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrowableKind {
    RuntimeException,
    Error,
    /// Checked exceptions are wrapped before they reach the caller.
    Checked,
}

/// Something thrown inside the sandbox.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{}: {message}", .class_name.replace('/', "."))]
pub struct GuestThrowable {
    /// Internal name, usually sandboxed.
    pub class_name: String,
    pub message: String,
    pub kind: ThrowableKind,
    /// Set when this is the sandbox terminating a run over its costs.
    pub violation: Option<ThresholdViolation>,
}

impl GuestThrowable {
    pub fn new(class_name: &str, message: impl Into<String>, kind: ThrowableKind) -> Self {
        Self {
            class_name: class_name.to_string(),
            message: message.into(),
            kind,
            violation: None,
        }
    }

    pub fn rule_violation(message: impl Into<String>) -> Self {
        Self::new(RULE_VIOLATION_ERROR, message, ThrowableKind::Error)
    }

    /// Throwables user code must never swallow.
    pub fn is_terminal(&self) -> bool {
        self.violation.is_some() || self.class_name == RULE_VIOLATION_ERROR
    }
}

impl From<ThresholdViolation> for GuestThrowable {
    fn from(violation: ThresholdViolation) -> Self {
        Self {
            class_name: THRESHOLD_VIOLATION_ERROR.to_string(),
            message: violation.message.clone(),
            kind: ThrowableKind::Error,
            violation: Some(violation),
        }
    }
}

/// Primitive value, boxed when it lives inside the sandbox.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Primitive {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl Primitive {
    /// Sandboxed wrapper class.
    pub fn boxed_class(&self) -> &'static str {
        match self {
            Primitive::Boolean(_) => "sandbox/java/lang/Boolean",
            Primitive::Byte(_) => "sandbox/java/lang/Byte",
            Primitive::Char(_) => "sandbox/java/lang/Character",
            Primitive::Short(_) => "sandbox/java/lang/Short",
            Primitive::Int(_) => "sandbox/java/lang/Integer",
            Primitive::Long(_) => "sandbox/java/lang/Long",
            Primitive::Float(_) => "sandbox/java/lang/Float",
            Primitive::Double(_) => "sandbox/java/lang/Double",
        }
    }
}

/// Primitive arrays are shared with the host as they are.
#[derive(Clone, Debug, PartialEq)]
pub enum PrimitiveArray {
    Boolean(Vec<bool>),
    Byte(Vec<i8>),
    Char(Vec<u16>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl PrimitiveArray {
    pub fn descriptor(&self) -> &'static str {
        match self {
            PrimitiveArray::Boolean(_) => "[Z",
            PrimitiveArray::Byte(_) => "[B",
            PrimitiveArray::Char(_) => "[C",
            PrimitiveArray::Short(_) => "[S",
            PrimitiveArray::Int(_) => "[I",
            PrimitiveArray::Long(_) => "[J",
            PrimitiveArray::Float(_) => "[F",
            PrimitiveArray::Double(_) => "[D",
        }
    }
}

/// A value as sandboxed code sees it.
#[derive(Clone, Debug, PartialEq)]
pub enum GuestValue {
    Null,
    /// `sandbox/java/lang/String`.
    String(String),
    Boxed(Primitive),
    Array(PrimitiveArray),
    /// Any other object, known to the host runtime by identity.
    Object { class_name: String, identity: u64 },
}

impl GuestValue {
    /// Internal name of the value's class; `None` for null.
    pub fn class_name(&self) -> Option<&str> {
        match self {
            GuestValue::Null => None,
            GuestValue::String(_) => Some("sandbox/java/lang/String"),
            GuestValue::Boxed(primitive) => Some(primitive.boxed_class()),
            GuestValue::Array(array) => Some(array.descriptor()),
            GuestValue::Object { class_name, .. } => Some(class_name),
        }
    }
}

impl fmt::Display for GuestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestValue::Null => f.write_str("null"),
            GuestValue::String(value) => write!(f, "{value:?}"),
            GuestValue::Boxed(primitive) => write!(f, "{primitive:?}"),
            GuestValue::Array(array) => write!(f, "{}", array.descriptor()),
            GuestValue::Object { class_name, identity } => {
                write!(f, "{}@{identity:x}", class_name.replace('/', "."))
            }
        }
    }
}

/// The managed runtime behind the sandbox.
///
/// Both calls run on the worker thread with `context` bound, so code the
/// runtime executes reaches the accounter through the runtime hooks.
pub trait HostRuntime: Send + Sync {
    /// Re-run the `djvm$reset` method of an already defined class.
    fn reset_class(&self, context: &SandboxRuntimeContext, class_name: &str) -> Result<(), GuestThrowable>;

    /// Instantiate `entry` and call its `apply` with `input`.
    fn apply(
        &self,
        context: &SandboxRuntimeContext,
        entry: &LoadedClass,
        input: GuestValue,
    ) -> Result<GuestValue, GuestThrowable>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::costing::CostMetric;

    #[test]
    fn threshold_violations_become_terminal_errors() {
        let throwable = GuestThrowable::from(ThresholdViolation {
            metric: CostMetric::Jump,
            message: "Sandbox [djvm-sandbox-1] terminated due to excessive use of looping".to_string(),
        });

        assert!(throwable.is_terminal());
        assert_eq!(throwable.kind, ThrowableKind::Error);
        assert_eq!(
            throwable.to_string(),
            "sandbox.ThresholdViolationError: Sandbox [djvm-sandbox-1] terminated due to excessive use of looping"
        );
    }

    #[test]
    fn ordinary_exceptions_are_not_terminal() {
        let throwable = GuestThrowable::new(
            "sandbox/java/lang/IllegalStateException",
            "bad state",
            ThrowableKind::RuntimeException,
        );

        assert!(!throwable.is_terminal());
        assert!(GuestThrowable::rule_violation("Native method has been deleted").is_terminal());
    }

    #[test]
    fn guest_values_name_their_sandboxed_class() {
        assert_eq!(GuestValue::Boxed(Primitive::Int(3)).class_name(), Some("sandbox/java/lang/Integer"));
        assert_eq!(
            GuestValue::Array(PrimitiveArray::Byte(vec![1])).class_name(),
            Some("[B")
        );
        assert_eq!(GuestValue::Null.class_name(), None);
    }
}
