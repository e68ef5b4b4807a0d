use thiserror::Error;

use crate::costing::{RuntimeCostSummary, ThresholdViolation};
use crate::execution::host::GuestThrowable;
use crate::messages::MessageCollection;
use crate::source::ClassSource;

/// Failure taxonomy of the sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Error-severity messages were recorded while loading or validating.
    #[error("class loading failed with {} error(s)", .messages.error_count())]
    Validation { messages: MessageCollection },

    /// Reported with the original, un-namespaced name.
    #[error("class {class_name} not found{}", origin_suffix(.origin))]
    ClassNotFound {
        class_name: String,
        origin: Option<String>,
    },

    #[error(transparent)]
    ThresholdViolation(#[from] ThresholdViolation),

    #[error("{0}")]
    RuleViolation(String),

    /// The sandboxed code threw. `wrapped` is set for checked exceptions,
    /// which cannot cross the boundary as they are.
    #[error("{throwable}")]
    Guest {
        throwable: GuestThrowable,
        wrapped: bool,
    },

    #[error("sandbox infrastructure failure: {0}")]
    Infrastructure(String),
}

fn origin_suffix(origin: &Option<String>) -> String {
    match origin {
        Some(origin) => format!(" (referenced from {origin})"),
        None => String::new(),
    }
}

impl SandboxError {
    /// Errors from the internal plumbing, keeping the whole context chain.
    pub(crate) fn infrastructure(error: &anyhow::Error) -> Self {
        SandboxError::Infrastructure(format!("{error:#}"))
    }
}

/// A failed run together with what was known about it when it failed.
#[derive(Debug, Error)]
#[error("sandboxed run of {} on thread {thread_name} failed", .class_source.qualified_name)]
pub struct SandboxException {
    #[source]
    pub error: SandboxError,
    pub thread_name: String,
    pub class_source: ClassSource,
    /// Costs recorded up to the failure.
    pub costs: RuntimeCostSummary,
}
