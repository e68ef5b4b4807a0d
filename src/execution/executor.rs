//! Running an entry point in isolation.
//!
//! Each run optionally validates the class graph, then moves to a worker
//! thread of its own. The worker binds a fresh runtime context, replays the
//! registered static resets, loads the entry class and applies it to the
//! input. The caller blocks until the worker is done. Dropping the context
//! at the end of the worker tears down its class loader, whatever the
//! outcome was.

use std::rc::Rc;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::analysis;
use crate::config::SandboxConfiguration;
use crate::costing::RuntimeCostSummary;
use crate::error::{SandboxError, SandboxException};
use crate::execution::context::SandboxRuntimeContext;
use crate::execution::host::{GuestThrowable, GuestValue, HostRuntime, ThrowableKind, RULE_VIOLATION_ERROR};
use crate::execution::marshal::{self, Value};
use crate::loader::LoadedClass;
use crate::source::ClassSource;

const FUNCTION: &str = "java/util/function/Function";
const WORKER_PREFIX: &str = "djvm-sandbox-";

static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);

/// Outcome of a successful run.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionSummary<T> {
    pub result: T,
    pub costs: RuntimeCostSummary,
    pub thread_name: String,
}

pub struct SandboxExecutor<R: HostRuntime + 'static> {
    configuration: Arc<SandboxConfiguration>,
    runtime: Arc<R>,
}

impl<R: HostRuntime + 'static> SandboxExecutor<R> {
    pub fn new(configuration: Arc<SandboxConfiguration>, runtime: Arc<R>) -> Self {
        Self {
            configuration,
            runtime,
        }
    }

    pub fn configuration(&self) -> &Arc<SandboxConfiguration> {
        &self.configuration
    }

    /// Run with host values, converting them at the boundary.
    pub fn run(
        &self,
        class_source: &ClassSource,
        input: Value,
    ) -> Result<ExecutionSummary<Value>, SandboxException> {
        let input = marshal::to_guest(input).map_err(|error| {
            caller_failure(class_source, SandboxError::infrastructure(&error))
        })?;
        let summary = self.execute(class_source, input)?;
        let result = marshal::from_guest(summary.result).map_err(|error| SandboxException {
            error: SandboxError::infrastructure(&error),
            thread_name: summary.thread_name.clone(),
            class_source: class_source.clone(),
            costs: summary.costs,
        })?;
        Ok(ExecutionSummary {
            result,
            costs: summary.costs,
            thread_name: summary.thread_name,
        })
    }

    /// Run with values that already live in the sandbox.
    pub fn run_raw(
        &self,
        class_source: &ClassSource,
        input: GuestValue,
    ) -> Result<ExecutionSummary<GuestValue>, SandboxException> {
        marshal::require_sandbox_native(&input).map_err(|error| {
            caller_failure(class_source, SandboxError::infrastructure(&error))
        })?;
        self.execute(class_source, input)
    }

    fn execute(
        &self,
        class_source: &ClassSource,
        input: GuestValue,
    ) -> Result<ExecutionSummary<GuestValue>, SandboxException> {
        if self.configuration.validate {
            analysis::validate(&self.configuration, slice::from_ref(class_source))
                .map_err(|error| caller_failure(class_source, error))?;
        }

        let thread_name = format!("{}{}", WORKER_PREFIX, NEXT_WORKER.fetch_add(1, Ordering::Relaxed));
        let configuration = self.configuration.clone();
        let runtime = self.runtime.clone();
        let source = class_source.clone();
        let worker_name = thread_name.clone();
        let worker = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_in_context(configuration, runtime.as_ref(), &source, &worker_name, input))
            .map_err(|error| {
                caller_failure(
                    class_source,
                    SandboxError::Infrastructure(format!("failed to start sandbox worker: {error}")),
                )
            })?;
        let (outcome, costs) = match worker.join() {
            Ok(finished) => finished,
            Err(_) => {
                warn!(thread = %thread_name, "sandbox worker panicked");
                (
                    Err(SandboxError::Infrastructure("sandbox worker panicked".to_string())),
                    RuntimeCostSummary::default(),
                )
            }
        };
        match outcome {
            Ok(result) => Ok(ExecutionSummary {
                result,
                costs,
                thread_name,
            }),
            Err(error) => Err(SandboxException {
                error,
                thread_name,
                class_source: class_source.clone(),
                costs,
            }),
        }
    }
}

fn caller_failure(class_source: &ClassSource, error: SandboxError) -> SandboxException {
    SandboxException {
        error,
        thread_name: thread::current().name().unwrap_or("unnamed").to_string(),
        class_source: class_source.clone(),
        costs: RuntimeCostSummary::default(),
    }
}

fn run_in_context<R: HostRuntime + ?Sized>(
    configuration: Arc<SandboxConfiguration>,
    runtime: &R,
    source: &ClassSource,
    thread_name: &str,
    input: GuestValue,
) -> (Result<GuestValue, SandboxError>, RuntimeCostSummary) {
    let context = Rc::new(SandboxRuntimeContext::new(configuration, thread_name));
    SandboxRuntimeContext::use_context(context, |context| {
        let outcome = apply_entry(context, runtime, source, input);
        let costs = context.accounter().summary();
        match &outcome {
            Ok(_) => info!(thread = thread_name, class = %source.qualified_name, %costs, "run completed"),
            Err(error) => info!(thread = thread_name, class = %source.qualified_name, %costs, %error, "run failed"),
        }
        (outcome, costs)
    })
}

fn apply_entry<R: HostRuntime + ?Sized>(
    context: &SandboxRuntimeContext,
    runtime: &R,
    source: &ClassSource,
    input: GuestValue,
) -> Result<GuestValue, SandboxError> {
    for class_name in context.configuration().resetter().registered() {
        debug!(class = %class_name, "resetting static state");
        runtime
            .reset_class(context, &class_name)
            .map_err(guest_failure)?;
    }
    let entry = context.class_loader().load_class(source)?;
    require_function(context, &entry)?;
    runtime
        .apply(context, &entry, input)
        .map_err(guest_failure)
}

fn require_function(context: &SandboxRuntimeContext, entry: &LoadedClass) -> Result<(), SandboxError> {
    let supertypes = context
        .configuration()
        .analysis
        .hierarchy
        .supertypes(entry.host_name())
        .map_err(|error| SandboxError::infrastructure(&error))?;
    if supertypes.iter().any(|name| name == FUNCTION) {
        return Ok(());
    }
    Err(SandboxError::Guest {
        throwable: GuestThrowable::new(
            "sandbox/java/lang/ClassCastException",
            format!(
                "{} cannot be cast to {}",
                entry.host_name().replace('/', "."),
                FUNCTION.replace('/', ".")
            ),
            ThrowableKind::RuntimeException,
        ),
        wrapped: false,
    })
}

/// Sort what the guest threw into the failure taxonomy.
fn guest_failure(throwable: GuestThrowable) -> SandboxError {
    if let Some(violation) = throwable.violation {
        return SandboxError::ThresholdViolation(violation);
    }
    if throwable.class_name == RULE_VIOLATION_ERROR {
        return SandboxError::RuleViolation(throwable.message);
    }
    let wrapped = throwable.kind == ThrowableKind::Checked;
    SandboxError::Guest { throwable, wrapped }
}
