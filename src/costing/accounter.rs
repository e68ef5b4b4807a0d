//! Entry points behind `sandbox/RuntimeCostAccounter` and the cost-related
//! parts of `sandbox/java/lang/DJVM`.
//!
//! Instrumented code calls these without a context parameter, so each one
//! looks up the context bound to the current thread. Outside a run they do
//! nothing.

use tracing::trace;

use crate::costing::{allocation_size, CostMetric};
use crate::execution::context::SandboxRuntimeContext;
use crate::execution::host::GuestThrowable;

fn record(metric: CostMetric, amount: i64) -> Result<(), GuestThrowable> {
    SandboxRuntimeContext::with_current(|context| context.accounter().record(metric, amount))
        .unwrap_or(Ok(()))
        .map_err(GuestThrowable::from)
}

/// `new` of one object of the given (sandboxed) class.
pub fn record_allocation(class_name: &str) -> Result<(), GuestThrowable> {
    record(CostMetric::Allocation, allocation_size(class_name) as i64)
}

/// Array allocation of `length` elements of `element_size` bytes each.
/// Negative lengths cost nothing; the allocation itself will fail.
pub fn record_array_allocation(length: i32, element_size: i32) -> Result<(), GuestThrowable> {
    let cost = (length.max(0) as i64).saturating_mul(element_size.max(0) as i64);
    record(CostMetric::Allocation, cost)
}

pub fn record_invocation() -> Result<(), GuestThrowable> {
    record(CostMetric::Invocation, 1)
}

pub fn record_jump() -> Result<(), GuestThrowable> {
    record(CostMetric::Jump, 1)
}

pub fn record_throw() -> Result<(), GuestThrowable> {
    record(CostMetric::Throw, 1)
}

/// Called at the entry of an exception handler with what it caught.
/// Termination errors are handed back so they keep unwinding.
pub fn check_catch(caught: &GuestThrowable) -> Result<(), GuestThrowable> {
    if caught.is_terminal() {
        trace!(class = %caught.class_name, "rethrowing termination error");
        return Err(caught.clone());
    }
    Ok(())
}

/// Called from a sandboxed `<clinit>` so the class is reset before later runs.
pub fn register_reset(class_name: &str) {
    SandboxRuntimeContext::with_current(|context| {
        context.configuration().resetter().register(class_name);
    });
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;
    use std::sync::Arc;

    use super::*;
    use crate::config::SandboxConfiguration;
    use crate::costing::{ExecutionProfile, RuntimeCostSummary};
    use crate::execution::host::ThrowableKind;

    fn run_with(profile: ExecutionProfile, task: impl FnOnce()) -> RuntimeCostSummary {
        let configuration = Arc::new(SandboxConfiguration::builder().execution_profile(profile).build());
        let context = Rc::new(SandboxRuntimeContext::new(configuration, "djvm-sandbox-test"));
        SandboxRuntimeContext::use_context(context, |context| {
            task();
            context.accounter().summary()
        })
    }

    #[test]
    fn hooks_charge_the_bound_context() {
        let costs = run_with(ExecutionProfile::UNLIMITED, || {
            record_invocation().expect("invocation");
            record_invocation().expect("invocation");
            record_allocation("sandbox/java/lang/Object").expect("allocation");
            record_array_allocation(10, 4).expect("array");
            record_jump().expect("jump");
        });

        assert_eq!(costs.invocation_cost, 2);
        assert_eq!(costs.allocation_cost, 8 + 40);
        assert_eq!(costs.jump_cost, 1);
        assert_eq!(costs.throw_cost, 0);
    }

    #[test]
    fn breach_surfaces_as_a_terminal_throwable() {
        let mut failure = None;
        let costs = run_with(ExecutionProfile::DISABLE_THROWS, || {
            failure = record_throw().err();
        });

        let failure = failure.expect("threshold breached");
        assert!(failure.is_terminal());
        assert_eq!(costs.throw_cost, 1);
        assert_eq!(check_catch(&failure), Err(failure.clone()));
    }

    #[test]
    fn hooks_outside_a_run_are_free() {
        record_jump().expect("no context");
        register_reset("sandbox/com/example/Unbound");
    }

    #[test]
    fn ordinary_catches_proceed() {
        let caught = GuestThrowable::new(
            "sandbox/java/lang/ArithmeticException",
            "/ by zero",
            ThrowableKind::RuntimeException,
        );

        assert_eq!(check_catch(&caught), Ok(()));
    }

    #[test]
    fn registration_reaches_the_shared_resetter() {
        let configuration = Arc::new(SandboxConfiguration::builder().build());
        let context = Rc::new(SandboxRuntimeContext::new(configuration.clone(), "djvm-sandbox-test"));

        SandboxRuntimeContext::use_context(context, |_| register_reset("sandbox/com/example/Counter"));

        assert_eq!(configuration.resetter().registered(), vec!["sandbox/com/example/Counter"]);
    }
}
