//! Runtime cost accounting.
//!
//! Instrumented code reports allocations, invocations, jumps and throws to
//! the accounter of the runtime context bound to the current thread. Each
//! counter has its own threshold; the first increment that takes a counter
//! past its threshold aborts the run.

use std::cell::Cell;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::opcodes;
use crate::remapper::SANDBOX_PREFIX;

pub mod accounter;

/// Cost of an object or array element whose type has no special size.
pub const DEFAULT_ALLOCATION_SIZE: i32 = 16;

/// Thresholds for the four metered costs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub allocation_cost_threshold: i64,
    pub invocation_cost_threshold: i64,
    pub jump_cost_threshold: i64,
    pub throw_cost_threshold: i64,
}

impl ExecutionProfile {
    pub const DEFAULT: ExecutionProfile = ExecutionProfile {
        allocation_cost_threshold: 1024 * 1024 * 1024,
        invocation_cost_threshold: 1_000_000,
        jump_cost_threshold: 1_000_000,
        throw_cost_threshold: 1_000_000,
    };

    pub const UNLIMITED: ExecutionProfile = ExecutionProfile {
        allocation_cost_threshold: i64::MAX,
        invocation_cost_threshold: i64::MAX,
        jump_cost_threshold: i64::MAX,
        throw_cost_threshold: i64::MAX,
    };

    pub const DISABLE_THROWS: ExecutionProfile = ExecutionProfile {
        throw_cost_threshold: 0,
        ..ExecutionProfile::DEFAULT
    };

    pub const DISABLE_BRANCHING: ExecutionProfile = ExecutionProfile {
        jump_cost_threshold: 0,
        ..ExecutionProfile::DEFAULT
    };

    /// Preset by its configuration name, e.g. `disable_branching`.
    pub fn preset(name: &str) -> Option<ExecutionProfile> {
        match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "default" => Some(Self::DEFAULT),
            "unlimited" => Some(Self::UNLIMITED),
            "disable_throws" => Some(Self::DISABLE_THROWS),
            "disable_branching" => Some(Self::DISABLE_BRANCHING),
            _ => None,
        }
    }
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Metered cost kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CostMetric {
    Allocation,
    Invocation,
    Jump,
    Throw,
}

impl CostMetric {
    fn description(self) -> &'static str {
        match self {
            CostMetric::Allocation => "allocation",
            CostMetric::Invocation => "method invocation",
            CostMetric::Jump => "use of looping",
            CostMetric::Throw => "throwing of exceptions",
        }
    }
}

impl fmt::Display for CostMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A counter went past its threshold.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ThresholdViolation {
    pub metric: CostMetric,
    pub message: String,
}

/// Costs recorded by one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCostSummary {
    pub allocation_cost: i64,
    pub invocation_cost: i64,
    pub jump_cost: i64,
    pub throw_cost: i64,
}

impl fmt::Display for RuntimeCostSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allocations={} invocations={} jumps={} throws={}",
            self.allocation_cost, self.invocation_cost, self.jump_cost, self.throw_cost
        )
    }
}

/// One thread-confined counter and its threshold.
#[derive(Debug)]
struct RuntimeCost {
    metric: CostMetric,
    threshold: i64,
    value: Cell<i64>,
}

impl RuntimeCost {
    fn new(metric: CostMetric, threshold: i64) -> Self {
        Self {
            metric,
            threshold,
            value: Cell::new(0),
        }
    }

    fn increment(&self, amount: i64, thread_name: &str) -> Result<(), ThresholdViolation> {
        // Overflow saturates, which is always past any threshold but UNLIMITED.
        let value = self.value.get().saturating_add(amount.max(0));
        self.value.set(value);
        if value > self.threshold {
            let message = format!(
                "Sandbox [{}] terminated due to excessive {}",
                thread_name, self.metric
            );
            warn!(
                thread = thread_name,
                metric = ?self.metric,
                value,
                threshold = self.threshold,
                "cost threshold breached"
            );
            return Err(ThresholdViolation {
                metric: self.metric,
                message,
            });
        }
        Ok(())
    }
}

/// Counters of one runtime context.
///
/// Not `Sync`: a context and its accounter belong to exactly one worker
/// thread.
#[derive(Debug)]
pub struct CostAccounter {
    thread_name: String,
    metered: bool,
    allocations: RuntimeCost,
    invocations: RuntimeCost,
    jumps: RuntimeCost,
    throws: RuntimeCost,
}

impl CostAccounter {
    /// Accounter for the named thread. Threads whose name starts with one
    /// of `filtered_threads` record nothing.
    pub fn new(profile: &ExecutionProfile, thread_name: &str, filtered_threads: &[String]) -> Self {
        let metered = !filtered_threads
            .iter()
            .any(|prefix| thread_name.starts_with(prefix.as_str()));
        Self {
            thread_name: thread_name.to_string(),
            metered,
            allocations: RuntimeCost::new(CostMetric::Allocation, profile.allocation_cost_threshold),
            invocations: RuntimeCost::new(CostMetric::Invocation, profile.invocation_cost_threshold),
            jumps: RuntimeCost::new(CostMetric::Jump, profile.jump_cost_threshold),
            throws: RuntimeCost::new(CostMetric::Throw, profile.throw_cost_threshold),
        }
    }

    pub fn is_metered(&self) -> bool {
        self.metered
    }

    pub fn record(&self, metric: CostMetric, amount: i64) -> Result<(), ThresholdViolation> {
        if !self.metered {
            return Ok(());
        }
        let cost = match metric {
            CostMetric::Allocation => &self.allocations,
            CostMetric::Invocation => &self.invocations,
            CostMetric::Jump => &self.jumps,
            CostMetric::Throw => &self.throws,
        };
        cost.increment(amount, &self.thread_name)
    }

    pub fn summary(&self) -> RuntimeCostSummary {
        RuntimeCostSummary {
            allocation_cost: self.allocations.value.get(),
            invocation_cost: self.invocations.value.get(),
            jump_cost: self.jumps.value.get(),
            throw_cost: self.throws.value.get(),
        }
    }
}

/// Estimated size of one object, or one element of an object array, of the
/// given (possibly sandboxed) class.
pub(crate) fn allocation_size(class_name: &str) -> i32 {
    let host_name = class_name.strip_prefix(SANDBOX_PREFIX).unwrap_or(class_name);
    match host_name {
        "java/lang/Object" => 8,
        "java/lang/StringBuilder" | "java/lang/StringBuffer" => 24,
        _ => DEFAULT_ALLOCATION_SIZE,
    }
}

/// Element width of a primitive array type code.
pub(crate) fn primitive_width(atype: u8) -> i32 {
    match atype {
        opcodes::T_BOOLEAN | opcodes::T_BYTE => 1,
        opcodes::T_CHAR | opcodes::T_SHORT => 2,
        opcodes::T_INT | opcodes::T_FLOAT => 4,
        opcodes::T_LONG | opcodes::T_DOUBLE => 8,
        _ => DEFAULT_ALLOCATION_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breach_is_reported_on_the_first_increment_past_the_threshold() {
        let accounter = CostAccounter::new(&ExecutionProfile::DISABLE_BRANCHING, "sandbox-1", &[]);

        let violation = accounter.record(CostMetric::Jump, 1).expect_err("breach");

        assert_eq!(violation.metric, CostMetric::Jump);
        assert_eq!(
            violation.message,
            "Sandbox [sandbox-1] terminated due to excessive use of looping"
        );
        assert_eq!(accounter.summary().jump_cost, 1);
        assert_eq!(accounter.summary().allocation_cost, 0);
    }

    #[test]
    fn counters_saturate_instead_of_wrapping() {
        let accounter = CostAccounter::new(&ExecutionProfile::UNLIMITED, "sandbox-1", &[]);

        accounter.record(CostMetric::Allocation, i64::MAX).expect("within limit");
        accounter.record(CostMetric::Allocation, 10).expect("saturated at the limit");

        assert_eq!(accounter.summary().allocation_cost, i64::MAX);
    }

    #[test]
    fn filtered_threads_are_not_metered() {
        let accounter = CostAccounter::new(
            &ExecutionProfile::DISABLE_THROWS,
            "djvm-control-7",
            &["djvm-control".to_string()],
        );

        accounter.record(CostMetric::Throw, 5).expect("not metered");

        assert!(!accounter.is_metered());
        assert_eq!(accounter.summary(), RuntimeCostSummary::default());
    }

    #[test]
    fn presets_resolve_by_name() {
        assert_eq!(ExecutionProfile::preset("UNLIMITED"), Some(ExecutionProfile::UNLIMITED));
        assert_eq!(
            ExecutionProfile::preset("disable-throws").map(|profile| profile.throw_cost_threshold),
            Some(0)
        );
        assert_eq!(ExecutionProfile::preset("fast"), None);
    }

    #[test]
    fn allocation_sizes_follow_the_host_class() {
        assert_eq!(allocation_size("sandbox/java/lang/Object"), 8);
        assert_eq!(allocation_size("java/lang/StringBuilder"), 24);
        assert_eq!(allocation_size("sandbox/com/example/Data"), 16);
        assert_eq!(primitive_width(opcodes::T_CHAR), 2);
        assert_eq!(primitive_width(opcodes::T_DOUBLE), 8);
    }
}
