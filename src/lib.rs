//! Deterministic sandbox for JVM byte code.
//!
//! Classes are validated against a rule set, rewritten into the `sandbox/`
//! namespace with cost accounting woven in, cached, and finally run in an
//! isolated per-thread context.

pub mod analysis;
pub mod cache;
pub(crate) mod classfile;
pub mod config;
pub mod costing;
pub mod descriptor;
pub mod emitters;
pub mod error;
pub mod execution;
pub mod header;
pub(crate) mod instruction;
pub mod ir;
pub mod loader;
pub mod messages;
pub(crate) mod opcodes;
pub mod providers;
pub mod references;
pub mod remapper;
pub mod report;
pub mod rewriter;
pub mod rules;
pub mod source;

pub use crate::config::{SandboxConfiguration, SandboxSettings};
pub use crate::error::{SandboxError, SandboxException};
pub use crate::execution::executor::{ExecutionSummary, SandboxExecutor};
pub use crate::source::{ClassSource, SourceSet};
