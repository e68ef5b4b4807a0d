//! Running sandboxed entry points.

pub mod context;
pub mod executor;
pub mod host;
pub mod marshal;
