//! HTTP endpoint modules.

pub mod metrics;
pub mod status;
