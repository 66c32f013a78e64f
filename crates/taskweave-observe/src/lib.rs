//! Tracing setup shared by the taskweave binaries.

pub mod tracing_setup;
