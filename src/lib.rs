#![allow(clippy::derive_partial_eq_without_eq)]

pub mod analyzer;
pub mod arch;
pub mod binary;
pub mod host;
pub mod report;
pub mod resolve;
pub mod syms;
pub mod tracer;
