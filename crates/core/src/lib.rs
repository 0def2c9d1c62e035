#![deny(unused)]
//! Core types, error taxonomy, and configuration for Skiff.
//!
//! This crate holds everything the sandbox adapter shares across its
//! components: the error categories and the classifier that assigns them,
//! the per-operation failure policy, result and option types, adapter
//! configuration, and tracing setup.

pub mod classify;
pub mod config;
pub mod error;
pub mod policy;
pub mod telemetry;
pub mod types;

pub use error::{Error, ErrorCategory, Result};
pub use types::*;
