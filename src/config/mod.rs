//! # Stratum Configuration Module
//!
//! This module centralizes all configuration constants. Constants are grouped
//! by their functional area, and values that depend on each other are
//! co-located with their relationships documented and enforced through
//! compile-time assertions.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency notes

pub mod constants;
pub use constants::*;
