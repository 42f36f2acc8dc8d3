//! # Configuration Module
//!
//! Centralizes the constants shared by the storage backends and the archive
//! factory. Constants that depend on each other live side by side and their
//! relationships are checked at compile time.
//!
//! ## Module Organization
//!
//! - [`constants`]: Numeric and string configuration values

pub mod constants;
pub use constants::*;
