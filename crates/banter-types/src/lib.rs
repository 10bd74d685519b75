//! Shared types, adapter traits, and core utilities for the Banter platform.
//!
//! This crate contains the foundational types that are shared between the
//! configuration subsystem and all adapter implementations. Extracting these
//! into a separate crate allows adapter crates to compile in parallel with
//! the feature crates.

pub mod cluster;
pub mod config_adapter;
pub mod error;
pub mod prelude;

// vim: ts=4
