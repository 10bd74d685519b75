//! Configuration and secrets subsystem for the Banter platform.
//!
//! Properties live in two stores: a small XML bootstrap file that is
//! available before any database connection exists, and a database-backed
//! property table that holds everything else. Both stores can transparently
//! encrypt individual values; the encryption key and algorithm can be
//! rotated from the security file without losing data.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod bootstrap;
pub mod bus;
pub mod crypto;
pub mod facade;
pub mod keyring;
pub mod prelude;
pub mod registry;
pub mod table;

// Re-export commonly used types
pub use bus::{ConfigEvent, ConfigEventBus, ConfigEventKind};
pub use crypto::{CipherAlgorithm, CipherStrategy};
pub use facade::{ConfigService, MigrationPlan};
pub use registry::{
	DurationUnit, PropKind, PropValue, PropertyDefinition, PropertyDefinitionBuilder,
	PropertyRegistry, RegisteredProp,
};

// vim: ts=4
