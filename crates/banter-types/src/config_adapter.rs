//! Persistent property row storage
//!
//! The property table keeps its full state in memory; the adapter is only
//! responsible for durably storing rows and replaying them at startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::prelude::*;

/// A single persisted property row.
///
/// For encrypted rows `value` holds the base64 ciphertext and `iv` the
/// base64 of the 16 byte initialization vector. Plaintext rows carry no IV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropRow {
	pub name: Box<str>,
	pub value: Box<str>,
	pub encrypted: bool,
	pub iv: Option<Box<str>>,
}

/// Storage backend for the database-backed property table
#[async_trait]
pub trait ConfigAdapter: Send + Sync + Debug {
	/// Load every stored row. Called once when the table is attached.
	async fn load_all(&self) -> BtResult<Vec<PropRow>>;

	/// Insert a new row. The name must not exist yet.
	async fn insert(&self, row: &PropRow) -> BtResult<()>;

	/// Overwrite an existing row.
	async fn update(&self, row: &PropRow) -> BtResult<()>;

	/// Delete a row and all of its descendants (`name` itself plus every
	/// row starting with `name` followed by a dot).
	async fn delete_tree(&self, name: &str) -> BtResult<()>;
}

// vim: ts=4
