//! Shared helpers for the property service integration tests

// Not every test binary uses every helper
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use banter_types::cluster::ClusterPropagator;
use banter_types::config_adapter::{ConfigAdapter, PropRow};
use banter_types::error::{BtResult, Error};

/// In-memory property storage. Cloning shares the row map, so a second
/// adapter instance sees the rows of the first, like reopening a database.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigAdapter {
	rows: Arc<Mutex<HashMap<Box<str>, PropRow>>>,
}

impl MemoryConfigAdapter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn row(&self, name: &str) -> Option<PropRow> {
		self.rows.lock().get(name).cloned()
	}

	pub fn len(&self) -> usize {
		self.rows.lock().len()
	}
}

#[async_trait]
impl ConfigAdapter for MemoryConfigAdapter {
	async fn load_all(&self) -> BtResult<Vec<PropRow>> {
		Ok(self.rows.lock().values().cloned().collect())
	}

	async fn insert(&self, row: &PropRow) -> BtResult<()> {
		let mut rows = self.rows.lock();
		if rows.contains_key(&row.name) {
			return Err(Error::DbError);
		}
		rows.insert(row.name.clone(), row.clone());
		Ok(())
	}

	async fn update(&self, row: &PropRow) -> BtResult<()> {
		let mut rows = self.rows.lock();
		if !rows.contains_key(&row.name) {
			return Err(Error::NotFound);
		}
		rows.insert(row.name.clone(), row.clone());
		Ok(())
	}

	async fn delete_tree(&self, name: &str) -> BtResult<()> {
		let prefix = format!("{}.", name);
		self.rows.lock().retain(|key, _| key.as_ref() != name && !key.starts_with(&prefix));
		Ok(())
	}
}

/// Counts outgoing cluster notifications.
#[derive(Debug, Default)]
pub struct CountingPropagator {
	pub sets: AtomicUsize,
	pub deletes: AtomicUsize,
}

impl CountingPropagator {
	pub fn set_count(&self) -> usize {
		self.sets.load(Ordering::SeqCst)
	}

	pub fn delete_count(&self) -> usize {
		self.deletes.load(Ordering::SeqCst)
	}
}

impl ClusterPropagator for CountingPropagator {
	fn property_set(&self, _name: &str, _value: &str, _encrypted: bool) {
		self.sets.fetch_add(1, Ordering::SeqCst);
	}

	fn property_deleted(&self, _name: &str) {
		self.deletes.fetch_add(1, Ordering::SeqCst);
	}
}

// vim: ts=4
