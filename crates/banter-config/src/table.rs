//! Database-backed property table
//!
//! The table keeps every property in memory in plaintext, so reads never
//! touch the database or the cipher layer. Mutations run under a single
//! async critical section that covers the row write, the memory update and
//! the encrypted-flag bookkeeping, then publish a change event and notify
//! cluster peers.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use banter_types::cluster::ClusterPropagator;
use banter_types::config_adapter::{ConfigAdapter, PropRow};

use crate::bootstrap::BootstrapStore;
use crate::bus::{ConfigEventBus, ConfigEventKind};
use crate::keyring::Keyring;
use crate::prelude::*;

pub struct PropertyTable {
	adapter: Arc<dyn ConfigAdapter>,
	keyring: Arc<Keyring>,
	bootstrap: Arc<BootstrapStore>,
	bus: ConfigEventBus,
	/// Plaintext values, mirroring the database row set exactly
	cache: RwLock<HashMap<Box<str>, Box<str>>>,
	/// Names whose stored row is encrypted
	encrypted: RwLock<HashSet<Box<str>>>,
	cluster: RwLock<Option<Arc<dyn ClusterPropagator>>>,
	/// Serializes mutations; reads are lock-free apart from the cache lock
	write_lock: Mutex<()>,
}

impl PropertyTable {
	/// Create the table and load every stored row into memory.
	pub async fn load(
		adapter: Arc<dyn ConfigAdapter>,
		keyring: Arc<Keyring>,
		bootstrap: Arc<BootstrapStore>,
		bus: ConfigEventBus,
	) -> BtResult<Self> {
		let rows = adapter.load_all().await?;
		let mut cache = HashMap::with_capacity(rows.len());
		let mut encrypted = HashSet::new();

		for row in rows {
			if row.encrypted || keyring.is_encrypted_name(&row.name) {
				encrypted.insert(row.name.clone());
			}
			if row.encrypted {
				let Some(iv) = &row.iv else {
					error!("Encrypted property '{}' has no IV, dropping value", row.name);
					continue;
				};
				match keyring.active().decrypt(iv, &row.value) {
					Ok(plain) => {
						cache.insert(row.name, plain);
					}
					Err(_) => {
						error!("Failed to decrypt property '{}', dropping value", row.name);
					}
				}
			} else {
				cache.insert(row.name, row.value);
			}
		}
		debug!("Loaded {} properties from storage", cache.len());

		Ok(Self {
			adapter,
			keyring,
			bootstrap,
			bus,
			cache: RwLock::new(cache),
			encrypted: RwLock::new(encrypted),
			cluster: RwLock::new(None),
			write_lock: Mutex::new(()),
		})
	}

	pub fn set_cluster_propagator(&self, propagator: Arc<dyn ClusterPropagator>) {
		*self.cluster.write() = Some(propagator);
	}

	pub fn get(&self, name: &str) -> Option<Box<str>> {
		self.cache.read().get(name).cloned()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.cache.read().contains_key(name)
	}

	pub fn property_names(&self) -> Vec<Box<str>> {
		self.cache.read().keys().cloned().collect()
	}

	/// Full names of the immediate children of `parent`: for stored names
	/// `x.y.a`, `x.y.b` and `x.y.b.c`, the children of `x.y` are `x.y.a`
	/// and `x.y.b`.
	pub fn children_names(&self, parent: &str) -> Vec<Box<str>> {
		let prefix = format!("{}.", parent);
		let mut seen = HashSet::new();
		let mut result = Vec::new();
		for name in self.cache.read().keys() {
			if let Some(rest) = name.strip_prefix(&prefix) {
				let first = rest.split('.').next().unwrap_or(rest);
				if seen.insert(first.to_string()) {
					result.push(format!("{}{}", prefix, first).into());
				}
			}
		}
		result
	}

	/// Whether the stored row is encrypted or the name is registered for
	/// encryption
	pub fn is_encrypted(&self, name: &str) -> bool {
		self.encrypted.read().contains(name) || self.keyring.is_encrypted_name(name)
	}

	/// Create or update a property.
	pub async fn put(&self, name: &str, value: &str, encrypt: bool) -> BtResult<()> {
		self.put_inner(name, value, encrypt, true).await
	}

	/// Like [`PropertyTable::put`], but without a local change event.
	/// Used for the children of list properties, which get one event for
	/// the parent instead.
	pub(crate) async fn put_quiet(&self, name: &str, value: &str, encrypt: bool) -> BtResult<()> {
		self.put_inner(name, value, encrypt, false).await
	}

	async fn put_inner(
		&self,
		name: &str,
		value: &str,
		encrypt: bool,
		notify_local: bool,
	) -> BtResult<()> {
		let _guard = self.write_lock.lock().await;

		let encrypted = encrypt || self.is_encrypted(name);
		let row = self.build_row(name, value, encrypted);
		let exists = self.contains(name);
		if exists {
			self.adapter.update(&row).await?;
		} else {
			self.adapter.insert(&row).await?;
		}
		self.cache.write().insert(name.into(), value.into());
		if encrypted {
			self.encrypted.write().insert(name.into());
		}
		self.clear_stale_registry_entry(name);
		drop(_guard);

		if notify_local {
			// Values of encrypted properties stay out of the event stream
			let event_value = if encrypted { None } else { Some(value) };
			self.bus.publish(name, ConfigEventKind::PropertySet, event_value);
		}
		if let Some(cluster) = self.cluster.read().as_ref() {
			cluster.property_set(name, value, encrypted);
		}
		Ok(())
	}

	/// The encrypted-name registry covers bootstrap-resident keys. Once the
	/// bootstrap file no longer holds a name, its registry entry is stale:
	/// the stored row carries its own flag. Runs inside the mutation
	/// critical section.
	fn clear_stale_registry_entry(&self, name: &str) {
		if self.keyring.is_encrypted_name(name) && self.bootstrap.get(name).is_none() {
			self.keyring.set_encrypted_name(name, false);
		}
	}

	fn build_row(&self, name: &str, value: &str, encrypted: bool) -> PropRow {
		if encrypted {
			let (iv, ciphertext) = self.keyring.write_strategy().encrypt(value);
			PropRow { name: name.into(), value: ciphertext, encrypted: true, iv: Some(iv) }
		} else {
			PropRow { name: name.into(), value: value.into(), encrypted: false, iv: None }
		}
	}

	/// Delete a property and all of its descendants.
	pub async fn delete(&self, name: &str) -> BtResult<()> {
		self.delete_inner(name, true).await
	}

	/// Like [`PropertyTable::delete`], but without a local change event.
	/// Used when replacing a list property, which gets one event for the
	/// parent after the new children are in place.
	pub(crate) async fn delete_quiet(&self, name: &str) -> BtResult<()> {
		self.delete_inner(name, false).await
	}

	async fn delete_inner(&self, name: &str, notify_local: bool) -> BtResult<()> {
		let _guard = self.write_lock.lock().await;

		self.adapter.delete_tree(name).await?;
		let prefix = format!("{}.", name);
		{
			let mut cache = self.cache.write();
			cache.remove(name);
			cache.retain(|key, _| !key.starts_with(&prefix));
		}
		{
			let mut encrypted = self.encrypted.write();
			encrypted.remove(name);
			encrypted.retain(|key| !key.starts_with(&prefix));
		}
		self.clear_stale_registry_entry(name);
		drop(_guard);

		if notify_local {
			self.bus.publish(name, ConfigEventKind::PropertyDeleted, None);
		}
		if let Some(cluster) = self.cluster.read().as_ref() {
			cluster.property_deleted(name);
		}
		Ok(())
	}

	/// Change the stored encryption state of an existing property,
	/// re-writing its row. Without a stored row, the intent is remembered
	/// in the encrypted-name registry instead.
	pub async fn set_encrypted(&self, name: &str, encrypt: bool) -> BtResult<()> {
		let Some(value) = self.get(name) else {
			self.keyring.set_encrypted_name(name, encrypt);
			return Ok(());
		};

		let _guard = self.write_lock.lock().await;
		let row = self.build_row(name, &value, encrypt);
		self.adapter.update(&row).await?;
		let mut encrypted = self.encrypted.write();
		if encrypt {
			encrypted.insert(name.into());
		} else {
			encrypted.remove(name);
		}
		Ok(())
	}

	/// Apply a property change received from a cluster peer: the peer
	/// already committed the row, so only memory and local events change.
	pub fn apply_peer_set(&self, name: &str, value: &str, encrypted: bool) {
		self.cache.write().insert(name.into(), value.into());
		if encrypted {
			self.encrypted.write().insert(name.into());
		}
		let event_value = if encrypted { None } else { Some(value) };
		self.bus.publish(name, ConfigEventKind::PropertySet, event_value);
	}

	/// Apply a property deletion received from a cluster peer.
	pub fn apply_peer_delete(&self, name: &str) {
		let prefix = format!("{}.", name);
		{
			let mut cache = self.cache.write();
			cache.remove(name);
			cache.retain(|key, _| !key.starts_with(&prefix));
		}
		{
			let mut encrypted = self.encrypted.write();
			encrypted.remove(name);
			encrypted.retain(|key| !key.starts_with(&prefix));
		}
		self.bus.publish(name, ConfigEventKind::PropertyDeleted, None);
	}

	/// Re-write every encrypted row with the current write strategy.
	/// Called during key or algorithm rotation; each row gets a fresh IV.
	pub async fn reencrypt_all(&self) -> BtResult<()> {
		let names: Vec<Box<str>> = self
			.cache
			.read()
			.keys()
			.filter(|name| self.encrypted.read().contains(*name))
			.cloned()
			.collect();
		for name in names {
			if let Some(value) = self.get(&name) {
				info!("Updating encrypted value for {}", name);
				self.put_quiet(&name, &value, true).await?;
			}
		}
		Ok(())
	}
}

impl std::fmt::Debug for PropertyTable {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PropertyTable")
			.field("properties", &self.cache.read().len())
			.finish_non_exhaustive()
	}
}

// vim: ts=4
