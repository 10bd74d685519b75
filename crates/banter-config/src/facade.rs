//! Property service facade
//!
//! One long-lived [`ConfigService`] instance owns both property stores and
//! the key coordination between them. The bootstrap file and the security
//! file open lazily on first use; the database-backed table exists only
//! after [`ConfigService::attach_database`] has been called. Until then
//! database-backed reads fall back to defaults and writes are logged
//! no-ops (setup mode).

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use banter_types::cluster::ClusterPropagator;
use banter_types::config_adapter::ConfigAdapter;

use crate::bootstrap::{BootstrapProps, BootstrapStore};
use crate::bus::ConfigEventBus;
use crate::crypto::CipherAlgorithm;
use crate::keyring::Keyring;
use crate::prelude::*;
use crate::table::PropertyTable;

const DEFAULT_CONFIG_NAME: &str = "banter.xml";
const SECURITY_CONFIG_NAME: &str = "security.xml";

/// What to do with a bootstrap property that may also exist in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPlan {
	/// Only the bootstrap file holds a value: move it into the table
	Move,
	/// Both stores hold the same value: drop the bootstrap copy
	DeleteDuplicate,
	/// The stores disagree: keep both and warn
	Conflict,
	/// The bootstrap file holds no value
	NoOp,
}

/// Decide how to migrate a bootstrap value into the table.
pub fn plan_migration(xml_value: Option<&str>, db_value: Option<&str>) -> MigrationPlan {
	match (xml_value, db_value) {
		(None, _) => MigrationPlan::NoOp,
		(Some(_), None) => MigrationPlan::Move,
		(Some(xml), Some(db)) if xml == db => MigrationPlan::DeleteDuplicate,
		_ => MigrationPlan::Conflict,
	}
}

/// Normalize a property key: trim whitespace and strip trailing dots.
fn normalize_key(name: &str) -> Box<str> {
	let mut key = name.trim();
	while let Some(stripped) = key.strip_suffix('.') {
		key = stripped;
	}
	if key != name {
		warn!("Property name '{}' normalized to '{}'", name, key);
	}
	key.into()
}

pub struct ConfigService {
	home: PathBuf,
	config_name: Box<str>,
	bus: ConfigEventBus,
	keyring: OnceLock<Arc<Keyring>>,
	bootstrap: OnceLock<Arc<BootstrapStore>>,
	table: OnceLock<Arc<PropertyTable>>,
	cluster: RwLock<Option<Arc<dyn ClusterPropagator>>>,
}

impl ConfigService {
	/// Create a service rooted at `home`. Property files live under
	/// `home/conf/`; nothing is opened until first use.
	pub fn new(home: impl Into<PathBuf>) -> Self {
		Self::with_config_name(home, DEFAULT_CONFIG_NAME)
	}

	/// Like [`ConfigService::new`] with an overridden bootstrap file name.
	pub fn with_config_name(home: impl Into<PathBuf>, config_name: &str) -> Self {
		Self {
			home: home.into(),
			config_name: config_name.into(),
			bus: ConfigEventBus::default(),
			keyring: OnceLock::new(),
			bootstrap: OnceLock::new(),
			table: OnceLock::new(),
			cluster: RwLock::new(None),
		}
	}

	pub fn bus(&self) -> &ConfigEventBus {
		&self.bus
	}

	fn keyring(&self) -> &Arc<Keyring> {
		self.keyring.get_or_init(|| {
			let path = self.home.join("conf").join(SECURITY_CONFIG_NAME);
			let props = match BootstrapProps::open(&path, "security") {
				Ok(props) => props,
				Err(err) => {
					error!(
						"Unable to open security file {}: {}; encryption settings will not persist",
						path.display(),
						err
					);
					BootstrapProps::in_memory("security")
				}
			};
			Arc::new(Keyring::new(props))
		})
	}

	/// The bootstrap property store, opened on first use. If the file
	/// cannot be opened the server keeps running on an in-memory instance.
	pub fn bootstrap(&self) -> &Arc<BootstrapStore> {
		self.bootstrap.get_or_init(|| {
			let keyring = self.keyring().clone();
			let path = self.home.join("conf").join(self.config_name.as_ref());
			let props = match BootstrapProps::open(&path, "banter") {
				Ok(props) => props,
				Err(err) => {
					error!(
						"Unable to open bootstrap file {}: {}; configuration will not persist",
						path.display(),
						err
					);
					BootstrapProps::in_memory("banter")
				}
			};
			Arc::new(BootstrapStore::new(props, keyring, self.bus.clone()))
		})
	}

	fn table(&self) -> Option<&Arc<PropertyTable>> {
		self.table.get()
	}

	/// Whether the database-backed table is not attached yet
	pub fn is_setup_mode(&self) -> bool {
		self.table.get().is_none()
	}

	/// Attach the database adapter: load the table, finish any staged key
	/// rotation, and migrate secrets found in the security file.
	pub async fn attach_database(&self, adapter: Arc<dyn ConfigAdapter>) -> BtResult<()> {
		let keyring = self.keyring().clone();
		let bootstrap = self.bootstrap().clone();
		let table = Arc::new(
			PropertyTable::load(adapter, keyring.clone(), bootstrap, self.bus.clone()).await?,
		);
		if let Some(propagator) = self.cluster.read().clone() {
			table.set_cluster_propagator(propagator);
		}
		self.table
			.set(table)
			.map_err(|_| Error::ConfigError("Database adapter is already attached".into()))?;

		self.run_rotation().await?;
		self.migrate_security_properties().await?;
		Ok(())
	}

	// Database-backed properties
	//****************************

	pub fn get(&self, name: &str) -> Option<Box<str>> {
		match self.table() {
			Some(table) => table.get(name),
			None => {
				debug!("Property '{}' requested in setup mode", name);
				None
			}
		}
	}

	pub fn get_or(&self, name: &str, default: &str) -> Box<str> {
		self.get(name).unwrap_or_else(|| default.into())
	}

	/// Integer property; a missing or malformed value yields the default.
	pub fn get_int(&self, name: &str, default: i32) -> i32 {
		self.get(name).and_then(|v| v.parse().ok()).unwrap_or(default)
	}

	pub fn get_long(&self, name: &str, default: i64) -> i64 {
		self.get(name).and_then(|v| v.parse().ok()).unwrap_or(default)
	}

	pub fn get_double(&self, name: &str, default: f64) -> f64 {
		self.get(name).and_then(|v| v.parse().ok()).unwrap_or(default)
	}

	/// Boolean property: only the exact value `true` is true.
	pub fn get_bool(&self, name: &str, default: bool) -> bool {
		match self.get(name) {
			Some(v) => v.as_ref() == "true",
			None => default,
		}
	}

	/// Parse a property into any `FromStr` type, with a default for
	/// missing or unparsable values.
	pub fn get_enum<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
		self.get(name).and_then(|v| v.parse().ok()).unwrap_or(default)
	}

	/// List property: ordered child values (`name.00001`, `name.00002`, ...).
	///
	/// An empty child set with a comma-separated value in the parent is
	/// read in the legacy format. A single empty child denotes an
	/// explicitly empty list, which overrides the defaults.
	pub fn get_list(&self, parent: &str) -> Vec<Box<str>> {
		self.get_list_or(parent, &[])
	}

	pub fn get_list_or(&self, parent: &str, defaults: &[&str]) -> Vec<Box<str>> {
		let Some(table) = self.table() else {
			return defaults.iter().map(|v| Box::from(*v)).collect();
		};

		let legacy = table.get(parent);
		let mut children = table.children_names(parent);
		children.sort();

		if children.is_empty() {
			if let Some(legacy) = legacy {
				info!(
					"Retrieving a list from property '{}' which is stored in a comma-separated format. Consider using child properties instead.",
					parent
				);
				return legacy.split(',').map(|v| v.trim().into()).collect();
			}
			return defaults.iter().map(|v| Box::from(*v)).collect();
		}
		if legacy.is_some() {
			warn!(
				"Retrieving a list from property '{}' which is stored using child properties, but also in a legacy format! The legacy value is ignored.",
				parent
			);
		}

		children
			.iter()
			.filter_map(|child| table.get(child))
			.filter(|value| !value.is_empty())
			.collect()
	}

	pub async fn set(&self, name: &str, value: &str) -> BtResult<()> {
		self.set_with_encryption(name, value, false).await
	}

	/// Set a property, optionally forcing it to be stored encrypted.
	/// Once encrypted, a property stays encrypted.
	pub async fn set_with_encryption(&self, name: &str, value: &str, encrypt: bool) -> BtResult<()> {
		let name = normalize_key(name);
		match self.table() {
			Some(table) => table.put(&name, value, encrypt).await,
			None => {
				warn!("Ignoring write to property '{}' in setup mode", name);
				Ok(())
			}
		}
	}

	/// Replace a list property. Values are stored as `name.00001`,
	/// `name.00002`, ... in order; empty values are skipped. An empty list
	/// is stored as a single empty child so it overrides defaults. The
	/// children are written without local events; one event fires for the
	/// parent.
	pub async fn set_list(&self, name: &str, values: &[Box<str>]) -> BtResult<()> {
		let name = normalize_key(name);
		let Some(table) = self.table() else {
			warn!("Ignoring write to property '{}' in setup mode", name);
			return Ok(());
		};

		let existing = self.get_list(&name);
		if existing == values {
			return Ok(());
		}

		table.delete_quiet(&name).await?;
		let mut index = 1;
		for value in values {
			if !value.is_empty() {
				let child = format!("{}.{:05}", name, index);
				index += 1;
				table.put_quiet(&child, value, false).await?;
			}
		}
		if index == 1 {
			table.put_quiet(&format!("{}.00001", name), "", false).await?;
		}
		self.bus.publish(&name, crate::bus::ConfigEventKind::PropertySet, None);
		Ok(())
	}

	/// Delete a property and its descendants. Also drops the name from
	/// the encrypted-name registry unless the bootstrap file still holds
	/// an encrypted value for it.
	pub async fn delete(&self, name: &str) -> BtResult<()> {
		let name = normalize_key(name);
		let Some(table) = self.table() else {
			warn!("Ignoring delete of property '{}' in setup mode", name);
			return Ok(());
		};
		table.delete(&name).await
	}

	pub fn property_names(&self) -> Vec<Box<str>> {
		self.table().map(|t| t.property_names()).unwrap_or_default()
	}

	pub fn children_names(&self, parent: &str) -> Vec<Box<str>> {
		self.table().map(|t| t.children_names(parent)).unwrap_or_default()
	}

	// Encryption management
	//***********************

	pub fn is_property_encrypted(&self, name: &str) -> bool {
		match self.table() {
			Some(table) => table.is_encrypted(name),
			None => self.keyring().is_encrypted_name(name),
		}
	}

	/// Mark a property for encrypted storage (or clear the mark),
	/// re-writing its stored row to match.
	pub async fn set_property_encrypted(&self, name: &str, encrypt: bool) -> BtResult<()> {
		let name = normalize_key(name);
		match self.table() {
			Some(table) => {
				table.set_encrypted(&name, encrypt).await?;
				if !encrypt {
					self.keyring().set_encrypted_name(&name, false);
				} else if self.bootstrap().get(&name).is_some() {
					self.keyring().set_encrypted_name(&name, true);
				}
				Ok(())
			}
			None => {
				self.keyring().set_encrypted_name(&name, encrypt);
				Ok(())
			}
		}
	}

	/// Change the property encryption key: every encrypted value in both
	/// stores is re-written under the new key, then the new key becomes
	/// current.
	pub async fn set_encryption_key(&self, material: &str) -> BtResult<()> {
		self.keyring().request_key(material);
		self.run_rotation().await
	}

	/// Change the property encryption algorithm, keeping the current key.
	pub async fn set_encryption_algorithm(&self, algorithm: CipherAlgorithm) -> BtResult<()> {
		self.keyring().request_algorithm(algorithm);
		self.run_rotation().await
	}

	/// Re-encrypt both stores with the pending strategy and promote it.
	///
	/// The pass holds no store-wide lock: a concurrent plaintext write to
	/// an already-visited property simply gets encrypted with the pending
	/// strategy directly, which is the desired end state anyway.
	async fn run_rotation(&self) -> BtResult<()> {
		let keyring = self.keyring().clone();
		if !keyring.has_pending() {
			return Ok(());
		}
		keyring.begin_rotation_pass();
		if let Some(table) = self.table() {
			if let Err(err) = table.reencrypt_all().await {
				keyring.end_rotation_pass();
				return Err(err);
			}
		}
		self.bootstrap().reencrypt_registered();
		keyring.promote_pending();
		keyring.end_rotation_pass();
		Ok(())
	}

	/// Names containing password-like markers should never be displayed.
	pub fn is_sensitive(name: &str) -> bool {
		let lower = name.to_lowercase();
		lower.contains("passwd") || lower.contains("password") || lower.contains("cookiekey")
	}

	// Bootstrap file properties
	//***************************

	pub fn get_xml(&self, name: &str) -> Option<Box<str>> {
		self.bootstrap().get(name)
	}

	pub fn get_xml_or(&self, name: &str, default: &str) -> Box<str> {
		self.get_xml(name).unwrap_or_else(|| default.into())
	}

	pub fn get_xml_int(&self, name: &str, default: i32) -> i32 {
		self.get_xml(name).and_then(|v| v.parse().ok()).unwrap_or(default)
	}

	pub fn get_xml_bool(&self, name: &str, default: bool) -> bool {
		match self.get_xml(name) {
			Some(v) => v.as_ref() == "true",
			None => default,
		}
	}

	pub fn set_xml(&self, name: &str, value: &str) -> bool {
		self.bootstrap().set(&normalize_key(name), value)
	}

	/// Set a bootstrap property that must be stored encrypted. The name
	/// is registered first so the write already encrypts.
	pub fn set_xml_encrypted(&self, name: &str, value: &str) -> bool {
		let name = normalize_key(name);
		self.keyring().set_encrypted_name(&name, true);
		self.bootstrap().set(&name, value)
	}

	/// Set several bootstrap properties at once.
	pub fn set_xml_properties(&self, properties: &[(&str, &str)]) -> bool {
		let mut saved = true;
		for (name, value) in properties {
			saved &= self.set_xml(name, value);
		}
		saved
	}

	pub fn delete_xml(&self, name: &str) {
		self.bootstrap().delete(&normalize_key(name));
	}

	pub fn xml_property_names(&self) -> Vec<Box<str>> {
		self.bootstrap().all_names()
	}

	// Migration
	//***********

	/// Move a bootstrap property into the table, unless the table already
	/// disagrees about its value.
	pub async fn migrate(&self, name: &str) -> BtResult<()> {
		let name = normalize_key(name);
		let Some(table) = self.table() else {
			warn!("Ignoring migration of property '{}' in setup mode", name);
			return Ok(());
		};

		let xml_value = self.bootstrap().get(&name);
		let db_value = table.get(&name);
		match plan_migration(xml_value.as_deref(), db_value.as_deref()) {
			MigrationPlan::NoOp => Ok(()),
			MigrationPlan::Move => {
				debug!("Migrating bootstrap property '{}' into the database", name);
				let encrypted = self.keyring().is_encrypted_name(&name);
				if let Some(value) = xml_value {
					// Put first, so the row carries the encrypted flag
					// before the bootstrap delete unregisters the name
					table.put(&name, &value, encrypted).await?;
				}
				self.bootstrap().delete(&name);
				Ok(())
			}
			MigrationPlan::DeleteDuplicate => {
				debug!("Deleting duplicate bootstrap property '{}' that is already in the database", name);
				if self.keyring().is_encrypted_name(&name) {
					table.set_encrypted(&name, true).await?;
				}
				self.bootstrap().delete(&name);
				Ok(())
			}
			MigrationPlan::Conflict => {
				warn!(
					"Bootstrap property '{}' differs from what is stored in the database. Please make property changes in the database instead of the configuration file.",
					name
				);
				Ok(())
			}
		}
	}

	/// Migrate a property and all of its descendants, leaves first.
	pub async fn migrate_tree(&self, name: &str) -> BtResult<()> {
		let name = normalize_key(name);
		if self.is_setup_mode() {
			warn!("Ignoring migration of property '{}' in setup mode", name);
			return Ok(());
		}
		let children = self.bootstrap().children_names(&name);
		for child in children {
			Box::pin(self.migrate_tree(&format!("{}.{}", name, child))).await?;
		}
		self.migrate(&name).await
	}

	/// Secrets an operator dropped into the security file are moved into
	/// the table as encrypted properties.
	async fn migrate_security_properties(&self) -> BtResult<()> {
		let keyring = self.keyring().clone();
		let Some(table) = self.table() else { return Ok(()) };

		for name in keyring.security_property_names() {
			if name.starts_with("encrypt.") {
				continue;
			}
			keyring.set_encrypted_name(&name, true);
			let Some(value) = keyring.security_get(&name) else { continue };
			match plan_migration(Some(&value), table.get(&name).as_deref()) {
				MigrationPlan::Move => {
					debug!("Migrating security file property '{}' into the database", name);
					table.put(&name, &value, true).await?;
					keyring.security_delete(&name);
				}
				MigrationPlan::DeleteDuplicate => {
					table.set_encrypted(&name, true).await?;
					keyring.security_delete(&name);
				}
				MigrationPlan::Conflict => {
					warn!(
						"Security file property '{}' differs from what is stored in the database; leaving it in place",
						name
					);
				}
				MigrationPlan::NoOp => {}
			}
		}
		Ok(())
	}

	// Cluster propagation
	//*********************

	pub fn set_cluster_propagator(&self, propagator: Arc<dyn ClusterPropagator>) {
		if let Some(table) = self.table() {
			table.set_cluster_propagator(propagator.clone());
		}
		*self.cluster.write() = Some(propagator);
	}

	/// Apply a property change broadcast by a cluster peer.
	pub fn apply_peer_set(&self, name: &str, value: &str, encrypted: bool) {
		if let Some(table) = self.table() {
			table.apply_peer_set(name, value, encrypted);
		}
	}

	/// Apply a property deletion broadcast by a cluster peer.
	pub fn apply_peer_delete(&self, name: &str) {
		if let Some(table) = self.table() {
			table.apply_peer_delete(name);
		}
	}
}

impl std::fmt::Debug for ConfigService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConfigService")
			.field("home", &self.home)
			.field("setup_mode", &self.is_setup_mode())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_plan_migration() {
		assert_eq!(plan_migration(None, None), MigrationPlan::NoOp);
		assert_eq!(plan_migration(None, Some("x")), MigrationPlan::NoOp);
		assert_eq!(plan_migration(Some("x"), None), MigrationPlan::Move);
		assert_eq!(plan_migration(Some("x"), Some("x")), MigrationPlan::DeleteDuplicate);
		assert_eq!(plan_migration(Some("x"), Some("y")), MigrationPlan::Conflict);
	}

	#[test]
	fn test_normalize_key() {
		assert_eq!(normalize_key("a.b.c").as_ref(), "a.b.c");
		assert_eq!(normalize_key("  a.b ").as_ref(), "a.b");
		assert_eq!(normalize_key("a.b...").as_ref(), "a.b");
	}

	#[test]
	fn test_is_sensitive() {
		assert!(ConfigService::is_sensitive("db.password"));
		assert!(ConfigService::is_sensitive("ldap.adminPasswd"));
		assert!(ConfigService::is_sensitive("web.CookieKey"));
		assert!(!ConfigService::is_sensitive("xmpp.domain"));
	}
}

// vim: ts=4
