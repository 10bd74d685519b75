//! Encryption key coordination
//!
//! The security file holds everything the cipher layer needs before any
//! other store is readable: the algorithm name, the current key (sealed
//! with the built-in key), the optional `new`/`old` rotation markers, and
//! the list of property names that must be stored encrypted.
//!
//! Rotation protocol: an operator writes `encrypt.key.new` together with
//! `encrypt.key.old` (which must match the current key). On the next load
//! the keyring validates the pair and stages the new key as *pending*.
//! The pending key is only used for new ciphertext while the re-encryption
//! pass is running; until that pass starts, writes keep using the active
//! key so they stay readable across a restart with the markers still in
//! place. Once every encrypted value has been re-written, the pending
//! strategy is promoted, the markers are deleted and the new key is sealed
//! into `encrypt.key.current`. A missing or mismatched old key aborts the
//! rotation with a warning and leaves the markers untouched.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bootstrap::BootstrapProps;
use crate::crypto::{CipherAlgorithm, CipherStrategy};
use crate::prelude::*;

const ENCRYPTED_NAME_PREFIX: &str = "encrypt.";
const ENCRYPTED_PROPERTY_NAMES: &str = "encrypt.property.name";
const ENCRYPTION_ALGORITHM: &str = "encrypt.algorithm";
const KEY_CURRENT: &str = "encrypt.key.current";
const KEY_NEW: &str = "encrypt.key.new";
const KEY_OLD: &str = "encrypt.key.old";

pub struct Keyring {
	security: RwLock<BootstrapProps>,
	active: RwLock<CipherStrategy>,
	active_material: RwLock<Option<Box<str>>>,
	pending: RwLock<Option<CipherStrategy>>,
	pending_material: RwLock<Option<Box<str>>>,
	/// Whether the re-encryption pass over both stores is running
	rotating: AtomicBool,
	encrypted_names: RwLock<HashSet<Box<str>>>,
}

impl Keyring {
	/// Load key state from an opened security property file.
	pub fn new(security: BootstrapProps) -> Self {
		let algorithm = CipherAlgorithm::from_name(
			security.get(ENCRYPTION_ALGORITHM).map(|(v, _)| v).filter(|v| !v.is_empty()).as_deref(),
		);

		let active_material = match security.get(KEY_CURRENT) {
			Some((sealed, _)) if !sealed.is_empty() => {
				match CipherStrategy::sealing().open(&sealed) {
					Ok(material) => Some(material),
					Err(_) => {
						error!("Unable to decrypt the current encryption key; using the default key");
						None
					}
				}
			}
			_ => None,
		};
		let active = CipherStrategy::new(algorithm, active_material.as_deref());

		let encrypted_names: HashSet<Box<str>> =
			security.values(ENCRYPTED_PROPERTY_NAMES).into_iter().map(|(v, _)| v).collect();

		let keyring = Keyring {
			security: RwLock::new(security),
			active: RwLock::new(active),
			active_material: RwLock::new(active_material),
			pending: RwLock::new(None),
			pending_material: RwLock::new(None),
			rotating: AtomicBool::new(false),
			encrypted_names: RwLock::new(encrypted_names),
		};
		keyring.detect_rotation(algorithm);
		keyring
	}

	/// Validate the `new`/`old` rotation markers and stage a pending
	/// strategy if they check out. Aborting leaves the markers in place
	/// and skips re-sealing the current key.
	fn detect_rotation(&self, algorithm: CipherAlgorithm) {
		let (new_key, old_key) = {
			let security = self.security.read();
			// An empty new key is a valid request: rotate to the default key
			let new_key = security.get(KEY_NEW).map(|(v, _)| v);
			let old_key = security.get(KEY_OLD).map(|(v, _)| v).filter(|v| !v.is_empty());
			(new_key, old_key)
		};

		let Some(new_key) = new_key else {
			self.persist_current();
			return;
		};
		info!("Detected new encryption key; updating encrypted properties");

		let current = self.active_material.read().clone();
		match (&old_key, &current) {
			(None, Some(_)) => {
				warn!("Old encryption key was not provided; ignoring new encryption key");
				return;
			}
			(Some(old), Some(current)) if old != current => {
				warn!("Old encryption key does not match current encryption key; ignoring new encryption key");
				return;
			}
			(Some(_), None) => {
				warn!("Old encryption key does not match current encryption key; ignoring new encryption key");
				return;
			}
			_ => {}
		}

		let material = if new_key.is_empty() { None } else { Some(new_key) };
		*self.pending.write() = Some(CipherStrategy::new(algorithm, material.as_deref()));
		*self.pending_material.write() = material;
	}

	/// The strategy that decrypts existing values
	pub fn active(&self) -> CipherStrategy {
		*self.active.read()
	}

	/// The strategy for new ciphertext: the pending one while the
	/// re-encryption pass is running, the active one otherwise.
	///
	/// A staged key that has not been applied yet must not leak into
	/// writes, or a restart before the pass would leave them unreadable.
	pub fn write_strategy(&self) -> CipherStrategy {
		if self.rotating.load(Ordering::Acquire) {
			self.pending.read().unwrap_or_else(|| self.active())
		} else {
			self.active()
		}
	}

	pub fn has_pending(&self) -> bool {
		self.pending.read().is_some()
	}

	/// Mark the re-encryption pass as running: new ciphertext now uses the
	/// pending strategy, so values visited by the pass (and any concurrent
	/// writes) end up under the new key.
	pub fn begin_rotation_pass(&self) {
		self.rotating.store(true, Ordering::Release);
	}

	pub fn end_rotation_pass(&self) {
		self.rotating.store(false, Ordering::Release);
	}

	/// Stage a key change. The re-encryption pass and promotion are driven
	/// by the facade.
	pub fn request_key(&self, material: &str) {
		let algorithm = self.active.read().algorithm;
		let material = if material.is_empty() { None } else { Some(Box::<str>::from(material)) };
		*self.pending.write() = Some(CipherStrategy::new(algorithm, material.as_deref()));
		*self.pending_material.write() = material;
	}

	/// Stage an algorithm change, keeping the current key.
	pub fn request_algorithm(&self, algorithm: CipherAlgorithm) {
		let material = self.active_material.read().clone();
		*self.pending.write() = Some(CipherStrategy::new(algorithm, material.as_deref()));
		*self.pending_material.write() = material;
	}

	/// Make the pending strategy active: consume the rotation markers and
	/// seal the new key into the security file.
	pub fn promote_pending(&self) {
		let Some(pending) = self.pending.write().take() else { return };
		*self.active.write() = pending;
		*self.active_material.write() = self.pending_material.write().take();
		{
			let mut security = self.security.write();
			security.delete(KEY_NEW);
			security.delete(KEY_OLD);
			security.set(ENCRYPTION_ALGORITHM, pending.algorithm.name(), false);
		}
		self.persist_current();
		info!("Property encryption now uses {}", pending.algorithm.name());
	}

	/// Seal the current key material back into the security file.
	pub fn persist_current(&self) {
		let sealed = self
			.active_material
			.read()
			.as_deref()
			.map(|material| CipherStrategy::sealing().seal(material))
			.unwrap_or_default();
		self.security.write().set(KEY_CURRENT, &sealed, false);
	}

	/// Whether values of this property name must be stored encrypted.
	/// The key-management properties themselves are never encrypted.
	pub fn is_encrypted_name(&self, name: &str) -> bool {
		!name.starts_with(ENCRYPTED_NAME_PREFIX) && self.encrypted_names.read().contains(name)
	}

	/// Register or unregister a property name for encryption
	pub fn set_encrypted_name(&self, name: &str, encrypted: bool) {
		if name.starts_with(ENCRYPTED_NAME_PREFIX) {
			return;
		}
		let changed = {
			let mut names = self.encrypted_names.write();
			if encrypted { names.insert(name.into()) } else { names.remove(name) }
		};
		if changed {
			let mut values: Vec<(Box<str>, bool)> = self
				.encrypted_names
				.read()
				.iter()
				.map(|n| (n.clone(), false))
				.collect();
			values.sort();
			self.security.write().set_values(ENCRYPTED_PROPERTY_NAMES, &values);
		}
	}

	pub fn encrypted_names(&self) -> Vec<Box<str>> {
		self.encrypted_names.read().iter().cloned().collect()
	}

	/// Names of every property stored in the security file itself.
	/// Secrets an operator drops there are migrated into the table.
	pub(crate) fn security_property_names(&self) -> Vec<Box<str>> {
		self.security.read().all_names()
	}

	pub(crate) fn security_get(&self, name: &str) -> Option<Box<str>> {
		self.security.read().get(name).map(|(v, _)| v).filter(|v| !v.is_empty())
	}

	pub(crate) fn security_delete(&self, name: &str) {
		self.security.write().delete(name);
	}
}

impl std::fmt::Debug for Keyring {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Keyring")
			.field("algorithm", &self.active.read().algorithm)
			.field("pending", &self.has_pending())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn security_with(entries: &[(&str, &str)]) -> BootstrapProps {
		let mut props = BootstrapProps::in_memory("security");
		for (name, value) in entries {
			props.set(name, value, false);
		}
		props
	}

	#[test]
	fn test_defaults_without_configuration() {
		let keyring = Keyring::new(BootstrapProps::in_memory("security"));
		assert_eq!(keyring.active().algorithm, CipherAlgorithm::Camellia);
		assert!(!keyring.has_pending());
	}

	#[test]
	fn test_sealed_current_key_loads() {
		let sealed = CipherStrategy::sealing().seal("my secret key");
		let props = security_with(&[("encrypt.algorithm", "AES"), ("encrypt.key.current", &sealed)]);
		let keyring = Keyring::new(props);

		let expected = CipherStrategy::new(CipherAlgorithm::Aes, Some("my secret key"));
		assert_eq!(keyring.active(), expected);
	}

	#[test]
	fn test_valid_rotation_is_staged_not_applied() {
		let sealed = CipherStrategy::sealing().seal("old key");
		let props = security_with(&[
			("encrypt.algorithm", "AES"),
			("encrypt.key.current", &sealed),
			("encrypt.key.new", "new key"),
			("encrypt.key.old", "old key"),
		]);
		let keyring = Keyring::new(props);

		assert!(keyring.has_pending());
		assert_eq!(keyring.active(), CipherStrategy::new(CipherAlgorithm::Aes, Some("old key")));
		// The staged key must not be used for writes before the
		// re-encryption pass runs
		assert_eq!(keyring.write_strategy(), keyring.active());
		keyring.begin_rotation_pass();
		assert_eq!(
			keyring.write_strategy(),
			CipherStrategy::new(CipherAlgorithm::Aes, Some("new key"))
		);
		keyring.end_rotation_pass();
		assert_eq!(keyring.write_strategy(), keyring.active());
	}

	#[test]
	fn test_rotation_aborts_on_mismatched_old_key() {
		let sealed = CipherStrategy::sealing().seal("old key");
		let props = security_with(&[
			("encrypt.key.current", &sealed),
			("encrypt.key.new", "new key"),
			("encrypt.key.old", "wrong key"),
		]);
		let keyring = Keyring::new(props);

		assert!(!keyring.has_pending());
		// Markers survive the abort so the operator can fix them
		assert_eq!(keyring.security.read().get("encrypt.key.new").unwrap().0.as_ref(), "new key");
	}

	#[test]
	fn test_rotation_aborts_on_missing_old_key() {
		let sealed = CipherStrategy::sealing().seal("old key");
		let props =
			security_with(&[("encrypt.key.current", &sealed), ("encrypt.key.new", "new key")]);
		let keyring = Keyring::new(props);

		assert!(!keyring.has_pending());
	}

	#[test]
	fn test_promote_consumes_markers_and_reseals() {
		let sealed = CipherStrategy::sealing().seal("old key");
		let props = security_with(&[
			("encrypt.algorithm", "AES"),
			("encrypt.key.current", &sealed),
			("encrypt.key.new", "new key"),
			("encrypt.key.old", "old key"),
		]);
		let keyring = Keyring::new(props);
		keyring.promote_pending();

		assert!(!keyring.has_pending());
		assert_eq!(keyring.active(), CipherStrategy::new(CipherAlgorithm::Aes, Some("new key")));
		let security = keyring.security.read();
		assert!(security.get("encrypt.key.new").is_none());
		assert!(security.get("encrypt.key.old").is_none());
		let resealed = security.get("encrypt.key.current").unwrap().0;
		assert_eq!(CipherStrategy::sealing().open(&resealed).unwrap().as_ref(), "new key");
	}

	#[test]
	fn test_encrypted_name_registry() {
		let keyring = Keyring::new(BootstrapProps::in_memory("security"));
		keyring.set_encrypted_name("db.password", true);
		assert!(keyring.is_encrypted_name("db.password"));
		assert!(!keyring.is_encrypted_name("db.url"));

		keyring.set_encrypted_name("db.password", false);
		assert!(!keyring.is_encrypted_name("db.password"));
	}

	#[test]
	fn test_key_management_names_never_encrypted() {
		let keyring = Keyring::new(BootstrapProps::in_memory("security"));
		keyring.set_encrypted_name("encrypt.key.current", true);
		assert!(!keyring.is_encrypted_name("encrypt.key.current"));
	}
}

// vim: ts=4
