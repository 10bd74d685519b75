//! Bootstrap XML property file
//!
//! A small set of properties must be readable before any database
//! connection exists (the database connection settings themselves, the
//! setup flag, ...). They live in an XML file where the dot-separated
//! property name maps onto the element hierarchy: `db.url` is the text of
//! `<db><url>...</url></db>`. Repeated sibling elements represent list
//! values. Encrypted values carry an `encrypted="true"` attribute.
//!
//! [`BootstrapProps`] is the plain tree + file layer. [`BootstrapStore`]
//! wraps it with the decrypted read cache, encryption on write, and change
//! events.

use parking_lot::RwLock;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bus::{ConfigEventBus, ConfigEventKind};
use crate::keyring::Keyring;
use crate::prelude::*;

const ENCRYPTED_ATTRIBUTE: &str = "encrypted";

/// One element of the property tree
#[derive(Debug, Clone, Default)]
struct Element {
	name: Box<str>,
	encrypted: bool,
	text: String,
	children: Vec<Element>,
}

impl Element {
	fn new(name: &str) -> Self {
		Element { name: name.into(), ..Element::default() }
	}

	fn child(&self, name: &str) -> Option<&Element> {
		self.children.iter().find(|c| c.name.as_ref() == name)
	}

	fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
		self.children.iter_mut().find(|c| c.name.as_ref() == name)
	}

	fn child_or_create(&mut self, name: &str) -> &mut Element {
		if let Some(idx) = self.children.iter().position(|c| c.name.as_ref() == name) {
			&mut self.children[idx]
		} else {
			self.children.push(Element::new(name));
			let idx = self.children.len() - 1;
			&mut self.children[idx]
		}
	}
}

/// Split a dot-separated property name into segments, skipping empty ones
fn parse_segments(name: &str) -> Vec<&str> {
	name.split('.').filter(|s| !s.is_empty()).collect()
}

/// Property names become XML element names, so they are restricted to
/// characters that need no escaping.
fn validate_name(name: &str) -> BtResult<()> {
	let segments = parse_segments(name);
	if segments.is_empty() {
		return Err(Error::ValidationError(format!("Invalid property name: '{}'", name)));
	}
	for segment in segments {
		let mut chars = segment.chars();
		let valid_first = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
		if !valid_first
			|| !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
		{
			return Err(Error::ValidationError(format!(
				"Property name segment '{}' is not a valid XML element name",
				segment
			)));
		}
	}
	Ok(())
}

/// The in-memory property tree backed by an XML file.
///
/// Every mutation rewrites the whole file through a temporary file that is
/// renamed over the original, so a crash mid-write never corrupts it. An
/// instance without a backing file keeps mutations in memory and reports
/// them as unsaved.
#[derive(Debug)]
pub struct BootstrapProps {
	path: Option<PathBuf>,
	root: Element,
}

impl BootstrapProps {
	/// Open (or create) the property file at `path`.
	///
	/// A missing file is recovered from a leftover `.tmp` of an interrupted
	/// write if one exists; otherwise a new file with an empty `root_name`
	/// document is created.
	pub fn open(path: impl AsRef<Path>, root_name: &str) -> BtResult<Self> {
		let path = path.as_ref();
		if !path.exists() {
			if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
				std::fs::create_dir_all(parent)?;
			}
			let tmp = tmp_path(path);
			if tmp.exists() {
				error!(
					"{:?} was not found, but the temp file of a previous write is. \
					Attempting automatic recovery, please check the file for consistency.",
					path.file_name().unwrap_or_default()
				);
				std::fs::rename(&tmp, path)?;
			} else {
				let props =
					BootstrapProps { path: Some(path.to_path_buf()), root: Element::new(root_name) };
				if !props.save() {
					return Err(Error::ConfigError(format!(
						"Unable to create property file {}",
						path.display()
					)));
				}
				return Ok(props);
			}
		}
		let content = std::fs::read_to_string(path)?;
		let root = parse_document(&content)?;
		Ok(BootstrapProps { path: Some(path.to_path_buf()), root })
	}

	/// An instance without a backing file. Used when the configuration
	/// directory is unusable; the server stays up but nothing persists.
	pub fn in_memory(root_name: &str) -> Self {
		BootstrapProps { path: None, root: Element::new(root_name) }
	}

	pub fn is_persistent(&self) -> bool {
		self.path.is_some()
	}

	fn find(&self, name: &str) -> Option<&Element> {
		let mut element = &self.root;
		for segment in parse_segments(name) {
			element = element.child(segment)?;
		}
		Some(element)
	}

	/// Raw value and encrypted marker of a property. Empty text is
	/// reported as-is; collapsing belongs to the caller.
	pub fn get(&self, name: &str) -> Option<(Box<str>, bool)> {
		let element = self.find(name)?;
		Some((element.text.trim().into(), element.encrypted))
	}

	/// Set a property value, creating intermediate elements as needed.
	///
	/// Returns whether the file was saved.
	pub fn set(&mut self, name: &str, value: &str, encrypted: bool) -> bool {
		let mut element = &mut self.root;
		for segment in parse_segments(name) {
			element = element.child_or_create(segment);
		}
		element.text = value.to_string();
		element.encrypted = encrypted;
		self.save()
	}

	/// Delete a property and all duplicate siblings of the same name.
	/// An intermediate element left with no children and no text is pruned.
	///
	/// Returns whether the property existed.
	pub fn delete(&mut self, name: &str) -> bool {
		let segments = parse_segments(name);
		let Some((leaf, parents)) = segments.split_last() else { return false };
		let mut element = &mut self.root;
		for segment in parents {
			match element.child_mut(segment) {
				Some(child) => element = child,
				None => return false,
			}
		}
		let before = element.children.len();
		element.children.retain(|c| c.name.as_ref() != *leaf);
		if before == element.children.len() {
			return false;
		}
		if element.children.is_empty() && element.text.trim().is_empty() && !parents.is_empty() {
			self.prune(parents);
		}
		self.save();
		true
	}

	fn prune(&mut self, path: &[&str]) {
		let Some((leaf, parents)) = path.split_last() else { return };
		let mut element = &mut self.root;
		for segment in parents {
			match element.child_mut(segment) {
				Some(child) => element = child,
				None => return,
			}
		}
		element.children.retain(|c| c.name.as_ref() != *leaf);
	}

	/// All non-empty values of repeated sibling elements, with their
	/// encrypted markers.
	pub fn values(&self, name: &str) -> Vec<(Box<str>, bool)> {
		let segments = parse_segments(name);
		let Some((leaf, parents)) = segments.split_last() else { return Vec::new() };
		let mut element = &self.root;
		for segment in parents {
			match element.child(segment) {
				Some(child) => element = child,
				None => return Vec::new(),
			}
		}
		element
			.children
			.iter()
			.filter(|c| c.name.as_ref() == *leaf && !c.text.trim().is_empty())
			.map(|c| (c.text.trim().into(), c.encrypted))
			.collect()
	}

	/// Replace all values of a list property.
	pub fn set_values(&mut self, name: &str, values: &[(Box<str>, bool)]) -> bool {
		let segments = parse_segments(name);
		let Some((leaf, parents)) = segments.split_last() else { return false };
		let mut element = &mut self.root;
		for segment in parents {
			element = element.child_or_create(segment);
		}
		element.children.retain(|c| c.name.as_ref() != *leaf);
		for (value, encrypted) in values {
			let mut child = Element::new(leaf);
			child.text = value.to_string();
			child.encrypted = *encrypted;
			element.children.push(child);
		}
		self.save()
	}

	/// Names of the direct child elements of a property
	pub fn children_names(&self, parent: &str) -> Vec<Box<str>> {
		match self.find(parent) {
			Some(element) => element.children.iter().map(|c| c.name.clone()).collect(),
			None => Vec::new(),
		}
	}

	/// Dot-separated names of every property in the file that has a value
	pub fn all_names(&self) -> Vec<Box<str>> {
		let mut result = Vec::new();
		collect_names(&self.root, "", &mut result);
		result
	}

	/// Serialize the tree and atomically replace the backing file.
	///
	/// A failed write leaves the previous file intact and returns false.
	fn save(&self) -> bool {
		let Some(path) = &self.path else {
			error!("Unable to save bootstrap properties: no file specified");
			return false;
		};
		let xml = match serialize_document(&self.root) {
			Ok(xml) => xml,
			Err(err) => {
				error!("Unable to serialize bootstrap properties: {}", err);
				return false;
			}
		};
		let tmp = tmp_path(path);
		if let Err(err) = std::fs::write(&tmp, xml) {
			error!("Unable to write bootstrap properties to {}: {}", tmp.display(), err);
			return false;
		}
		if let Err(err) = std::fs::rename(&tmp, path) {
			error!("Error moving new property file over {}: {}", path.display(), err);
			return false;
		}
		true
	}
}

fn tmp_path(path: &Path) -> PathBuf {
	let mut name = path.file_name().unwrap_or_default().to_os_string();
	name.push(".tmp");
	path.with_file_name(name)
}

fn collect_names(parent: &Element, prefix: &str, out: &mut Vec<Box<str>>) {
	for child in &parent.children {
		let name = if prefix.is_empty() {
			child.name.to_string()
		} else {
			format!("{}.{}", prefix, child.name)
		};
		if !child.text.trim().is_empty() && !out.iter().any(|n| n.as_ref() == name) {
			out.push(name.clone().into());
		}
		collect_names(child, &name, out);
	}
}

fn parse_document(content: &str) -> BtResult<Element> {
	let mut reader = Reader::from_str(content);
	reader.config_mut().trim_text(true);

	let mut stack: Vec<Element> = Vec::new();
	let mut root: Option<Element> = None;
	loop {
		let event = reader
			.read_event()
			.map_err(|err| Error::Parse(format!("XML error: {}", err).into()))?;
		match event {
			Event::Start(e) => {
				stack.push(element_from_start(&e)?);
			}
			Event::Empty(e) => {
				let element = element_from_start(&e)?;
				attach(&mut stack, &mut root, element);
			}
			Event::Text(e) => {
				if let Some(top) = stack.last_mut() {
					let text = e
						.unescape()
						.map_err(|err| Error::Parse(format!("XML error: {}", err).into()))?;
					top.text.push_str(&text);
				}
			}
			Event::CData(e) => {
				if let Some(top) = stack.last_mut() {
					top.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
				}
			}
			Event::End(_) => {
				if let Some(element) = stack.pop() {
					attach(&mut stack, &mut root, element);
				}
			}
			Event::Eof => break,
			_ => {}
		}
	}
	root.ok_or_else(|| Error::Parse("Property file has no root element".into()))
}

fn element_from_start(e: &BytesStart) -> BtResult<Element> {
	let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
	let encrypted = e
		.try_get_attribute(ENCRYPTED_ATTRIBUTE)
		.map_err(|err| Error::Parse(format!("XML error: {}", err).into()))?
		.and_then(|attr| attr.unescape_value().ok())
		.is_some_and(|v| v == "true");
	Ok(Element { name: name.into(), encrypted, text: String::new(), children: Vec::new() })
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
	if let Some(parent) = stack.last_mut() {
		parent.children.push(element);
	} else if root.is_none() {
		*root = Some(element);
	}
}

fn serialize_document(root: &Element) -> BtResult<String> {
	let mut writer = Writer::new_with_indent(Vec::new(), b'\t', 1);
	writer
		.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
		.map_err(|err| Error::ConfigError(format!("XML write error: {}", err)))?;
	write_element(&mut writer, root)
		.map_err(|err| Error::ConfigError(format!("XML write error: {}", err)))?;
	String::from_utf8(writer.into_inner())
		.map_err(|err| Error::ConfigError(format!("XML write error: {}", err)))
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> std::io::Result<()> {
	let mut start = BytesStart::new(element.name.as_ref());
	if element.encrypted {
		start.push_attribute((ENCRYPTED_ATTRIBUTE, "true"));
	}
	if element.children.is_empty() && element.text.is_empty() {
		writer.write_event(Event::Empty(start))?;
	} else {
		writer.write_event(Event::Start(start))?;
		if !element.text.is_empty() {
			writer.write_event(Event::Text(BytesText::new(&element.text)))?;
		}
		for child in &element.children {
			write_element(writer, child)?;
		}
		writer.write_event(Event::End(BytesEnd::new(element.name.as_ref())))?;
	}
	Ok(())
}

/// Crypto-aware view of the bootstrap file.
///
/// Reads go through a decrypted value cache; writes encrypt values whose
/// names are registered for encryption and mark them in the file. A value
/// that is registered for encryption but still stored in plaintext is
/// rewritten encrypted the first time it is read.
pub struct BootstrapStore {
	props: RwLock<BootstrapProps>,
	cache: RwLock<HashMap<Box<str>, Option<Box<str>>>>,
	keyring: Arc<Keyring>,
	bus: ConfigEventBus,
}

impl BootstrapStore {
	pub fn new(props: BootstrapProps, keyring: Arc<Keyring>, bus: ConfigEventBus) -> Self {
		Self { props: RwLock::new(props), cache: RwLock::new(HashMap::new()), keyring, bus }
	}

	pub fn is_persistent(&self) -> bool {
		self.props.read().is_persistent()
	}

	/// Get a property value. Empty values count as absent.
	pub fn get(&self, name: &str) -> Option<Box<str>> {
		if let Some(cached) = self.cache.read().get(name) {
			return cached.clone();
		}

		let raw = self.props.read().get(name);
		let resolved = match raw {
			None => None,
			Some((value, _)) if value.is_empty() => None,
			Some((value, marked)) => {
				if marked {
					match self.keyring.active().decrypt_embedded(&value) {
						Ok(plain) => Some(plain),
						Err(_) => {
							error!("Failed to decrypt bootstrap property '{}', dropping value", name);
							None
						}
					}
				} else if self.keyring.is_encrypted_name(name) {
					// Stored plaintext but registered for encryption
					info!("Rewriting bootstrap property '{}' as an encrypted value", name);
					self.set(name, &value);
					return Some(value);
				} else {
					Some(value)
				}
			}
		};
		self.cache.write().insert(name.into(), resolved.clone());
		resolved
	}

	/// Set a property value.
	///
	/// Returns whether the file was saved (false for in-memory instances).
	pub fn set(&self, name: &str, value: &str) -> bool {
		if let Err(err) = validate_name(name) {
			warn!("Rejecting bootstrap property write: {}", err);
			return false;
		}
		let encrypt = self.keyring.is_encrypted_name(name);
		let saved = {
			let mut props = self.props.write();
			let stored = if encrypt {
				self.keyring.write_strategy().encrypt_embedded(value)
			} else {
				value.into()
			};
			self.cache.write().insert(name.into(), Some(value.into()));
			props.set(name, &stored, encrypt)
		};
		self.bus.publish(name, ConfigEventKind::XmlPropertySet, Some(value));
		saved
	}

	/// Delete a property. Also removes the name from the encrypted-name
	/// registry so a later plaintext write is not encrypted by surprise.
	pub fn delete(&self, name: &str) {
		{
			let mut props = self.props.write();
			let mut cache = self.cache.write();
			cache.retain(|key, _| {
				key.as_ref() != name && !key.strip_prefix(name).is_some_and(|r| r.starts_with('.'))
			});
			props.delete(name);
		}
		self.keyring.set_encrypted_name(name, false);
		self.bus.publish(name, ConfigEventKind::XmlPropertyDeleted, None);
	}

	/// All values of a list property (repeated sibling elements), decrypted
	pub fn values(&self, name: &str) -> Vec<Box<str>> {
		let raw = self.props.read().values(name);
		let mut result = Vec::with_capacity(raw.len());
		let mut must_rewrite = false;
		let registered = self.keyring.is_encrypted_name(name);
		for (value, marked) in raw {
			if marked {
				match self.keyring.active().decrypt_embedded(&value) {
					Ok(plain) => result.push(plain),
					Err(_) => {
						error!("Failed to decrypt bootstrap property '{}', dropping value", name);
					}
				}
			} else {
				if registered {
					must_rewrite = true;
				}
				result.push(value);
			}
		}
		if must_rewrite {
			info!("Rewriting bootstrap property '{}' as an encrypted value", name);
			self.set_values(name, &result);
		}
		result
	}

	/// Replace all values of a list property
	pub fn set_values(&self, name: &str, values: &[Box<str>]) -> bool {
		if let Err(err) = validate_name(name) {
			warn!("Rejecting bootstrap property write: {}", err);
			return false;
		}
		let encrypt = self.keyring.is_encrypted_name(name);
		let saved = {
			let mut props = self.props.write();
			self.cache.write().remove(name);
			let stored: Vec<(Box<str>, bool)> = values
				.iter()
				.map(|v| {
					if encrypt {
						(self.keyring.write_strategy().encrypt_embedded(v), true)
					} else {
						(v.clone(), false)
					}
				})
				.collect();
			props.set_values(name, &stored)
		};
		self.bus.publish(name, ConfigEventKind::XmlPropertySet, None);
		saved
	}

	/// Add a value to a list property. Returns false if already present.
	pub fn add_to_values(&self, name: &str, value: &str) -> bool {
		let mut values = self.values(name);
		if values.iter().any(|v| v.as_ref() == value) {
			return false;
		}
		values.push(value.into());
		self.set_values(name, &values)
	}

	/// Remove a value from a list property. Returns false if not found.
	pub fn remove_from_values(&self, name: &str, value: &str) -> bool {
		let mut values = self.values(name);
		let before = values.len();
		values.retain(|v| v.as_ref() != value);
		if values.len() == before {
			return false;
		}
		self.set_values(name, &values)
	}

	pub fn children_names(&self, parent: &str) -> Vec<Box<str>> {
		self.props.read().children_names(parent)
	}

	pub fn all_names(&self) -> Vec<Box<str>> {
		self.props.read().all_names()
	}

	/// Re-encrypt every registered encrypted value with the pending write
	/// strategy. Called during key or algorithm rotation.
	pub(crate) fn reencrypt_registered(&self) {
		for name in self.keyring.encrypted_names() {
			if let Some(value) = self.get(&name) {
				self.set(&name, &value);
			}
		}
	}
}

impl std::fmt::Debug for BootstrapStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BootstrapStore")
			.field("persistent", &self.is_persistent())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_and_get() {
		let root = parse_document(
			"<banter><db><url>sqlite://banter.db</url></db><setup>true</setup></banter>",
		)
		.unwrap();
		let props = BootstrapProps { path: None, root };
		assert_eq!(props.get("db.url").unwrap().0.as_ref(), "sqlite://banter.db");
		assert_eq!(props.get("setup").unwrap().0.as_ref(), "true");
		assert!(props.get("db.user").is_none());
	}

	#[test]
	fn test_encrypted_marker_round_trip() {
		let mut props = BootstrapProps::in_memory("banter");
		props.set("db.password", "Y2lwaGVydGV4dA==", true);
		let xml = serialize_document(&props.root).unwrap();
		assert!(xml.contains("encrypted=\"true\""));
		let parsed = parse_document(&xml).unwrap();
		let reread = BootstrapProps { path: None, root: parsed };
		assert_eq!(reread.get("db.password"), Some(("Y2lwaGVydGV4dA==".into(), true)));
	}

	#[test]
	fn test_list_values_as_sibling_elements() {
		let mut props = BootstrapProps::in_memory("banter");
		props.set_values(
			"network.interface",
			&[("eth0".into(), false), ("eth1".into(), false)],
		);
		let values: Vec<_> = props.values("network.interface").into_iter().map(|v| v.0).collect();
		assert_eq!(values, vec![Box::from("eth0"), Box::from("eth1")]);

		let xml = serialize_document(&props.root).unwrap();
		assert_eq!(xml.matches("<interface>").count(), 2);
	}

	#[test]
	fn test_delete_prunes_empty_parents() {
		let mut props = BootstrapProps::in_memory("banter");
		props.set("a.b.c", "value", false);
		assert!(props.delete("a.b.c"));
		assert!(props.children_names("a").is_empty());
		assert!(!props.delete("a.b.c"));
	}

	#[test]
	fn test_all_names_skips_branches_without_values() {
		let mut props = BootstrapProps::in_memory("banter");
		props.set("db.url", "x", false);
		props.set("db.pool.size", "5", false);
		let names = props.all_names();
		assert!(names.iter().any(|n| n.as_ref() == "db.url"));
		assert!(names.iter().any(|n| n.as_ref() == "db.pool.size"));
		assert!(!names.iter().any(|n| n.as_ref() == "db"));
	}

	#[test]
	fn test_atomic_save_and_reload() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("banter.xml");
		{
			let mut props = BootstrapProps::open(&path, "banter").unwrap();
			assert!(props.set("xmpp.domain", "example.org", false));
		}
		let props = BootstrapProps::open(&path, "banter").unwrap();
		assert_eq!(props.get("xmpp.domain").unwrap().0.as_ref(), "example.org");
		assert!(!tmp_path(&path).exists());
	}

	#[test]
	fn test_tmp_file_recovery() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("banter.xml");
		std::fs::write(
			tmp_path(&path),
			"<?xml version=\"1.0\"?><banter><rescued>yes</rescued></banter>",
		)
		.unwrap();

		let props = BootstrapProps::open(&path, "banter").unwrap();
		assert_eq!(props.get("rescued").unwrap().0.as_ref(), "yes");
		assert!(path.exists());
		assert!(!tmp_path(&path).exists());
	}

	#[test]
	fn test_open_creates_missing_directories() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("conf").join("banter.xml");
		{
			let mut props = BootstrapProps::open(&path, "banter").unwrap();
			assert!(props.is_persistent());
			assert!(props.set("fresh.home", "works", false));
		}
		assert!(path.exists());
		let props = BootstrapProps::open(&path, "banter").unwrap();
		assert_eq!(props.get("fresh.home").unwrap().0.as_ref(), "works");
	}

	#[test]
	fn test_invalid_names_rejected() {
		assert!(validate_name("db.url").is_ok());
		assert!(validate_name("a-b.c_d").is_ok());
		assert!(validate_name("").is_err());
		assert!(validate_name("a.<b>").is_err());
		assert!(validate_name("1digit.first").is_err());
	}

	#[test]
	fn test_escaped_text_round_trip() {
		let mut props = BootstrapProps::in_memory("banter");
		props.set("motd", "a < b & \"c\"", false);
		let xml = serialize_document(&props.root).unwrap();
		let reread = BootstrapProps { path: None, root: parse_document(&xml).unwrap() };
		assert_eq!(reread.get("motd").unwrap().0.as_ref(), "a < b & \"c\"");
	}
}

// vim: ts=4
