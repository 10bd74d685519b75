//! Typed property definitions
//!
//! Feature modules describe the properties they use once, with a concrete
//! type, a default, optional bounds and change listeners. Reads go through
//! the definition so a malformed or out-of-range stored value degrades to
//! the default with a warning instead of an error.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::bus::ConfigEventKind;
use crate::facade::ConfigService;
use crate::prelude::*;

/// Storage encoding of a duration property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationUnit {
	Millis,
	Seconds,
	Minutes,
	Hours,
	Days,
}

impl DurationUnit {
	fn encode(self, duration: Duration) -> i64 {
		let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
		match self {
			DurationUnit::Millis => millis,
			DurationUnit::Seconds => millis / 1_000,
			DurationUnit::Minutes => millis / 60_000,
			DurationUnit::Hours => millis / 3_600_000,
			DurationUnit::Days => millis / 86_400_000,
		}
	}

	fn decode(self, raw: i64) -> Duration {
		let raw = u64::try_from(raw).unwrap_or(0);
		match self {
			DurationUnit::Millis => Duration::from_millis(raw),
			DurationUnit::Seconds => Duration::from_secs(raw),
			DurationUnit::Minutes => Duration::from_secs(raw * 60),
			DurationUnit::Hours => Duration::from_secs(raw * 3_600),
			DurationUnit::Days => Duration::from_secs(raw * 86_400),
		}
	}
}

/// A typed property value
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
	Text(Box<str>),
	Int(i32),
	Long(i64),
	Double(f64),
	Bool(bool),
	Duration(Duration),
	/// Milliseconds since the Unix epoch
	Instant(i64),
	/// Name of a pluggable implementation, validated against the
	/// definition's allowed set
	Provider(Box<str>),
}

/// The type of a property, carrying how values parse and encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKind {
	Text,
	Int,
	Long,
	Double,
	Bool,
	Duration(DurationUnit),
	Instant,
	Provider,
}

impl PropKind {
	fn parse(self, raw: &str) -> Option<PropValue> {
		match self {
			PropKind::Text => Some(PropValue::Text(raw.into())),
			PropKind::Int => raw.parse().ok().map(PropValue::Int),
			PropKind::Long => raw.parse().ok().map(PropValue::Long),
			PropKind::Double => raw.parse().ok().map(PropValue::Double),
			PropKind::Bool => match raw {
				"true" => Some(PropValue::Bool(true)),
				"false" => Some(PropValue::Bool(false)),
				_ => None,
			},
			PropKind::Duration(unit) => {
				raw.parse().ok().map(|v| PropValue::Duration(unit.decode(v)))
			}
			PropKind::Instant => raw.parse().ok().map(PropValue::Instant),
			PropKind::Provider => Some(PropValue::Provider(raw.into())),
		}
	}

	fn encode(self, value: &PropValue) -> Option<Box<str>> {
		match (self, value) {
			(PropKind::Text, PropValue::Text(v)) => Some(v.clone()),
			(PropKind::Int, PropValue::Int(v)) => Some(v.to_string().into()),
			(PropKind::Long, PropValue::Long(v)) => Some(v.to_string().into()),
			(PropKind::Double, PropValue::Double(v)) => Some(v.to_string().into()),
			(PropKind::Bool, PropValue::Bool(v)) => Some(v.to_string().into()),
			(PropKind::Duration(unit), PropValue::Duration(v)) => {
				Some(unit.encode(*v).to_string().into())
			}
			(PropKind::Instant, PropValue::Instant(v)) => Some(v.to_string().into()),
			(PropKind::Provider, PropValue::Provider(v)) => Some(v.clone()),
			_ => None,
		}
	}

	/// Orderable scalar for bounds checks
	fn ordinal(self, value: &PropValue) -> Option<f64> {
		match (self, value) {
			(PropKind::Int, PropValue::Int(v)) => Some(f64::from(*v)),
			(PropKind::Long, PropValue::Long(v)) => Some(*v as f64),
			(PropKind::Double, PropValue::Double(v)) => Some(*v),
			(PropKind::Duration(_), PropValue::Duration(v)) => Some(v.as_millis() as f64),
			(PropKind::Instant, PropValue::Instant(v)) => Some(*v as f64),
			_ => None,
		}
	}

	fn supports_bounds(self) -> bool {
		matches!(
			self,
			PropKind::Int
				| PropKind::Long
				| PropKind::Double
				| PropKind::Duration(_)
				| PropKind::Instant
		)
	}
}

/// Type alias for property change listener functions
pub type PropListener = Arc<dyn Fn(&PropValue) + Send + Sync>;

/// Metadata of one typed property
pub struct PropertyDefinition {
	pub key: Box<str>,
	pub kind: PropKind,
	pub description: Box<str>,
	pub default: PropValue,
	pub min: Option<PropValue>,
	pub max: Option<PropValue>,
	/// Dynamic properties take effect immediately; non-dynamic ones
	/// require a restart
	pub dynamic: bool,
	/// Whether values must be stored encrypted
	pub encrypted: bool,
	/// Allowed provider names (Provider kind only)
	pub allowed: Vec<Box<str>>,
	/// Owning module, used for bulk removal on plugin unload
	pub group: Box<str>,
	listeners: Vec<PropListener>,
}

impl std::fmt::Debug for PropertyDefinition {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PropertyDefinition")
			.field("key", &self.key)
			.field("kind", &self.kind)
			.field("default", &self.default)
			.field("dynamic", &self.dynamic)
			.field("encrypted", &self.encrypted)
			.field("listeners", &self.listeners.len())
			.finish_non_exhaustive()
	}
}

impl PropertyDefinition {
	/// Create a builder for constructing a PropertyDefinition
	pub fn builder(key: impl Into<Box<str>>, kind: PropKind) -> PropertyDefinitionBuilder {
		PropertyDefinitionBuilder::new(key, kind)
	}
}

/// Builder for PropertyDefinition with fluent API
pub struct PropertyDefinitionBuilder {
	key: Box<str>,
	kind: PropKind,
	description: Option<Box<str>>,
	default: Option<PropValue>,
	min: Option<PropValue>,
	max: Option<PropValue>,
	dynamic: Option<bool>,
	encrypted: bool,
	allowed: Vec<Box<str>>,
	group: Box<str>,
	listeners: Vec<PropListener>,
}

impl PropertyDefinitionBuilder {
	pub fn new(key: impl Into<Box<str>>, kind: PropKind) -> Self {
		Self {
			key: key.into(),
			kind,
			description: None,
			default: None,
			min: None,
			max: None,
			dynamic: None,
			encrypted: false,
			allowed: Vec::new(),
			group: "server".into(),
			listeners: Vec::new(),
		}
	}

	pub fn description(mut self, description: impl Into<Box<str>>) -> Self {
		self.description = Some(description.into());
		self
	}

	/// Set the default value (required)
	pub fn default(mut self, value: PropValue) -> Self {
		self.default = Some(value);
		self
	}

	pub fn min(mut self, value: PropValue) -> Self {
		self.min = Some(value);
		self
	}

	pub fn max(mut self, value: PropValue) -> Self {
		self.max = Some(value);
		self
	}

	/// Declare whether changes take effect without a restart (required)
	pub fn dynamic(mut self, dynamic: bool) -> Self {
		self.dynamic = Some(dynamic);
		self
	}

	/// Store values encrypted
	pub fn encrypted(mut self, encrypted: bool) -> Self {
		self.encrypted = encrypted;
		self
	}

	/// Allowed implementation names (Provider kind)
	pub fn allowed<I, S>(mut self, names: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<Box<str>>,
	{
		self.allowed = names.into_iter().map(Into::into).collect();
		self
	}

	pub fn group(mut self, group: impl Into<Box<str>>) -> Self {
		self.group = group.into();
		self
	}

	/// Add a change listener, invoked with the fresh typed value
	pub fn listener<F>(mut self, f: F) -> Self
	where
		F: Fn(&PropValue) + Send + Sync + 'static,
	{
		self.listeners.push(Arc::new(f));
		self
	}

	/// Build the PropertyDefinition, failing on any misconfiguration
	pub fn build(self) -> BtResult<PropertyDefinition> {
		let default = self
			.default
			.ok_or_else(|| Error::ConfigError(format!("Property '{}' needs a default", self.key)))?;
		if self.kind.encode(&default).is_none() {
			return Err(Error::ConfigError(format!(
				"Default value of property '{}' does not match its type",
				self.key
			)));
		}
		let dynamic = self.dynamic.ok_or_else(|| {
			Error::ConfigError(format!("Property '{}' must declare whether it is dynamic", self.key))
		})?;

		if (self.min.is_some() || self.max.is_some()) && !self.kind.supports_bounds() {
			return Err(Error::ConfigError(format!(
				"Property '{}' has bounds but is not an ordered type",
				self.key
			)));
		}
		for bound in self.min.iter().chain(self.max.iter()) {
			if self.kind.ordinal(bound).is_none() {
				return Err(Error::ConfigError(format!(
					"Bound of property '{}' does not match its type",
					self.key
				)));
			}
		}
		if let (Some(min), Some(max)) = (&self.min, &self.max) {
			let (min, max) = (self.kind.ordinal(min), self.kind.ordinal(max));
			if min > max {
				return Err(Error::ConfigError(format!(
					"Property '{}' has min greater than max",
					self.key
				)));
			}
		}
		if out_of_bounds(self.kind, &default, self.min.as_ref(), self.max.as_ref()) {
			return Err(Error::ConfigError(format!(
				"Default value of property '{}' violates its bounds",
				self.key
			)));
		}

		if self.kind == PropKind::Provider {
			if self.allowed.is_empty() {
				return Err(Error::ConfigError(format!(
					"Provider property '{}' needs a non-empty allowed set",
					self.key
				)));
			}
			if let PropValue::Provider(name) = &default {
				if !self.allowed.contains(name) {
					return Err(Error::ConfigError(format!(
						"Default provider of property '{}' is not in the allowed set",
						self.key
					)));
				}
			}
		} else if !self.allowed.is_empty() {
			return Err(Error::ConfigError(format!(
				"Property '{}' has an allowed set but is not a provider",
				self.key
			)));
		}

		Ok(PropertyDefinition {
			key: self.key,
			kind: self.kind,
			description: self.description.unwrap_or_default(),
			default,
			min: self.min,
			max: self.max,
			dynamic,
			encrypted: self.encrypted,
			allowed: self.allowed,
			group: self.group,
			listeners: self.listeners,
		})
	}
}

fn out_of_bounds(
	kind: PropKind,
	value: &PropValue,
	min: Option<&PropValue>,
	max: Option<&PropValue>,
) -> bool {
	let Some(ordinal) = kind.ordinal(value) else { return false };
	if let Some(min) = min.and_then(|m| kind.ordinal(m)) {
		if ordinal < min {
			return true;
		}
	}
	if let Some(max) = max.and_then(|m| kind.ordinal(m)) {
		if ordinal > max {
			return true;
		}
	}
	false
}

/// A definition bound to the property service
pub struct RegisteredProp {
	def: PropertyDefinition,
	service: Arc<ConfigService>,
	/// Raw value at registration time, for restart-required tracking
	initial: Box<str>,
}

impl RegisteredProp {
	pub fn key(&self) -> &str {
		&self.def.key
	}

	pub fn definition(&self) -> &PropertyDefinition {
		&self.def
	}

	fn raw(&self) -> Option<Box<str>> {
		self.service.get(&self.def.key)
	}

	/// The current typed value. A missing, malformed, out-of-range or
	/// disallowed stored value yields the default.
	pub fn value(&self) -> PropValue {
		let Some(raw) = self.raw() else { return self.def.default.clone() };
		let Some(value) = self.def.kind.parse(&raw) else {
			warn!(
				"Value '{}' of property '{}' does not parse as {:?}; using the default",
				raw, self.def.key, self.def.kind
			);
			return self.def.default.clone();
		};
		if out_of_bounds(self.def.kind, &value, self.def.min.as_ref(), self.def.max.as_ref()) {
			warn!("Value of property '{}' is out of range; using the default", self.def.key);
			return self.def.default.clone();
		}
		if let PropValue::Provider(name) = &value {
			if !self.def.allowed.contains(name) {
				warn!(
					"Provider '{}' of property '{}' is not in the allowed set; using the default",
					name, self.def.key
				);
				return self.def.default.clone();
			}
		}
		value
	}

	/// Write a new value in the canonical encoding.
	pub async fn set_value(&self, value: &PropValue) -> BtResult<()> {
		if let PropValue::Provider(name) = value {
			if !self.def.allowed.contains(name) {
				return Err(Error::ValidationError(format!(
					"Provider '{}' is not allowed for property '{}'",
					name, self.def.key
				)));
			}
		}
		let encoded = self.def.kind.encode(value).ok_or_else(|| {
			Error::ValidationError(format!(
				"Value does not match the type of property '{}'",
				self.def.key
			))
		})?;
		self.service.set_with_encryption(&self.def.key, &encoded, self.def.encrypted).await
	}

	/// Remove the stored value, falling back to the default.
	pub async fn clear(&self) -> BtResult<()> {
		self.service.delete(&self.def.key).await
	}

	/// A non-dynamic property whose stored value changed since
	/// registration needs a restart to take effect.
	pub fn is_restart_required(&self) -> bool {
		!self.def.dynamic && self.raw().unwrap_or_default() != self.initial
	}

	fn notify(&self) {
		let value = self.value();
		for listener in &self.def.listeners {
			listener(&value);
		}
	}
}

impl std::fmt::Debug for RegisteredProp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RegisteredProp").field("key", &self.def.key).finish_non_exhaustive()
	}
}

/// Registry of all typed properties, one definition per key
pub struct PropertyRegistry {
	service: Arc<ConfigService>,
	props: RwLock<HashMap<Box<str>, Arc<RegisteredProp>>>,
}

impl PropertyRegistry {
	/// Create the registry and start its listener dispatch task.
	///
	/// Must be called from within a tokio runtime.
	pub fn new(service: Arc<ConfigService>) -> Arc<Self> {
		let registry = Arc::new(Self { service: service.clone(), props: RwLock::new(HashMap::new()) });
		Self::spawn_dispatcher(Arc::downgrade(&registry), service);
		registry
	}

	fn spawn_dispatcher(registry: Weak<Self>, service: Arc<ConfigService>) {
		let mut rx = service.bus().subscribe();
		tokio::spawn(async move {
			loop {
				let event = match rx.recv().await {
					Ok(event) => event,
					Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
						warn!("Property listener dispatch lagged, {} events missed", missed);
						continue;
					}
					Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
				};
				if !matches!(
					event.kind,
					ConfigEventKind::PropertySet | ConfigEventKind::PropertyDeleted
				) {
					continue;
				}
				let Some(registry) = registry.upgrade() else { break };
				let prop = registry.props.read().get(event.key.as_ref()).cloned();
				if let Some(prop) = prop {
					prop.notify();
				}
			}
		});
	}

	/// Register a definition: one per key, ever. The key is migrated out
	/// of the bootstrap file, encryption is enforced for encrypted
	/// definitions, and the current raw value is captured for
	/// restart-required tracking.
	pub async fn register(&self, def: PropertyDefinition) -> BtResult<Arc<RegisteredProp>> {
		if self.props.read().contains_key(&def.key) {
			return Err(Error::ConfigError(format!(
				"Property '{}' is already registered",
				def.key
			)));
		}
		debug!("Registering property: {}", def.key);

		self.service.migrate(&def.key).await?;
		if def.encrypted {
			self.service.set_property_encrypted(&def.key, true).await?;
		}

		let initial = self.service.get(&def.key).unwrap_or_default();
		let key = def.key.clone();
		let prop = Arc::new(RegisteredProp { def, service: self.service.clone(), initial });

		let mut props = self.props.write();
		if props.contains_key(&key) {
			return Err(Error::ConfigError(format!("Property '{}' is already registered", key)));
		}
		props.insert(key, prop.clone());
		Ok(prop)
	}

	pub fn get(&self, key: &str) -> Option<Arc<RegisteredProp>> {
		self.props.read().get(key).cloned()
	}

	pub fn list(&self) -> Vec<Arc<RegisteredProp>> {
		self.props.read().values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.props.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.props.read().is_empty()
	}

	/// Drop every definition registered by a group (plugin unload).
	/// Stored values stay; only the definitions go away.
	pub fn remove_group(&self, group: &str) -> usize {
		let mut props = self.props.write();
		let before = props.len();
		props.retain(|_, prop| prop.def.group.as_ref() != group);
		before - props.len()
	}
}

impl std::fmt::Debug for PropertyRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PropertyRegistry").field("len", &self.len()).finish_non_exhaustive()
	}
}


// vim: ts=4
