//! Configuration change events
//!
//! Every successful mutation of either property store publishes one event.
//! Subscribers (the typed property registry, admin consoles, caches) decide
//! for themselves which keys they care about.

use tokio::sync::broadcast;

/// What happened to the property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEventKind {
	/// A database-backed property was created or updated
	PropertySet,
	/// A database-backed property was deleted
	PropertyDeleted,
	/// A bootstrap file property was created or updated
	XmlPropertySet,
	/// A bootstrap file property was deleted
	XmlPropertyDeleted,
}

/// A single property change
#[derive(Debug, Clone)]
pub struct ConfigEvent {
	pub key: Box<str>,
	pub kind: ConfigEventKind,
	/// New plaintext value; `None` for deletions
	pub value: Option<Box<str>>,
}

/// Broadcast channel for configuration changes.
///
/// Publishing with no subscribers is not an error; slow subscribers that
/// overflow the buffer miss events (standard broadcast semantics).
#[derive(Debug, Clone)]
pub struct ConfigEventBus {
	tx: broadcast::Sender<ConfigEvent>,
}

impl ConfigEventBus {
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);
		Self { tx }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
		self.tx.subscribe()
	}

	pub fn publish(&self, key: &str, kind: ConfigEventKind, value: Option<&str>) {
		let event =
			ConfigEvent { key: key.into(), kind, value: value.map(std::convert::Into::into) };
		// A send error only means nobody is listening right now
		let _ = self.tx.send(event);
	}
}

impl Default for ConfigEventBus {
	fn default() -> Self {
		Self::new(128)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_publish_and_receive() {
		let bus = ConfigEventBus::new(8);
		let mut rx = bus.subscribe();

		bus.publish("xmpp.domain", ConfigEventKind::PropertySet, Some("example.org"));

		let event = rx.recv().await.unwrap();
		assert_eq!(event.key.as_ref(), "xmpp.domain");
		assert_eq!(event.kind, ConfigEventKind::PropertySet);
		assert_eq!(event.value.as_deref(), Some("example.org"));
	}

	#[test]
	fn test_publish_without_subscribers() {
		let bus = ConfigEventBus::new(8);
		bus.publish("orphan", ConfigEventKind::PropertyDeleted, None);
	}
}

// vim: ts=4
