//! Typed property registry integration tests

mod common;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use banter_config::{
	ConfigService, DurationUnit, PropKind, PropValue, PropertyDefinition, PropertyRegistry,
};
use common::MemoryConfigAdapter;

async fn create_registry() -> (Arc<PropertyRegistry>, Arc<ConfigService>, MemoryConfigAdapter, TempDir)
{
	let home = TempDir::new().expect("Failed to create temp directory");
	let service = Arc::new(ConfigService::new(home.path()));
	let adapter = MemoryConfigAdapter::new();
	service.attach_database(Arc::new(adapter.clone())).await.expect("Failed to attach adapter");
	let registry = PropertyRegistry::new(service.clone());
	(registry, service, adapter, home)
}

#[tokio::test]
async fn test_default_and_set_value() {
	let (registry, _service, _adapter, _home) = create_registry().await;

	let prop = registry
		.register(
			PropertyDefinition::builder("session.timeout", PropKind::Int)
				.default(PropValue::Int(30))
				.dynamic(true)
				.build()
				.unwrap(),
		)
		.await
		.unwrap();

	assert_eq!(prop.value(), PropValue::Int(30));

	prop.set_value(&PropValue::Int(60)).await.unwrap();
	assert_eq!(prop.value(), PropValue::Int(60));

	prop.clear().await.unwrap();
	assert_eq!(prop.value(), PropValue::Int(30));
}

#[tokio::test]
async fn test_set_value_rejects_wrong_type() {
	let (registry, _service, _adapter, _home) = create_registry().await;

	let prop = registry
		.register(
			PropertyDefinition::builder("typed.prop", PropKind::Int)
				.default(PropValue::Int(1))
				.dynamic(true)
				.build()
				.unwrap(),
		)
		.await
		.unwrap();

	assert!(prop.set_value(&PropValue::Text("oops".into())).await.is_err());
	assert_eq!(prop.value(), PropValue::Int(1));
}

#[tokio::test]
async fn test_malformed_and_out_of_range_yield_default() {
	let (registry, service, _adapter, _home) = create_registry().await;

	let prop = registry
		.register(
			PropertyDefinition::builder("bounded.prop", PropKind::Int)
				.default(PropValue::Int(10))
				.min(PropValue::Int(1))
				.max(PropValue::Int(100))
				.dynamic(true)
				.build()
				.unwrap(),
		)
		.await
		.unwrap();

	service.set("bounded.prop", "not a number").await.unwrap();
	assert_eq!(prop.value(), PropValue::Int(10));

	service.set("bounded.prop", "5000").await.unwrap();
	assert_eq!(prop.value(), PropValue::Int(10));

	service.set("bounded.prop", "99").await.unwrap();
	assert_eq!(prop.value(), PropValue::Int(99));
}

#[tokio::test]
async fn test_duplicate_registration_fails() {
	let (registry, _service, _adapter, _home) = create_registry().await;

	let def = || {
		PropertyDefinition::builder("once.only", PropKind::Bool)
			.default(PropValue::Bool(false))
			.dynamic(true)
			.build()
			.unwrap()
	};
	registry.register(def()).await.unwrap();
	assert!(registry.register(def()).await.is_err());
}

#[tokio::test]
async fn test_registration_migrates_bootstrap_value() {
	let (registry, service, _adapter, _home) = create_registry().await;

	service.set_xml("migrated.on.register", "carried over");
	let prop = registry
		.register(
			PropertyDefinition::builder("migrated.on.register", PropKind::Text)
				.default(PropValue::Text("default".into()))
				.dynamic(true)
				.build()
				.unwrap(),
		)
		.await
		.unwrap();

	assert_eq!(prop.value(), PropValue::Text("carried over".into()));
	assert_eq!(service.get_xml("migrated.on.register"), None);
}

#[tokio::test]
async fn test_encrypted_definition() {
	let (registry, service, adapter, _home) = create_registry().await;

	let prop = registry
		.register(
			PropertyDefinition::builder("admin.token", PropKind::Text)
				.default(PropValue::Text("".into()))
				.dynamic(true)
				.encrypted(true)
				.build()
				.unwrap(),
		)
		.await
		.unwrap();

	prop.set_value(&PropValue::Text("top secret".into())).await.unwrap();
	assert_eq!(prop.value(), PropValue::Text("top secret".into()));
	assert!(service.is_property_encrypted("admin.token"));
	assert!(adapter.row("admin.token").unwrap().encrypted);
}

#[tokio::test]
async fn test_restart_required_tracking() {
	let (registry, _service, _adapter, _home) = create_registry().await;

	let prop = registry
		.register(
			PropertyDefinition::builder("listen.port", PropKind::Int)
				.default(PropValue::Int(5222))
				.dynamic(false)
				.build()
				.unwrap(),
		)
		.await
		.unwrap();

	assert!(!prop.is_restart_required());
	prop.set_value(&PropValue::Int(5223)).await.unwrap();
	assert!(prop.is_restart_required());
	prop.clear().await.unwrap();
	assert!(!prop.is_restart_required());
}

#[tokio::test]
async fn test_duration_property() {
	let (registry, service, adapter, _home) = create_registry().await;

	let prop = registry
		.register(
			PropertyDefinition::builder("idle.timeout", PropKind::Duration(DurationUnit::Seconds))
				.default(PropValue::Duration(Duration::from_secs(300)))
				.dynamic(true)
				.build()
				.unwrap(),
		)
		.await
		.unwrap();

	prop.set_value(&PropValue::Duration(Duration::from_secs(90))).await.unwrap();
	// The canonical encoding is in the declared unit
	assert_eq!(adapter.row("idle.timeout").unwrap().value.as_ref(), "90");
	assert_eq!(prop.value(), PropValue::Duration(Duration::from_secs(90)));
	assert_eq!(service.get("idle.timeout").as_deref(), Some("90"));
}

#[tokio::test]
async fn test_provider_property() {
	let (registry, service, _adapter, _home) = create_registry().await;

	let prop = registry
		.register(
			PropertyDefinition::builder("auth.provider", PropKind::Provider)
				.default(PropValue::Provider("native".into()))
				.allowed(["native", "ldap"])
				.dynamic(true)
				.build()
				.unwrap(),
		)
		.await
		.unwrap();

	prop.set_value(&PropValue::Provider("ldap".into())).await.unwrap();
	assert_eq!(prop.value(), PropValue::Provider("ldap".into()));

	assert!(prop.set_value(&PropValue::Provider("bogus".into())).await.is_err());

	// A disallowed stored value falls back to the default
	service.set("auth.provider", "bogus").await.unwrap();
	assert_eq!(prop.value(), PropValue::Provider("native".into()));
}

#[tokio::test]
async fn test_listener_dispatch() {
	let (registry, service, _adapter, _home) = create_registry().await;
	let (tx, mut rx) = mpsc::unbounded_channel();

	registry
		.register(
			PropertyDefinition::builder("observed.prop", PropKind::Int)
				.default(PropValue::Int(0))
				.dynamic(true)
				.listener(move |value| {
					let _ = tx.send(value.clone());
				})
				.build()
				.unwrap(),
		)
		.await
		.unwrap();

	service.set("observed.prop", "7").await.unwrap();
	let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
		.await
		.expect("Listener was not invoked")
		.unwrap();
	assert_eq!(seen, PropValue::Int(7));

	service.delete("observed.prop").await.unwrap();
	let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
		.await
		.expect("Listener was not invoked on delete")
		.unwrap();
	assert_eq!(seen, PropValue::Int(0));
}

#[tokio::test]
async fn test_remove_group() {
	let (registry, _service, _adapter, _home) = create_registry().await;

	for key in ["plugin.a", "plugin.b"] {
		registry
			.register(
				PropertyDefinition::builder(key, PropKind::Bool)
					.default(PropValue::Bool(true))
					.dynamic(true)
					.group("my-plugin")
					.build()
					.unwrap(),
			)
			.await
			.unwrap();
	}
	registry
		.register(
			PropertyDefinition::builder("core.prop", PropKind::Bool)
				.default(PropValue::Bool(true))
				.dynamic(true)
				.build()
				.unwrap(),
		)
		.await
		.unwrap();

	assert_eq!(registry.len(), 3);
	assert_eq!(registry.remove_group("my-plugin"), 2);
	assert_eq!(registry.len(), 1);
	assert!(registry.get("core.prop").is_some());
	assert!(registry.get("plugin.a").is_none());
}

// vim: ts=4
