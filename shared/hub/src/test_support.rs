//! In-memory port stand-ins shared by this crate's own unit tests. Not
//! compiled into the library proper.
#![cfg(test)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bars_config::CatalogueObject;

use crate::hub::Ports;
use crate::ports::{
	AnalyticsEvent, AnalyticsSink, DurableStateStore, IdentityOracle, KeyDirectory,
	PointCatalogue, UserStatus,
};

#[derive(Default)]
pub struct TestPorts {
	catalogue: Mutex<HashMap<String, Vec<CatalogueObject>>>,
}

impl TestPorts {
	pub fn seed_catalogue(&self, airport: &str, objects: &[(&str, bars_config::ObjectKind)]) {
		self.catalogue.lock().unwrap().insert(
			airport.to_string(),
			objects
				.iter()
				.map(|(id, kind)| CatalogueObject {
					id: (*id).to_string(),
					kind: *kind,
				})
				.collect(),
		);
	}

	pub fn into_ports(self) -> Arc<Ports> {
		Arc::new(Ports {
			identity: Arc::new(NullIdentityOracle),
			keys: Arc::new(NullKeyDirectory),
			catalogue: Arc::new(StaticCatalogue(self.catalogue.into_inner().unwrap())),
			store: Arc::new(InMemoryStore::default()),
			analytics: Arc::new(NullAnalyticsSink),
		})
	}
}

struct NullIdentityOracle;

#[async_trait]
impl IdentityOracle for NullIdentityOracle {
	async fn status(&self, _user_id: &str) -> Option<UserStatus> {
		None
	}

	async fn is_banned(&self, _user_id: &str) -> bool {
		false
	}
}

struct NullKeyDirectory;

#[async_trait]
impl KeyDirectory for NullKeyDirectory {
	async fn resolve(&self, _api_key: &str) -> Option<String> {
		None
	}

	async fn is_banned(&self, _user_id: &str) -> bool {
		false
	}
}

struct StaticCatalogue(HashMap<String, Vec<CatalogueObject>>);

#[async_trait]
impl PointCatalogue for StaticCatalogue {
	async fn objects(&self, airport: &str) -> Vec<CatalogueObject> {
		self.0.get(airport).cloned().unwrap_or_default()
	}
}

#[derive(Default)]
struct InMemoryStore {
	kv: Mutex<HashMap<String, String>>,
	counters: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl DurableStateStore for InMemoryStore {
	async fn get(&self, key: &str) -> Option<String> {
		self.kv.lock().unwrap().get(key).cloned()
	}

	async fn set(&self, key: &str, value: String) {
		self.kv.lock().unwrap().insert(key.to_string(), value);
	}

	async fn delete(&self, key: &str) {
		self.kv.lock().unwrap().remove(key);
	}

	async fn list_prefixed(&self, prefix: &str) -> Vec<(String, String)> {
		self.kv
			.lock()
			.unwrap()
			.iter()
			.filter(|(k, _)| k.starts_with(prefix))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect()
	}

	async fn incr_counter(&self, key: &str, delta: i64) -> i64 {
		let mut counters = self.counters.lock().unwrap();
		let entry = counters.entry(key.to_string()).or_insert(0);
		*entry += delta;
		*entry
	}
}

struct NullAnalyticsSink;

impl AnalyticsSink for NullAnalyticsSink {
	fn record(&self, _event: AnalyticsEvent) {}
}
