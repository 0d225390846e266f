//! Routes an airport code to its Hub, creating one on first use and
//! keeping the process-wide active-hubs table current.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::HubConfig;
use crate::error::{is_valid_airport, AcceptError};
use crate::hub::{Hub, Ports};
use crate::model::{now_ms, ActiveHubEntry};
use crate::persistence::ACTIVE_HUB_PREFIX;

pub struct HubRegistry {
	ports: Arc<Ports>,
	config: Arc<HubConfig>,
	hubs: RwLock<HashMap<String, Arc<Hub>>>,
}

impl HubRegistry {
	pub fn new(ports: Arc<Ports>, config: Arc<HubConfig>) -> Self {
		Self {
			ports,
			config,
			hubs: RwLock::new(HashMap::new()),
		}
	}

	/// Resolve `airport` to its Hub, creating and registering one the
	/// first time it's requested. Double-checks under the write lock so
	/// two concurrent first-connects can't create duplicate Hubs for the
	/// same airport.
	pub async fn route(self: &Arc<Self>, airport: &str) -> Result<Arc<Hub>, AcceptError> {
		if !is_valid_airport(airport) {
			return Err(AcceptError::InvalidAirport)
		}

		if let Some(hub) = self.hubs.read().await.get(airport) {
			return Ok(hub.clone())
		}

		let mut hubs = self.hubs.write().await;
		if let Some(hub) = hubs.get(airport) {
			return Ok(hub.clone())
		}

		let hub = Arc::new(
			Hub::new(airport.to_string(), self.ports.clone(), self.config.clone()).await,
		);
		hubs.insert(airport.to_string(), hub.clone());
		info!(%airport, "hub created");

		let maintenance = hub.clone();
		tokio::spawn(async move { maintenance.run_maintenance().await });

		Ok(hub)
	}

	/// The read-only facade backing `GET /state?airport=<icao>[&offline=true]`:
	/// routes without creating a Hub for an airport that has never
	/// connected. `offline_forced` mirrors the `offline=true` query
	/// parameter: forces the Point Catalogue baseline even if controllers
	/// are currently connected.
	pub async fn get_state_snapshot(
		&self,
		airport: &str,
		offline_forced: bool,
	) -> Result<Value, AcceptError> {
		if !is_valid_airport(airport) {
			return Err(AcceptError::InvalidAirport)
		}

		match self.hubs.read().await.get(airport) {
			Some(hub) => Ok(hub.state_snapshot_for_facade(offline_forced).await),
			None => Ok(serde_json::json!({
				"airport": airport,
				"controllers": [],
				"pilots": [],
				"objects": [],
				"offline": true,
			})),
		}
	}

	/// `GET /state?airport=all`: every currently-live Hub plus every
	/// `ActiveHubEntry` row in the durable store not yet pruned as stale,
	/// deduplicated by hub id.
	pub async fn list_active(&self) -> Vec<ActiveHubEntry> {
		let now = now_ms();
		let mut by_id = HashMap::new();

		for (key, value) in self.ports.store.list_prefixed(ACTIVE_HUB_PREFIX).await {
			let Some(hub_id) = key.strip_prefix(ACTIVE_HUB_PREFIX) else { continue };
			if let Ok(entry) = serde_json::from_str::<ActiveHubEntry>(&value) {
				if !entry.is_stale(now) {
					by_id.insert(hub_id.to_string(), entry);
				}
			}
		}

		for (airport, hub) in self.hubs.read().await.iter() {
			if !hub.is_idle().await {
				let snapshot = hub.state_snapshot_for_facade(false).await;
				let controllers = snapshot["controllers"].as_array().map(Vec::len).unwrap_or(0);
				by_id.insert(
					airport.clone(),
					ActiveHubEntry {
						hub_id: airport.clone(),
						label: ActiveHubEntry::make_label(airport, controllers, 0, 0),
						last_updated_at: now,
					},
				);
			}
		}

		let mut entries: Vec<_> = by_id.into_values().collect();
		entries.sort_by(|a, b| a.hub_id.cmp(&b.hub_id));
		entries
	}

	/// Drops every Hub with no open sessions from the in-memory map. The
	/// Hub itself and its durable state are left alone; only the route
	/// table entry is reclaimed, so a later reconnect re-loads it fresh.
	pub async fn shutdown_idle(&self) {
		let mut hubs = self.hubs.write().await;
		let mut idle = Vec::new();

		for (airport, hub) in hubs.iter() {
			if hub.is_idle().await {
				idle.push(airport.clone());
			}
		}

		for airport in idle {
			hubs.remove(&airport);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::TestPorts;

	#[tokio::test]
	async fn rejects_malformed_airport_codes() {
		let registry = Arc::new(HubRegistry::new(
			TestPorts::default().into_ports(),
			Arc::new(HubConfig::default()),
		));

		assert_eq!(
			registry.route("kjfk").await.unwrap_err(),
			AcceptError::InvalidAirport
		);
		assert_eq!(
			registry.get_state_snapshot("too-long", false).await.unwrap_err(),
			AcceptError::InvalidAirport
		);
	}

	#[tokio::test]
	async fn unrouted_airport_reports_offline() {
		let registry = Arc::new(HubRegistry::new(
			TestPorts::default().into_ports(),
			Arc::new(HubConfig::default()),
		));

		let snapshot = registry.get_state_snapshot("KJFK", false).await.unwrap();
		assert_eq!(snapshot["offline"], true);
	}

	#[tokio::test]
	async fn offline_forced_overrides_a_live_controller_snapshot() {
		let registry = Arc::new(HubRegistry::new(
			TestPorts::default().into_ports(),
			Arc::new(HubConfig::default()),
		));

		let hub = registry.route("KJFK").await.unwrap();
		hub.connect("C1".into(), bars_protocol::ClientKind::Controller).await;

		let live = registry.get_state_snapshot("KJFK", false).await.unwrap();
		assert_eq!(live["offline"], false);

		let forced = registry.get_state_snapshot("KJFK", true).await.unwrap();
		assert_eq!(forced["offline"], true);
	}

	#[tokio::test]
	async fn routing_twice_returns_the_same_hub() {
		let registry = Arc::new(HubRegistry::new(
			TestPorts::default().into_ports(),
			Arc::new(HubConfig::default()),
		));

		let a = registry.route("KJFK").await.unwrap();
		let b = registry.route("KJFK").await.unwrap();
		assert!(Arc::ptr_eq(&a, &b));
	}
}
