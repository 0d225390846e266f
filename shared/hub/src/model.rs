use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use bars_protocol::{AirportObject, ClientKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Milliseconds since the Unix epoch — the packet-timestamp and
/// `updatedAt`/`lastUpdateAt` representation throughout.
pub fn now_ms() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as i64
}

/// Identifies one connected socket within a single Hub. Only unique
/// per-Hub, assigned from an in-process counter on accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// The per-socket record a Hub keeps.
#[derive(Clone, Debug)]
pub struct Session {
	pub id: SessionId,
	pub user_id: String,
	pub kind: ClientKind,
	pub airport: String,
	/// Monotonic milliseconds (`Instant`-relative), refreshed by every
	/// inbound packet and compared against `HEARTBEAT_TIMEOUT`.
	pub last_heartbeat_at: tokio::time::Instant,
	/// Counts heartbeat ticks observed, so the revalidation loop can fire
	/// every other tick instead of on every heartbeat.
	pub heartbeat_ticks: u32,
}

impl Session {
	pub fn touch_heartbeat(&mut self) {
		self.last_heartbeat_at = tokio::time::Instant::now();
	}
}

/// The authoritative in-memory model of one airport's object state.
/// The persisted shape of this, `PersistedAirportState`, lives in
/// `persistence` since its field names diverge from the live model's.
#[derive(Clone, Debug, Default)]
pub struct AirportState {
	pub objects: HashMap<String, AirportObject>,
	pub last_update_at: i64,
	pub controller_ids: HashSet<String>,
}

/// The free-form per-airport scratchpad. Always a JSON object at the top
/// level.
#[derive(Clone, Debug)]
pub struct SharedState(pub Value);

impl Default for SharedState {
	fn default() -> Self {
		Self(Value::Object(Default::default()))
	}
}

/// A row in the process-wide active-hubs table, written through the
/// durable state store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActiveHubEntry {
	pub hub_id: String,
	pub label: String,
	#[serde(rename = "lastUpdatedAt")]
	pub last_updated_at: i64,
}

impl ActiveHubEntry {
	/// `"<icao>/<ctlCount>/<pilotCount>/<obsCount>"`.
	pub fn make_label(
		icao: &str,
		controllers: usize,
		pilots: usize,
		observers: usize,
	) -> String {
		format!("{icao}/{controllers}/{pilots}/{observers}")
	}

	/// Rows older than this are pruned by readers.
	pub const GC_HORIZON_MS: i64 = 2 * 24 * 60 * 60 * 1000;

	pub fn is_stale(&self, now: i64) -> bool {
		now.saturating_sub(self.last_updated_at) > Self::GC_HORIZON_MS
	}
}

/// Per-airport connection counts, tracked incrementally so the label in
/// [`ActiveHubEntry`] can be recomputed cheaply.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionCounts {
	pub controllers: usize,
	pub pilots: usize,
	pub observers: usize,
}

impl ConnectionCounts {
	pub fn total(&self) -> usize {
		self.controllers + self.pilots + self.observers
	}

	pub fn add(&mut self, kind: ClientKind) {
		match kind {
			ClientKind::Controller => self.controllers += 1,
			ClientKind::Pilot => self.pilots += 1,
			ClientKind::Observer => self.observers += 1,
		}
	}

	pub fn remove(&mut self, kind: ClientKind) {
		match kind {
			ClientKind::Controller => self.controllers = self.controllers.saturating_sub(1),
			ClientKind::Pilot => self.pilots = self.pilots.saturating_sub(1),
			ClientKind::Observer => self.observers = self.observers.saturating_sub(1),
		}
	}
}
