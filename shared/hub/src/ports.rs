//! The external collaborators deliberately kept out of core scope: the
//! identity oracle ("VATSIM"), the key directory, the point catalogue,
//! the durable state store and the analytics sink. Each is a trait so
//! the Hub never depends on a concrete backend; `tool/server` wires in
//! the local adapters this workspace ships.

use async_trait::async_trait;

use bars_config::CatalogueObject;

/// A user's live network status, as reported by the identity oracle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserStatus {
	pub callsign: String,
	pub kind: NetworkKind,
}

/// The oracle's raw classification, before observer-callsign detection is
/// applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkKind {
	Atc,
	Pilot,
}

/// Resolves an opaque bearer token to a user's live status, and reports
/// bans.
///
/// Calls are expected to carry their own timeout (`IDENTITY_TIMEOUT`) — a
/// transport error or timeout must be treated as "not present", never
/// surfaced as an error to the caller.
#[async_trait]
pub trait IdentityOracle: Send + Sync {
	async fn status(&self, user_id: &str) -> Option<UserStatus>;
	async fn is_banned(&self, user_id: &str) -> bool;
}

/// Resolves an API key to a stable user id, and reports bans.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
	async fn resolve(&self, api_key: &str) -> Option<String>;
	async fn is_banned(&self, user_id: &str) -> bool;
}

/// Returns the static list of airfield objects for an airport, with their
/// offline on/off baseline category.
#[async_trait]
pub trait PointCatalogue: Send + Sync {
	async fn objects(&self, airport: &str) -> Vec<CatalogueObject>;
}

/// Key/value persistence scoped to a single Hub's two keys, plus the
/// shared `ActiveHubEntry` table and connection counter.
///
/// Writes are best-effort: implementations should log and swallow
/// failures rather than propagate them onto the Hub's hot path.
#[async_trait]
pub trait DurableStateStore: Send + Sync {
	async fn get(&self, key: &str) -> Option<String>;
	async fn set(&self, key: &str, value: String);
	async fn delete(&self, key: &str);

	/// All keys (and their values) with the given prefix, used to
	/// enumerate `ActiveHubEntry` rows for `airport=all` queries.
	async fn list_prefixed(&self, prefix: &str) -> Vec<(String, String)>;

	async fn incr_counter(&self, key: &str, delta: i64) -> i64;
}

/// An analytics event. Fields are intentionally loose (`serde_json::Value`
/// payload) since the real analytics sink's schema lives outside this
/// core.
#[derive(Clone, Debug)]
pub struct AnalyticsEvent {
	pub name: &'static str,
	pub airport: String,
	pub payload: serde_json::Value,
}

/// Fire-and-forget event emission: the Hub may not await it on any hot
/// path, so `record` is synchronous and non-blocking by construction,
/// not merely by convention.
pub trait AnalyticsSink: Send + Sync {
	fn record(&self, event: AnalyticsEvent);
}
