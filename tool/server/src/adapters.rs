//! Local, self-contained implementations of `bars-hub`'s ports, for
//! running a complete hub off nothing but CLI flags: no real VATSIM
//! connection, no external analytics backend, persistence either
//! entirely in memory or in flat JSON files under a directory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bars_config::{Catalogue, CatalogueObject};
use bars_hub::{AnalyticsEvent, AnalyticsSink, DurableStateStore, IdentityOracle, KeyDirectory, NetworkKind, PointCatalogue, UserStatus};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Classifies connecting clients purely from the static key lists handed
/// to the binary on the command line (`-c`/`-o`/`-p`), the same shape as
/// the reference server's `Config { controller_keys, observer_keys }`
/// extended with a pilot list. The resolved "user id" is just the key
/// itself, so repeated connections with the same key are recognised as
/// the same user for controller-set bookkeeping.
pub struct StaticDirectory {
	controller_keys: HashSet<String>,
	observer_keys: HashSet<String>,
	pilot_keys: HashSet<String>,
}

impl StaticDirectory {
	pub fn new(
		controller_keys: Vec<String>,
		observer_keys: Vec<String>,
		pilot_keys: Vec<String>,
	) -> Self {
		let controller_keys: HashSet<_> = controller_keys.into_iter().collect();
		let observer_keys: HashSet<_> = observer_keys.into_iter().collect();
		let pilot_keys: HashSet<_> = pilot_keys.into_iter().collect();

		if !controller_keys.is_disjoint(&observer_keys) {
			warn!("overlapping controller and observer keys");
		}

		Self {
			controller_keys,
			observer_keys,
			pilot_keys,
		}
	}
}

#[async_trait]
impl KeyDirectory for StaticDirectory {
	async fn resolve(&self, api_key: &str) -> Option<String> {
		if self.controller_keys.contains(api_key)
			|| self.observer_keys.contains(api_key)
			|| self.pilot_keys.contains(api_key)
		{
			Some(api_key.to_string())
		} else {
			None
		}
	}

	async fn is_banned(&self, _user_id: &str) -> bool {
		false
	}
}

#[async_trait]
impl IdentityOracle for StaticDirectory {
	async fn status(&self, user_id: &str) -> Option<UserStatus> {
		if self.observer_keys.contains(user_id) {
			Some(UserStatus {
				callsign: format!("{user_id}_OBS"),
				kind: NetworkKind::Atc,
			})
		} else if self.controller_keys.contains(user_id) {
			Some(UserStatus {
				callsign: user_id.to_string(),
				kind: NetworkKind::Atc,
			})
		} else if self.pilot_keys.contains(user_id) {
			Some(UserStatus {
				callsign: user_id.to_string(),
				kind: NetworkKind::Pilot,
			})
		} else {
			None
		}
	}

	async fn is_banned(&self, _user_id: &str) -> bool {
		false
	}
}

/// A [`PointCatalogue`] backed by a single `bars-config` catalogue file
/// loaded once at startup.
pub struct FileCatalogue {
	catalogue: Catalogue,
}

impl FileCatalogue {
	pub fn load(path: &Path) -> anyhow::Result<Self> {
		let file = std::fs::File::open(path)?;
		let catalogue = Catalogue::load(file)?;
		Ok(Self { catalogue })
	}
}

#[async_trait]
impl PointCatalogue for FileCatalogue {
	async fn objects(&self, airport: &str) -> Vec<CatalogueObject> {
		self.catalogue
			.airport(airport)
			.map(|a| a.objects.clone())
			.unwrap_or_default()
	}
}

/// The catalogue used when no `--catalogue` file is given: every airport
/// has no known static objects, so every offline snapshot is empty.
pub struct EmptyCatalogue;

#[async_trait]
impl PointCatalogue for EmptyCatalogue {
	async fn objects(&self, _airport: &str) -> Vec<CatalogueObject> {
		Vec::new()
	}
}

/// Process-lifetime-only state store, matching the reference server's own
/// persistence model (none — everything lives in the `State` map and is
/// lost on restart).
#[derive(Default)]
pub struct InMemoryStateStore {
	entries: RwLock<HashMap<String, String>>,
	counters: RwLock<HashMap<String, i64>>,
}

#[async_trait]
impl DurableStateStore for InMemoryStateStore {
	async fn get(&self, key: &str) -> Option<String> {
		self.entries.read().await.get(key).cloned()
	}

	async fn set(&self, key: &str, value: String) {
		self.entries.write().await.insert(key.to_string(), value);
	}

	async fn delete(&self, key: &str) {
		self.entries.write().await.remove(key);
	}

	async fn list_prefixed(&self, prefix: &str) -> Vec<(String, String)> {
		self.entries
			.read()
			.await
			.iter()
			.filter(|(k, _)| k.starts_with(prefix))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect()
	}

	async fn incr_counter(&self, key: &str, delta: i64) -> i64 {
		let mut counters = self.counters.write().await;
		let entry = counters.entry(key.to_string()).or_insert(0);
		*entry += delta;
		*entry
	}
}

/// A [`DurableStateStore`] that survives restarts by keeping one JSON
/// file per key under `base_dir`, in the spirit of `client/src/config.rs`'s
/// `tokio::fs`-based cache reads and writes.
pub struct FileStateStore {
	base_dir: PathBuf,
	counters: RwLock<std::collections::HashMap<String, i64>>,
}

impl FileStateStore {
	pub fn new(base_dir: PathBuf) -> Self {
		Self {
			base_dir,
			counters: RwLock::new(std::collections::HashMap::new()),
		}
	}

	/// Only `/` is unsafe as a path component on this store's keys (`:`
	/// and the rest are left untouched) so `list_prefixed` can match a
	/// prefix like `active_hub:` directly against the file stem without
	/// needing to invert any encoding.
	fn path_for(&self, key: &str) -> PathBuf {
		let safe: String = key
			.chars()
			.map(|c| if c == '/' || c == '\\' { '_' } else { c })
			.collect();
		self.base_dir.join(format!("{safe}.json"))
	}
}

#[async_trait]
impl DurableStateStore for FileStateStore {
	async fn get(&self, key: &str) -> Option<String> {
		tokio::fs::read_to_string(self.path_for(key)).await.ok()
	}

	async fn set(&self, key: &str, value: String) {
		if let Err(err) = tokio::fs::create_dir_all(&self.base_dir).await {
			warn!("failed to create state dir: {err}");
			return
		}
		if let Err(err) = tokio::fs::write(self.path_for(key), value).await {
			warn!("failed to write state file for {key}: {err}");
		}
	}

	async fn delete(&self, key: &str) {
		let _ = tokio::fs::remove_file(self.path_for(key)).await;
	}

	async fn list_prefixed(&self, prefix: &str) -> Vec<(String, String)> {
		let mut out = Vec::new();
		let Ok(mut entries) = tokio::fs::read_dir(&self.base_dir).await else {
			return out
		};

		while let Ok(Some(entry)) = entries.next_entry().await {
			let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
			let Some(stem) = name.strip_suffix(".json") else { continue };
			if !stem.starts_with(prefix) {
				continue
			}
			if let Ok(contents) = tokio::fs::read_to_string(entry.path()).await {
				out.push((stem.to_string(), contents));
			}
		}

		out
	}

	async fn incr_counter(&self, key: &str, delta: i64) -> i64 {
		let mut counters = self.counters.write().await;
		let entry = counters.entry(key.to_string()).or_insert(0);
		*entry += delta;
		*entry
	}
}

/// The analytics sink used when no real pipeline is configured: every
/// event is just logged, matching the reference server's own lack of a
/// dedicated analytics backend.
pub struct TracingAnalyticsSink;

impl AnalyticsSink for TracingAnalyticsSink {
	fn record(&self, event: AnalyticsEvent) {
		info!(airport = %event.airport, name = event.name, payload = %event.payload, "analytics event");
	}
}
