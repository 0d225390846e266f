use std::time::Duration;

use bars_protocol::WireLimits;
use serde::{Deserialize, Serialize};

/// Every runtime tunable a Hub reads, with its documented default. Shared
/// by every Hub a [`crate::registry::HubRegistry`] creates.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
	pub heartbeat_interval_ms: u64,
	pub heartbeat_timeout_ms: u64,
	pub max_state_size: usize,
	pub max_packet_chars: usize,
	pub max_patch_chars: usize,
	pub merge_max_depth: usize,
	pub max_properties: usize,
	pub max_array_size: usize,
	pub stale_ttl_ms: i64,
	pub identity_timeout_ms: u64,
	pub active_hub_throttle_ms: i64,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			heartbeat_interval_ms: 60_000,
			heartbeat_timeout_ms: 70_000,
			max_state_size: 1_000_000,
			max_packet_chars: 50_000,
			max_patch_chars: 10_240,
			merge_max_depth: 20,
			max_properties: 100,
			max_array_size: 1000,
			stale_ttl_ms: 120_000,
			identity_timeout_ms: 5_000,
			active_hub_throttle_ms: 5_000,
		}
	}
}

impl HubConfig {
	pub fn heartbeat_interval(&self) -> Duration {
		Duration::from_millis(self.heartbeat_interval_ms)
	}

	pub fn heartbeat_timeout(&self) -> Duration {
		Duration::from_millis(self.heartbeat_timeout_ms)
	}

	pub fn identity_timeout(&self) -> Duration {
		Duration::from_millis(self.identity_timeout_ms)
	}

	pub fn wire_limits(&self) -> WireLimits {
		WireLimits {
			max_packet_chars: self.max_packet_chars,
			max_patch_chars: self.max_patch_chars,
			merge: bars_protocol::MergeLimits {
				max_depth: self.merge_max_depth,
				max_properties: self.max_properties,
				max_array_size: self.max_array_size,
				max_key_len: 100,
			},
		}
	}
}
