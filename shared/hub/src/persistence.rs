//! The two keyed blobs per airport plus the shared `active_connections`
//! counter and `ActiveHubEntry` table.

use std::collections::HashMap;

use bars_protocol::{AirportObject, ObjectState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::model::AirportState;
use crate::ports::DurableStateStore;

pub fn airport_state_key(airport: &str) -> String {
	format!("airport_state:{airport}")
}

pub fn airport_shared_state_key(airport: &str) -> String {
	format!("airport_shared_state:{airport}")
}

pub const ACTIVE_HUB_PREFIX: &str = "active_hub:";
pub const ACTIVE_CONNECTIONS_COUNTER: &str = "active_connections";

/// The wire shape of `airport_state:<icao>`: note the per-object field
/// names (`controllerId`, `timestamp`) differ from the live/wire
/// `AirportObject`'s (`lastControllerId`, `updatedAt`) — this is the
/// persisted representation's own shape, not a re-export of it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedAirportState {
	pub airport: String,
	pub objects: HashMap<String, PersistedObject>,
	#[serde(rename = "lastUpdate")]
	pub last_update: i64,
	pub controllers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedObject {
	pub id: String,
	pub state: Value,
	#[serde(rename = "controllerId", skip_serializing_if = "Option::is_none")]
	pub controller_id: Option<String>,
	pub timestamp: i64,
}

impl From<&AirportObject> for PersistedObject {
	fn from(object: &AirportObject) -> Self {
		Self {
			id: object.id.clone(),
			state: object.state.as_value(),
			controller_id: object.last_controller_id.clone(),
			timestamp: object.updated_at,
		}
	}
}

impl PersistedObject {
	fn into_airport_object(self) -> Option<AirportObject> {
		let state = ObjectState::validate(&self.state).ok()?;
		Some(AirportObject {
			id: self.id,
			state,
			last_controller_id: self.controller_id,
			updated_at: self.timestamp,
		})
	}
}

impl PersistedAirportState {
	pub fn from_state(airport: &str, state: &AirportState) -> Self {
		Self {
			airport: airport.to_string(),
			objects: state
				.objects
				.iter()
				.map(|(id, object)| (id.clone(), PersistedObject::from(object)))
				.collect(),
			last_update: state.last_update_at,
			controllers: state.controller_ids.iter().cloned().collect(),
		}
	}

	pub fn into_state(self) -> AirportState {
		AirportState {
			objects: self
				.objects
				.into_values()
				.filter_map(|object| {
					let airport_object = object.into_airport_object()?;
					Some((airport_object.id.clone(), airport_object))
				})
				.collect(),
			last_update_at: self.last_update,
			controller_ids: self.controllers.into_iter().collect(),
		}
	}
}

/// Loads `airport_state:<airport>`, tolerating a missing or malformed blob
/// by returning the default empty state.
pub async fn load_airport_state(
	store: &dyn DurableStateStore,
	airport: &str,
) -> AirportState {
	let Some(raw) = store.get(&airport_state_key(airport)).await else {
		return AirportState::default()
	};

	match serde_json::from_str::<PersistedAirportState>(&raw) {
		Ok(persisted) => persisted.into_state(),
		Err(err) => {
			warn!("malformed airport_state blob for {airport}: {err}");
			AirportState::default()
		},
	}
}

/// Loads `airport_shared_state:<airport>`, defaulting to an empty object.
pub async fn load_shared_state(
	store: &dyn DurableStateStore,
	airport: &str,
) -> Value {
	let Some(raw) = store.get(&airport_shared_state_key(airport)).await else {
		return Value::Object(Default::default())
	};

	match serde_json::from_str::<Value>(&raw) {
		Ok(value) if value.is_object() => value,
		Ok(_) | Err(_) => {
			warn!("malformed airport_shared_state blob for {airport}");
			Value::Object(Default::default())
		},
	}
}

/// Best-effort write: a blob exceeding `max_chars` is skipped with a
/// warning, never a fatal error.
pub async fn save_airport_state(
	store: &dyn DurableStateStore,
	airport: &str,
	state: &AirportState,
	max_chars: usize,
) {
	let persisted = PersistedAirportState::from_state(airport, state);
	let Ok(serialized) = serde_json::to_string(&persisted) else {
		warn!("failed to serialize airport_state for {airport}");
		return
	};

	if serialized.chars().count() > max_chars {
		warn!("airport_state for {airport} exceeds MAX_STATE_SIZE, skipping write");
		return
	}

	store.set(&airport_state_key(airport), serialized).await;
}

pub async fn save_shared_state(
	store: &dyn DurableStateStore,
	airport: &str,
	shared_state: &Value,
	max_chars: usize,
) {
	let Ok(serialized) = serde_json::to_string(shared_state) else {
		warn!("failed to serialize shared_state for {airport}");
		return
	};

	if serialized.chars().count() > max_chars {
		warn!("shared_state for {airport} exceeds MAX_STATE_SIZE, skipping write");
		return
	}

	store
		.set(&airport_shared_state_key(airport), serialized)
		.await;
}

#[cfg(test)]
mod tests {
	use super::*;
	use bars_protocol::ObjectState;
	use serde_json::json;

	#[test]
	fn persisted_object_round_trips() {
		let object = AirportObject {
			id: "SB1".into(),
			state: ObjectState::Bool(true),
			last_controller_id: Some("u1".into()),
			updated_at: 123,
		};

		let persisted = PersistedObject::from(&object);
		let back = persisted.into_airport_object().unwrap();
		assert_eq!(back.id, "SB1");
		assert_eq!(back.state, ObjectState::Bool(true));
		assert_eq!(back.last_controller_id.as_deref(), Some("u1"));
	}

	#[test]
	fn malformed_persisted_state_becomes_empty() {
		let value = json!("not an object at all");
		let result = serde_json::from_value::<PersistedAirportState>(value);
		assert!(result.is_err());
	}
}
