use serde::{Deserialize, Serialize};
use serde_json::Value;

/// State of a single airfield object: either the legacy on/off boolean, or
/// an arbitrary JSON object used as a deep-merge patch target. Never an
/// array, never null — enforced by [`ObjectState::validate`], not by the
/// wire type itself, since the untagged representation has to accept
/// whatever a `state` or `patch` field contains before it can be checked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectState {
	Bool(bool),
	Object(serde_json::Map<String, Value>),
}

impl ObjectState {
	pub fn validate(value: &Value) -> Result<Self, InvalidObjectState> {
		match value {
			Value::Bool(b) => Ok(Self::Bool(*b)),
			Value::Object(map) => Ok(Self::Object(map.clone())),
			_ => Err(InvalidObjectState),
		}
	}

	pub fn as_value(&self) -> Value {
		match self {
			Self::Bool(b) => Value::Bool(*b),
			Self::Object(map) => Value::Object(map.clone()),
		}
	}

	pub fn empty_object() -> Self {
		Self::Object(serde_json::Map::new())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidObjectState;

impl std::fmt::Display for InvalidObjectState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "object state must be a boolean or an object, never an array or null")
	}
}

impl std::error::Error for InvalidObjectState {}

/// A single illuminated airfield element, as held in `AirportState.objects`
/// and sent to clients as part of a snapshot or update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AirportObject {
	pub id: String,
	pub state: ObjectState,
	#[serde(rename = "lastControllerId", skip_serializing_if = "Option::is_none")]
	pub last_controller_id: Option<String>,
	#[serde(rename = "updatedAt")]
	pub updated_at: i64,
}

impl AirportObject {
	pub fn new(id: impl Into<String>, state: ObjectState, now: i64) -> Self {
		Self {
			id: id.into(),
			state,
			last_controller_id: None,
			updated_at: now,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn bool_state_round_trips() {
		let value = json!(true);
		let state = ObjectState::validate(&value).unwrap();
		assert_eq!(state, ObjectState::Bool(true));
		assert_eq!(state.as_value(), value);
	}

	#[test]
	fn object_state_round_trips() {
		let value = json!({"on": true, "color": "red"});
		let state = ObjectState::validate(&value).unwrap();
		assert_eq!(state.as_value(), value);
	}

	#[test]
	fn arrays_and_null_are_rejected() {
		assert!(ObjectState::validate(&json!([1, 2])).is_err());
		assert!(ObjectState::validate(&json!(null)).is_err());
	}
}
