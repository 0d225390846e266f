use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::object::{AirportObject, ObjectState};

/// A client's role, derived from the identity oracle's live status.
/// Serialized lower-case on the wire (`connectionType`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
	Controller,
	Pilot,
	Observer,
}

impl ClientKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Controller => "controller",
			Self::Pilot => "pilot",
			Self::Observer => "observer",
		}
	}
}

/// The `type` discriminant carried by every packet, both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketType {
	Heartbeat,
	HeartbeatAck,
	Close,
	GetState,
	StateUpdate,
	SharedStateUpdate,
	StopbarCrossing,
	InitialState,
	StateSnapshot,
	ControllerConnect,
	ControllerDisconnect,
	Error,
}

/// The wire shape of every inbound packet before type-specific payload
/// validation: `type`, an optional `airport` override, an optional client
/// `timestamp` (ignored — the server always stamps its own), and a `data`
/// object whose shape depends on `type`.
#[derive(Clone, Debug, Deserialize)]
pub struct RawEnvelope {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub airport: Option<String>,
	#[serde(default)]
	pub timestamp: Option<i64>,
	#[serde(default = "default_data")]
	pub data: Value,
}

fn default_data() -> Value {
	Value::Object(Default::default())
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
	#[error("unknown_type")]
	UnknownType,
	#[error("invalid_packet: {0}")]
	InvalidPacket(String),
	#[error("not_authorized_for_packet")]
	NotAuthorized,
}

/// One of `objectId`'s two possible companions in a `STATE_UPDATE` —
/// exactly one of `patch` or `state` must be present.
#[derive(Clone, Debug)]
pub enum StateUpdatePayload {
	Patch(Value),
	State(ObjectState),
}

#[derive(Clone, Debug)]
pub enum Upstream {
	Heartbeat,
	GetState,
	StateUpdate {
		object_id: String,
		payload: StateUpdatePayload,
	},
	SharedStateUpdate {
		shared_state_patch: Value,
	},
	StopbarCrossing {
		object_id: String,
	},
	Close,
}

impl Upstream {
	/// Parse a decoded envelope into a typed message. Structural validation
	/// only — role authorization (`not_authorized_for_packet`) is the
	/// dispatcher's job, since it depends on the session, not the packet.
	pub fn decode(kind: &str, data: Value) -> Result<Self, ProtocolError> {
		match kind {
			"HEARTBEAT" => Ok(Self::Heartbeat),
			"GET_STATE" => Ok(Self::GetState),
			"CLOSE" => Ok(Self::Close),
			"STATE_UPDATE" => {
				let object_id = require_object_id(&data)?;

				let patch = data.get("patch");
				let state = data.get("state");

				let payload = match (patch, state) {
					(Some(patch), None) if patch.is_object() => {
						StateUpdatePayload::Patch(patch.clone())
					},
					(None, Some(state)) => {
						let state = ObjectState::validate(state).map_err(|_| {
							ProtocolError::InvalidPacket(
								"state must be a boolean or object".into(),
							)
						})?;
						StateUpdatePayload::State(state)
					},
					(Some(_), Some(_)) => {
						return Err(ProtocolError::InvalidPacket(
							"exactly one of patch or state must be given".into(),
						))
					},
					_ => {
						return Err(ProtocolError::InvalidPacket(
							"missing patch or state".into(),
						))
					},
				};

				Ok(Self::StateUpdate { object_id, payload })
			},
			"SHARED_STATE_UPDATE" => {
				let patch = data.get("sharedStatePatch").ok_or_else(|| {
					ProtocolError::InvalidPacket("missing sharedStatePatch".into())
				})?;

				if !patch.is_object() {
					return Err(ProtocolError::InvalidPacket(
						"sharedStatePatch must be an object".into(),
					))
				}

				Ok(Self::SharedStateUpdate {
					shared_state_patch: patch.clone(),
				})
			},
			"STOPBAR_CROSSING" => {
				let object_id = require_object_id(&data)?;
				Ok(Self::StopbarCrossing { object_id })
			},
			_ => Err(ProtocolError::UnknownType),
		}
	}
}

fn require_object_id(data: &Value) -> Result<String, ProtocolError> {
	let object_id = data
		.get("objectId")
		.and_then(Value::as_str)
		.ok_or_else(|| ProtocolError::InvalidPacket("missing objectId".into()))?;

	if !is_valid_object_id(object_id) {
		return Err(ProtocolError::InvalidPacket(
			"objectId has an invalid format".into(),
		))
	}

	Ok(object_id.to_string())
}

/// `^[A-Za-z0-9_-]+$`, checked by hand rather than pulling in `regex` for
/// one character class.
pub fn is_valid_object_id(s: &str) -> bool {
	!s.is_empty()
		&& s.bytes().all(|b| {
			b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
		})
}

/// Every server-to-client message. `kind`/`data` are derived on demand
/// rather than stored, so a `Downstream` value can't drift from its own
/// wire representation.
#[derive(Clone, Debug)]
pub enum Downstream {
	Heartbeat,
	HeartbeatAck,
	Error {
		message: String,
	},
	ControllerConnect {
		controller_id: String,
	},
	ControllerDisconnect {
		controller_id: String,
	},
	InitialState {
		objects: Vec<AirportObject>,
		connection_type: ClientKind,
		offline: bool,
		shared_state: Value,
	},
	StateSnapshot {
		objects: Vec<AirportObject>,
		shared_state: Value,
		offline: bool,
		requested_at: i64,
	},
	StateUpdate {
		object_id: String,
		state: ObjectState,
		controller_id: String,
	},
	SharedStateUpdate {
		shared_state_patch: Value,
		controller_id: String,
	},
	StopbarCrossing {
		object_id: String,
		controller_id: String,
	},
}

impl Downstream {
	pub fn packet_type(&self) -> PacketType {
		match self {
			Self::Heartbeat => PacketType::Heartbeat,
			Self::HeartbeatAck => PacketType::HeartbeatAck,
			Self::Error { .. } => PacketType::Error,
			Self::ControllerConnect { .. } => PacketType::ControllerConnect,
			Self::ControllerDisconnect { .. } => PacketType::ControllerDisconnect,
			Self::InitialState { .. } => PacketType::InitialState,
			Self::StateSnapshot { .. } => PacketType::StateSnapshot,
			Self::StateUpdate { .. } => PacketType::StateUpdate,
			Self::SharedStateUpdate { .. } => PacketType::SharedStateUpdate,
			Self::StopbarCrossing { .. } => PacketType::StopbarCrossing,
		}
	}

	fn data(&self) -> Value {
		match self {
			Self::Heartbeat | Self::HeartbeatAck => json!({}),
			Self::Error { message } => json!({ "message": message }),
			Self::ControllerConnect { controller_id }
			| Self::ControllerDisconnect { controller_id } => {
				json!({ "controllerId": controller_id })
			},
			Self::InitialState {
				objects,
				connection_type,
				offline,
				shared_state,
			} => json!({
				"objects": objects,
				"connectionType": connection_type.as_str(),
				"offline": offline,
				"sharedState": shared_state,
			}),
			Self::StateSnapshot {
				objects,
				shared_state,
				offline,
				requested_at,
			} => json!({
				"objects": objects,
				"sharedState": shared_state,
				"offline": offline,
				"requestedAt": requested_at,
			}),
			Self::StateUpdate {
				object_id,
				state,
				controller_id,
			} => json!({
				"objectId": object_id,
				"state": state.as_value(),
				"controllerId": controller_id,
			}),
			Self::SharedStateUpdate {
				shared_state_patch,
				controller_id,
			} => json!({
				"sharedStatePatch": shared_state_patch,
				"controllerId": controller_id,
			}),
			Self::StopbarCrossing {
				object_id,
				controller_id,
			} => json!({
				"objectId": object_id,
				"controllerId": controller_id,
			}),
		}
	}

	/// Stamp this message for the wire: the server always sets its own
	/// `timestamp`, never trusting the client's.
	pub fn into_frame(self, airport: Option<String>, timestamp: i64) -> Frame {
		Frame {
			kind: self.packet_type(),
			airport,
			timestamp,
			data: self.data(),
		}
	}
}

#[derive(Clone, Debug, Serialize)]
pub struct Frame {
	#[serde(rename = "type")]
	pub kind: PacketType,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub airport: Option<String>,
	pub timestamp: i64,
	pub data: Value,
}

impl Frame {
	pub fn to_json_string(&self) -> String {
		serde_json::to_string(self)
			.expect("Frame serialization is infallible for well-formed Value data")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn object_id_format() {
		assert!(is_valid_object_id("SB1"));
		assert!(is_valid_object_id("taxi-way_1"));
		assert!(!is_valid_object_id(""));
		assert!(!is_valid_object_id("has space"));
		assert!(!is_valid_object_id("semi;colon"));
	}

	#[test]
	fn decode_heartbeat() {
		assert!(matches!(
			Upstream::decode("HEARTBEAT", json!({})).unwrap(),
			Upstream::Heartbeat
		));
	}

	#[test]
	fn decode_unknown_type() {
		assert_eq!(
			Upstream::decode("NONSENSE", json!({})).unwrap_err(),
			ProtocolError::UnknownType
		);
	}

	#[test]
	fn decode_state_update_requires_exactly_one_of_patch_or_state() {
		let err = Upstream::decode(
			"STATE_UPDATE",
			json!({"objectId": "SB1", "patch": {}, "state": true}),
		)
		.unwrap_err();
		assert!(matches!(err, ProtocolError::InvalidPacket(_)));

		let err =
			Upstream::decode("STATE_UPDATE", json!({"objectId": "SB1"})).unwrap_err();
		assert!(matches!(err, ProtocolError::InvalidPacket(_)));
	}

	#[test]
	fn decode_state_update_with_patch() {
		let msg = Upstream::decode(
			"STATE_UPDATE",
			json!({"objectId": "SB1", "patch": {"on": true}}),
		)
		.unwrap();

		match msg {
			Upstream::StateUpdate { object_id, payload } => {
				assert_eq!(object_id, "SB1");
				assert!(matches!(payload, StateUpdatePayload::Patch(_)));
			},
			_ => panic!("wrong variant"),
		}
	}

	#[test]
	fn downstream_frame_carries_server_timestamp() {
		let frame = Downstream::Error {
			message: "boom".into(),
		}
		.into_frame(None, 42);

		assert_eq!(frame.timestamp, 42);
		assert_eq!(frame.data, json!({"message": "boom"}));
	}
}
