//! Wire protocol for the BARS stopbar hub: packet shapes, the JSON
//! deep-merge used for object and shared-state patches, and the
//! structural limits every inbound packet must respect.
//!
//! Generalizes the reference server's `Downstream<Value>` /
//! `Upstream<Value>` instantiation (`tool/server/src/main.rs`) into the
//! full stopbar-hub message set, with explicit validation instead of
//! relying on `serde`'s default enum-deserialize error.

mod merge;
mod object;
mod packet;

pub use merge::{deep_merge, MergeError, MergeLimits};
pub use object::{AirportObject, InvalidObjectState, ObjectState};
pub use packet::{
	is_valid_object_id, ClientKind, Downstream, Frame, PacketType,
	ProtocolError, RawEnvelope, StateUpdatePayload, Upstream,
};

use serde_json::Value;

/// Structural limits applied to every inbound packet, independent of the
/// per-type payload checks in [`Upstream::decode`].
#[derive(Clone, Copy, Debug)]
pub struct WireLimits {
	pub max_packet_chars: usize,
	pub max_patch_chars: usize,
	pub merge: MergeLimits,
}

impl Default for WireLimits {
	fn default() -> Self {
		Self {
			max_packet_chars: 50_000,
			max_patch_chars: 10_240,
			merge: MergeLimits::default(),
		}
	}
}

/// Decode a raw text frame into an [`Upstream`] message, enforcing the
/// packet-size cap before touching `serde_json` and the shared-state patch
/// size cap for `SHARED_STATE_UPDATE` specifically.
///
/// Returns the envelope's `airport` override alongside the message so the
/// caller can default it to the session's airport.
pub fn decode_inbound(
	raw: &str,
	limits: &WireLimits,
) -> Result<(Option<String>, Upstream), ProtocolError> {
	if raw.chars().count() > limits.max_packet_chars {
		return Err(ProtocolError::InvalidPacket(
			"packet exceeds the maximum allowed size".into(),
		))
	}

	let envelope: RawEnvelope = serde_json::from_str(raw)
		.map_err(|err| ProtocolError::InvalidPacket(err.to_string()))?;

	if let Some(patch) = envelope.data.get("sharedStatePatch") {
		let serialized = serde_json::to_string(patch).unwrap_or_default();
		if serialized.chars().count() > limits.max_patch_chars {
			return Err(ProtocolError::InvalidPacket(
				"sharedStatePatch exceeds the maximum allowed size".into(),
			))
		}
	}

	let message = Upstream::decode(&envelope.kind, envelope.data)?;
	Ok((envelope.airport, message))
}

/// `true` if `value`'s serialized form exceeds `max_chars` — used for the
/// persistence skip threshold as well as the inbound caps above.
pub fn serialized_len_exceeds(value: &Value, max_chars: usize) -> bool {
	serde_json::to_string(value)
		.map(|s| s.chars().count() > max_chars)
		.unwrap_or(true)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn oversized_packet_is_rejected_before_parsing() {
		let huge = format!(r#"{{"type":"HEARTBEAT","pad":"{}"}}"#, "x".repeat(60_000));
		let limits = WireLimits::default();
		let err = decode_inbound(&huge, &limits).unwrap_err();
		assert!(matches!(err, ProtocolError::InvalidPacket(_)));
	}

	#[test]
	fn oversized_shared_state_patch_is_rejected() {
		let mut patch = serde_json::Map::new();
		patch.insert("blob".into(), json!("x".repeat(11_000)));

		let envelope = json!({
			"type": "SHARED_STATE_UPDATE",
			"data": { "sharedStatePatch": patch },
		});

		let raw = envelope.to_string();
		let err = decode_inbound(&raw, &WireLimits::default()).unwrap_err();
		assert!(matches!(err, ProtocolError::InvalidPacket(_)));
	}

	#[test]
	fn well_formed_packet_decodes() {
		let raw = json!({
			"type": "GET_STATE",
			"airport": "KJFK",
		})
		.to_string();

		let (airport, message) = decode_inbound(&raw, &WireLimits::default()).unwrap();
		assert_eq!(airport.as_deref(), Some("KJFK"));
		assert!(matches!(message, Upstream::GetState));
	}
}
