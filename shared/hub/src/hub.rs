//! The per-airport connection hub and state machine. Realized as the
//! reference server's own concurrency choice, generalized: a mutex
//! guarding all Hub fields, matching `tool/server/src/main.rs`'s
//! `Arc<Mutex<Aerodrome>>`, plus a `tokio::sync::broadcast` channel
//! carrying an audience tag so one channel expresses every delivery rule
//! a packet type needs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bars_protocol::{
	deep_merge, AirportObject, ClientKind, Downstream, ObjectState,
	ProtocolError, StateUpdatePayload, Upstream,
};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::config::HubConfig;
use crate::error::AcceptError;
use crate::model::{
	now_ms, ActiveHubEntry, AirportState, ConnectionCounts, Session, SessionId,
	SharedState,
};
use crate::persistence::{self, ACTIVE_CONNECTIONS_COUNTER, ACTIVE_HUB_PREFIX};
use crate::ports::{
	AnalyticsEvent, AnalyticsSink, DurableStateStore, IdentityOracle,
	KeyDirectory, NetworkKind, PointCatalogue, UserStatus,
};
use crate::snapshot::offline_objects;

/// The process-wide singleton ports every Hub shares.
pub struct Ports {
	pub identity: Arc<dyn IdentityOracle>,
	pub keys: Arc<dyn KeyDirectory>,
	pub catalogue: Arc<dyn PointCatalogue>,
	pub store: Arc<dyn DurableStateStore>,
	pub analytics: Arc<dyn AnalyticsSink>,
}

/// Who a broadcast is delivered to. Generalizes the reference server's
/// single undifferentiated `broadcast::Sender<Downstream>` (every
/// subscriber got every message) into the three delivery rules the
/// dispatch table actually needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Audience {
	All,
	AllExceptOrigin,
	ControllersOnly,
}

#[derive(Clone, Debug)]
pub struct BroadcastMessage {
	pub origin: Option<SessionId>,
	pub audience: Audience,
	pub downstream: Downstream,
}

impl BroadcastMessage {
	/// Whether `recipient` (a socket of role `kind`, with id `session_id`)
	/// should be delivered this message, per its audience rule.
	pub fn is_for(&self, session_id: SessionId, kind: ClientKind) -> bool {
		match self.audience {
			Audience::All => true,
			Audience::AllExceptOrigin => self.origin != Some(session_id),
			Audience::ControllersOnly => kind == ClientKind::Controller,
		}
	}
}

/// What the connection task should do after a packet is dispatched.
pub enum DispatchAction {
	/// Nothing to send directly to the originating socket (a broadcast may
	/// still have gone out to others).
	None,
	/// Send a message directly to the originating socket only.
	Send(Downstream),
	/// Handle the session's own `CLOSE` request: close the socket with a
	/// normal-close reason after any side effects have run.
	Close,
}

/// What the heartbeat loop should do on a tick.
pub enum HeartbeatAction {
	SendHeartbeat,
	Close { error: Option<Downstream>, reason: &'static str },
}

struct HubInner {
	airport_state: AirportState,
	shared_state: SharedState,
	sessions: HashMap<SessionId, Session>,
	counts: ConnectionCounts,
}

/// The per-airport state machine.
pub struct Hub {
	pub airport: String,
	config: Arc<HubConfig>,
	ports: Arc<Ports>,
	inner: Mutex<HubInner>,
	broadcast: broadcast::Sender<BroadcastMessage>,
	next_session_id: AtomicU64,
	last_active_hub_write: Mutex<Option<Instant>>,
}

impl Hub {
	pub async fn new(
		airport: String,
		ports: Arc<Ports>,
		config: Arc<HubConfig>,
	) -> Self {
		let airport_state = persistence::load_airport_state(&*ports.store, &airport).await;
		let shared_state = persistence::load_shared_state(&*ports.store, &airport).await;

		let (tx, _rx) = broadcast::channel(256);

		Self {
			airport,
			config,
			ports,
			inner: Mutex::new(HubInner {
				airport_state,
				shared_state: SharedState(shared_state),
				sessions: HashMap::new(),
				counts: ConnectionCounts::default(),
			}),
			broadcast: tx,
			next_session_id: AtomicU64::new(1),
			last_active_hub_write: Mutex::new(None),
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
		self.broadcast.subscribe()
	}

	pub fn wire_limits(&self) -> bars_protocol::WireLimits {
		self.config.wire_limits()
	}

	pub fn heartbeat_interval(&self) -> Duration {
		self.config.heartbeat_interval()
	}

	fn send(&self, origin: Option<SessionId>, audience: Audience, downstream: Downstream) {
		// A broadcast send only fails when there are no subscribers left,
		// which is not an error for a fire-and-forget fan-out.
		let _ = self.broadcast.send(BroadcastMessage {
			origin,
			audience,
			downstream,
		});
	}

	/// Accept a newly-authenticated connection. Registers the session,
	/// applies the controller join side effects, and returns the session
	/// id plus the `INITIAL_STATE` packet to send.
	pub async fn connect(
		self: &Arc<Self>,
		user_id: String,
		kind: ClientKind,
	) -> (SessionId, Downstream) {
		let session_id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
		let now = now_ms();

		let mut inner = self.inner.lock().await;

		let stale_cleared = self.maybe_stale_cleanup(&mut inner, now);

		inner.sessions.insert(
			session_id,
			Session {
				id: session_id,
				user_id: user_id.clone(),
				kind,
				airport: self.airport.clone(),
				last_heartbeat_at: Instant::now(),
				heartbeat_ticks: 0,
			},
		);
		inner.counts.add(kind);

		let is_controller = kind == ClientKind::Controller;
		if is_controller {
			inner.airport_state.controller_ids.insert(user_id.clone());
		}

		let controllers_present = !inner.airport_state.controller_ids.is_empty();
		let use_live_state = is_controller || controllers_present;

		let objects = if use_live_state {
			inner.airport_state.objects.values().cloned().collect()
		} else {
			Vec::new()
		};

		let shared_state = inner.shared_state.0.clone();
		let counts = inner.counts;

		drop(inner);

		let objects = if use_live_state {
			objects
		} else {
			offline_objects(&*self.ports.catalogue, &self.airport).await
		};

		if is_controller || stale_cleared {
			self.persist_airport_state().await;
		}
		if stale_cleared {
			self.persist_shared_state().await;
		}

		if is_controller {
			self.send(
				Some(session_id),
				Audience::AllExceptOrigin,
				Downstream::ControllerConnect {
					controller_id: user_id.clone(),
				},
			);
		}

		self.touch_active_hub_entry(counts).await;
		self.adjust_active_connections(1).await;

		self.ports.analytics.record(AnalyticsEvent {
			name: "connect",
			airport: self.airport.clone(),
			payload: serde_json::json!({ "userId": user_id, "kind": kind.as_str() }),
		});

		let initial_state = Downstream::InitialState {
			objects,
			connection_type: kind,
			offline: !controllers_present,
			shared_state,
		};

		(session_id, initial_state)
	}

	/// Dispatch one inbound packet. `raw_airport_override` is the packet's
	/// own `airport` field, if present; unused for anything but `GET_STATE`
	/// replies since every session is already bound to one airport.
	pub async fn dispatch(
		self: &Arc<Self>,
		session_id: SessionId,
		upstream: Upstream,
	) -> DispatchAction {
		self.touch_heartbeat(session_id).await;

		match upstream {
			Upstream::Heartbeat => {
				DispatchAction::Send(Downstream::HeartbeatAck)
			},
			Upstream::GetState => {
				let (objects, shared_state, offline) = self.live_snapshot().await;
				DispatchAction::Send(Downstream::StateSnapshot {
					objects,
					shared_state,
					offline,
					requested_at: now_ms(),
				})
			},
			Upstream::StateUpdate { object_id, payload } => {
				self.handle_state_update(session_id, object_id, payload).await
			},
			Upstream::SharedStateUpdate { shared_state_patch } => {
				self.handle_shared_state_update(session_id, shared_state_patch).await
			},
			Upstream::StopbarCrossing { object_id } => {
				self.handle_stopbar_crossing(session_id, object_id).await
			},
			Upstream::Close => DispatchAction::Close,
		}
	}

	/// Translate a protocol-level decode failure into an `ERROR` reply
	/// (never a close, mirroring the reference server's malformed-message
	/// handling).
	pub fn error_for(err: ProtocolError) -> Downstream {
		Downstream::Error {
			message: err.to_string(),
		}
	}

	async fn handle_state_update(
		self: &Arc<Self>,
		session_id: SessionId,
		object_id: String,
		payload: StateUpdatePayload,
	) -> DispatchAction {
		let mut inner = self.inner.lock().await;

		let Some(session) = inner.sessions.get(&session_id) else {
			return DispatchAction::None
		};

		if session.kind != ClientKind::Controller {
			return DispatchAction::Send(Downstream::Error {
				message: "not_authorized_for_packet".into(),
			})
		}

		let user_id = session.user_id.clone();
		let now = now_ms();

		let new_state = match payload {
			StateUpdatePayload::Patch(patch) => {
				let mut target = inner
					.airport_state
					.objects
					.get(&object_id)
					.map(|object| object.state.as_value())
					.unwrap_or_else(|| ObjectState::empty_object().as_value());

				if let Err(err) = deep_merge(&mut target, &patch, &self.config.wire_limits().merge)
				{
					debug!("merge_failed for {object_id}: {err}");
					return DispatchAction::Send(Downstream::Error {
						message: "merge_failed".into(),
					})
				}

				match ObjectState::validate(&target) {
					Ok(state) => state,
					Err(_) => {
						return DispatchAction::Send(Downstream::Error {
							message: "merge_failed".into(),
						})
					},
				}
			},
			StateUpdatePayload::State(state) => state,
		};

		inner.airport_state.objects.insert(
			object_id.clone(),
			AirportObject {
				id: object_id.clone(),
				state: new_state.clone(),
				last_controller_id: Some(user_id.clone()),
				updated_at: now,
			},
		);
		inner.airport_state.last_update_at = now;

		drop(inner);

		self.persist_airport_state().await;

		self.send(
			Some(session_id),
			Audience::AllExceptOrigin,
			Downstream::StateUpdate {
				object_id,
				state: new_state,
				controller_id: user_id,
			},
		);

		DispatchAction::None
	}

	async fn handle_shared_state_update(
		self: &Arc<Self>,
		session_id: SessionId,
		patch: Value,
	) -> DispatchAction {
		let mut inner = self.inner.lock().await;

		let Some(session) = inner.sessions.get(&session_id) else {
			return DispatchAction::None
		};

		if session.kind != ClientKind::Controller {
			return DispatchAction::Send(Downstream::Error {
				message: "not_authorized_for_packet".into(),
			})
		}

		let user_id = session.user_id.clone();

		if let Err(err) = deep_merge(
			&mut inner.shared_state.0,
			&patch,
			&self.config.wire_limits().merge,
		) {
			debug!("shared state merge_failed: {err}");
			return DispatchAction::Send(Downstream::Error {
				message: "merge_failed".into(),
			})
		}

		drop(inner);

		self.persist_shared_state().await;

		self.send(
			Some(session_id),
			Audience::All,
			Downstream::SharedStateUpdate {
				shared_state_patch: patch,
				controller_id: user_id,
			},
		);

		DispatchAction::None
	}

	async fn handle_stopbar_crossing(
		self: &Arc<Self>,
		session_id: SessionId,
		object_id: String,
	) -> DispatchAction {
		let inner = self.inner.lock().await;

		let Some(session) = inner.sessions.get(&session_id) else {
			return DispatchAction::None
		};

		if session.kind != ClientKind::Pilot {
			return DispatchAction::Send(Downstream::Error {
				message: "not_authorized_for_packet".into(),
			})
		}

		let user_id = session.user_id.clone();
		drop(inner);

		self.ports.analytics.record(AnalyticsEvent {
			name: "stopbar_crossing",
			airport: self.airport.clone(),
			payload: serde_json::json!({ "objectId": object_id, "userId": user_id }),
		});

		self.send(
			Some(session_id),
			Audience::ControllersOnly,
			Downstream::StopbarCrossing {
				object_id,
				controller_id: user_id,
			},
		);

		DispatchAction::None
	}

	/// Runs once per heartbeat-interval tick for a given socket.
	pub async fn heartbeat_tick(self: &Arc<Self>, session_id: SessionId) -> HeartbeatAction {
		let timed_out = {
			let inner = self.inner.lock().await;
			let Some(session) = inner.sessions.get(&session_id) else {
				return HeartbeatAction::Close { error: None, reason: "gone" }
			};
			session.last_heartbeat_at.elapsed() > self.config.heartbeat_timeout()
		};

		if timed_out {
			return HeartbeatAction::Close {
				error: None,
				reason: "heartbeat_timeout",
			}
		}

		let should_revalidate = {
			let mut inner = self.inner.lock().await;
			let Some(session) = inner.sessions.get_mut(&session_id) else {
				return HeartbeatAction::Close { error: None, reason: "gone" }
			};
			session.heartbeat_ticks += 1;
			session.heartbeat_ticks % 2 == 0
		};

		if should_revalidate {
			if let Some(action) = self.revalidate(session_id).await {
				return action
			}
		}

		HeartbeatAction::SendHeartbeat
	}

	async fn revalidate(self: &Arc<Self>, session_id: SessionId) -> Option<HeartbeatAction> {
		let user_id = {
			let inner = self.inner.lock().await;
			inner.sessions.get(&session_id)?.user_id.clone()
		};

		if self.identity_banned(&user_id).await {
			return Some(HeartbeatAction::Close {
				error: Some(Downstream::Error { message: "banned".into() }),
				reason: "banned",
			})
		}

		let Some(status) = self.identity_status(&user_id).await else {
			return Some(HeartbeatAction::Close {
				error: Some(Downstream::Error {
					message: "not_on_network".into(),
				}),
				reason: "not_on_network",
			})
		};

		let live_kind = classify(&status);

		let session_kind = {
			let inner = self.inner.lock().await;
			inner.sessions.get(&session_id)?.kind
		};

		if live_kind != session_kind {
			return Some(HeartbeatAction::Close {
				error: Some(Downstream::Error {
					message: "role_changed".into(),
				}),
				reason: "role_changed",
			})
		}

		None
	}

	async fn identity_banned(&self, user_id: &str) -> bool {
		match tokio::time::timeout(
			self.config.identity_timeout(),
			self.ports.identity.is_banned(user_id),
		)
		.await
		{
			Ok(banned) => banned,
			Err(_) => false,
		}
	}

	async fn identity_status(&self, user_id: &str) -> Option<UserStatus> {
		match tokio::time::timeout(
			self.config.identity_timeout(),
			self.ports.identity.status(user_id),
		)
		.await
		{
			Ok(status) => status,
			Err(_) => None,
		}
	}

	/// Remove a session and run controller-disconnect side effects. Always
	/// called exactly once per socket, whether it closed gracefully
	/// (`CLOSE`), errored, was banned, or timed out.
	pub async fn disconnect(self: &Arc<Self>, session_id: SessionId) {
		let mut inner = self.inner.lock().await;

		let Some(session) = inner.sessions.remove(&session_id) else {
			return
		};
		inner.counts.remove(session.kind);

		if session.kind == ClientKind::Controller {
			inner.airport_state.controller_ids.remove(&session.user_id);
			inner.airport_state.last_update_at = now_ms();

			let counts = inner.counts;
			drop(inner);

			self.persist_airport_state().await;
			self.send(
				Some(session_id),
				Audience::AllExceptOrigin,
				Downstream::ControllerDisconnect {
					controller_id: session.user_id.clone(),
				},
			);
			self.touch_active_hub_entry(counts).await;
		} else {
			let counts = inner.counts;
			drop(inner);
			self.touch_active_hub_entry(counts).await;
		}

		self.adjust_active_connections(-1).await;

		self.ports.analytics.record(AnalyticsEvent {
			name: "disconnect",
			airport: self.airport.clone(),
			payload: serde_json::json!({ "userId": session.user_id }),
		});

		if self.is_idle().await {
			self.ports
				.store
				.delete(&format!("{ACTIVE_HUB_PREFIX}{}", self.airport))
				.await;
		}
	}

	pub async fn is_idle(&self) -> bool {
		self.inner.lock().await.sessions.is_empty()
	}

	/// `GET_STATE` / `STATE_SNAPSHOT`: offline is computed fresh at reply
	/// time, without applying stale-cleanup first — staleness is applied
	/// at connection time and on the background tick only.
	async fn live_snapshot(&self) -> (Vec<AirportObject>, Value, bool) {
		let inner = self.inner.lock().await;
		let offline = inner.airport_state.controller_ids.is_empty();

		if offline {
			drop(inner);
			let objects = offline_objects(&*self.ports.catalogue, &self.airport).await;
			(objects, Value::Object(Default::default()), true)
		} else {
			(
				inner.airport_state.objects.values().cloned().collect(),
				inner.shared_state.0.clone(),
				false,
			)
		}
	}

	/// Builds the same snapshot shape as `GET_STATE`, usable without an
	/// open socket (the HTTP `/state` facade).
	pub async fn state_snapshot_for_facade(&self, offline_forced: bool) -> Value {
		let inner = self.inner.lock().await;

		let controllers: Vec<String> =
			inner.airport_state.controller_ids.iter().cloned().collect();
		let pilots: Vec<String> = inner
			.sessions
			.values()
			.filter(|session| session.kind == ClientKind::Pilot)
			.map(|session| session.user_id.clone())
			.collect();
		let offline = offline_forced || controllers.is_empty();

		if offline {
			drop(inner);
			let objects = offline_objects(&*self.ports.catalogue, &self.airport).await;
			serde_json::json!({
				"airport": self.airport,
				"controllers": controllers,
				"pilots": pilots,
				"objects": objects,
				"offline": true,
			})
		} else {
			let objects: Vec<AirportObject> =
				inner.airport_state.objects.values().cloned().collect();
			serde_json::json!({
				"airport": self.airport,
				"controllers": controllers,
				"pilots": pilots,
				"objects": objects,
				"offline": false,
			})
		}
	}

	pub async fn touch_heartbeat(&self, session_id: SessionId) {
		let mut inner = self.inner.lock().await;
		if let Some(session) = inner.sessions.get_mut(&session_id) {
			session.touch_heartbeat();
		}
	}

	/// Clears stale per-airport state once the airport has had no
	/// controller for `STALE_TTL` — checked lazily on connect and by the
	/// background maintenance tick ([`Hub::run_maintenance`]). Returns
	/// whether it actually cleared anything, so callers know to persist
	/// both blobs (resetting `last_update_at` would otherwise make a
	/// before/after comparison of it useless for that purpose).
	fn maybe_stale_cleanup(&self, inner: &mut HubInner, now: i64) -> bool {
		let idle_too_long = now.saturating_sub(inner.airport_state.last_update_at)
			> self.config.stale_ttl_ms;

		if idle_too_long && inner.airport_state.controller_ids.is_empty() {
			inner.airport_state.objects.clear();
			inner.shared_state.0 = Value::Object(Default::default());
			inner.airport_state.last_update_at = now;
			true
		} else {
			false
		}
	}

	/// Background per-Hub tick: re-runs the staleness check even with no
	/// new connections.
	pub async fn run_maintenance(self: Arc<Self>) {
		let mut interval = tokio::time::interval(
			Duration::from_millis((self.config.stale_ttl_ms.max(1_000) as u64) / 2),
		);

		loop {
			interval.tick().await;

			let (changed, airport_state, shared_state) = {
				let mut inner = self.inner.lock().await;
				let changed = self.maybe_stale_cleanup(&mut inner, now_ms());
				(
					changed,
					inner.airport_state.clone(),
					inner.shared_state.0.clone(),
				)
			};

			if changed {
				persistence::save_airport_state(
					&*self.ports.store,
					&self.airport,
					&airport_state,
					self.config.max_state_size,
				)
				.await;
				persistence::save_shared_state(
					&*self.ports.store,
					&self.airport,
					&shared_state,
					self.config.max_state_size,
				)
				.await;
			}

			if self.is_idle().await {
				break
			}
		}
	}

	async fn persist_airport_state(&self) {
		let airport_state = self.inner.lock().await.airport_state.clone();
		persistence::save_airport_state(
			&*self.ports.store,
			&self.airport,
			&airport_state,
			self.config.max_state_size,
		)
		.await;
	}

	async fn persist_shared_state(&self) {
		let shared_state = self.inner.lock().await.shared_state.0.clone();
		persistence::save_shared_state(
			&*self.ports.store,
			&self.airport,
			&shared_state,
			self.config.max_state_size,
		)
		.await;
	}

	/// Throttled, idempotent upsert-by-hubId of this Hub's `ActiveHubEntry`
	/// row.
	async fn touch_active_hub_entry(&self, counts: ConnectionCounts) {
		let mut last_write = self.last_active_hub_write.lock().await;
		let now = Instant::now();

		if let Some(previous) = *last_write {
			if now.duration_since(previous)
				< Duration::from_millis(self.config.active_hub_throttle_ms as u64)
			{
				return
			}
		}

		*last_write = Some(now);
		drop(last_write);

		let entry = ActiveHubEntry {
			hub_id: self.airport.clone(),
			label: ActiveHubEntry::make_label(
				&self.airport,
				counts.controllers,
				counts.pilots,
				counts.observers,
			),
			last_updated_at: now_ms(),
		};

		if let Ok(serialized) = serde_json::to_string(&entry) {
			self.ports
				.store
				.set(&format!("{ACTIVE_HUB_PREFIX}{}", self.airport), serialized)
				.await;
		}
	}

	/// Adjusts the process-wide `active_connections` counter by `delta`
	/// (`+1` on connect, `-1` on disconnect). Unlike the throttled
	/// `ActiveHubEntry` upsert, this runs on every connect/disconnect so
	/// the counter never drifts from the true live count.
	async fn adjust_active_connections(&self, delta: i64) {
		self.ports
			.store
			.incr_counter(ACTIVE_CONNECTIONS_COUNTER, delta)
			.await;
	}
}

/// Classify a live status into a client role: an ATC connection whose
/// callsign ends in `_OBS` is an observer, any other ATC connection is a
/// controller, anything else is a pilot.
pub fn classify(status: &UserStatus) -> ClientKind {
	match status.kind {
		NetworkKind::Atc if status.callsign.ends_with("_OBS") => ClientKind::Observer,
		NetworkKind::Atc => ClientKind::Controller,
		NetworkKind::Pilot => ClientKind::Pilot,
	}
}

/// Resolve and classify a connecting client, including the mandatory
/// jittered delay on any rejection caused by a missing or invalid
/// credential (an anti-enumeration control).
pub async fn authenticate(
	ports: &Ports,
	api_key: Option<&str>,
) -> Result<(String, ClientKind), AcceptError> {
	let Some(api_key) = api_key else {
		anti_enumeration_delay().await;
		return Err(AcceptError::Unauthenticated)
	};

	let Some(user_id) = ports.keys.resolve(api_key).await else {
		anti_enumeration_delay().await;
		return Err(AcceptError::Unauthenticated)
	};

	if ports.keys.is_banned(&user_id).await {
		return Err(AcceptError::Forbidden("banned"))
	}

	let Some(status) = ports.identity.status(&user_id).await else {
		return Err(AcceptError::Forbidden("not_on_network"))
	};

	Ok((user_id, classify(&status)))
}

/// The uniform 20-50ms delay applied before rejecting any connect attempt
/// with a missing or unresolvable credential, so an attacker can't use
/// response latency to enumerate which airports or keys exist.
pub async fn anti_enumeration_delay() {
	let millis = rand::thread_rng().gen_range(20..50);
	tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::TestPorts;

	fn hub_config() -> Arc<HubConfig> {
		Arc::new(HubConfig::default())
	}

	async fn build_hub(airport: &str) -> Arc<Hub> {
		let ports = TestPorts::default().into_ports();
		Arc::new(Hub::new(airport.to_string(), ports, hub_config()).await)
	}

	#[tokio::test]
	async fn two_controllers_converge_on_the_same_object_state() {
		let hub = build_hub("KJFK").await;

		let (c1, _) = hub.connect("C1".into(), ClientKind::Controller).await;
		let (c2, _) = hub.connect("C2".into(), ClientKind::Controller).await;

		hub.dispatch(
			c1,
			Upstream::StateUpdate {
				object_id: "SB1".into(),
				payload: StateUpdatePayload::Patch(serde_json::json!({"on": true})),
			},
		)
		.await;

		hub.dispatch(
			c2,
			Upstream::StateUpdate {
				object_id: "SB1".into(),
				payload: StateUpdatePayload::Patch(serde_json::json!({"color": "red"})),
			},
		)
		.await;

		let (objects, _, _) = hub.live_snapshot().await;
		let sb1 = objects.iter().find(|o| o.id == "SB1").unwrap();
		assert_eq!(
			sb1.state.as_value(),
			serde_json::json!({"on": true, "color": "red"})
		);
		assert_eq!(sb1.last_controller_id.as_deref(), Some("C2"));
	}

	#[tokio::test]
	async fn pilot_offline_snapshot_uses_catalogue_defaults() {
		let ports = TestPorts::default();
		ports.seed_catalogue("KJFK", &[("T1", bars_config::ObjectKind::Taxiway), ("SB1", bars_config::ObjectKind::Stopbar)]);
		let hub = Arc::new(Hub::new("KJFK".into(), ports.into_ports(), hub_config()).await);

		let (_id, initial) = hub.connect("P1".into(), ClientKind::Pilot).await;

		match initial {
			Downstream::InitialState { objects, offline, .. } => {
				assert!(offline);
				let mut by_id: HashMap<_, _> =
					objects.into_iter().map(|o| (o.id.clone(), o)).collect();
				assert_eq!(
					by_id.remove("T1").unwrap().state.as_value(),
					serde_json::json!(true)
				);
				assert_eq!(
					by_id.remove("SB1").unwrap().state.as_value(),
					serde_json::json!(false)
				);
			},
			_ => panic!("expected InitialState"),
		}
	}

	#[tokio::test]
	async fn stopbar_crossing_is_visible_only_to_controllers() {
		let hub = build_hub("KJFK").await;

		let (_controller_id, _) = hub.connect("CTRL".into(), ClientKind::Controller).await;
		let mut controller_rx = hub.subscribe();

		let (_pilot1_id, _) = hub.connect("P1".into(), ClientKind::Pilot).await;
		let mut pilot1_rx = hub.subscribe();

		let (pilot2_id, _) = hub.connect("P2".into(), ClientKind::Pilot).await;

		hub.dispatch(
			pilot2_id,
			Upstream::StopbarCrossing { object_id: "SB1".into() },
		)
		.await;

		let msg = controller_rx.try_recv().expect("controller should receive it");
		assert!(msg.is_for(_controller_id, ClientKind::Controller));
		match msg.downstream {
			Downstream::StopbarCrossing { controller_id, .. } => {
				assert_eq!(controller_id, "P2");
			},
			_ => panic!("wrong message"),
		}

		// the event sent above was for controllers only; the first pilot's
		// receiver must not consider itself addressed.
		if let Ok(msg) = pilot1_rx.try_recv() {
			assert!(!msg.is_for(_pilot1_id, ClientKind::Pilot));
		}
	}

	#[tokio::test]
	async fn merge_guardrail_rejects_deep_patches_without_mutating_state() {
		let hub = build_hub("KJFK").await;
		let (c1, _) = hub.connect("C1".into(), ClientKind::Controller).await;

		let mut patch = serde_json::json!(1);
		for _ in 0..25 {
			patch = serde_json::json!({"n": patch});
		}

		let action = hub
			.dispatch(
				c1,
				Upstream::StateUpdate {
					object_id: "X".into(),
					payload: StateUpdatePayload::Patch(patch),
				},
			)
			.await;

		match action {
			DispatchAction::Send(Downstream::Error { message }) => {
				assert_eq!(message, "merge_failed");
			},
			_ => panic!("expected an error reply"),
		}

		let (objects, _, _) = hub.live_snapshot().await;
		assert!(objects.iter().all(|o| o.id != "X"));
	}

	#[tokio::test]
	async fn pilot_cannot_send_state_update() {
		let hub = build_hub("KJFK").await;
		let (p1, _) = hub.connect("P1".into(), ClientKind::Pilot).await;

		let action = hub
			.dispatch(
				p1,
				Upstream::StateUpdate {
					object_id: "SB1".into(),
					payload: StateUpdatePayload::State(ObjectState::Bool(true)),
				},
			)
			.await;

		match action {
			DispatchAction::Send(Downstream::Error { message }) => {
				assert_eq!(message, "not_authorized_for_packet");
			},
			_ => panic!("expected a not_authorized_for_packet error"),
		}
	}

	#[tokio::test]
	async fn shared_state_update_broadcasts_including_sender() {
		let hub = build_hub("KJFK").await;
		let (c1, _) = hub.connect("C1".into(), ClientKind::Controller).await;
		let mut rx = hub.subscribe();

		hub.dispatch(
			c1,
			Upstream::SharedStateUpdate {
				shared_state_patch: serde_json::json!({"note": "hi"}),
			},
		)
		.await;

		let msg = rx.try_recv().unwrap();
		assert!(msg.is_for(c1, ClientKind::Controller));
	}

	#[tokio::test]
	async fn stale_cleanup_on_connect_persists_both_cleared_blobs() {
		let ports = TestPorts::default().into_ports();
		let store = ports.store.clone();
		let config = Arc::new(HubConfig {
			stale_ttl_ms: 0,
			..HubConfig::default()
		});
		let hub = Arc::new(Hub::new("KJFK".into(), ports, config).await);

		let (c1, _) = hub.connect("C1".into(), ClientKind::Controller).await;
		hub.dispatch(
			c1,
			Upstream::StateUpdate {
				object_id: "SB1".into(),
				payload: StateUpdatePayload::State(ObjectState::Bool(true)),
			},
		)
		.await;
		hub.dispatch(
			c1,
			Upstream::SharedStateUpdate {
				shared_state_patch: serde_json::json!({"note": "hi"}),
			},
		)
		.await;
		hub.disconnect(c1).await;

		// with stale_ttl_ms == 0, any elapsed time makes the airport stale
		// the moment it has no connected controllers.
		tokio::time::sleep(Duration::from_millis(5)).await;

		// a pilot connecting observes the cleared, offline state...
		let (_p1, initial) = hub.connect("P1".into(), ClientKind::Pilot).await;
		match initial {
			Downstream::InitialState { offline, .. } => assert!(offline),
			_ => panic!("expected InitialState"),
		}

		// ...and both blobs were actually persisted, not just cleared
		// in memory.
		let persisted_airport_state = store
			.get(&crate::persistence::airport_state_key("KJFK"))
			.await
			.expect("airport_state should have been persisted");
		assert!(persisted_airport_state.contains("\"objects\":{}"));

		let persisted_shared_state = store
			.get(&crate::persistence::airport_shared_state_key("KJFK"))
			.await
			.expect("airport_shared_state should have been persisted");
		assert_eq!(persisted_shared_state, "{}");
	}

	#[tokio::test]
	async fn active_connections_counter_tracks_connect_and_disconnect() {
		let ports = TestPorts::default().into_ports();
		let store = ports.store.clone();
		let hub = Arc::new(Hub::new("KJFK".into(), ports, hub_config()).await);

		let (c1, _) = hub.connect("C1".into(), ClientKind::Controller).await;
		let (p1, _) = hub.connect("P1".into(), ClientKind::Pilot).await;
		assert_eq!(store.incr_counter(ACTIVE_CONNECTIONS_COUNTER, 0).await, 2);

		hub.disconnect(c1).await;
		assert_eq!(store.incr_counter(ACTIVE_CONNECTIONS_COUNTER, 0).await, 1);

		hub.disconnect(p1).await;
		assert_eq!(store.incr_counter(ACTIVE_CONNECTIONS_COUNTER, 0).await, 0);
	}
}
