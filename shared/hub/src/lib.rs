//! The airport-scoped connection hub: session bookkeeping, the
//! mutex-and-broadcast state machine, heartbeat/revalidation, and the
//! external ports (identity, keys, catalogue, durable store, analytics)
//! a deployment wires in around it.

pub mod config;
pub mod error;
pub mod hub;
pub mod model;
pub mod persistence;
pub mod ports;
pub mod registry;
pub mod snapshot;

#[cfg(test)]
mod test_support;

pub use config::HubConfig;
pub use error::{is_valid_airport, AcceptError};
pub use hub::{
	anti_enumeration_delay, authenticate, classify, Audience, BroadcastMessage,
	DispatchAction, Hub, HeartbeatAction, Ports,
};
pub use model::{
	now_ms, ActiveHubEntry, AirportState, ConnectionCounts, Session, SessionId,
	SharedState,
};
pub use ports::{
	AnalyticsEvent, AnalyticsSink, DurableStateStore, IdentityOracle, KeyDirectory,
	NetworkKind, PointCatalogue, UserStatus,
};
pub use registry::HubRegistry;
