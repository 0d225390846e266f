//! Snapshot synthesis: the offline Point Catalogue baseline, and picking
//! between it and the live `AirportState` for a given viewer.

use bars_protocol::{AirportObject, ObjectState};

use crate::model::now_ms;
use crate::ports::PointCatalogue;

/// Builds the offline baseline for `airport`: one [`AirportObject`] per
/// catalogue entry, each defaulted per its category.
pub async fn offline_objects(
	catalogue: &dyn PointCatalogue,
	airport: &str,
) -> Vec<AirportObject> {
	let now = now_ms();

	catalogue
		.objects(airport)
		.await
		.into_iter()
		.map(|object| {
			AirportObject::new(
				object.id,
				ObjectState::Bool(object.kind.offline_default()),
				now,
			)
		})
		.collect()
}
