//! The offline Point Catalogue's on-disk format: a small bincode-encoded
//! list of airfield objects per airport, with their static category used
//! to pick an offline default state when no controller is connected.
//!
//! Trimmed down from the full map-rendering schema (nodes, edges, blocks,
//! maps, views, styles, profiles) this format's magic-bytes/version/
//! size-limited-`bincode::Options` layout was lifted from, to the handful
//! of fields the Point Catalogue port actually needs. Light-layout
//! generation and rendering live outside this crate entirely.

use std::io::{Read, Write};

use bincode::{DefaultOptions, ErrorKind, Options};
pub use bincode;

use serde::{Deserialize, Serialize};

static MAGIC: &[u8] = b"\xffBARS\x13pc";
const VERSION: u16 = 0;

fn bincode_options() -> impl Options {
	DefaultOptions::new().with_limit(0x100_0000)
}

/// A full catalogue file, covering every airport this deployment knows
/// the static layout for.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Catalogue {
	pub airports: Vec<AirportCatalogue>,
}

impl Catalogue {
	pub fn load(mut reader: impl Read) -> bincode::Result<Self> {
		let mut buf = vec![0; MAGIC.len()];
		reader.read_exact(&mut buf)?;

		if buf != MAGIC {
			return Err(ErrorKind::Custom("invalid catalogue file".into()).into())
		}

		let mut buf = [0; 2];
		reader.read_exact(&mut buf)?;

		if buf != VERSION.to_be_bytes() {
			return Err(ErrorKind::Custom("unsupported catalogue version".into()).into())
		}

		bincode_options().deserialize_from(reader)
	}

	pub fn save(&self, mut writer: impl Write) -> bincode::Result<()> {
		writer.write_all(MAGIC)?;
		writer.write_all(&VERSION.to_be_bytes())?;

		bincode_options().serialize_into(writer, self)
	}

	pub fn airport(&self, icao: &str) -> Option<&AirportCatalogue> {
		self.airports.iter().find(|a| a.icao == icao)
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AirportCatalogue {
	pub icao: String,
	pub objects: Vec<CatalogueObject>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CatalogueObject {
	pub id: String,
	pub kind: ObjectKind,
}

/// The static category of an airfield object, used only to pick its
/// offline default state — never sent on the wire as part of
/// `AirportObject`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
	Taxiway,
	LeadOn,
	Stand,
	Stopbar,
	Other,
}

impl ObjectKind {
	/// The default on/off baseline for this category when synthesizing an
	/// offline snapshot: taxiways, lead-ons and stands default on,
	/// stopbars and anything else default off.
	pub fn offline_default(self) -> bool {
		matches!(self, Self::Taxiway | Self::LeadOn | Self::Stand)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_through_bincode() {
		let catalogue = Catalogue {
			airports: vec![AirportCatalogue {
				icao: "KJFK".into(),
				objects: vec![
					CatalogueObject {
						id: "T1".into(),
						kind: ObjectKind::Taxiway,
					},
					CatalogueObject {
						id: "SB1".into(),
						kind: ObjectKind::Stopbar,
					},
				],
			}],
		};

		let mut buf = Vec::new();
		catalogue.save(&mut buf).unwrap();

		let loaded = Catalogue::load(buf.as_slice()).unwrap();
		assert_eq!(loaded.airports.len(), 1);
		assert_eq!(loaded.airport("KJFK").unwrap().objects.len(), 2);
	}

	#[test]
	fn rejects_bad_magic() {
		let err = Catalogue::load(&b"not a catalogue file at all!!"[..]).unwrap_err();
		assert!(matches!(*err, ErrorKind::Custom(_)));
	}

	#[test]
	fn offline_defaults_are_taxiway_leadon_stand() {
		assert!(ObjectKind::Taxiway.offline_default());
		assert!(ObjectKind::LeadOn.offline_default());
		assert!(ObjectKind::Stand.offline_default());
		assert!(!ObjectKind::Stopbar.offline_default());
		assert!(!ObjectKind::Other.offline_default());
	}
}
