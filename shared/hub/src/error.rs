use thiserror::Error;

/// Failures at connect time: the upgrade is refused outright, never
/// escalated into an `ERROR` packet on an open socket.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcceptError {
	#[error("unauthenticated")]
	Unauthenticated,
	#[error("forbidden: {0}")]
	Forbidden(&'static str),
	#[error("invalid_airport")]
	InvalidAirport,
}

/// `true` if `airport` is exactly four A–Z0–9 characters.
pub fn is_valid_airport(airport: &str) -> bool {
	airport.len() == 4
		&& airport
			.bytes()
			.all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn airport_codes_must_be_four_alnum_chars() {
		assert!(is_valid_airport("KJFK"));
		assert!(is_valid_airport("EGLL"));
		assert!(!is_valid_airport("kjfk"));
		assert!(!is_valid_airport("KJF"));
		assert!(!is_valid_airport("KJFKX"));
		assert!(!is_valid_airport("K-FK"));
	}
}
