//! Recursive deep-merge of JSON values, generalized from the reference
//! server's `Aerodrome::merge_state` (a plain recursive object merge with
//! no guards) to the bounded variant the wire protocol requires: depth,
//! key-count, array-length and key-length limits, plus an overall
//! serialized-size cap enforced by the caller before merging begins.

use serde_json::Value;
use thiserror::Error;

/// Bounds enforced while merging a patch into a target value.
#[derive(Clone, Copy, Debug)]
pub struct MergeLimits {
	pub max_depth: usize,
	pub max_properties: usize,
	pub max_array_size: usize,
	pub max_key_len: usize,
}

impl Default for MergeLimits {
	fn default() -> Self {
		Self {
			max_depth: 20,
			max_properties: 100,
			max_array_size: 1000,
			max_key_len: 100,
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
	#[error("patch exceeds maximum nesting depth")]
	TooDeep,
	#[error("object has more than the maximum number of keys")]
	TooManyProperties,
	#[error("array exceeds the maximum allowed length")]
	ArrayTooLong,
	#[error("object key exceeds the maximum allowed length")]
	KeyTooLong,
}

/// Deep-merge `source` into `target` in place:
///
/// - object keys merge recursively (a missing or non-object `target[k]` is
///   treated as `{}`);
/// - anything else (primitive, null, array) replaces the prior value
///   wholesale — arrays are never element-merged;
/// - depth, key-count, array-length and key-length are bounded by `limits`.
///
/// `target` and `source` must both be JSON objects; the top level of
/// `SharedState` and of a patched `AirportObject` is always an object
/// per the data-model invariant.
pub fn deep_merge(
	target: &mut Value,
	source: &Value,
	limits: &MergeLimits,
) -> Result<(), MergeError> {
	validate_shape(source, limits, 0)?;
	merge_inner(target, source);
	Ok(())
}

fn merge_inner(target: &mut Value, source: &Value) {
	match (target.as_object_mut(), source.as_object()) {
		(Some(target_obj), Some(source_obj)) => {
			for (key, value) in source_obj {
				if value.is_object() {
					let entry = target_obj
						.entry(key.clone())
						.or_insert_with(|| Value::Object(Default::default()));

					if !entry.is_object() {
						*entry = Value::Object(Default::default());
					}

					merge_inner(entry, value);
				} else {
					target_obj.insert(key.clone(), value.clone());
				}
			}
		},
		_ => *target = source.clone(),
	}
}

/// Walk `source` (never touching `target`) to check it respects the
/// guards before any mutation happens — merges must be all-or-nothing.
fn validate_shape(
	value: &Value,
	limits: &MergeLimits,
	depth: usize,
) -> Result<(), MergeError> {
	if depth > limits.max_depth {
		return Err(MergeError::TooDeep)
	}

	match value {
		Value::Object(map) => {
			if map.len() > limits.max_properties {
				return Err(MergeError::TooManyProperties)
			}

			for (key, value) in map {
				if key.len() > limits.max_key_len {
					return Err(MergeError::KeyTooLong)
				}

				validate_shape(value, limits, depth + 1)?;
			}

			Ok(())
		},
		Value::Array(items) => {
			if items.len() > limits.max_array_size {
				return Err(MergeError::ArrayTooLong)
			}

			// Arrays are leaf-replaced, never merged, but a deeply nested
			// array-of-objects patch can still smuggle in an oversized
			// structure, so the guards still apply recursively here.
			for item in items {
				validate_shape(item, limits, depth + 1)?;
			}

			Ok(())
		},
		_ => Ok(()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn merge_with_empty_is_identity() {
		let mut target = json!({"a": 1, "b": {"c": 2}});
		let before = target.clone();
		deep_merge(&mut target, &json!({}), &MergeLimits::default()).unwrap();
		assert_eq!(target, before);
	}

	#[test]
	fn merge_with_self_is_identity() {
		let mut target = json!({"a": 1, "b": {"c": 2}});
		let source = target.clone();
		deep_merge(&mut target, &source, &MergeLimits::default()).unwrap();
		assert_eq!(target, source);
	}

	#[test]
	fn nested_objects_merge_recursively() {
		let mut target = json!({"on": true});
		deep_merge(&mut target, &json!({"color": "red"}), &MergeLimits::default())
			.unwrap();
		assert_eq!(target, json!({"on": true, "color": "red"}));
	}

	#[test]
	fn arrays_replace_rather_than_merge() {
		let mut target = json!({"tags": [1, 2, 3]});
		deep_merge(&mut target, &json!({"tags": [4]}), &MergeLimits::default())
			.unwrap();
		assert_eq!(target, json!({"tags": [4]}));
	}

	#[test]
	fn non_object_target_is_replaced_wholesale() {
		let mut target = json!({"state": true});
		deep_merge(
			&mut target,
			&json!({"state": {"nested": 1}}),
			&MergeLimits::default(),
		)
		.unwrap();
		assert_eq!(target, json!({"state": {"nested": 1}}));
	}

	#[test]
	fn rejects_excessive_depth() {
		let mut patch = json!(1);
		for _ in 0..25 {
			patch = json!({"n": patch});
		}

		let mut target = json!({});
		let err =
			deep_merge(&mut target, &patch, &MergeLimits::default()).unwrap_err();
		assert_eq!(err, MergeError::TooDeep);
		assert_eq!(target, json!({})); // rejected before mutation
	}

	#[test]
	fn rejects_too_many_properties() {
		let mut obj = serde_json::Map::new();
		for i in 0..150 {
			obj.insert(format!("k{i}"), json!(i));
		}

		let mut target = json!({});
		let err = deep_merge(
			&mut target,
			&Value::Object(obj),
			&MergeLimits::default(),
		)
		.unwrap_err();
		assert_eq!(err, MergeError::TooManyProperties);
	}

	#[test]
	fn rejects_oversized_arrays() {
		let array = Value::Array(vec![json!(1); 1001]);
		let mut target = json!({});
		let err = deep_merge(
			&mut target,
			&json!({"arr": array}),
			&MergeLimits::default(),
		)
		.unwrap_err();
		assert_eq!(err, MergeError::ArrayTooLong);
	}

	#[test]
	fn rejects_oversized_keys() {
		let key = "k".repeat(101);
		let mut target = json!({});
		let err = deep_merge(
			&mut target,
			&json!({ key: 1 }),
			&MergeLimits::default(),
		)
		.unwrap_err();
		assert_eq!(err, MergeError::KeyTooLong);
	}
}
