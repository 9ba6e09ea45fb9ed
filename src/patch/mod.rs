//! Patch operations over replicated values.
//!
//! A patch is an ordered list of [`PatchOp`]s that advances an object by one
//! revision. Ops address either the root value or one direct child field of
//! it. [`apply`] is total: shapes that do not fit an op degrade to wholesale
//! replacement instead of failing, and op kinds this build does not know are
//! skipped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The four patch kinds, plus a catch-all for kinds added by newer hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
	Set,
	Merge,
	Insert,
	Remove,
	#[serde(other)]
	Unknown,
}

/// A single operation inside a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
	#[serde(rename = "op", alias = "kind")]
	pub kind: PatchKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub value: Option<Value>,
}

impl PatchOp {
	pub fn set(path: Option<&str>, value: Value) -> Self {
		Self::new(PatchKind::Set, path, Some(value))
	}

	pub fn merge(path: Option<&str>, value: Value) -> Self {
		Self::new(PatchKind::Merge, path, Some(value))
	}

	pub fn insert(path: Option<&str>, value: Value) -> Self {
		Self::new(PatchKind::Insert, path, Some(value))
	}

	pub fn remove(path: Option<&str>, value: Value) -> Self {
		Self::new(PatchKind::Remove, path, Some(value))
	}

	fn new(kind: PatchKind, path: Option<&str>, value: Option<Value>) -> Self {
		Self {
			kind,
			path: path.map(str::to_string),
			value,
		}
	}
}

/// Reasons a patch is refused before it is applied or queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
	#[error("op {index} has an empty path")]
	EmptyPath { index: usize },
	#[error("op {index} ({kind:?}) requires a value")]
	MissingValue { index: usize, kind: PatchKind },
	#[error("op {index} remove target must be an index, a key or an object with an id")]
	BadRemoveTarget { index: usize },
}

/// Structural check run by receivers before trusting a patch.
pub fn validate(ops: &[PatchOp]) -> Result<(), ValidationError> {
	for (index, op) in ops.iter().enumerate() {
		if matches!(op.path.as_deref(), Some(p) if p.is_empty()) {
			return Err(ValidationError::EmptyPath { index });
		}
		match op.kind {
			PatchKind::Insert | PatchKind::Remove if op.value.is_none() => {
				return Err(ValidationError::MissingValue {
					index,
					kind: op.kind,
				});
			}
			PatchKind::Remove => {
				let ok = match op.value.as_ref() {
					Some(Value::Number(n)) => n.is_u64(),
					Some(Value::String(_)) => true,
					Some(Value::Object(map)) => map.contains_key("id"),
					_ => false,
				};
				if !ok {
					return Err(ValidationError::BadRemoveTarget { index });
				}
			}
			_ => {}
		}
	}
	Ok(())
}

/// Apply `ops` in order to a copy of `base` and return the new value.
pub fn apply(base: &Value, ops: &[PatchOp]) -> Value {
	let mut next = base.clone();
	for op in ops {
		apply_op(&mut next, op);
	}
	next
}

fn apply_op(root: &mut Value, op: &PatchOp) {
	if op.kind == PatchKind::Unknown {
		return;
	}

	let Some(path) = op.path.as_deref() else {
		apply_at(root, op);
		return;
	};

	if !root.is_object() {
		*root = Value::Object(Map::new());
	}
	if let Value::Object(fields) = root {
		match op.kind {
			PatchKind::Remove if !fields.contains_key(path) => {}
			_ => {
				let target = fields.entry(path.to_string()).or_insert(Value::Null);
				apply_at(target, op);
			}
		}
	}
}

fn apply_at(target: &mut Value, op: &PatchOp) {
	let value = op.value.as_ref();
	match op.kind {
		PatchKind::Set => *target = value.cloned().unwrap_or(Value::Null),
		PatchKind::Merge => merge_into(target, value.unwrap_or(&Value::Null)),
		PatchKind::Insert => {
			if let Some(value) = value {
				insert_into(target, value);
			}
		}
		PatchKind::Remove => {
			if let Some(value) = value {
				remove_from(target, value);
			}
		}
		PatchKind::Unknown => {}
	}
}

fn merge_into(target: &mut Value, value: &Value) {
	match (&mut *target, value) {
		(Value::Array(items), Value::Array(incoming)) => {
			for item in incoming {
				upsert_keyed(items, item);
			}
		}
		(Value::Array(items), one) => upsert_keyed(items, one),
		(Value::Object(fields), Value::Object(incoming)) => {
			for (key, v) in incoming {
				fields.insert(key.clone(), v.clone());
			}
		}
		_ => *target = value.clone(),
	}
}

fn upsert_keyed(items: &mut Vec<Value>, item: &Value) {
	let Some(id) = item.get("id").filter(|id| !id.is_null()) else {
		items.push(item.clone());
		return;
	};

	let existing = items
		.iter_mut()
		.find(|candidate| candidate.get("id") == Some(id));
	match (existing, item) {
		(Some(Value::Object(fields)), Value::Object(incoming)) => {
			for (key, v) in incoming {
				fields.insert(key.clone(), v.clone());
			}
		}
		(Some(slot), _) => *slot = item.clone(),
		(None, _) => items.push(item.clone()),
	}
}

fn insert_into(target: &mut Value, value: &Value) {
	if !target.is_array() {
		*target = Value::Array(Vec::new());
	}
	if let Value::Array(items) = target {
		match value {
			Value::Array(more) => items.extend(more.iter().cloned()),
			one => items.push(one.clone()),
		}
	}
}

fn remove_from(target: &mut Value, value: &Value) {
	match target {
		Value::Array(items) => {
			if let Some(index) = value.as_u64() {
				if let Ok(index) = usize::try_from(index) {
					if index < items.len() {
						items.remove(index);
					}
				}
				return;
			}
			let id = match value {
				Value::Object(map) => map.get("id"),
				other => Some(other),
			};
			let Some(id) = id else { return };
			if let Some(pos) = items.iter().position(|item| item.get("id") == Some(id)) {
				items.remove(pos);
			}
		}
		Value::Object(fields) => {
			if let Value::String(key) = value {
				fields.remove(key);
			}
		}
		_ => {}
	}
}
