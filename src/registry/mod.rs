//! Declarations of the objects a session replicates.
//!
//! A [`NetObjectRegistry`] is built once per session and shared by the host
//! and client sides. Each [`NetObjectDescriptor`] names an object, picks the
//! adapter that shapes its mutations ([`NetObjectKind`]) and says how it is
//! delivered. Registering a new kind needs no change to the core.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::patch::PatchOp;

/// Built-in participant list, a keyed list under `participants`.
pub const ROSTER: &str = "roster";
/// Built-in chat history, an append-only list under `entries`.
pub const CHATLOG: &str = "chatlog";

/// A peer's request to change an object through its command model.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
	/// Participant id of the sender, or `local` for unbound peers.
	pub actor: String,
	pub name: String,
	pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandRejected {
	#[error("unknown command '{0}'")]
	UnknownCommand(String),
	#[error("invalid arguments: {0}")]
	InvalidArgs(String),
	#[error("not allowed: {0}")]
	NotAllowed(String),
	#[error("object does not accept commands")]
	Unsupported,
}

/// Validates commands against the current value and turns them into ops.
///
/// Models are pure: the host owns the value and applies whatever ops the
/// model returns as one revision.
pub trait CommandModel: Send + Sync {
	fn initial(&self) -> Value;

	fn handle(&self, state: &Value, command: &Command) -> Result<Vec<PatchOp>, CommandRejected>;
}

/// Mutation adapter for an object.
#[derive(Clone)]
pub enum NetObjectKind {
	/// A single value replaced or merged at the root.
	Value,
	/// An ordered list stored under `path`.
	List { path: String },
	/// A list of records addressed by their `id` field.
	KeyedList { path: String },
	/// State driven by a command model.
	Custom(Arc<dyn CommandModel>),
}

impl fmt::Debug for NetObjectKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			NetObjectKind::Value => f.write_str("Value"),
			NetObjectKind::List { path } => f.debug_struct("List").field("path", path).finish(),
			NetObjectKind::KeyedList { path } => {
				f.debug_struct("KeyedList").field("path", path).finish()
			}
			NetObjectKind::Custom(_) => f.write_str("Custom(..)"),
		}
	}
}

impl NetObjectKind {
	/// Field holding the collection, if the object has one.
	pub fn collection_path(&self) -> Option<&str> {
		match self {
			NetObjectKind::List { path } | NetObjectKind::KeyedList { path } => Some(path),
			_ => None,
		}
	}

	pub fn initial_value(&self) -> Option<Value> {
		match self {
			NetObjectKind::Value => None,
			NetObjectKind::List { path } | NetObjectKind::KeyedList { path } => {
				let mut fields = Map::new();
				fields.insert(path.clone(), Value::Array(Vec::new()));
				Some(Value::Object(fields))
			}
			NetObjectKind::Custom(model) => Some(model.initial()),
		}
	}

	pub fn merge_op(&self, value: Value) -> PatchOp {
		PatchOp::merge(None, value)
	}

	pub fn append_op(&self, item: Value) -> PatchOp {
		PatchOp::insert(self.collection_path(), item)
	}

	/// Upsert by `id` into the collection. Values without a collection merge
	/// at the root.
	pub fn upsert_op(&self, items: Vec<Value>) -> PatchOp {
		PatchOp::merge(self.collection_path(), Value::Array(items))
	}

	pub fn remove_by_id_op(&self, id: &str) -> PatchOp {
		match self.collection_path() {
			Some(path) => PatchOp::remove(Some(path), json!({ "id": id })),
			None => PatchOp::remove(None, Value::String(id.to_string())),
		}
	}

	pub fn remove_at_op(&self, index: usize) -> PatchOp {
		PatchOp::remove(self.collection_path(), json!(index))
	}

	pub fn handle_command(
		&self,
		state: &Value,
		command: &Command,
	) -> Result<Vec<PatchOp>, CommandRejected> {
		match self {
			NetObjectKind::Custom(model) => model.handle(state, command),
			_ => Err(CommandRejected::Unsupported),
		}
	}
}

/// Delivery guarantees for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
	/// Track acknowledgments and resend on timeout.
	pub enabled: bool,
	/// Largest revision gap resent as individual patches. `None` uses the
	/// configured default.
	pub max_incremental: Option<u64>,
}

impl Default for AckPolicy {
	fn default() -> Self {
		Self {
			enabled: true,
			max_incremental: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct NetObjectDescriptor {
	pub id: String,
	pub kind: NetObjectKind,
	pub initial: Option<Value>,
	pub ack_policy: AckPolicy,
	/// Replay to a (re)connecting peer from its last acknowledged revision.
	pub replay_on_connect: bool,
	/// Clients ask for a snapshot as soon as they start.
	pub request_on_start: bool,
}

impl NetObjectDescriptor {
	fn new(id: impl Into<String>, kind: NetObjectKind) -> Self {
		let initial = kind.initial_value();
		Self {
			id: id.into(),
			kind,
			initial,
			ack_policy: AckPolicy::default(),
			replay_on_connect: true,
			request_on_start: true,
		}
	}

	pub fn value(id: impl Into<String>) -> Self {
		Self::new(id, NetObjectKind::Value)
	}

	pub fn list(id: impl Into<String>, path: impl Into<String>) -> Self {
		Self::new(id, NetObjectKind::List { path: path.into() })
	}

	pub fn keyed_list(id: impl Into<String>, path: impl Into<String>) -> Self {
		Self::new(id, NetObjectKind::KeyedList { path: path.into() })
	}

	pub fn custom(id: impl Into<String>, model: Arc<dyn CommandModel>) -> Self {
		Self::new(id, NetObjectKind::Custom(model))
	}

	pub fn with_initial(mut self, initial: Value) -> Self {
		self.initial = Some(initial);
		self
	}

	pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
		self.ack_policy = policy;
		self
	}

	pub fn with_max_incremental(mut self, cap: u64) -> Self {
		self.ack_policy.max_incremental = Some(cap);
		self
	}

	pub fn replay_on_connect(mut self, enabled: bool) -> Self {
		self.replay_on_connect = enabled;
		self
	}

	pub fn request_on_start(mut self, enabled: bool) -> Self {
		self.request_on_start = enabled;
		self
	}
}

/// Descriptors in registration order.
#[derive(Debug, Default, Clone)]
pub struct NetObjectRegistry {
	descriptors: Vec<NetObjectDescriptor>,
	index: HashMap<String, usize>,
}

impl NetObjectRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// The roster and chat log every session carries.
	pub fn with_builtins() -> Self {
		let mut registry = Self::new();
		registry.register(NetObjectDescriptor::keyed_list(ROSTER, "participants").with_max_incremental(5));
		registry.register(NetObjectDescriptor::list(CHATLOG, "entries").with_max_incremental(20));
		registry
	}

	/// Add a descriptor. A second registration for the same id is ignored and
	/// returns false.
	pub fn register(&mut self, descriptor: NetObjectDescriptor) -> bool {
		if self.index.contains_key(&descriptor.id) {
			log::debug!("net object '{}' already registered", descriptor.id);
			return false;
		}
		self.index
			.insert(descriptor.id.clone(), self.descriptors.len());
		self.descriptors.push(descriptor);
		true
	}

	pub fn get(&self, id: &str) -> Option<&NetObjectDescriptor> {
		self.index.get(id).map(|&i| &self.descriptors[i])
	}

	pub fn descriptors(&self) -> impl Iterator<Item = &NetObjectDescriptor> {
		self.descriptors.iter()
	}

	pub fn len(&self) -> usize {
		self.descriptors.len()
	}

	pub fn is_empty(&self) -> bool {
		self.descriptors.is_empty()
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::patch::{self, PatchKind};

	struct Counter;

	impl CommandModel for Counter {
		fn initial(&self) -> Value {
			json!({"count": 0})
		}

		fn handle(&self, state: &Value, command: &Command) -> Result<Vec<PatchOp>, CommandRejected> {
			match command.name.as_str() {
				"increment" => {
					let count = state["count"].as_i64().unwrap_or(0);
					Ok(vec![PatchOp::set(Some("count"), json!(count + 1))])
				}
				other => Err(CommandRejected::UnknownCommand(other.to_string())),
			}
		}
	}

	#[test]
	fn builtins_are_registered_in_order() {
		let registry = NetObjectRegistry::with_builtins();
		let ids: Vec<&str> = registry.descriptors().map(|d| d.id.as_str()).collect();
		assert_eq!(ids, vec![ROSTER, CHATLOG]);

		let roster = registry.get(ROSTER).unwrap();
		assert_eq!(roster.initial, Some(json!({"participants": []})));
		assert_eq!(roster.ack_policy.max_incremental, Some(5));
		assert_eq!(registry.get(CHATLOG).unwrap().ack_policy.max_incremental, Some(20));
	}

	#[test]
	fn duplicate_registration_is_ignored() {
		let mut registry = NetObjectRegistry::new();
		assert!(registry.register(NetObjectDescriptor::value("score").with_initial(json!(0))));
		assert!(!registry.register(NetObjectDescriptor::value("score").with_initial(json!(9))));
		assert_eq!(registry.len(), 1);
		assert_eq!(registry.get("score").unwrap().initial, Some(json!(0)));
	}

	#[test]
	fn keyed_list_adapter_ops() {
		let kind = NetObjectKind::KeyedList {
			path: "participants".into(),
		};
		let base = kind.initial_value().unwrap();
		let next = patch::apply(
			&base,
			&[kind.upsert_op(vec![json!({"id": "a", "ready": false}), json!({"id": "b"})])],
		);
		let next = patch::apply(&next, &[kind.upsert_op(vec![json!({"id": "a", "ready": true})])]);
		let next = patch::apply(&next, &[kind.remove_by_id_op("b")]);
		assert_eq!(next, json!({"participants": [{"id": "a", "ready": true}]}));
	}

	#[test]
	fn value_adapter_works_at_root() {
		let kind = NetObjectKind::Value;
		assert_eq!(kind.collection_path(), None);
		assert_eq!(kind.remove_by_id_op("k").kind, PatchKind::Remove);
		let next = patch::apply(&json!({"k": 1, "j": 2}), &[kind.remove_by_id_op("k")]);
		assert_eq!(next, json!({"j": 2}));
	}

	#[test]
	fn custom_kind_delegates_to_model() {
		let descriptor = NetObjectDescriptor::custom("counter", Arc::new(Counter));
		assert_eq!(descriptor.initial, Some(json!({"count": 0})));

		let cmd = Command {
			actor: "p1".into(),
			name: "increment".into(),
			args: Value::Null,
		};
		let ops = descriptor.kind.handle_command(&json!({"count": 4}), &cmd).unwrap();
		assert_eq!(patch::apply(&json!({"count": 4}), &ops), json!({"count": 5}));

		let bad = Command {
			name: "explode".into(),
			..cmd.clone()
		};
		assert!(descriptor.kind.handle_command(&json!({}), &bad).is_err());
		assert_eq!(
			NetObjectKind::Value.handle_command(&json!({}), &cmd),
			Err(CommandRejected::Unsupported)
		);
	}
}
