use std::collections::{HashMap, VecDeque};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ReplicationSettings;
use crate::net::{Message, PublishContext, Transport};
use crate::patch::{self, PatchOp};

/// A revisioned copy of one object's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
	pub revision: u64,
	pub value: Value,
}

/// The ops that produced one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchLogEntry {
	pub revision: u64,
	pub ops: Vec<PatchOp>,
}

struct HostObject {
	state: ObjectState,
	log: VecDeque<PatchLogEntry>,
}

impl HostObject {
	/// Entries after `since`, or `None` once the log no longer reaches back
	/// that far.
	fn entries_after(&self, since: u64) -> Option<Vec<PatchLogEntry>> {
		if since >= self.state.revision {
			return Some(Vec::new());
		}
		let oldest = self.log.front()?.revision;
		if oldest > since + 1 {
			return None;
		}
		Some(
			self.log
				.iter()
				.filter(|e| e.revision > since)
				.cloned()
				.collect(),
		)
	}
}

/// Canonical state for every object the host owns.
///
/// The replicator is the only writer. Each write bumps the object's revision by
/// exactly one, records the ops in a bounded log and publishes them, so publish
/// order always equals log order and revisions run gapless from 1.
pub struct HostReplicator {
	settings: ReplicationSettings,
	objects: HashMap<String, HostObject>,
}

impl HostReplicator {
	pub fn new(settings: ReplicationSettings) -> Self {
		Self {
			settings,
			objects: HashMap::new(),
		}
	}

	/// Replace the whole value and publish `object:replace`.
	pub fn set(
		&mut self,
		id: &str,
		value: Value,
		out: &mut dyn Transport,
		ctx: &PublishContext,
	) -> bool {
		let rev = self.commit(id, value.clone(), vec![PatchOp::set(None, value.clone())]);
		out.publish(&Message::replace(id, rev, value), ctx)
	}

	/// Apply `ops` to the current value and publish them as `object:patch`.
	pub fn apply(
		&mut self,
		id: &str,
		ops: Vec<PatchOp>,
		out: &mut dyn Transport,
		ctx: &PublishContext,
	) -> bool {
		let base = self
			.objects
			.get(id)
			.map(|o| o.state.value.clone())
			.unwrap_or(Value::Null);
		let next = patch::apply(&base, &ops);
		let rev = self.commit(id, next, ops.clone());
		out.publish(&Message::patch(id, rev, ops), ctx)
	}

	fn commit(&mut self, id: &str, value: Value, ops: Vec<PatchOp>) -> u64 {
		let capacity = self.settings.log_capacity.max(1);
		let object = self
			.objects
			.entry(id.to_string())
			.or_insert_with(|| HostObject {
				state: ObjectState {
					revision: 0,
					value: Value::Null,
				},
				log: VecDeque::with_capacity(capacity),
			});

		object.state.revision += 1;
		object.state.value = value;
		let revision = object.state.revision;

		if object.log.len() == capacity {
			object.log.pop_front();
		}
		object.log.push_back(PatchLogEntry { revision, ops });
		debug!("object '{}' advanced to rev {}", id, revision);
		revision
	}

	pub fn get(&self, id: &str) -> Option<&ObjectState> {
		self.objects.get(id).map(|o| &o.state)
	}

	pub fn revision(&self, id: &str) -> Option<u64> {
		self.get(id).map(|s| s.revision)
	}

	pub fn ids(&self) -> impl Iterator<Item = &str> {
		self.objects.keys().map(String::as_str)
	}

	/// Serve a pull request.
	///
	/// Replays the log one patch at a time when `since_rev` is still inside the
	/// retained window and the gap is under the burst cap; otherwise publishes
	/// a full snapshot. Returns false for objects that were never written.
	pub fn on_request(
		&self,
		id: &str,
		since_rev: Option<u64>,
		out: &mut dyn Transport,
		ctx: &PublishContext,
	) -> bool {
		let Some(object) = self.objects.get(id) else {
			debug!("request for unknown object '{}'", id);
			return false;
		};
		let current = object.state.revision;

		if let Some(since) = since_rev {
			if since == current {
				return true;
			}
			if since < current && current - since < self.settings.replay_burst_cap {
				if let Some(entries) = object.entries_after(since) {
					let mut delivered = true;
					for entry in entries {
						delivered &= out.publish(&Message::patch(id, entry.revision, entry.ops), ctx);
					}
					return delivered;
				}
			}
			if since > current {
				warn!(
					"peer asked for '{}' since rev {} but host is at {}; sending snapshot",
					id, since, current
				);
			}
		}

		out.publish(&Message::replace(id, current, object.state.value.clone()), ctx)
	}

	/// Log entries after `since_rev`, if the retained window still covers them.
	pub fn logs_since(&self, id: &str, since_rev: u64) -> Option<Vec<PatchLogEntry>> {
		self.objects.get(id)?.entries_after(since_rev)
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::net::MemoryTransport;

	fn replicator(log_capacity: usize) -> HostReplicator {
		HostReplicator::new(ReplicationSettings {
			log_capacity,
			replay_burst_cap: 64,
			default_incremental_cap: 16,
		})
	}

	#[test]
	fn set_then_apply_publishes_in_order() {
		let mut host = replicator(16);
		let mut out = MemoryTransport::broadcast_only();
		let ctx = PublishContext::broadcast();

		assert!(host.set("chatlog", json!({"entries": []}), &mut out, &ctx));
		assert!(host.apply(
			"chatlog",
			vec![PatchOp::insert(Some("entries"), json!({"text": "hi"}))],
			&mut out,
			&ctx
		));

		let sent = out.take();
		assert_eq!(sent[0].message, Message::replace("chatlog", 1, json!({"entries": []})));
		assert_eq!(
			sent[1].message,
			Message::patch(
				"chatlog",
				2,
				vec![PatchOp::insert(Some("entries"), json!({"text": "hi"}))]
			)
		);
		assert_eq!(host.get("chatlog").unwrap().value, json!({"entries": [{"text": "hi"}]}));
	}

	#[test]
	fn first_apply_starts_at_rev_one() {
		let mut host = replicator(16);
		let mut out = MemoryTransport::broadcast_only();
		host.apply("v", vec![PatchOp::merge(None, json!({"a": 1}))], &mut out, &PublishContext::broadcast());
		assert_eq!(host.revision("v"), Some(1));
		assert_eq!(host.revision("missing"), None);
	}

	#[test]
	fn request_inside_window_replays_patches() {
		let mut host = replicator(16);
		let mut out = MemoryTransport::broadcast_only();
		let ctx = PublishContext::broadcast();
		host.set("list", json!({"items": []}), &mut out, &ctx);
		for n in 0..3 {
			host.apply("list", vec![PatchOp::insert(Some("items"), json!(n))], &mut out, &ctx);
		}
		out.take();

		assert!(host.on_request("list", Some(2), &mut out, &PublishContext::to("p1")));
		let sent = out.take();
		let revs: Vec<u64> = sent.iter().filter_map(|d| d.message.revision().map(|r| r.1)).collect();
		assert_eq!(revs, vec![3, 4]);
		assert!(sent.iter().all(|d| matches!(d.message, Message::Patch(_))));
		assert!(sent.iter().all(|d| d.target.as_deref() == Some("p1")));
	}

	#[test]
	fn request_outside_window_sends_snapshot() {
		let mut host = replicator(2);
		let mut out = MemoryTransport::broadcast_only();
		let ctx = PublishContext::broadcast();
		host.set("list", json!({"items": []}), &mut out, &ctx);
		for n in 0..4 {
			host.apply("list", vec![PatchOp::insert(Some("items"), json!(n))], &mut out, &ctx);
		}
		out.take();

		// Only revs 4 and 5 are retained.
		assert!(host.logs_since("list", 1).is_none());
		assert_eq!(host.logs_since("list", 3).map(|e| e.len()), Some(2));

		host.on_request("list", Some(1), &mut out, &ctx);
		host.on_request("list", None, &mut out, &ctx);
		host.on_request("list", Some(99), &mut out, &ctx);
		let sent = out.take();
		assert_eq!(sent.len(), 3);
		for d in sent {
			assert_eq!(d.message, Message::replace("list", 5, json!({"items": [0, 1, 2, 3]})));
		}
	}

	#[test]
	fn request_beyond_burst_cap_sends_snapshot() {
		let mut host = HostReplicator::new(ReplicationSettings {
			log_capacity: 128,
			replay_burst_cap: 2,
			default_incremental_cap: 16,
		});
		let mut out = MemoryTransport::broadcast_only();
		let ctx = PublishContext::broadcast();
		host.set("v", json!({}), &mut out, &ctx);
		for n in 0..5 {
			host.apply("v", vec![PatchOp::set(Some("n"), json!(n))], &mut out, &ctx);
		}
		out.take();

		// At rev 6: a gap equal to the cap is already too wide to replay.
		host.on_request("v", Some(4), &mut out, &ctx);
		let sent = out.take();
		assert_eq!(sent.len(), 1);
		assert!(matches!(&sent[0].message, Message::Replace(b) if b.rev == 6));

		host.on_request("v", Some(5), &mut out, &ctx);
		let sent = out.take();
		assert_eq!(sent.len(), 1);
		assert!(matches!(&sent[0].message, Message::Patch(b) if b.rev == 6));
	}

	#[test]
	fn up_to_date_request_publishes_nothing() {
		let mut host = replicator(8);
		let mut out = MemoryTransport::broadcast_only();
		let ctx = PublishContext::broadcast();
		host.set("v", json!(1), &mut out, &ctx);
		out.take();
		assert!(host.on_request("v", Some(1), &mut out, &ctx));
		assert!(out.sent().is_empty());
		assert!(!host.on_request("nope", None, &mut out, &ctx));
	}
}
