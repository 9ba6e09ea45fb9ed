use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::ClientSettings;
use crate::error::ReplicationError;
use crate::patch::{self, PatchOp};
use crate::sync::host::ObjectState;
use crate::sync::timers::TimerQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
	Applied,
	Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
	/// The ops failed structural validation.
	InvalidOps,
	/// No snapshot has been received for the object yet.
	NoBase,
	/// Buffering the patch would exceed the reorder queue bound.
	QueueOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
	Applied,
	Queued,
	Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallReason {
	Timeout,
	Overflow,
}

/// Transitions published on the store's event bus.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
	Replaced { id: String, rev: u64 },
	Applied { id: String, rev: u64 },
	Queued { id: String, rev: u64, depth: usize },
	Stalled { id: String, reason: StallReason },
	Rejected { id: String, rev: u64, reason: RejectReason },
}

pub type SubscriptionId = u64;

type Listener = Box<dyn FnMut(&str, &ObjectState) + Send>;

/// A client's private copies of replicated objects.
///
/// Patches are applied strictly in revision order. Patches that arrive early
/// wait in a bounded per-object queue; anything the store cannot reconcile
/// (invalid ops, no base snapshot, an overflowing or stalled queue) is turned
/// into a resync request so the object is rebuilt from a fresh snapshot
/// instead of silently diverging.
pub struct ClientStore {
	settings: ClientSettings,
	states: HashMap<String, ObjectState>,
	pending: HashMap<String, BTreeMap<u64, Vec<PatchOp>>>,
	stall_timers: TimerQueue<String>,
	resync: Vec<String>,
	listeners: HashMap<String, BTreeMap<SubscriptionId, Listener>>,
	next_listener: SubscriptionId,
	events: broadcast::Sender<StoreEvent>,
}

impl ClientStore {
	pub fn new(settings: ClientSettings) -> Self {
		let (events, _) = broadcast::channel(256);
		Self {
			settings,
			states: HashMap::new(),
			pending: HashMap::new(),
			stall_timers: TimerQueue::new(),
			resync: Vec::new(),
			listeners: HashMap::new(),
			next_listener: 1,
			events,
		}
	}

	pub fn get(&self, id: &str) -> Option<&ObjectState> {
		self.states.get(id)
	}

	pub fn revision(&self, id: &str) -> Option<u64> {
		self.states.get(id).map(|s| s.revision)
	}

	pub fn pending_len(&self, id: &str) -> usize {
		self.pending.get(id).map_or(0, BTreeMap::len)
	}

	pub fn pending_total(&self) -> usize {
		self.pending.values().map(BTreeMap::len).sum()
	}

	pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
		self.events.subscribe()
	}

	/// Call `listener` with the new state after every revision of `id`.
	pub fn subscribe<F>(&mut self, id: &str, listener: F) -> SubscriptionId
	where
		F: FnMut(&str, &ObjectState) + Send + 'static,
	{
		let sub = self.next_listener;
		self.next_listener = self.next_listener.saturating_add(1);
		self.listeners
			.entry(id.to_string())
			.or_default()
			.insert(sub, Box::new(listener));
		sub
	}

	pub fn unsubscribe(&mut self, sub: SubscriptionId) -> bool {
		self.listeners
			.values_mut()
			.any(|subs| subs.remove(&sub).is_some())
	}

	/// Install a full snapshot unless it is not newer than what we hold.
	pub fn apply_replace(&mut self, id: &str, rev: u64, value: Value, now: Instant) -> ReplaceOutcome {
		if self.revision(id).is_some_and(|current| rev <= current) {
			debug!("stale snapshot for '{}' rev {}", id, rev);
			return ReplaceOutcome::Stale;
		}

		self.store(id, ObjectState { revision: rev, value });
		self.emit(StoreEvent::Replaced {
			id: id.to_string(),
			rev,
		});
		self.drain(id, now);
		ReplaceOutcome::Applied
	}

	/// Apply, queue or reject one patch.
	pub fn apply_patch(&mut self, id: &str, rev: u64, ops: Vec<PatchOp>, now: Instant) -> PatchOutcome {
		if let Err(e) = patch::validate(&ops) {
			let err = ReplicationError::Validation {
				id: id.to_string(),
				rev,
				reason: e.to_string(),
			};
			warn!("{}", err);
			return self.reject(id, rev, RejectReason::InvalidOps);
		}

		let Some(current) = self.revision(id) else {
			debug!("patch for '{}' rev {} before any snapshot", id, rev);
			return self.reject(id, rev, RejectReason::NoBase);
		};

		if rev <= current {
			return PatchOutcome::Applied;
		}

		if rev > current + 1 {
			return self.enqueue(id, current, rev, ops, now);
		}

		self.advance(id, rev, &ops);
		self.drain(id, now);
		PatchOutcome::Applied
	}

	fn enqueue(&mut self, id: &str, current: u64, rev: u64, ops: Vec<PatchOp>, now: Instant) -> PatchOutcome {
		let queue = self.pending.entry(id.to_string()).or_default();
		queue.insert(rev, ops);
		let depth = queue.len();

		if depth > self.settings.max_queued_revs {
			let err = ReplicationError::SequenceGap {
				id: id.to_string(),
				current,
				received: rev,
			};
			warn!("{}; {} patches queued, resyncing", err, depth);
			self.drop_queue(id);
			self.emit(StoreEvent::Stalled {
				id: id.to_string(),
				reason: StallReason::Overflow,
			});
			return self.reject(id, rev, RejectReason::QueueOverflow);
		}

		if !self.stall_timers.is_armed(&id.to_string()) {
			self.stall_timers
				.arm(id.to_string(), now + self.settings.stall_timeout());
		}
		self.emit(StoreEvent::Queued {
			id: id.to_string(),
			rev,
			depth,
		});
		PatchOutcome::Queued
	}

	fn reject(&mut self, id: &str, rev: u64, reason: RejectReason) -> PatchOutcome {
		self.emit(StoreEvent::Rejected {
			id: id.to_string(),
			rev,
			reason,
		});
		self.request_resync(id);
		PatchOutcome::Rejected(reason)
	}

	fn advance(&mut self, id: &str, rev: u64, ops: &[PatchOp]) {
		let base = self
			.states
			.get(id)
			.map(|s| s.value.clone())
			.unwrap_or(Value::Null);
		let value = patch::apply(&base, ops);
		self.store(id, ObjectState { revision: rev, value });
		self.emit(StoreEvent::Applied {
			id: id.to_string(),
			rev,
		});
	}

	/// Apply queued patches that now follow on contiguously.
	fn drain(&mut self, id: &str, now: Instant) {
		let Some(mut current) = self.revision(id) else {
			return;
		};
		let mut progressed = false;

		loop {
			let Some(queue) = self.pending.get_mut(id) else {
				break;
			};
			queue.retain(|rev, _| *rev > current);
			let Some(ops) = queue.remove(&(current + 1)) else {
				break;
			};
			self.advance(id, current + 1, &ops);
			current += 1;
			progressed = true;
		}

		let remaining = self.pending_len(id);
		let key = id.to_string();
		if remaining == 0 {
			self.pending.remove(id);
			self.stall_timers.cancel(&key);
		} else if progressed {
			self.stall_timers
				.arm(key, now + self.settings.stall_timeout());
		}
	}

	/// Fire stall timeouts due at `now`.
	pub fn poll_stalls(&mut self, now: Instant) -> usize {
		let stalled = self.stall_timers.pop_expired(now);
		for id in &stalled {
			let waiting_for = self.revision(id).map_or(1, |r| r + 1);
			let err = ReplicationError::StallTimeout {
				id: id.clone(),
				waiting_for,
			};
			info!("{}; dropping {} queued patches", err, self.pending_len(id));
			self.drop_queue(id);
			self.emit(StoreEvent::Stalled {
				id: id.clone(),
				reason: StallReason::Timeout,
			});
			self.request_resync(id);
		}
		stalled.len()
	}

	pub fn next_deadline(&mut self) -> Option<Instant> {
		self.stall_timers.next_deadline()
	}

	fn drop_queue(&mut self, id: &str) {
		self.pending.remove(id);
		self.stall_timers.cancel(&id.to_string());
	}

	fn request_resync(&mut self, id: &str) {
		if !self.resync.iter().any(|r| r == id) {
			self.resync.push(id.to_string());
		}
	}

	/// Objects that need a fresh snapshot, in the order they failed.
	pub fn take_resync_requests(&mut self) -> Vec<String> {
		std::mem::take(&mut self.resync)
	}

	fn store(&mut self, id: &str, state: ObjectState) {
		self.states.insert(id.to_string(), state);
		if let (Some(subs), Some(state)) = (self.listeners.get_mut(id), self.states.get(id)) {
			for listener in subs.values_mut() {
				listener(id, state);
			}
		}
	}

	fn emit(&self, event: StoreEvent) {
		// No receivers is fine; the bus is purely observational.
		let _ = self.events.send(event);
	}
}
