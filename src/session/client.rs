use std::sync::Arc;

use log::debug;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::Settings;
use crate::net::protocol::{ChatBody, CommandBody, HelloBody, ReadyBody};
use crate::net::{Envelope, Message, PublishContext, Transport};
use crate::observability::ReplicationMetrics;
use crate::patch::PatchOp;
use crate::registry::NetObjectRegistry;
use crate::sync::{
	ClientStore, ObjectState, PatchOutcome, ReplaceOutcome, StoreEvent, SubscriptionId,
};

/// The peer end of a session: a [`ClientStore`] wired to the host link.
///
/// Successful applies are acknowledged with the store's current revision and
/// every resync the store asks for goes out as a snapshot request.
pub struct ClientSession<T: Transport> {
	registry: Arc<NetObjectRegistry>,
	transport: T,
	store: ClientStore,
	metrics: Option<Arc<ReplicationMetrics>>,
	reported_depth: i64,
}

impl<T: Transport> ClientSession<T> {
	pub fn new(registry: Arc<NetObjectRegistry>, transport: T, settings: &Settings) -> Self {
		Self {
			registry,
			transport,
			store: ClientStore::new(settings.client.clone()),
			metrics: None,
			reported_depth: 0,
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<ReplicationMetrics>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn store(&self) -> &ClientStore {
		&self.store
	}

	pub fn transport(&self) -> &T {
		&self.transport
	}

	pub fn transport_mut(&mut self) -> &mut T {
		&mut self.transport
	}

	pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
		self.store.events()
	}

	/// Ask the host for every object declared `request_on_start`.
	pub fn start(&mut self) -> usize {
		let registry = Arc::clone(&self.registry);
		let mut requested = 0;
		for descriptor in registry.descriptors().filter(|d| d.request_on_start) {
			if self.send(&Message::request(descriptor.id.as_str(), None)) {
				requested += 1;
			}
		}
		requested
	}

	pub fn send(&mut self, message: &Message) -> bool {
		self.transport.publish(message, &PublishContext::broadcast())
	}

	pub fn hello(&mut self, participant_id: Option<&str>, name: &str) -> bool {
		self.send(&Message::Hello(HelloBody {
			participant_id: participant_id.map(str::to_string),
			name: name.to_string(),
		}))
	}

	pub fn ready(&mut self, ready: bool) -> bool {
		self.send(&Message::Ready(ReadyBody { ready }))
	}

	pub fn chat(&mut self, text: &str) -> bool {
		self.send(&Message::Chat(ChatBody {
			text: text.to_string(),
		}))
	}

	pub fn command(&mut self, id: &str, name: &str, args: Value) -> bool {
		self.send(&Message::Command(CommandBody {
			id: id.to_string(),
			name: name.to_string(),
			args,
		}))
	}

	pub fn leave(&mut self) -> bool {
		self.send(&Message::leave())
	}

	fn count(&self, f: impl FnOnce(&ReplicationMetrics)) {
		if let Some(m) = self.metrics.as_deref() {
			f(m);
		}
	}

	/// Feed one envelope from the host. Returns false when it was not a state
	/// message this store could use.
	pub fn handle_message(&mut self, envelope: Envelope) -> bool {
		self.count(|m| m.messages_received.inc());
		let message = match Message::try_from(envelope) {
			Ok(message) => message,
			Err(e) => {
				debug!("dropping message from host: {}", e);
				self.count(|m| m.messages_dropped.inc());
				return false;
			}
		};

		match message {
			Message::Replace(b) => {
				self.apply_replace(&b.id, b.rev, b.value);
				true
			}
			Message::Patch(b) => !matches!(self.apply_patch(&b.id, b.rev, b.ops), PatchOutcome::Rejected(_)),
			other => {
				debug!("ignoring '{}' from host", other.kind());
				false
			}
		}
	}

	fn apply_replace(&mut self, id: &str, rev: u64, value: Value) -> ReplaceOutcome {
		let outcome = self.store.apply_replace(id, rev, value, Instant::now());
		if outcome == ReplaceOutcome::Applied {
			// The snapshot itself plus anything it let drain.
			let drained = self.store.revision(id).map_or(0, |now| now.saturating_sub(rev));
			self.count(|m| m.revisions_applied.inc_by(1 + drained));
		}
		self.acknowledge(id);
		self.settle();
		outcome
	}

	fn apply_patch(&mut self, id: &str, rev: u64, ops: Vec<PatchOp>) -> PatchOutcome {
		let before = self.store.revision(id).unwrap_or_default();
		let outcome = self.store.apply_patch(id, rev, ops, Instant::now());
		match outcome {
			PatchOutcome::Applied => {
				let after = self.store.revision(id).unwrap_or_default();
				self.count(|m| m.revisions_applied.inc_by(after.saturating_sub(before)));
				self.acknowledge(id);
			}
			PatchOutcome::Queued => self.count(|m| m.patches_queued.inc()),
			PatchOutcome::Rejected(_) => self.count(|m| m.patches_rejected.inc()),
		}
		self.settle();
		outcome
	}

	fn acknowledge(&mut self, id: &str) {
		if let Some(rev) = self.store.revision(id) {
			self.send(&Message::ack(id, rev));
		}
	}

	/// Flush resync requests and report queue depth.
	fn settle(&mut self) {
		for id in self.store.take_resync_requests() {
			self.count(|m| m.resync_requests.inc());
			self.send(&Message::request(id, None));
		}
		let depth = i64::try_from(self.store.pending_total()).unwrap_or(i64::MAX);
		let delta = depth - self.reported_depth;
		if delta != 0 {
			self.count(|m| m.pending_depth.add(delta));
			self.reported_depth = depth;
		}
	}

	/// Fire due stall timeouts. Returns how many objects stalled.
	pub fn poll(&mut self) -> usize {
		let stalled = self.store.poll_stalls(Instant::now());
		if stalled > 0 {
			self.count(|m| m.stalls.inc_by(stalled as u64));
		}
		self.settle();
		stalled
	}

	pub fn next_deadline(&mut self) -> Option<Instant> {
		self.store.next_deadline()
	}

	pub fn object(&mut self, id: &str) -> ClientHandle<'_, T> {
		ClientHandle {
			session: self,
			id: id.to_string(),
		}
	}

	pub fn unsubscribe(&mut self, sub: SubscriptionId) -> bool {
		self.store.unsubscribe(sub)
	}
}

/// One object as seen from a peer.
pub struct ClientHandle<'a, T: Transport> {
	session: &'a mut ClientSession<T>,
	id: String,
}

impl<T: Transport> ClientHandle<'_, T> {
	pub fn on_replace(&mut self, rev: u64, value: Value) -> ReplaceOutcome {
		self.session.apply_replace(&self.id, rev, value)
	}

	pub fn on_patch(&mut self, rev: u64, ops: Vec<PatchOp>) -> PatchOutcome {
		self.session.apply_patch(&self.id, rev, ops)
	}

	pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
	where
		F: FnMut(&str, &ObjectState) + Send + 'static,
	{
		self.session.store.subscribe(&self.id, listener)
	}

	pub fn get(&self) -> Option<&ObjectState> {
		self.session.store.get(&self.id)
	}

	pub fn request(&mut self, since_rev: Option<u64>) -> bool {
		let message = Message::request(self.id.as_str(), since_rev);
		self.session.send(&message)
	}
}
