use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::{LimitSettings, ReplicationSettings, Settings};
use crate::error::ReplicationError;
use crate::net::protocol::{AckBody, ChatBody, CommandBody, HelloBody, ReadyBody, RequestBody};
use crate::net::{Envelope, Message, PeerId, PublishContext, RateLimiter, Transport};
use crate::observability::ReplicationMetrics;
use crate::patch::PatchOp;
use crate::registry::{CHATLOG, Command, NetObjectKind, NetObjectRegistry, ROSTER};
use crate::session::roster::{NoHooks, Participant, Roster, SessionHooks};
use crate::sync::{AckScheduler, HostReplicator, ObjectState, ResendTask};

/// Identity used for peers that have not said hello.
pub const LOCAL_ACTOR: &str = "local";

/// Every envelope the host receives, before built-in handling.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
	pub peer: PeerId,
	pub envelope: Envelope,
}

pub type MessageHandler<T> = Box<dyn FnMut(&mut HostSession<T>, &str, &Envelope) -> bool + Send>;

/// Wraps the transport so every revision published is tracked for acks.
struct Outbound<'a, T> {
	transport: &'a mut T,
	acks: &'a mut AckScheduler,
	registry: &'a NetObjectRegistry,
	metrics: Option<&'a ReplicationMetrics>,
	now: Instant,
}

impl<T: Transport> Transport for Outbound<'_, T> {
	fn publish(&mut self, message: &Message, ctx: &PublishContext) -> bool {
		let delivered = self.transport.publish(message, ctx);
		if let Some(m) = self.metrics {
			match message {
				Message::Replace(_) => m.snapshots_published.inc(),
				Message::Patch(_) => m.patches_published.inc(),
				_ => {}
			}
		}

		let Some((id, rev)) = message.revision() else {
			return delivered;
		};
		let tracked = self
			.registry
			.get(id)
			.is_none_or(|d| d.ack_policy.enabled);
		// Without peer enumeration there is nobody to resend to.
		let Some(peers) = self.transport.peer_ids().filter(|_| tracked) else {
			return delivered;
		};
		match &ctx.target {
			Some(peer) => self.acks.on_sent(peer, id, rev, self.now),
			None => {
				for peer in &peers {
					self.acks.on_sent(peer, id, rev, self.now);
				}
			}
		}
		delivered
	}

	fn peer_ids(&self) -> Option<Vec<PeerId>> {
		self.transport.peer_ids()
	}

	fn send_to_peer(&mut self, peer: &str, message: &Message) -> bool {
		self.transport.send_to_peer(peer, message)
	}
}

struct Limiters {
	requests: RateLimiter,
	ready: RateLimiter,
	chat: RateLimiter,
	commands: RateLimiter,
}

impl Limiters {
	fn new(limits: &LimitSettings) -> Self {
		Self {
			requests: RateLimiter::new(limits.requests, limits.window()),
			ready: RateLimiter::new(limits.ready, limits.window()),
			chat: RateLimiter::new(limits.chat, limits.window()),
			commands: RateLimiter::new(limits.commands, limits.window()),
		}
	}

	fn sweep(&mut self, now: Instant) {
		self.requests.sweep(now);
		self.ready.sweep(now);
		self.chat.sweep(now);
		self.commands.sweep(now);
	}
}

/// The authoritative end of a session.
///
/// Routes inbound envelopes, owns canonical object state and the roster, and
/// drives acknowledgment-based resends. All methods run to completion against
/// the tokio clock; the caller schedules [`HostSession::poll`] for
/// [`HostSession::next_deadline`].
pub struct HostSession<T: Transport> {
	registry: Arc<NetObjectRegistry>,
	replication: ReplicationSettings,
	limits: LimitSettings,
	transport: T,
	replicator: HostReplicator,
	acks: AckScheduler,
	roster: Box<dyn Roster>,
	hooks: Box<dyn SessionHooks>,
	bindings: HashMap<PeerId, String>,
	limiters: Limiters,
	handlers: HashMap<String, MessageHandler<T>>,
	observers: broadcast::Sender<InboundEvent>,
	metrics: Option<Arc<ReplicationMetrics>>,
	chat_seq: u64,
}

impl<T: Transport> HostSession<T> {
	/// Build a session and publish every registered initial value as rev 1.
	pub fn new(
		registry: Arc<NetObjectRegistry>,
		transport: T,
		roster: Box<dyn Roster>,
		settings: &Settings,
	) -> Self {
		let (observers, _) = broadcast::channel(256);
		let mut session = Self {
			registry: Arc::clone(&registry),
			replication: settings.replication.clone(),
			limits: settings.limits.clone(),
			transport,
			replicator: HostReplicator::new(settings.replication.clone()),
			acks: AckScheduler::new(settings.acks.clone()),
			roster,
			hooks: Box::new(NoHooks),
			bindings: HashMap::new(),
			limiters: Limiters::new(&settings.limits),
			handlers: HashMap::new(),
			observers,
			metrics: None,
			chat_seq: 0,
		};

		for descriptor in registry.descriptors() {
			if let Some(initial) = descriptor.initial.clone() {
				session.publish_set(&descriptor.id, initial, &PublishContext::broadcast());
			}
		}
		session
	}

	pub fn with_hooks(mut self, hooks: Box<dyn SessionHooks>) -> Self {
		self.hooks = hooks;
		self
	}

	pub fn with_metrics(mut self, metrics: Arc<ReplicationMetrics>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn transport(&self) -> &T {
		&self.transport
	}

	pub fn transport_mut(&mut self) -> &mut T {
		&mut self.transport
	}

	pub fn roster(&self) -> &dyn Roster {
		self.roster.as_ref()
	}

	pub fn replicator(&self) -> &HostReplicator {
		&self.replicator
	}

	pub fn acks(&self) -> &AckScheduler {
		&self.acks
	}

	pub fn participant_for(&self, peer: &str) -> Option<&str> {
		self.bindings.get(peer).map(String::as_str)
	}

	/// Receive every inbound envelope on a side channel.
	pub fn observe(&self) -> broadcast::Receiver<InboundEvent> {
		self.observers.subscribe()
	}

	/// Handle envelopes of `kind` before the built-in router. A handler that
	/// returns true consumes the envelope.
	pub fn register_handler<F>(&mut self, kind: impl Into<String>, handler: F)
	where
		F: FnMut(&mut HostSession<T>, &str, &Envelope) -> bool + Send + 'static,
	{
		self.handlers.insert(kind.into(), Box::new(handler));
	}

	/// Per-object mutation handle. Unregistered ids behave as plain values.
	pub fn object(&mut self, id: &str) -> HostHandle<'_, T> {
		let kind = self
			.registry
			.get(id)
			.map(|d| d.kind.clone())
			.unwrap_or(NetObjectKind::Value);
		HostHandle {
			session: self,
			id: id.to_string(),
			kind,
		}
	}

	fn split(&mut self) -> (&mut HostReplicator, Outbound<'_, T>) {
		(
			&mut self.replicator,
			Outbound {
				transport: &mut self.transport,
				acks: &mut self.acks,
				registry: &self.registry,
				metrics: self.metrics.as_deref(),
				now: Instant::now(),
			},
		)
	}

	fn publish_set(&mut self, id: &str, value: Value, ctx: &PublishContext) -> bool {
		let (replicator, mut out) = self.split();
		replicator.set(id, value, &mut out, ctx)
	}

	fn publish_ops(&mut self, id: &str, ops: Vec<PatchOp>) -> bool {
		let (replicator, mut out) = self.split();
		replicator.apply(id, ops, &mut out, &PublishContext::broadcast())
	}

	fn serve_request(&mut self, id: &str, since_rev: Option<u64>, ctx: &PublishContext) -> bool {
		let (replicator, mut out) = self.split();
		replicator.on_request(id, since_rev, &mut out, ctx)
	}

	fn count(&self, f: impl FnOnce(&ReplicationMetrics)) {
		if let Some(m) = self.metrics.as_deref() {
			f(m);
		}
	}

	fn actor(&self, peer: &str) -> String {
		self.bindings
			.get(peer)
			.cloned()
			.unwrap_or_else(|| LOCAL_ACTOR.to_string())
	}

	fn limited(&self, key: &str) {
		debug!("{}; dropping", ReplicationError::RateLimited { key: key.to_string() });
		self.count(|m| m.rate_limited.inc());
	}

	/// Route one inbound envelope. Returns true if anything handled it.
	pub fn handle_message(&mut self, peer: &str, envelope: Envelope) -> bool {
		self.count(|m| m.messages_received.inc());
		// No observers is fine.
		let _ = self.observers.send(InboundEvent {
			peer: peer.to_string(),
			envelope: envelope.clone(),
		});

		if let Some(mut handler) = self.handlers.remove(&envelope.kind) {
			let consumed = handler(self, peer, &envelope);
			self.handlers
				.entry(envelope.kind.clone())
				.or_insert(handler);
			if consumed {
				return true;
			}
		}

		let message = match Message::try_from(envelope) {
			Ok(message) => message,
			Err(e) => {
				debug!("dropping message from {}: {}", peer, e);
				self.count(|m| m.messages_dropped.inc());
				return false;
			}
		};

		match message {
			Message::Hello(body) => self.on_hello(peer, body),
			Message::Ready(body) => self.on_ready(peer, body),
			Message::Leave(_) => self.on_leave(peer),
			Message::Request(body) => self.on_object_request(peer, body),
			Message::Ack(body) => self.on_ack(peer, body),
			Message::Chat(body) => self.on_chat(peer, body),
			Message::Command(body) => self.on_command(peer, body),
			Message::Replace(_) | Message::Patch(_) => {
				debug!("ignoring state message from {}; the host is authoritative", peer);
				self.count(|m| m.messages_dropped.inc());
				false
			}
		}
	}

	fn on_hello(&mut self, peer: &str, body: HelloBody) -> bool {
		let id = body
			.participant_id
			.filter(|id| !id.is_empty())
			.unwrap_or_else(|| peer.to_string());
		let participant = self.roster.upsert(Participant::new(id.clone(), body.name));
		if let Some(previous) = self.bindings.insert(peer.to_string(), id) {
			if previous != participant.id {
				self.release_participant(peer, &previous);
			}
		}
		info!("{} joined as '{}' ({})", peer, participant.name, participant.id);

		if let Ok(row) = serde_json::to_value(&participant) {
			self.object(ROSTER).upsert_many(vec![row]);
		}
		self.hooks.on_join(&participant);
		true
	}

	fn on_ready(&mut self, peer: &str, body: ReadyBody) -> bool {
		let Some(id) = self.bindings.get(peer).cloned() else {
			debug!("ready from unbound peer {}", peer);
			return false;
		};
		if !self.limiters.ready.allow(&id, Instant::now()) {
			self.limited(&id);
			return false;
		}
		if !self.roster.set_ready(&id, body.ready) {
			return false;
		}
		self.object(ROSTER)
			.upsert_many(vec![json!({"id": id, "ready": body.ready})])
	}

	fn on_leave(&mut self, peer: &str) -> bool {
		self.acks.forget_peer(peer);
		let Some(id) = self.bindings.remove(peer) else {
			return false;
		};
		self.release_participant(peer, &id)
	}

	/// Drop a participant the peer no longer speaks for, unless another peer
	/// is still bound to it.
	fn release_participant(&mut self, peer: &str, id: &str) -> bool {
		if self.bindings.values().any(|bound| bound == id) {
			return false;
		}
		let Some(participant) = self.roster.remove(id) else {
			return false;
		};
		info!("{} left ({})", peer, participant.id);
		self.object(ROSTER).remove_by_id(&participant.id);
		self.hooks.on_leave(&participant);
		true
	}

	fn on_object_request(&mut self, peer: &str, body: RequestBody) -> bool {
		let key = format!("{}/{}", peer, body.id);
		if !self.limiters.requests.allow(&key, Instant::now()) {
			self.limited(&key);
			return false;
		}
		self.serve_request(&body.id, body.since_rev, &PublishContext::to(peer))
	}

	fn on_ack(&mut self, peer: &str, body: AckBody) -> bool {
		self.count(|m| m.acks_received.inc());
		self.acks.on_ack(peer, &body.id, body.rev)
	}

	fn on_chat(&mut self, peer: &str, body: ChatBody) -> bool {
		let text = body.text.trim();
		if text.is_empty() || text.chars().count() > self.limits.chat_max_len {
			debug!("dropping chat from {}: {} chars", peer, text.chars().count());
			return false;
		}
		let actor = self.actor(peer);
		if !self.limiters.chat.allow(&actor, Instant::now()) {
			self.limited(&actor);
			return false;
		}

		self.chat_seq += 1;
		let name = self
			.roster
			.get(&actor)
			.map(|p| p.name)
			.unwrap_or_else(|| actor.clone());
		let entry = json!({
			"id": format!("{}-{}", actor, self.chat_seq),
			"from": actor,
			"name": name,
			"text": text,
			"at": chrono::Utc::now().to_rfc3339(),
		});
		self.object(CHATLOG).append(entry)
	}

	fn on_command(&mut self, peer: &str, body: CommandBody) -> bool {
		let actor = self.actor(peer);
		if !self.limiters.commands.allow(&actor, Instant::now()) {
			self.limited(&actor);
			return false;
		}
		let registry = Arc::clone(&self.registry);
		let Some(descriptor) = registry.get(&body.id) else {
			debug!("command '{}' for unknown object '{}'", body.name, body.id);
			return false;
		};

		let state = self
			.replicator
			.get(&body.id)
			.map(|s| s.value.clone())
			.or_else(|| descriptor.initial.clone())
			.unwrap_or(Value::Null);
		let command = Command {
			actor,
			name: body.name,
			args: body.args,
		};
		match descriptor.kind.handle_command(&state, &command) {
			Ok(ops) if ops.is_empty() => true,
			Ok(ops) => self.publish_ops(&body.id, ops),
			Err(e) => {
				debug!("command '{}' on '{}' from {} rejected: {}", command.name, body.id, command.actor, e);
				false
			}
		}
	}

	/// Replay objects to a peer from whatever it last acknowledged.
	pub fn on_peer_connected(&mut self, peer: &str) {
		let registry = Arc::clone(&self.registry);
		for descriptor in registry.descriptors().filter(|d| d.replay_on_connect) {
			let since = self.acks.acked_rev(peer, &descriptor.id);
			self.serve_request(&descriptor.id, since, &PublishContext::to(peer));
		}
	}

	/// Stop resending to a peer. Its acknowledged revisions are kept for the
	/// replay on reconnect; its roster row stays until it leaves.
	pub fn on_peer_disconnected(&mut self, peer: &str) {
		self.bindings.remove(peer);
		self.acks.suspend_peer(peer);
	}

	/// Run resends that are due. Returns the number of resend tasks executed.
	pub fn poll(&mut self) -> usize {
		let now = Instant::now();
		let before = self.acks.abandoned();
		let tasks = self.acks.poll(now);
		let abandoned = self.acks.abandoned() - before;
		if abandoned > 0 {
			self.count(|m| m.deliveries_abandoned.inc_by(abandoned));
		}
		for task in &tasks {
			self.resend(task);
		}
		self.limiters.sweep(now);
		tasks.len()
	}

	fn resend(&mut self, task: &ResendTask) {
		let Some(state) = self.replicator.get(&task.id) else {
			return;
		};
		let cap = self
			.registry
			.get(&task.id)
			.and_then(|d| d.ack_policy.max_incremental)
			.unwrap_or(self.replication.default_incremental_cap);

		if let Some(acked) = task.acked {
			let gap = task.last_sent.saturating_sub(acked);
			if gap > 0 && gap <= cap {
				if let Some(entries) = self.replicator.logs_since(&task.id, acked) {
					for entry in entries {
						let rev = entry.revision;
						let message = Message::patch(task.id.as_str(), rev, entry.ops);
						if !self.transport.send_to_peer(&task.peer, &message) {
							warn!("incremental resend of '{}' rev {} to {} failed", task.id, rev, task.peer);
						}
					}
					if let Some(m) = self.metrics.as_deref() {
						m.resends_incremental.inc();
					}
					return;
				}
			}
		}

		let message = Message::replace(task.id.as_str(), state.revision, state.value.clone());
		if !self.transport.send_to_peer(&task.peer, &message) {
			warn!("snapshot resend of '{}' to {} failed", task.id, task.peer);
		}
		if let Some(m) = self.metrics.as_deref() {
			m.resends_snapshot.inc();
		}
	}

	pub fn next_deadline(&mut self) -> Option<Instant> {
		self.acks.next_deadline()
	}
}

/// Mutations for one object, each published as a single revision.
pub struct HostHandle<'a, T: Transport> {
	session: &'a mut HostSession<T>,
	id: String,
	kind: NetObjectKind,
}

impl<T: Transport> HostHandle<'_, T> {
	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn set(&mut self, value: Value) -> bool {
		self.session
			.publish_set(&self.id, value, &PublishContext::broadcast())
	}

	pub fn merge(&mut self, value: Value) -> bool {
		let op = self.kind.merge_op(value);
		self.apply(vec![op])
	}

	pub fn append(&mut self, item: Value) -> bool {
		let op = self.kind.append_op(item);
		self.apply(vec![op])
	}

	pub fn upsert_many(&mut self, items: Vec<Value>) -> bool {
		let op = self.kind.upsert_op(items);
		self.apply(vec![op])
	}

	pub fn remove_by_id(&mut self, id: &str) -> bool {
		let op = self.kind.remove_by_id_op(id);
		self.apply(vec![op])
	}

	pub fn remove_at(&mut self, index: usize) -> bool {
		let op = self.kind.remove_at_op(index);
		self.apply(vec![op])
	}

	pub fn apply(&mut self, ops: Vec<PatchOp>) -> bool {
		self.session.publish_ops(&self.id, ops)
	}

	pub fn get(&self) -> Option<&ObjectState> {
		self.session.replicator.get(&self.id)
	}

	/// Serve a pull request, to one peer or to everyone.
	pub fn on_request(&mut self, since_rev: Option<u64>, peer: Option<&str>) -> bool {
		let ctx = match peer {
			Some(peer) => PublishContext::to(peer),
			None => PublishContext::broadcast(),
		};
		self.session.serve_request(&self.id, since_rev, &ctx)
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::net::{MemoryTransport, kinds};
	use crate::registry::NetObjectDescriptor;
	use crate::session::roster::MemoryRoster;

	fn session(peers: &[&str]) -> HostSession<MemoryTransport> {
		let mut host = HostSession::new(
			Arc::new(NetObjectRegistry::with_builtins()),
			MemoryTransport::with_peers(peers.iter().copied()),
			Box::new(MemoryRoster::new()),
			&Settings::default(),
		);
		host.transport_mut().take();
		host
	}

	fn hello(id: &str, name: &str) -> Envelope {
		Envelope::new(kinds::HELLO, json!({"participantId": id, "name": name}))
	}

	fn ack_all(host: &mut HostSession<MemoryTransport>, peer: &str) {
		for id in [ROSTER, CHATLOG] {
			if let Some(rev) = host.replicator().revision(id) {
				host.handle_message(peer, Message::ack(id, rev).to_envelope().unwrap());
			}
		}
	}

	#[tokio::test(start_paused = true)]
	async fn builtins_are_seeded_at_rev_one() {
		let host = session(&[]);
		assert_eq!(host.replicator().revision(ROSTER), Some(1));
		assert_eq!(
			host.replicator().get(CHATLOG).map(|s| s.value.clone()),
			Some(json!({"entries": []}))
		);
	}

	#[tokio::test(start_paused = true)]
	async fn hello_binds_and_patches_roster() {
		let mut host = session(&["peer-1"]);
		assert!(host.handle_message("peer-1", hello("ada", "Ada")));
		assert_eq!(host.participant_for("peer-1"), Some("ada"));

		let sent = host.transport_mut().take();
		assert_eq!(sent.len(), 1);
		assert!(matches!(&sent[0].message, Message::Patch(b) if b.id == ROSTER && b.rev == 2));
		assert_eq!(
			host.replicator().get(ROSTER).unwrap().value,
			json!({"participants": [{"id": "ada", "name": "Ada", "ready": false}]})
		);
	}

	#[tokio::test(start_paused = true)]
	async fn hello_without_id_uses_peer_id() {
		let mut host = session(&[]);
		host.handle_message("peer-9", Envelope::new(kinds::HELLO, json!({"name": "Nine"})));
		assert_eq!(host.participant_for("peer-9"), Some("peer-9"));
	}

	#[tokio::test(start_paused = true)]
	async fn ready_and_leave_update_roster() {
		let mut host = session(&["p"]);
		host.handle_message("p", hello("ada", "Ada"));
		host.handle_message("p", Envelope::new(kinds::READY, json!({"ready": true})));
		assert_eq!(host.roster().get("ada").map(|p| p.ready), Some(true));
		assert_eq!(host.replicator().get(ROSTER).unwrap().value["participants"][0]["ready"], true);

		assert!(host.handle_message("p", Envelope::new(kinds::LEAVE, json!({}))));
		assert!(host.roster().get("ada").is_none());
		assert_eq!(host.participant_for("p"), None);
		assert_eq!(host.replicator().get(ROSTER).unwrap().value, json!({"participants": []}));
	}

	#[tokio::test(start_paused = true)]
	async fn rehello_with_new_id_replaces_participant() {
		let mut host = session(&["p", "q"]);
		host.handle_message("p", hello("ada", "Ada"));
		host.handle_message("p", hello("bob", "Bob"));
		assert_eq!(host.participant_for("p"), Some("bob"));
		assert!(host.roster().get("ada").is_none());
		assert_eq!(
			host.replicator().get(ROSTER).unwrap().value,
			json!({"participants": [{"id": "bob", "name": "Bob", "ready": false}]})
		);

		// A participant shared with another peer survives one of them moving on.
		host.handle_message("q", hello("bob", "Bob"));
		host.handle_message("p", hello("cy", "Cy"));
		assert!(host.roster().get("bob").is_some());

		host.handle_message("p", Envelope::new(kinds::LEAVE, json!({})));
		host.handle_message("q", Envelope::new(kinds::LEAVE, json!({})));
		assert_eq!(host.replicator().get(ROSTER).unwrap().value, json!({"participants": []}));
	}

	#[tokio::test(start_paused = true)]
	async fn chat_is_validated_and_appended() {
		let mut host = session(&[]);
		host.handle_message("p", hello("ada", "Ada"));
		assert!(host.handle_message("p", Envelope::new(kinds::CHAT, json!({"text": "  hi  "}))));
		assert!(!host.handle_message("p", Envelope::new(kinds::CHAT, json!({"text": "   "}))));
		let long = "x".repeat(501);
		assert!(!host.handle_message("p", Envelope::new(kinds::CHAT, json!({"text": long}))));

		let log = &host.replicator().get(CHATLOG).unwrap().value["entries"];
		assert_eq!(log.as_array().map(Vec::len), Some(1));
		assert_eq!(log[0]["text"], "hi");
		assert_eq!(log[0]["from"], "ada");
		assert_eq!(log[0]["name"], "Ada");
	}

	#[tokio::test(start_paused = true)]
	async fn chat_from_unbound_peer_uses_local_actor() {
		let mut host = session(&[]);
		host.handle_message("anon", Envelope::new(kinds::CHAT, json!({"text": "yo"})));
		let log = &host.replicator().get(CHATLOG).unwrap().value["entries"];
		assert_eq!(log[0]["from"], LOCAL_ACTOR);
	}

	#[tokio::test(start_paused = true)]
	async fn requests_are_rate_limited_per_object() {
		let mut host = session(&["p"]);
		let req = || Message::request(CHATLOG, None).to_envelope().unwrap();
		for _ in 0..8 {
			assert!(host.handle_message("p", req()));
		}
		assert!(!host.handle_message("p", req()));
		assert!(host.handle_message("p", Message::request(ROSTER, None).to_envelope().unwrap()));

		tokio::time::advance(Duration::from_millis(1001)).await;
		assert!(host.handle_message("p", req()));
	}

	#[tokio::test(start_paused = true)]
	async fn unknown_kinds_and_bad_bodies_are_dropped() {
		let mut host = session(&[]);
		assert!(!host.handle_message("p", Envelope::new("dance", json!({}))));
		assert!(!host.handle_message("p", Envelope::new(kinds::CHAT, json!({"txt": 1}))));
		assert!(!host.handle_message("p", Message::replace(ROSTER, 9, json!({})).to_envelope().unwrap()));
		assert!(host.transport().sent().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn handlers_run_first_and_observers_see_everything() {
		let mut host = session(&[]);
		let mut events = host.observe();
		host.register_handler(kinds::CHAT, |session, _peer, envelope| {
			envelope.body["text"] == "secret"
				&& session.object("notes").set(json!({"seen": true}))
		});

		host.handle_message("p", Envelope::new(kinds::CHAT, json!({"text": "secret"})));
		host.handle_message("p", Envelope::new(kinds::CHAT, json!({"text": "open"})));

		assert_eq!(host.replicator().get("notes").unwrap().value, json!({"seen": true}));
		let log = &host.replicator().get(CHATLOG).unwrap().value["entries"];
		assert_eq!(log.as_array().map(Vec::len), Some(1));
		assert_eq!(events.try_recv().unwrap().envelope.body["text"], "secret");
		assert_eq!(events.try_recv().unwrap().envelope.body["text"], "open");
	}

	#[tokio::test(start_paused = true)]
	async fn ack_cancels_resend() {
		let mut host = session(&["p"]);
		ack_all(&mut host, "p");
		host.object(CHATLOG).append(json!({"text": "one"}));
		assert!(host.acks().is_pending("p", CHATLOG));

		host.handle_message("p", Message::ack(CHATLOG, 2).to_envelope().unwrap());
		assert!(!host.acks().is_pending("p", CHATLOG));
		host.transport_mut().take();

		tokio::time::advance(Duration::from_secs(10)).await;
		host.poll();
		assert!(host.transport().sent().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn unacked_patch_resends_incrementally() {
		let mut host = session(&["p"]);
		ack_all(&mut host, "p");
		host.object(CHATLOG).append(json!({"text": "one"}));
		host.object(CHATLOG).append(json!({"text": "two"}));
		host.transport_mut().take();

		tokio::time::advance(Duration::from_secs(1)).await;
		assert_eq!(host.poll(), 1);
		let sent = host.transport_mut().take();
		let revs: Vec<u64> = sent.iter().filter_map(|d| d.message.revision().map(|r| r.1)).collect();
		assert_eq!(revs, vec![2, 3]);
		assert!(sent.iter().all(|d| d.target.as_deref() == Some("p")));
		assert!(sent.iter().all(|d| matches!(d.message, Message::Patch(_))));
	}

	#[tokio::test(start_paused = true)]
	async fn failed_incremental_resend_stays_armed() {
		let mut host = session(&["p"]);
		ack_all(&mut host, "p");
		host.object(CHATLOG).append(json!({"text": "one"}));
		host.transport_mut().take();
		host.transport_mut().set_offline(true);

		tokio::time::advance(Duration::from_secs(1)).await;
		assert_eq!(host.poll(), 1);
		assert!(host.transport().sent().is_empty());
		assert!(host.acks().is_pending("p", CHATLOG));

		host.transport_mut().set_offline(false);
		tokio::time::advance(Duration::from_secs(2)).await;
		assert_eq!(host.poll(), 1);
		let sent = host.transport_mut().take();
		assert!(matches!(&sent[0].message, Message::Patch(b) if b.rev == 2));
	}

	#[tokio::test(start_paused = true)]
	async fn gap_beyond_cap_resends_snapshot() {
		let mut host = session(&["p"]);
		ack_all(&mut host, "p");
		for n in 0..6 {
			host.object(ROSTER)
				.upsert_many(vec![json!({"id": format!("u{n}"), "name": "x"})]);
		}
		host.transport_mut().take();

		tokio::time::advance(Duration::from_secs(1)).await;
		host.poll();
		let sent = host.transport_mut().take();
		assert_eq!(sent.len(), 1);
		assert!(matches!(&sent[0].message, Message::Replace(b) if b.rev == 7));
	}

	#[tokio::test(start_paused = true)]
	async fn broadcast_only_transport_arms_no_timers() {
		let registry = Arc::new(NetObjectRegistry::with_builtins());
		let mut host = HostSession::new(
			registry,
			MemoryTransport::broadcast_only(),
			Box::new(MemoryRoster::new()),
			&Settings::default(),
		);
		host.object(CHATLOG).append(json!({"text": "x"}));
		assert_eq!(host.acks().pending(), 0);
		assert!(host.next_deadline().is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn reconnect_replays_from_acked_revision() {
		let mut host = session(&["p"]);
		ack_all(&mut host, "p");
		host.on_peer_disconnected("p");
		host.object(CHATLOG).append(json!({"text": "missed"}));
		host.transport_mut().take();

		host.on_peer_connected("p");
		let sent = host.transport_mut().take();
		// Roster is current so only the chat log patch is replayed.
		assert_eq!(sent.len(), 1);
		assert!(matches!(&sent[0].message, Message::Patch(b) if b.id == CHATLOG && b.rev == 2));
	}

	#[tokio::test(start_paused = true)]
	async fn commands_go_through_the_model() {
		use crate::registry::{CommandModel, CommandRejected};

		struct Toggle;
		impl CommandModel for Toggle {
			fn initial(&self) -> Value {
				json!({"on": false})
			}
			fn handle(&self, state: &Value, command: &Command) -> Result<Vec<PatchOp>, CommandRejected> {
				if command.name != "toggle" {
					return Err(CommandRejected::UnknownCommand(command.name.clone()));
				}
				let on = state["on"].as_bool().unwrap_or(false);
				Ok(vec![PatchOp::set(Some("on"), json!(!on))])
			}
		}

		let mut registry = NetObjectRegistry::with_builtins();
		registry.register(NetObjectDescriptor::custom("switch", Arc::new(Toggle)));
		let mut host = HostSession::new(
			Arc::new(registry),
			MemoryTransport::broadcast_only(),
			Box::new(MemoryRoster::new()),
			&Settings::default(),
		);
		let cmd = |name: &str| Envelope::new(kinds::COMMAND, json!({"id": "switch", "name": name}));

		assert!(host.handle_message("p", cmd("toggle")));
		assert!(!host.handle_message("p", cmd("explode")));
		assert_eq!(host.replicator().get("switch").unwrap().value, json!({"on": true}));
		assert_eq!(host.replicator().revision("switch"), Some(2));
	}
}
