//! Common test utilities for the replication integration tests.
//!
//! A [`Harness`] wires one host and several clients together over recording
//! transports and moves messages between them on demand, so tests control
//! exactly what is delivered and when.
#![allow(dead_code)]

use std::sync::Arc;

use vanopticon_bifrost::config::Settings;
use vanopticon_bifrost::net::{Delivery, Envelope, MemoryTransport};
use vanopticon_bifrost::registry::NetObjectRegistry;
use vanopticon_bifrost::session::{ClientSession, HostSession, MemoryRoster};

/// Upper bound on delivery rounds in [`Harness::pump`].
const MAX_ROUNDS: usize = 1000;

pub struct Harness {
	pub host: HostSession<MemoryTransport>,
	pub clients: Vec<(String, ClientSession<MemoryTransport>)>,
	registry: Arc<NetObjectRegistry>,
	settings: Settings,
}

impl Harness {
	/// Host plus one client per peer, built-in objects only.
	pub fn new(peers: &[&str]) -> Self {
		Self::with_registry(NetObjectRegistry::with_builtins(), peers, Settings::default())
	}

	pub fn with_registry(registry: NetObjectRegistry, peers: &[&str], settings: Settings) -> Self {
		let registry = Arc::new(registry);
		let host = HostSession::new(
			Arc::clone(&registry),
			MemoryTransport::with_peers(peers.iter().copied()),
			Box::new(MemoryRoster::new()),
			&settings,
		);
		let mut harness = Self {
			host,
			clients: Vec::new(),
			registry,
			settings,
		};
		// Everyone was "connected" before the seed went out.
		for peer in peers {
			harness.add_client(peer);
		}
		harness
	}

	/// Connect another client. It only sees traffic published after this call.
	pub fn add_client(&mut self, peer: &str) {
		self.host.transport_mut().add_peer(peer);
		let client = ClientSession::new(
			Arc::clone(&self.registry),
			MemoryTransport::broadcast_only(),
			&self.settings,
		);
		self.clients.push((peer.to_string(), client));
	}

	pub fn client(&mut self, peer: &str) -> &mut ClientSession<MemoryTransport> {
		let (_, client) = self
			.clients
			.iter_mut()
			.find(|(p, _)| p == peer)
			.expect("unknown peer");
		client
	}

	/// Everything the host has published since the last drain.
	pub fn drain_host(&mut self) -> Vec<Delivery> {
		self.host.transport_mut().take()
	}

	/// Hand one host delivery to the clients it was addressed to.
	pub fn deliver(&mut self, delivery: &Delivery) -> usize {
		let envelope = envelope_of(delivery);
		let mut delivered = 0;
		for (peer, client) in &mut self.clients {
			if delivery.target.as_deref().is_none_or(|t| t == peer.as_str()) {
				client.handle_message(envelope.clone());
				delivered += 1;
			}
		}
		delivered
	}

	/// Move messages both ways until nothing is left in flight. Returns the
	/// number of messages moved.
	pub fn pump(&mut self) -> usize {
		let mut total = 0;
		for _ in 0..MAX_ROUNDS {
			let mut moved = 0;
			for delivery in self.drain_host() {
				self.deliver(&delivery);
				moved += 1;
			}
			for i in 0..self.clients.len() {
				let peer = self.clients[i].0.clone();
				let outgoing = self.clients[i].1.transport_mut().take();
				for delivery in outgoing {
					self.host.handle_message(&peer, envelope_of(&delivery));
					moved += 1;
				}
			}
			if moved == 0 {
				return total;
			}
			total += moved;
		}
		panic!("traffic did not settle after {} rounds", MAX_ROUNDS);
	}

	/// Drop whatever the clients have queued for the host.
	pub fn discard_client_output(&mut self) {
		for (_, client) in &mut self.clients {
			client.transport_mut().take();
		}
	}

	/// True when every client holds the host's value for `id`.
	pub fn converged(&self, id: &str) -> bool {
		let expected = self.host.replicator().get(id).map(|s| &s.value);
		self.clients
			.iter()
			.all(|(_, c)| c.store().get(id).map(|s| &s.value) == expected)
	}
}

pub fn envelope_of(delivery: &Delivery) -> Envelope {
	delivery
		.message
		.to_envelope()
		.expect("outbound messages always encode")
}
