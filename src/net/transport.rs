use std::collections::BTreeSet;

use crate::net::protocol::Message;

pub type PeerId = String;

/// Addressing for one publish. No target means every connected peer (or, on a
/// client, the host).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishContext {
	pub target: Option<PeerId>,
}

impl PublishContext {
	pub fn broadcast() -> Self {
		Self::default()
	}

	pub fn to(peer: impl Into<PeerId>) -> Self {
		Self {
			target: Some(peer.into()),
		}
	}
}

/// The message-oriented link the replication core writes to.
///
/// Only `publish` is required. Transports that can enumerate peers and address
/// one of them enable acknowledgment tracking and targeted resends; without
/// them the host degrades to broadcast-only delivery.
pub trait Transport {
	fn publish(&mut self, message: &Message, ctx: &PublishContext) -> bool;

	fn peer_ids(&self) -> Option<Vec<PeerId>> {
		None
	}

	fn send_to_peer(&mut self, peer: &str, message: &Message) -> bool {
		let _ = (peer, message);
		false
	}
}

/// One recorded outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
	pub target: Option<PeerId>,
	pub message: Message,
}

/// Transport that records everything it is asked to send. Used by tests and
/// as the loopback link of embedded sessions.
#[derive(Debug, Default)]
pub struct MemoryTransport {
	peers: Option<BTreeSet<PeerId>>,
	sent: Vec<Delivery>,
	offline: bool,
}

impl MemoryTransport {
	/// A transport that knows its peers and can address them.
	pub fn with_peers<I, S>(peers: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<PeerId>,
	{
		Self {
			peers: Some(peers.into_iter().map(Into::into).collect()),
			..Self::default()
		}
	}

	/// A transport with no peer enumeration.
	pub fn broadcast_only() -> Self {
		Self::default()
	}

	pub fn add_peer(&mut self, peer: impl Into<PeerId>) {
		self.peers.get_or_insert_with(BTreeSet::new).insert(peer.into());
	}

	pub fn remove_peer(&mut self, peer: &str) {
		if let Some(peers) = self.peers.as_mut() {
			peers.remove(peer);
		}
	}

	/// While offline every send reports failure and nothing is recorded.
	pub fn set_offline(&mut self, offline: bool) {
		self.offline = offline;
	}

	pub fn sent(&self) -> &[Delivery] {
		&self.sent
	}

	pub fn take(&mut self) -> Vec<Delivery> {
		std::mem::take(&mut self.sent)
	}
}

impl Transport for MemoryTransport {
	fn publish(&mut self, message: &Message, ctx: &PublishContext) -> bool {
		if self.offline {
			return false;
		}
		self.sent.push(Delivery {
			target: ctx.target.clone(),
			message: message.clone(),
		});
		true
	}

	fn peer_ids(&self) -> Option<Vec<PeerId>> {
		self.peers.as_ref().map(|p| p.iter().cloned().collect())
	}

	fn send_to_peer(&mut self, peer: &str, message: &Message) -> bool {
		let known = self.peers.as_ref().is_some_and(|p| p.contains(peer));
		if self.offline || !known {
			return false;
		}
		self.sent.push(Delivery {
			target: Some(peer.to_string()),
			message: message.clone(),
		});
		true
	}
}
