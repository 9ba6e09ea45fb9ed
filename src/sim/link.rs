use std::collections::BTreeMap;

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::ProtocolError;
use crate::net::{Envelope, Message, PeerId, PublishContext, Transport, read_frame, write_frame};

/// Inbound frame from a link, or `None` once the link closed.
pub type LinkEvent = (PeerId, Option<Envelope>);

/// Host side of the simulated network: one outbound queue per peer, with
/// seeded frame loss.
pub struct SimLink {
	peers: BTreeMap<PeerId, mpsc::UnboundedSender<Message>>,
	rng: StdRng,
	drop_rate: f64,
	dropped: u64,
}

impl SimLink {
	pub fn new(drop_rate: f64, seed: u64) -> Self {
		Self {
			peers: BTreeMap::new(),
			rng: StdRng::seed_from_u64(seed),
			drop_rate,
			dropped: 0,
		}
	}

	pub fn add_peer(&mut self, peer: impl Into<PeerId>, tx: mpsc::UnboundedSender<Message>) {
		self.peers.insert(peer.into(), tx);
	}

	/// Forget a peer whose pipe closed. Returns false if it was not linked.
	pub fn remove_peer(&mut self, peer: &str) -> bool {
		self.peers.remove(peer).is_some()
	}

	/// Frames lost on purpose so far.
	pub fn dropped(&self) -> u64 {
		self.dropped
	}

	fn deliver(&mut self, peer: &str, message: &Message) -> bool {
		let Some(tx) = self.peers.get(peer) else {
			return false;
		};
		if self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate) {
			self.dropped += 1;
			debug!("dropped '{}' to {}", message.kind(), peer);
			// Lost in transit; the sender cannot tell.
			return true;
		}
		tx.send(message.clone()).is_ok()
	}
}

impl Transport for SimLink {
	fn publish(&mut self, message: &Message, ctx: &PublishContext) -> bool {
		if let Some(peer) = &ctx.target {
			return self.deliver(peer, message);
		}
		let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
		let mut delivered = true;
		for peer in &peers {
			delivered &= self.deliver(peer, message);
		}
		delivered
	}

	fn peer_ids(&self) -> Option<Vec<PeerId>> {
		Some(self.peers.keys().cloned().collect())
	}

	fn send_to_peer(&mut self, peer: &str, message: &Message) -> bool {
		self.deliver(peer, message)
	}
}

/// Client side of the simulated network. Everything goes to the host.
pub struct HostLink {
	tx: mpsc::UnboundedSender<Message>,
}

impl HostLink {
	pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
		Self { tx }
	}
}

impl Transport for HostLink {
	fn publish(&mut self, message: &Message, _ctx: &PublishContext) -> bool {
		self.tx.send(message.clone()).is_ok()
	}
}

/// Drain a queue of messages into framed writes until the queue closes.
pub async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Message>) -> Result<(), ProtocolError>
where
	W: AsyncWrite + Unpin,
{
	while let Some(message) = rx.recv().await {
		write_frame(&mut writer, &message).await?;
	}
	Ok(())
}

/// Forward framed reads as [`LinkEvent`]s until the stream ends.
pub async fn read_loop<R>(mut reader: R, peer: PeerId, tx: mpsc::UnboundedSender<LinkEvent>)
where
	R: AsyncRead + Unpin,
{
	loop {
		match read_frame(&mut reader).await {
			Ok(Some(envelope)) => {
				if tx.send((peer.clone(), Some(envelope))).is_err() {
					return;
				}
			}
			Ok(None) => break,
			Err(e) => {
				warn!("link to {} failed: {}", peer, e);
				break;
			}
		}
	}
	let _ = tx.send((peer, None));
}
