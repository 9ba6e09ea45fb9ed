use std::collections::HashMap;

use log::{debug, warn};
use tokio::time::Instant;

use crate::config::AckSettings;
use crate::error::ReplicationError;
use crate::net::PeerId;
use crate::sync::timers::TimerQueue;

type DeliveryKey = (PeerId, String);

#[derive(Debug, Default, Clone)]
struct Delivery {
	last_sent: u64,
	acked: Option<u64>,
	attempt: u32,
}

/// A delivery whose ack timer fired; the caller decides how to resend it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendTask {
	pub peer: PeerId,
	pub id: String,
	pub acked: Option<u64>,
	pub last_sent: u64,
	pub attempt: u32,
}

/// Per-(peer, object) delivery bookkeeping for the host.
///
/// Every outbound revision arms a timer. A matching `object:ack` cancels it;
/// otherwise [`AckScheduler::poll`] hands back a resend task with linear
/// backoff until the retry budget is spent. Acked revisions outlive the timers
/// so a reconnecting peer can resume from them.
pub struct AckScheduler {
	settings: AckSettings,
	deliveries: HashMap<DeliveryKey, Delivery>,
	timers: TimerQueue<DeliveryKey>,
	abandoned: u64,
}

impl AckScheduler {
	pub fn new(settings: AckSettings) -> Self {
		Self {
			settings,
			deliveries: HashMap::new(),
			timers: TimerQueue::new(),
			abandoned: 0,
		}
	}

	/// Record a fresh send of `rev`, superseding any timer already armed.
	pub fn on_sent(&mut self, peer: &str, id: &str, rev: u64, now: Instant) {
		let key = (peer.to_string(), id.to_string());
		let delivery = self.deliveries.entry(key.clone()).or_default();
		delivery.last_sent = delivery.last_sent.max(rev);
		delivery.attempt = 0;
		if delivery.acked.is_some_and(|acked| acked >= delivery.last_sent) {
			self.timers.cancel(&key);
			return;
		}
		self.timers.arm(key, now + self.settings.backoff(1));
	}

	/// Record an ack. Returns true when it settled an outstanding delivery.
	/// Acks for deliveries that were never sent are ignored.
	pub fn on_ack(&mut self, peer: &str, id: &str, rev: u64) -> bool {
		let key = (peer.to_string(), id.to_string());
		let Some(delivery) = self.deliveries.get_mut(&key) else {
			debug!("ignoring ack for untracked '{}' from {}", id, peer);
			return false;
		};
		delivery.acked = Some(delivery.acked.map_or(rev, |a| a.max(rev)));
		if delivery.acked.is_some_and(|acked| acked >= delivery.last_sent) {
			delivery.attempt = 0;
			return self.timers.cancel(&key);
		}
		false
	}

	pub fn acked_rev(&self, peer: &str, id: &str) -> Option<u64> {
		self.deliveries
			.get(&(peer.to_string(), id.to_string()))
			.and_then(|d| d.acked)
	}

	pub fn is_pending(&self, peer: &str, id: &str) -> bool {
		self.timers.is_armed(&(peer.to_string(), id.to_string()))
	}

	/// Collect resend work for every timer due at `now`.
	pub fn poll(&mut self, now: Instant) -> Vec<ResendTask> {
		let mut tasks = Vec::new();
		for key in self.timers.pop_expired(now) {
			let Some(delivery) = self.deliveries.get_mut(&key) else {
				continue;
			};
			if delivery.acked.is_some_and(|acked| acked >= delivery.last_sent) {
				continue;
			}
			if delivery.attempt >= self.settings.max_attempts {
				let err = ReplicationError::DeliveryTimeout {
					peer: key.0.clone(),
					id: key.1.clone(),
					rev: delivery.last_sent,
					attempts: delivery.attempt,
				};
				warn!("{}; giving up until the next write or request", err);
				delivery.attempt = 0;
				self.abandoned += 1;
				continue;
			}

			delivery.attempt += 1;
			let task = ResendTask {
				peer: key.0.clone(),
				id: key.1.clone(),
				acked: delivery.acked,
				last_sent: delivery.last_sent,
				attempt: delivery.attempt,
			};
			debug!(
				"resend {} of '{}' rev {} to {}",
				task.attempt, task.id, task.last_sent, task.peer
			);
			self.timers
				.arm(key, now + self.settings.backoff(delivery.attempt + 1));
			tasks.push(task);
		}
		tasks
	}

	/// Stop retrying toward `peer` but remember what it acknowledged.
	pub fn suspend_peer(&mut self, peer: &str) {
		for key in self.deliveries.keys().filter(|k| k.0 == peer) {
			self.timers.cancel(key);
		}
	}

	/// Drop everything known about `peer`.
	pub fn forget_peer(&mut self, peer: &str) {
		self.suspend_peer(peer);
		self.deliveries.retain(|k, _| k.0 != peer);
	}

	pub fn next_deadline(&mut self) -> Option<Instant> {
		self.timers.next_deadline()
	}

	pub fn pending(&self) -> usize {
		self.timers.len()
	}

	/// Number of (peer, object) pairs with delivery bookkeeping.
	pub fn tracked(&self) -> usize {
		self.deliveries.len()
	}

	/// Deliveries given up on since the scheduler was created.
	pub fn abandoned(&self) -> u64 {
		self.abandoned
	}
}
