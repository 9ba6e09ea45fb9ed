use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

use tokio::time::Instant;

struct Entry<K> {
	deadline: Instant,
	token: u64,
	key: K,
}

impl<K> PartialEq for Entry<K> {
	fn eq(&self, other: &Self) -> bool {
		self.deadline == other.deadline && self.token == other.token
	}
}

impl<K> Eq for Entry<K> {}

impl<K> PartialOrd for Entry<K> {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl<K> Ord for Entry<K> {
	// Reversed so the max-heap pops the earliest deadline first.
	fn cmp(&self, other: &Self) -> Ordering {
		other
			.deadline
			.cmp(&self.deadline)
			.then_with(|| other.token.cmp(&self.token))
	}
}

/// Cancellable one-shot timers keyed by `K`.
///
/// At most one timer is live per key. Re-arming or cancelling a key bumps its
/// token; heap entries carrying an older token are discarded when they surface,
/// so a superseded timer can never fire.
pub struct TimerQueue<K> {
	heap: BinaryHeap<Entry<K>>,
	live: HashMap<K, u64>,
	next_token: u64,
}

impl<K: Clone + Eq + Hash> TimerQueue<K> {
	pub fn new() -> Self {
		Self {
			heap: BinaryHeap::new(),
			live: HashMap::new(),
			next_token: 0,
		}
	}

	/// Arm (or re-arm) the timer for `key`, returning its token.
	pub fn arm(&mut self, key: K, deadline: Instant) -> u64 {
		self.next_token += 1;
		let token = self.next_token;
		self.live.insert(key.clone(), token);
		self.heap.push(Entry {
			deadline,
			token,
			key,
		});
		token
	}

	pub fn cancel(&mut self, key: &K) -> bool {
		self.live.remove(key).is_some()
	}

	pub fn is_armed(&self, key: &K) -> bool {
		self.live.contains_key(key)
	}

	pub fn token(&self, key: &K) -> Option<u64> {
		self.live.get(key).copied()
	}

	/// Pop every live timer due at or before `now`, earliest first.
	pub fn pop_expired(&mut self, now: Instant) -> Vec<K> {
		let mut due = Vec::new();
		while let Some(top) = self.heap.peek() {
			if top.deadline > now {
				break;
			}
			let Some(entry) = self.heap.pop() else { break };
			if self.live.get(&entry.key) == Some(&entry.token) {
				self.live.remove(&entry.key);
				due.push(entry.key);
			}
		}
		due
	}

	/// Earliest live deadline, discarding superseded entries on the way.
	pub fn next_deadline(&mut self) -> Option<Instant> {
		while let Some(top) = self.heap.peek() {
			if self.live.get(&top.key) == Some(&top.token) {
				return Some(top.deadline);
			}
			self.heap.pop();
		}
		None
	}

	pub fn len(&self) -> usize {
		self.live.len()
	}

	pub fn is_empty(&self) -> bool {
		self.live.is_empty()
	}
}

impl<K: Clone + Eq + Hash> Default for TimerQueue<K> {
	fn default() -> Self {
		Self::new()
	}
}
