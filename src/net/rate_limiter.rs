use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

/// Sliding-window limiter keyed by an arbitrary string (participant, peer and
/// object, ...).
///
/// Each key keeps the timestamps of its recent accepted events, never more
/// than `max_events` of them. Old timestamps are pruned lazily when the key is
/// next checked, so idle keys cost nothing until [`RateLimiter::sweep`] runs.
#[derive(Debug)]
pub struct RateLimiter {
	window: Duration,
	max_events: usize,
	buckets: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
	pub fn new(max_events: usize, window: Duration) -> Self {
		Self {
			window,
			max_events,
			buckets: HashMap::new(),
		}
	}

	/// Record an event for `key` at `now` if the window still has room.
	pub fn allow(&mut self, key: &str, now: Instant) -> bool {
		let bucket = self.buckets.entry(key.to_string()).or_default();
		while let Some(oldest) = bucket.front() {
			if now.saturating_duration_since(*oldest) >= self.window {
				bucket.pop_front();
			} else {
				break;
			}
		}

		if bucket.len() >= self.max_events {
			return false;
		}
		bucket.push_back(now);
		true
	}

	pub fn reset(&mut self, key: &str) {
		self.buckets.remove(key);
	}

	/// Drop buckets whose events have all left the window.
	pub fn sweep(&mut self, now: Instant) {
		let window = self.window;
		self.buckets.retain(|_, bucket| {
			bucket
				.back()
				.is_some_and(|last| now.saturating_duration_since(*last) < window)
		});
	}

	pub fn tracked_keys(&self) -> usize {
		self.buckets.len()
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn limiter_allows_under_limit() {
		let mut limiter = RateLimiter::new(3, Duration::from_secs(1));
		let now = Instant::now();
		assert!(limiter.allow("alice", now));
		assert!(limiter.allow("alice", now));
		assert!(limiter.allow("alice", now));
	}

	#[test]
	fn limiter_denies_when_exhausted() {
		let mut limiter = RateLimiter::new(2, Duration::from_secs(1));
		let now = Instant::now();
		assert!(limiter.allow("alice", now));
		assert!(limiter.allow("alice", now + Duration::from_millis(10)));
		assert!(!limiter.allow("alice", now + Duration::from_millis(20)));
		// Other keys have their own bucket.
		assert!(limiter.allow("bob", now + Duration::from_millis(20)));
	}

	#[test]
	fn limiter_recovers_after_window() {
		let mut limiter = RateLimiter::new(1, Duration::from_millis(500));
		let now = Instant::now();
		assert!(limiter.allow("k", now));
		assert!(!limiter.allow("k", now + Duration::from_millis(499)));
		assert!(limiter.allow("k", now + Duration::from_millis(500)));
	}

	#[test]
	fn refused_calls_do_not_extend_the_window() {
		let mut limiter = RateLimiter::new(1, Duration::from_millis(100));
		let now = Instant::now();
		assert!(limiter.allow("k", now));
		for ms in 1..100 {
			assert!(!limiter.allow("k", now + Duration::from_millis(ms)));
		}
		assert!(limiter.allow("k", now + Duration::from_millis(100)));
	}

	#[test]
	fn sweep_drops_idle_buckets() {
		let mut limiter = RateLimiter::new(4, Duration::from_millis(100));
		let now = Instant::now();
		limiter.allow("a", now);
		limiter.allow("b", now + Duration::from_millis(80));
		limiter.sweep(now + Duration::from_millis(120));
		assert_eq!(limiter.tracked_keys(), 1);
		limiter.reset("b");
		assert_eq!(limiter.tracked_keys(), 0);
	}
}
