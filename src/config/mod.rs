use std::path::Path;
use std::time::Duration;

use log::Level;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtime configuration for Bifrost.
///
/// Values are loaded from (in order): the `/etc/vanopticon/bifrost.json` file,
/// the user config folders (optional), an explicit file handed to
/// [`load_from`], and environment variables prefixed with `BFR_` (nested keys
/// use `__`, e.g. `BFR_ACKS__MAX_ATTEMPTS`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
	pub log_level: Level,
	pub replication: ReplicationSettings,
	pub acks: AckSettings,
	pub client: ClientSettings,
	pub limits: LimitSettings,
	pub sim: SimSettings,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			log_level: Level::Info,
			replication: ReplicationSettings::default(),
			acks: AckSettings::default(),
			client: ClientSettings::default(),
			limits: LimitSettings::default(),
			sim: SimSettings::default(),
		}
	}
}

/// Host-side patch log and replay bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
	/// Patch log entries retained per object for incremental resend.
	pub log_capacity: usize,
	/// Largest replay served incrementally on `object:request`.
	pub replay_burst_cap: u64,
	/// Incremental resend cap for objects that do not declare their own.
	pub default_incremental_cap: u64,
}

impl Default for ReplicationSettings {
	fn default() -> Self {
		Self {
			log_capacity: 256,
			replay_burst_cap: 64,
			default_incremental_cap: 16,
		}
	}
}

/// Acknowledgment tracking and resend backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AckSettings {
	pub max_attempts: u32,
	pub base_delay_ms: u64,
	pub max_delay_ms: u64,
}

impl Default for AckSettings {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay_ms: 1000,
			max_delay_ms: 5000,
		}
	}
}

impl AckSettings {
	/// `min(max_delay, attempt × base_delay)`, with attempt counted from 1.
	pub fn backoff(&self, attempt: u32) -> Duration {
		let scaled = self.base_delay_ms.saturating_mul(u64::from(attempt.max(1)));
		Duration::from_millis(scaled.min(self.max_delay_ms))
	}
}

/// Client reorder queue bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
	pub max_queued_revs: usize,
	pub stall_timeout_ms: u64,
}

impl Default for ClientSettings {
	fn default() -> Self {
		Self {
			max_queued_revs: 32,
			stall_timeout_ms: 2500,
		}
	}
}

impl ClientSettings {
	pub fn stall_timeout(&self) -> Duration {
		Duration::from_millis(self.stall_timeout_ms)
	}
}

/// Inbound rate limits applied by the host router. Each limit is the number of
/// events allowed per key within `window_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
	pub window_ms: u64,
	pub requests: usize,
	pub ready: usize,
	pub chat: usize,
	pub commands: usize,
	pub chat_max_len: usize,
}

impl Default for LimitSettings {
	fn default() -> Self {
		Self {
			window_ms: 1000,
			requests: 8,
			ready: 4,
			chat: 5,
			commands: 10,
			chat_max_len: 500,
		}
	}
}

impl LimitSettings {
	pub fn window(&self) -> Duration {
		Duration::from_millis(self.window_ms)
	}
}

/// Parameters for the in-process simulation driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
	pub peers: usize,
	pub messages: usize,
	/// Probability in `[0, 1)` that a host frame to a peer is lost.
	pub drop_rate: f64,
	pub seed: u64,
	pub message_interval_ms: u64,
	pub settle_ms: u64,
}

impl Default for SimSettings {
	fn default() -> Self {
		Self {
			peers: 3,
			messages: 10,
			drop_rate: 0.0,
			seed: 7,
			message_interval_ms: 250,
			settle_ms: 15_000,
		}
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
}

pub fn load() -> Result<Settings, SettingsError> {
	load_from(None)
}

pub fn load_from(explicit: Option<&Path>) -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/vanopticon/bifrost.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("vanopticon").join("bifrost.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}
	if let Some(folder) = dirs::config_local_dir() {
		let local_config_path = folder.join("vanopticon").join("bifrost.json");
		builder = builder.add_source(config::File::from(local_config_path).required(false));
	}
	if let Some(path) = explicit {
		builder = builder.add_source(config::File::from(path).required(true));
	}

	builder = builder.add_source(config::Environment::with_prefix("BFR").separator("__"));

	let cfg = builder.build()?;

	let mut s: Settings = cfg.try_deserialize()?;

	// Prefer the flat variables operators actually set when they are present;
	// nested names are easy to get wrong by hand.
	if let Ok(l) = std::env::var("BFR_LOG_LEVEL") {
		if let Ok(parsed) = l.parse::<Level>() {
			s.log_level = parsed;
		}
	}
	if let Ok(a) = std::env::var("BFR_ACK_MAX_ATTEMPTS") {
		if let Ok(parsed) = a.parse::<u32>() {
			s.acks.max_attempts = parsed;
		}
	}
	if let Ok(q) = std::env::var("BFR_MAX_QUEUED_REVS") {
		if let Ok(parsed) = q.parse::<usize>() {
			s.client.max_queued_revs = parsed;
		}
	}
	if let Ok(t) = std::env::var("BFR_STALL_TIMEOUT_MS") {
		if let Ok(parsed) = t.parse::<u64>() {
			s.client.stall_timeout_ms = parsed;
		}
	}
	if let Ok(c) = std::env::var("BFR_LOG_CAPACITY") {
		if let Ok(parsed) = c.parse::<usize>() {
			s.replication.log_capacity = parsed;
		}
	}

	Ok(s)
}
