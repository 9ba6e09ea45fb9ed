pub mod acks;
pub mod client;
pub mod host;
pub mod timers;

pub use acks::{AckScheduler, ResendTask};
pub use client::{
	ClientStore, PatchOutcome, RejectReason, ReplaceOutcome, StallReason, StoreEvent, SubscriptionId,
};
pub use host::{HostReplicator, ObjectState, PatchLogEntry};
pub use timers::TimerQueue;
