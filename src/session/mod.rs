pub mod client;
pub mod host;
pub mod roster;

pub use client::{ClientHandle, ClientSession};
pub use host::{HostHandle, HostSession, InboundEvent, LOCAL_ACTOR, MessageHandler};
pub use roster::{MemoryRoster, NoHooks, Participant, Roster, SessionHooks};
