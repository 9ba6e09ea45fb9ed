use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub ready: bool,
}

impl Participant {
	pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			name: name.into(),
			ready: false,
		}
	}
}

/// Source of truth for who is in the session.
///
/// The host mirrors every change into the replicated roster object, so
/// implementations only need to keep their own records.
pub trait Roster: Send {
	/// Insert or update a participant, keeping its ready flag when it rejoins.
	fn upsert(&mut self, participant: Participant) -> Participant;

	fn remove(&mut self, id: &str) -> Option<Participant>;

	fn get(&self, id: &str) -> Option<Participant>;

	/// Returns false for unknown participants.
	fn set_ready(&mut self, id: &str, ready: bool) -> bool;

	fn list(&self) -> Vec<Participant>;
}

#[derive(Debug, Default)]
pub struct MemoryRoster {
	participants: BTreeMap<String, Participant>,
}

impl MemoryRoster {
	pub fn new() -> Self {
		Self::default()
	}
}

impl Roster for MemoryRoster {
	fn upsert(&mut self, participant: Participant) -> Participant {
		let entry = self
			.participants
			.entry(participant.id.clone())
			.and_modify(|p| p.name = participant.name.clone())
			.or_insert(participant);
		entry.clone()
	}

	fn remove(&mut self, id: &str) -> Option<Participant> {
		self.participants.remove(id)
	}

	fn get(&self, id: &str) -> Option<Participant> {
		self.participants.get(id).cloned()
	}

	fn set_ready(&mut self, id: &str, ready: bool) -> bool {
		match self.participants.get_mut(id) {
			Some(p) => {
				p.ready = ready;
				true
			}
			None => false,
		}
	}

	fn list(&self) -> Vec<Participant> {
		self.participants.values().cloned().collect()
	}
}

/// Callbacks for bookkeeping outside the replicated state.
pub trait SessionHooks: Send {
	fn on_join(&mut self, participant: &Participant) {
		let _ = participant;
	}

	fn on_leave(&mut self, participant: &Participant) {
		let _ = participant;
	}
}

#[derive(Debug, Default)]
pub struct NoHooks;

impl SessionHooks for NoHooks {}
