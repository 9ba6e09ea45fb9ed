//! Wire format shared by hosts and peers.
//!
//! Every message travels as an [`Envelope`] `{kind, body}`. Routers work on
//! envelopes so that custom kinds can be handled without touching
//! [`Message`], which only covers the kinds this crate understands.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::patch::PatchOp;

/// Maximum size for a single frame (10MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

pub mod kinds {
	pub const REPLACE: &str = "object:replace";
	pub const PATCH: &str = "object:patch";
	pub const REQUEST: &str = "object:request";
	pub const ACK: &str = "object:ack";
	pub const HELLO: &str = "hello";
	pub const READY: &str = "ready";
	pub const LEAVE: &str = "leave";
	pub const CHAT: &str = "chat";
	pub const COMMAND: &str = "command";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	pub kind: String,
	#[serde(default)]
	pub body: Value,
}

impl Envelope {
	pub fn new(kind: impl Into<String>, body: Value) -> Self {
		Self {
			kind: kind.into(),
			body,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceBody {
	pub id: String,
	pub rev: u64,
	pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchBody {
	pub id: String,
	pub rev: u64,
	pub ops: Vec<PatchOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
	pub id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub since_rev: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckBody {
	pub id: String,
	pub rev: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloBody {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub participant_id: Option<String>,
	#[serde(default)]
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyBody {
	pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatBody {
	pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandBody {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub args: Value,
}

/// Messages with a built-in meaning.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "body")]
pub enum Message {
	#[serde(rename = "object:replace")]
	Replace(ReplaceBody),
	#[serde(rename = "object:patch")]
	Patch(PatchBody),
	#[serde(rename = "object:request")]
	Request(RequestBody),
	#[serde(rename = "object:ack")]
	Ack(AckBody),
	#[serde(rename = "hello")]
	Hello(HelloBody),
	#[serde(rename = "ready")]
	Ready(ReadyBody),
	#[serde(rename = "leave")]
	Leave(Value),
	#[serde(rename = "chat")]
	Chat(ChatBody),
	#[serde(rename = "command")]
	Command(CommandBody),
}

impl Message {
	pub fn replace(id: impl Into<String>, rev: u64, value: Value) -> Self {
		Message::Replace(ReplaceBody {
			id: id.into(),
			rev,
			value,
		})
	}

	pub fn patch(id: impl Into<String>, rev: u64, ops: Vec<PatchOp>) -> Self {
		Message::Patch(PatchBody {
			id: id.into(),
			rev,
			ops,
		})
	}

	pub fn request(id: impl Into<String>, since_rev: Option<u64>) -> Self {
		Message::Request(RequestBody {
			id: id.into(),
			since_rev,
		})
	}

	pub fn ack(id: impl Into<String>, rev: u64) -> Self {
		Message::Ack(AckBody { id: id.into(), rev })
	}

	pub fn leave() -> Self {
		Message::Leave(Value::Object(Default::default()))
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Message::Replace(_) => kinds::REPLACE,
			Message::Patch(_) => kinds::PATCH,
			Message::Request(_) => kinds::REQUEST,
			Message::Ack(_) => kinds::ACK,
			Message::Hello(_) => kinds::HELLO,
			Message::Ready(_) => kinds::READY,
			Message::Leave(_) => kinds::LEAVE,
			Message::Chat(_) => kinds::CHAT,
			Message::Command(_) => kinds::COMMAND,
		}
	}

	/// Object id and revision carried by state-bearing messages.
	pub fn revision(&self) -> Option<(&str, u64)> {
		match self {
			Message::Replace(b) => Some((b.id.as_str(), b.rev)),
			Message::Patch(b) => Some((b.id.as_str(), b.rev)),
			_ => None,
		}
	}

	pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
		Ok(serde_json::from_value(serde_json::to_value(self)?)?)
	}
}

impl TryFrom<Envelope> for Message {
	type Error = ProtocolError;

	fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
		let Envelope { kind, body } = envelope;
		let message = match kind.as_str() {
			kinds::REPLACE => Message::Replace(serde_json::from_value(body)?),
			kinds::PATCH => Message::Patch(serde_json::from_value(body)?),
			kinds::REQUEST => Message::Request(serde_json::from_value(body)?),
			kinds::ACK => Message::Ack(serde_json::from_value(body)?),
			kinds::HELLO => Message::Hello(serde_json::from_value(body)?),
			kinds::READY => Message::Ready(serde_json::from_value(body)?),
			kinds::LEAVE => Message::Leave(body),
			kinds::CHAT => Message::Chat(serde_json::from_value(body)?),
			kinds::COMMAND => Message::Command(serde_json::from_value(body)?),
			_ => return Err(ProtocolError::UnknownKind(kind)),
		};
		Ok(message)
	}
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
	W: AsyncWrite + Unpin,
	T: Serialize,
{
	let json = serde_json::to_vec(msg)?;
	let len = json.len();

	if len > MAX_FRAME_SIZE {
		return Err(ProtocolError::FrameTooLarge {
			size: len,
			max: MAX_FRAME_SIZE,
		});
	}

	// Write length prefix (4 bytes, big-endian)
	writer.write_all(&(len as u32).to_be_bytes()).await?;
	writer.write_all(&json).await?;
	writer.flush().await?;

	Ok(())
}

/// Read one frame. Returns `Ok(None)` when the stream closes cleanly between
/// frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>, ProtocolError>
where
	R: AsyncReadExt + Unpin,
{
	let mut len_bytes = [0u8; 4];
	match reader.read_exact(&mut len_bytes).await {
		Ok(_) => {}
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e.into()),
	}

	let len = u32::from_be_bytes(len_bytes) as usize;
	if len > MAX_FRAME_SIZE {
		return Err(ProtocolError::FrameTooLarge {
			size: len,
			max: MAX_FRAME_SIZE,
		});
	}

	let mut buf = vec![0u8; len];
	reader.read_exact(&mut buf).await?;

	Ok(Some(serde_json::from_slice(&buf)?))
}
