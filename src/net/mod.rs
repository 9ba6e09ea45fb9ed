pub mod protocol;
pub mod rate_limiter;
pub mod transport;

pub use protocol::{Envelope, Message, kinds, read_frame, write_frame};
pub use rate_limiter::RateLimiter;
pub use transport::{Delivery, MemoryTransport, PeerId, PublishContext, Transport};
