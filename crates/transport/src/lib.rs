//! Length-prefixed framing over a byte stream, request/response matching by
//! id, and the bare process-id handshake used once per connection before
//! switching into framed mode.

mod client;
mod error;
mod frame;
mod unix;

pub use client::Client;
pub use error::TransportError;
pub use frame::{DEFAULT_MAX_FRAME_LEN, read_frame, read_handshake, write_frame, write_handshake};
pub use unix::{bind, connect};
