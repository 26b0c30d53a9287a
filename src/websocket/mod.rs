//! WebSocket protocol support (RFC 6455).
//!
//! - [`handshake`] validates upgrade requests and computes the accept key.
//! - [`Frame`] / [`FrameBuilder`] model one wire frame and serialize it.
//! - [`FrameParser`] decodes frames incrementally from partial reads.
//! - [`WebSocket`] is the message-level session used by handlers after the upgrade.
//!
//! ```
//! use kiln::websocket::{FrameBuilder, Opcode};
//!
//! let frame = FrameBuilder::new()
//!     .opcode(Opcode::Text)
//!     .text_payload("Hello")
//!     .build();
//! assert_eq!(&frame.to_bytes()[..], b"\x81\x05Hello");
//! ```

mod frame;
pub mod handshake;
mod parser;
mod session;

pub use frame::{CloseCode, Frame, FrameBuilder, FrameError, MAX_CONTROL_PAYLOAD, Opcode, apply_mask};
pub use handshake::{HandshakeError, compute_accept_key};
pub use parser::{FrameParser, MaskPolicy, ParseStatus, ParserConfig, decode_frame};
pub use session::{Message, Role, SessionConfig, SessionState, WebSocket, WebSocketError};
