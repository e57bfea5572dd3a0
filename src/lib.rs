//! An RFC 6455 WebSocket endpoint over any `AsyncRead + AsyncWrite` stream.
//!
//! The crate is organized around four layers: XOR payload [masking](mask)
//! with a runtime-selected SIMD path, a zero-copy [frame codec](frame), the
//! opening [handshake](handshake) for both roles, and a message-level
//! [`Connection`] that assembles fragments, answers Pings and runs the close
//! handshake.
//!
//! ```no_run
//! use framewave::{handshake, MessageType};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut conn = handshake::dial("ws://127.0.0.1:9001/echo", &[]).await?;
//! conn.write_message(MessageType::Text, &mut b"hello".to_vec()).await?;
//! let (ty, data) = conn.read_message().await?;
//! assert_eq!(ty, MessageType::Text);
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;
mod proto;

pub mod frame;
pub mod handshake;
pub mod mask;
pub mod pool;

pub use connection::{AutoPong, Config, Connection, ControlHandler, Role, Sender};
pub use error::{Error, HandshakeError, Result};
pub use proto::{is_valid_close_code, CloseCode, Opcode};

/// Kind of a complete data message. Control frames never surface as
/// messages; they are handled inside the read loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
}
