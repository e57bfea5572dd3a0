//! Error taxonomy.
//!
//! Three classes share [`Error`]: protocol errors and resource errors are
//! fatal to the connection (a best-effort Close frame is sent, then the
//! error surfaces to the caller); transport errors propagate verbatim and
//! are never retried here. Handshake failures use [`HandshakeError`], which
//! knows the HTTP status an HTTP layer should answer with.

use http::StatusCode;
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Frame-codec and connection errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Opcode was in the reserved range `3..=7` or `11..=15`.
    #[error("invalid opcode")]
    InvalidOpcode,
    /// Control frame with a payload longer than 125 bytes.
    #[error("control frame payload exceeds 125 bytes")]
    InvalidControlFrame,
    /// Control frame with FIN unset.
    #[error("control frame cannot be fragmented")]
    FragmentedControl,
    /// RSV1–3 must be zero; no extension is ever negotiated.
    #[error("reserved bits must be 0")]
    ReservedBitsSet,
    /// A server received an unmasked frame.
    #[error("client frames must be masked")]
    MaskRequired,
    /// A client received a masked frame.
    #[error("server frames must not be masked")]
    MaskNotAllowed,
    /// Illegal fragmentation sequence.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// A text message (or close reason) was not valid UTF-8.
    #[error("invalid utf-8 payload")]
    InvalidUtf8,
    /// Close frame carried a code outside the legal set.
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),
    /// Frame payload exceeded the destination buffer or the RFC length cap.
    #[error("frame too large")]
    FrameTooLarge,
    /// Assembled message exceeded `max_message_size`.
    #[error("message too large")]
    MessageTooLarge,
    /// The peer closed the connection (or a read was attempted after close).
    #[error("connection closed: code={code:?} reason={reason:?}")]
    ConnectionClosed {
        code: Option<u16>,
        reason: String,
    },
    /// Transport failure, including deadline expiry (`ErrorKind::TimedOut`).
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Close status code sent to the peer before the connection is failed,
    /// or `None` when no Close frame should be attempted (transport errors,
    /// peer-initiated close).
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::InvalidOpcode
            | Error::InvalidControlFrame
            | Error::FragmentedControl
            | Error::ReservedBitsSet
            | Error::MaskRequired
            | Error::MaskNotAllowed
            | Error::ProtocolViolation(_)
            | Error::InvalidCloseCode(_) => Some(1002),
            Error::InvalidUtf8 => Some(1007),
            Error::FrameTooLarge | Error::MessageTooLarge => Some(1009),
            Error::ConnectionClosed { .. } | Error::Io(_) => None,
        }
    }

    /// Whether this is a protocol-legality error (as opposed to a resource
    /// or transport error). Kept distinct for observability only; the
    /// connection treats both classes as fatal.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::InvalidOpcode
                | Error::InvalidControlFrame
                | Error::FragmentedControl
                | Error::ReservedBitsSet
                | Error::MaskRequired
                | Error::MaskNotAllowed
                | Error::ProtocolViolation(_)
                | Error::InvalidUtf8
                | Error::InvalidCloseCode(_)
        )
    }
}

/// Opening-handshake failures. Server-side variants map to an HTTP error
/// response; the attempted upgrade fails but the HTTP connection survives
/// unless the transport was already taken over.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HandshakeError {
    /// Request is not a WebSocket upgrade (missing/incorrect header).
    #[error("not a websocket handshake: {0}")]
    NotWebSocket(&'static str),
    /// Upgrade requests must use GET.
    #[error("handshake method must be GET")]
    MethodNotAllowed,
    /// `Sec-WebSocket-Version` was not exactly "13".
    #[error("unsupported websocket version")]
    UnsupportedVersion,
    /// `Sec-WebSocket-Key` missing or empty.
    #[error("missing Sec-WebSocket-Key")]
    MissingKey,
    /// The configured origin check rejected the request.
    #[error("origin not allowed")]
    OriginDenied,
    /// Client: server answered with something other than 101.
    #[error("unexpected handshake status: {0}")]
    BadStatus(u16),
    /// Client: response was not parseable as an HTTP/1.1 message.
    #[error("malformed handshake response")]
    BadResponse,
    /// Client: `Sec-WebSocket-Accept` did not match the key we sent.
    /// Always fatal; never downgraded to a warning.
    #[error("Sec-WebSocket-Accept mismatch")]
    AcceptMismatch,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HandshakeError {
    /// HTTP status a server should reject the upgrade request with.
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            HandshakeError::UnsupportedVersion => StatusCode::UPGRADE_REQUIRED,
            HandshakeError::OriginDenied => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Ready-to-write HTTP/1.1 rejection response for this failure. The
    /// version-mismatch response advertises the supported version, as RFC
    /// 6455 §4.2.2 requires.
    pub fn response(&self) -> String {
        let status = self.status();
        let reason = status.canonical_reason().unwrap_or("Error");
        let body = self.to_string();
        let extra = match self {
            HandshakeError::UnsupportedVersion => "Sec-WebSocket-Version: 13\r\n",
            _ => "",
        };
        format!(
            "HTTP/1.1 {} {reason}\r\n{extra}Content-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            status.as_u16(),
            body.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_mapping() {
        assert_eq!(Error::InvalidOpcode.close_code(), Some(1002));
        assert_eq!(Error::MaskRequired.close_code(), Some(1002));
        assert_eq!(Error::InvalidUtf8.close_code(), Some(1007));
        assert_eq!(Error::MessageTooLarge.close_code(), Some(1009));
        assert_eq!(Error::FrameTooLarge.close_code(), Some(1009));
        assert_eq!(
            Error::Io(io::Error::from(io::ErrorKind::TimedOut)).close_code(),
            None
        );
    }

    #[test]
    fn rejection_statuses() {
        assert_eq!(HandshakeError::MethodNotAllowed.status().as_u16(), 405);
        assert_eq!(HandshakeError::UnsupportedVersion.status().as_u16(), 426);
        assert_eq!(HandshakeError::OriginDenied.status().as_u16(), 403);
        assert_eq!(HandshakeError::MissingKey.status().as_u16(), 400);

        let res = HandshakeError::UnsupportedVersion.response();
        assert!(res.starts_with("HTTP/1.1 426 "));
        assert!(res.contains("Sec-WebSocket-Version: 13\r\n"));
    }
}
