//! Message-level connection state machine.
//!
//! A [`Connection`] owns one frame reader and one frame writer over a split
//! transport. Exactly one task drives [`Connection::read_message`]; any
//! number of tasks may write through the connection or a cloned [`Sender`] —
//! the write path is serialized by an async mutex so two concurrent sends
//! never interleave their header and payload bytes on the wire.

use crate::error::{Error, Result};
use crate::frame::{FrameReader, FrameWriter};
use crate::pool::{BufferPool, Unpooled};
use crate::proto::{is_valid_close_code, Opcode, MAX_CONTROL_PAYLOAD};
use crate::MessageType;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Which side of the connection this endpoint is. The masking direction is
/// derived from the role and is not configurable: servers never mask,
/// clients always mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    #[inline]
    pub fn is_server(self) -> bool {
        matches!(self, Role::Server)
    }

    /// Fresh random mask key for an outgoing frame, or `None` server-side.
    fn mask_key(self) -> Option<[u8; 4]> {
        match self {
            Role::Server => None,
            Role::Client => Some(rand::random()),
        }
    }
}

/// Per-connection tuning. `Default` gives a 32 MiB message cap, no
/// timeouts and unpooled scratch buffers.
pub struct Config {
    /// Assembly is aborted with [`Error::MessageTooLarge`] the moment the
    /// accumulated length would exceed this.
    pub max_message_size: usize,
    /// Applied around whole-frame reads; expiry surfaces as an
    /// `io::ErrorKind::TimedOut` transport error.
    pub read_timeout: Option<Duration>,
    /// Applied around whole-frame writes.
    pub write_timeout: Option<Duration>,
    /// Source of the frame reader's scratch buffer.
    pub pool: Arc<dyn BufferPool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 32 << 20,
            read_timeout: None,
            write_timeout: None,
            pool: Arc::new(Unpooled),
        }
    }
}

impl Clone for Config {
    fn clone(&self) -> Self {
        Self {
            max_message_size: self.max_message_size,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            pool: Arc::clone(&self.pool),
        }
    }
}

/// Strategy for incoming Ping/Pong frames.
///
/// Handlers decide; the connection performs the I/O. The default behavior
/// (see [`AutoPong`]) replies to every Ping with a Pong carrying the same
/// payload and ignores Pongs. Returning an error aborts the read loop with
/// that error.
pub trait ControlHandler: Send + Sync {
    /// Return `Ok(true)` to let the connection echo a Pong, `Ok(false)` to
    /// suppress the reply.
    fn on_ping(&mut self, payload: &[u8]) -> Result<bool> {
        let _ = payload;
        Ok(true)
    }

    fn on_pong(&mut self, payload: &[u8]) -> Result<()> {
        let _ = payload;
        Ok(())
    }
}

/// Built-in default handler: auto-Pong every Ping.
#[derive(Debug, Default)]
pub struct AutoPong;

impl ControlHandler for AutoPong {}

struct WriteState<S> {
    codec: FrameWriter<WriteHalf<S>>,
    close_sent: bool,
    write_timeout: Option<Duration>,
}

/// A WebSocket connection over any byte stream.
pub struct Connection<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: Arc<Mutex<WriteState<S>>>,
    role: Role,
    subprotocol: Option<String>,

    // Fragmentation state: `None` when idle, `Some` while a fragmented
    // message is being assembled.
    assembling: Option<MessageType>,
    assembly: Vec<u8>,

    max_message_size: usize,
    read_timeout: Option<Duration>,
    handler: Box<dyn ControlHandler>,
    closed: bool,
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("subprotocol", &self.subprotocol)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    pub fn new(stream: S, role: Role) -> Self {
        Self::with_config(stream, role, Config::default())
    }

    pub fn with_config(stream: S, role: Role, config: Config) -> Self {
        let (read_half, write_half) = split(stream);
        Self {
            reader: FrameReader::with_pool(read_half, config.pool),
            writer: Arc::new(Mutex::new(WriteState {
                codec: FrameWriter::new(write_half),
                close_sent: false,
                write_timeout: config.write_timeout,
            })),
            role,
            subprotocol: None,
            assembling: None,
            assembly: Vec::new(),
            max_message_size: config.max_message_size,
            read_timeout: config.read_timeout,
            handler: Box::new(AutoPong),
            closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Subprotocol negotiated at handshake time, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub(crate) fn set_subprotocol(&mut self, proto: Option<String>) {
        self.subprotocol = proto;
    }

    pub fn set_max_message_size(&mut self, size: usize) {
        self.max_message_size = size;
    }

    pub fn set_control_handler(&mut self, handler: Box<dyn ControlHandler>) {
        self.handler = handler;
    }

    /// Cloneable write-side handle sharing this connection's write lock.
    pub fn sender(&self) -> Sender<S> {
        Sender {
            writer: Arc::clone(&self.writer),
            role: self.role,
        }
    }

    /// Reads the next complete data message, transparently handling
    /// fragmentation and control frames.
    ///
    /// Fatal protocol and resource errors send a best-effort Close frame and
    /// latch the connection closed; a Close from the peer surfaces as
    /// [`Error::ConnectionClosed`] after the close handshake is answered.
    pub async fn read_message(&mut self) -> Result<(MessageType, Vec<u8>)> {
        if self.closed {
            return Err(Error::ConnectionClosed {
                code: None,
                reason: "read after close".into(),
            });
        }
        let res = self.next_message().await;
        if res.is_err() {
            self.closed = true;
        }
        res
    }

    async fn next_message(&mut self) -> Result<(MessageType, Vec<u8>)> {
        loop {
            let mut violation: Option<Error> = None;
            let mut control: Option<(Opcode, [u8; MAX_CONTROL_PAYLOAD], usize)> = None;
            let mut finished: Option<MessageType> = None;
            let mut read_err: Option<Error> = None;

            {
                let frame_res = match self.read_timeout {
                    Some(t) => match timeout(t, self.reader.read_frame()).await {
                        Ok(res) => res,
                        Err(_) => Err(Error::Io(io::ErrorKind::TimedOut.into())),
                    },
                    None => self.reader.read_frame().await,
                };
                match frame_res {
                    Err(e) => read_err = Some(e),
                    Ok(frame) => {
                        if self.role.is_server() && !frame.masked {
                            violation = Some(Error::MaskRequired);
                        } else if !self.role.is_server() && frame.masked {
                            violation = Some(Error::MaskNotAllowed);
                        } else if frame.is_control() {
                            let mut buf = [0u8; MAX_CONTROL_PAYLOAD];
                            buf[..frame.payload.len()].copy_from_slice(frame.payload);
                            control = Some((frame.opcode, buf, frame.payload.len()));
                        } else {
                            match (frame.opcode, self.assembling) {
                                (Opcode::Continuation, None) => {
                                    violation = Some(Error::ProtocolViolation(
                                        "continuation frame without a message in progress",
                                    ));
                                }
                                (Opcode::Continuation, Some(_)) => {}
                                (Opcode::Text, None) => {
                                    self.assembling = Some(MessageType::Text);
                                    self.assembly.clear();
                                }
                                (Opcode::Binary, None) => {
                                    self.assembling = Some(MessageType::Binary);
                                    self.assembly.clear();
                                }
                                (_, Some(_)) => {
                                    violation = Some(Error::ProtocolViolation(
                                        "data frame while assembling a fragmented message",
                                    ));
                                }
                                // Control opcodes never reach this branch.
                                (_, None) => {}
                            }

                            if violation.is_none() {
                                let total =
                                    self.assembly.len().saturating_add(frame.payload.len());
                                if total > self.max_message_size {
                                    violation = Some(Error::MessageTooLarge);
                                } else {
                                    self.assembly.extend_from_slice(frame.payload);
                                    if frame.fin {
                                        finished = self.assembling.take();
                                    }
                                }
                            }
                        }
                    }
                }
            }

            if let Some(e) = read_err {
                return self.fail(e).await;
            }
            if let Some(e) = violation {
                return self.fail(e).await;
            }
            if let Some((opcode, buf, len)) = control {
                self.handle_control(opcode, &buf[..len]).await?;
                continue;
            }
            if let Some(ty) = finished {
                if ty == MessageType::Text && std::str::from_utf8(&self.assembly).is_err() {
                    return self.fail(Error::InvalidUtf8).await;
                }
                // Copy out: the assembly buffer is about to be reused.
                let data = self.assembly.clone();
                self.assembly.clear();
                tracing::trace!(ty = ?ty, len = data.len(), "message assembled");
                return Ok((ty, data));
            }
        }
    }

    /// Reads the next complete data message into `buf` without allocating.
    ///
    /// Returns the message type and the number of bytes written. Fails with
    /// [`Error::FrameTooLarge`] / [`Error::MessageTooLarge`] when `buf`
    /// cannot hold the next frame or the whole message.
    pub async fn read_message_into(&mut self, buf: &mut [u8]) -> Result<(MessageType, usize)> {
        if self.closed {
            return Err(Error::ConnectionClosed {
                code: None,
                reason: "read after close".into(),
            });
        }
        let res = self.next_message_into(buf).await;
        if res.is_err() {
            self.closed = true;
        }
        res
    }

    async fn next_message_into(&mut self, buf: &mut [u8]) -> Result<(MessageType, usize)> {
        let mut ty: Option<MessageType> = None;
        let mut filled = 0usize;
        loop {
            if filled >= buf.len() {
                return self.fail(Error::MessageTooLarge).await;
            }

            let frame_res = match self.read_timeout {
                Some(t) => match timeout(t, self.reader.read_frame_into(&mut buf[filled..])).await
                {
                    Ok(res) => res,
                    Err(_) => Err(Error::Io(io::ErrorKind::TimedOut.into())),
                },
                None => self.reader.read_frame_into(&mut buf[filled..]).await,
            };
            let frame = match frame_res {
                Ok(frame) => frame,
                Err(e) => return self.fail(e).await,
            };

            if self.role.is_server() && !frame.masked {
                return self.fail(Error::MaskRequired).await;
            }
            if !self.role.is_server() && frame.masked {
                return self.fail(Error::MaskNotAllowed).await;
            }

            if frame.is_control() {
                // Copied out so the region can be overwritten by the next
                // data frame; control payloads never advance `filled`.
                let mut ctrl = [0u8; MAX_CONTROL_PAYLOAD];
                ctrl[..frame.payload.len()].copy_from_slice(frame.payload);
                let (opcode, len) = (frame.opcode, frame.payload.len());
                drop(frame);
                self.handle_control(opcode, &ctrl[..len]).await?;
                continue;
            }

            match (frame.opcode, ty) {
                (Opcode::Continuation, None) => {
                    return self
                        .fail(Error::ProtocolViolation(
                            "continuation frame without a message in progress",
                        ))
                        .await;
                }
                (Opcode::Continuation, Some(_)) => {}
                (Opcode::Text, None) => ty = Some(MessageType::Text),
                (Opcode::Binary, None) => ty = Some(MessageType::Binary),
                (_, Some(_)) => {
                    return self
                        .fail(Error::ProtocolViolation(
                            "data frame while assembling a fragmented message",
                        ))
                        .await;
                }
                (_, None) => {}
            }

            let n = frame.payload.len();
            let fin = frame.fin;
            drop(frame);
            filled += n;
            if filled > self.max_message_size {
                return self.fail(Error::MessageTooLarge).await;
            }
            if fin {
                let ty = match ty {
                    Some(ty) => ty,
                    None => {
                        return self
                            .fail(Error::ProtocolViolation("message ended before it began"))
                            .await;
                    }
                };
                if ty == MessageType::Text && std::str::from_utf8(&buf[..filled]).is_err() {
                    return self.fail(Error::InvalidUtf8).await;
                }
                return Ok((ty, filled));
            }
        }
    }

    /// Dispatches a control frame. `Ok(())` means keep reading; a Close
    /// frame always returns `Err(ConnectionClosed)` after answering it.
    async fn handle_control(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        match opcode {
            Opcode::Ping => {
                tracing::trace!(len = payload.len(), "ping");
                if self.handler.on_ping(payload)? {
                    let mut echo = [0u8; MAX_CONTROL_PAYLOAD];
                    echo[..payload.len()].copy_from_slice(payload);
                    send_frame(
                        &self.writer,
                        self.role,
                        Opcode::Pong,
                        &mut echo[..payload.len()],
                    )
                    .await?;
                }
                Ok(())
            }
            Opcode::Pong => {
                tracing::trace!(len = payload.len(), "pong");
                self.handler.on_pong(payload)
            }
            _ => self.close_received(payload).await,
        }
    }

    async fn close_received(&mut self, payload: &[u8]) -> Result<()> {
        let mut code = None;
        let mut reason = String::new();
        if payload.len() >= 2 {
            let c = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(c) {
                return self.fail(Error::InvalidCloseCode(c)).await;
            }
            match std::str::from_utf8(&payload[2..]) {
                Ok(r) => reason = r.to_owned(),
                Err(_) => return self.fail(Error::InvalidUtf8).await,
            }
            code = Some(c);
        }

        // Answer with a Close echoing the peer's payload, unless one has
        // already gone out.
        let mut echo = [0u8; MAX_CONTROL_PAYLOAD];
        echo[..payload.len()].copy_from_slice(payload);
        let _ = send_close_frame(&self.writer, self.role, &mut echo[..payload.len()], false).await;

        tracing::debug!(code = ?code, "peer sent close");
        Err(Error::ConnectionClosed { code, reason })
    }

    /// Fails the connection: aborts any in-progress assembly, sends a
    /// best-effort Close mapped from the error class, and surfaces `err`.
    async fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.assembling = None;
        self.assembly.clear();
        if let Some(code) = err.close_code() {
            tracing::debug!(error = %err, code, "failing connection");
            let mut payload = code.to_be_bytes();
            let _ = send_close_frame(&self.writer, self.role, &mut payload, false).await;
        }
        Err(err)
    }

    /// Writes `data` as a single, unfragmented message.
    ///
    /// Client-role connections mask with a fresh random key per call, which
    /// scrambles `data` in place; server-role connections leave it intact.
    pub async fn write_message(&self, ty: MessageType, data: &mut [u8]) -> Result<()> {
        send_message(&self.writer, self.role, ty, data).await
    }

    pub async fn write_ping(&self, payload: &mut [u8]) -> Result<()> {
        send_frame(&self.writer, self.role, Opcode::Ping, payload).await
    }

    pub async fn write_pong(&self, payload: &mut [u8]) -> Result<()> {
        send_frame(&self.writer, self.role, Opcode::Pong, payload).await
    }

    /// Sends a Close frame (at most once, subsequent calls are no-ops) and
    /// shuts down the write side of the transport.
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        send_close(&self.writer, self.role, code, reason).await
    }
}

/// Cloneable write handle. All clones share the connection's write lock, so
/// a heartbeat task and an application task can both send safely.
pub struct Sender<S> {
    writer: Arc<Mutex<WriteState<S>>>,
    role: Role,
}

impl<S> Clone for Sender<S> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            role: self.role,
        }
    }
}

impl<S: AsyncWrite> Sender<S> {
    pub async fn write_message(&self, ty: MessageType, data: &mut [u8]) -> Result<()> {
        send_message(&self.writer, self.role, ty, data).await
    }

    pub async fn write_ping(&self, payload: &mut [u8]) -> Result<()> {
        send_frame(&self.writer, self.role, Opcode::Ping, payload).await
    }

    pub async fn write_pong(&self, payload: &mut [u8]) -> Result<()> {
        send_frame(&self.writer, self.role, Opcode::Pong, payload).await
    }

    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        send_close(&self.writer, self.role, code, reason).await
    }
}

async fn send_message<S: AsyncWrite>(
    writer: &Mutex<WriteState<S>>,
    role: Role,
    ty: MessageType,
    data: &mut [u8],
) -> Result<()> {
    let opcode = match ty {
        MessageType::Text => {
            if std::str::from_utf8(data).is_err() {
                return Err(Error::InvalidUtf8);
            }
            Opcode::Text
        }
        MessageType::Binary => Opcode::Binary,
    };
    send_frame(writer, role, opcode, data).await
}

/// Serialized single-frame write. Holding the lock across header + payload
/// keeps concurrent writers from interleaving bytes on the wire.
async fn send_frame<S: AsyncWrite>(
    writer: &Mutex<WriteState<S>>,
    role: Role,
    opcode: Opcode,
    payload: &mut [u8],
) -> Result<()> {
    let mut w = writer.lock().await;
    if w.close_sent {
        return Err(Error::ConnectionClosed {
            code: None,
            reason: "write after close".into(),
        });
    }
    let key = role.mask_key();
    let deadline = w.write_timeout;
    let fut = async {
        if opcode.is_control() {
            w.codec.write_control(opcode, payload, key).await?;
        } else {
            w.codec.write_frame(opcode, true, payload, key).await?;
        }
        w.codec.flush().await
    };
    match deadline {
        Some(t) => match timeout(t, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Io(io::ErrorKind::TimedOut.into())),
        },
        None => fut.await,
    }
}

async fn send_close<S: AsyncWrite>(
    writer: &Mutex<WriteState<S>>,
    role: Role,
    code: u16,
    reason: &str,
) -> Result<()> {
    if !is_valid_close_code(code) {
        return Err(Error::InvalidCloseCode(code));
    }
    if 2 + reason.len() > MAX_CONTROL_PAYLOAD {
        return Err(Error::InvalidControlFrame);
    }
    let mut payload = [0u8; MAX_CONTROL_PAYLOAD];
    payload[..2].copy_from_slice(&code.to_be_bytes());
    payload[2..2 + reason.len()].copy_from_slice(reason.as_bytes());
    send_close_frame(writer, role, &mut payload[..2 + reason.len()], true).await?;
    Ok(())
}

/// Sends a Close frame at most once per connection. Returns whether this
/// call was the one that sent it.
async fn send_close_frame<S: AsyncWrite>(
    writer: &Mutex<WriteState<S>>,
    role: Role,
    payload: &mut [u8],
    shutdown: bool,
) -> Result<bool> {
    let mut w = writer.lock().await;
    if w.close_sent {
        return Ok(false);
    }
    w.close_sent = true;
    let key = role.mask_key();
    let deadline = w.write_timeout;
    let fut = async {
        w.codec.write_control(Opcode::Close, payload, key).await?;
        w.codec.flush().await?;
        if shutdown {
            w.codec.shutdown().await?;
        }
        Ok(())
    };
    match deadline {
        Some(t) => match timeout(t, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Io(io::ErrorKind::TimedOut.into())),
        },
        None => fut.await,
    }?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const KEY: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    async fn raw_frame(opcode: Opcode, fin: bool, data: &[u8], key: Option<[u8; 4]>) -> Vec<u8> {
        let mut fw = FrameWriter::new(Vec::new());
        let mut payload = data.to_vec();
        fw.write_frame(opcode, fin, &mut payload, key).await.unwrap();
        fw.into_inner()
    }

    fn pair() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(1 << 20)
    }

    #[tokio::test]
    async fn server_requires_masked_frames() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Server);

        let bytes = raw_frame(Opcode::Text, true, b"Hello", None).await;
        peer.write_all(&bytes).await.unwrap();

        assert!(matches!(
            conn.read_message().await,
            Err(Error::MaskRequired)
        ));

        // Best-effort Close with 1002 went out before the failure surfaced.
        let mut close = [0u8; 4];
        peer.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xEA]);
    }

    #[tokio::test]
    async fn client_rejects_masked_frames() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Client);

        let bytes = raw_frame(Opcode::Text, true, b"Hello", Some(KEY)).await;
        peer.write_all(&bytes).await.unwrap();

        assert!(matches!(
            conn.read_message().await,
            Err(Error::MaskNotAllowed)
        ));
    }

    #[tokio::test]
    async fn fragmented_message_matches_unfragmented() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Client);

        peer.write_all(&raw_frame(Opcode::Text, false, b"Hel", None).await)
            .await
            .unwrap();
        peer.write_all(&raw_frame(Opcode::Continuation, false, b"lo wo", None).await)
            .await
            .unwrap();
        peer.write_all(&raw_frame(Opcode::Continuation, true, b"rld", None).await)
            .await
            .unwrap();
        let (ty, data) = conn.read_message().await.unwrap();
        assert_eq!(ty, MessageType::Text);
        assert_eq!(data, b"Hello world");

        peer.write_all(&raw_frame(Opcode::Text, true, b"Hello world", None).await)
            .await
            .unwrap();
        let (ty, unfragmented) = conn.read_message().await.unwrap();
        assert_eq!(ty, MessageType::Text);
        assert_eq!(unfragmented, data);
    }

    #[tokio::test]
    async fn ping_between_fragments_is_answered() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Server);

        peer.write_all(&raw_frame(Opcode::Binary, false, b"ab", Some(KEY)).await)
            .await
            .unwrap();
        peer.write_all(&raw_frame(Opcode::Ping, true, b"hb", Some(KEY)).await)
            .await
            .unwrap();
        peer.write_all(&raw_frame(Opcode::Continuation, true, b"cd", Some(KEY)).await)
            .await
            .unwrap();

        let (ty, data) = conn.read_message().await.unwrap();
        assert_eq!(ty, MessageType::Binary);
        assert_eq!(data, b"abcd");

        // Server pongs are unmasked and echo the ping payload.
        let mut pong = [0u8; 4];
        peer.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8A, 0x02, b'h', b'b']);
    }

    #[tokio::test]
    async fn stray_continuation_is_a_violation() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Client);

        peer.write_all(&raw_frame(Opcode::Continuation, true, b"x", None).await)
            .await
            .unwrap();
        assert!(matches!(
            conn.read_message().await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn new_data_frame_mid_message_is_a_violation() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Client);

        peer.write_all(&raw_frame(Opcode::Text, false, b"a", None).await)
            .await
            .unwrap();
        peer.write_all(&raw_frame(Opcode::Text, true, b"b", None).await)
            .await
            .unwrap();
        assert!(matches!(
            conn.read_message().await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn close_codes() {
        for (code, ok) in [(1000u16, true), (1011, true), (1005, false), (1006, false), (1015, false)] {
            let (local, mut peer) = pair();
            let mut conn = Connection::new(local, Role::Client);

            peer.write_all(&raw_frame(Opcode::Close, true, &code.to_be_bytes(), None).await)
                .await
                .unwrap();
            match conn.read_message().await {
                Err(Error::ConnectionClosed { code: got, .. }) if ok => {
                    assert_eq!(got, Some(code));
                }
                Err(Error::InvalidCloseCode(got)) if !ok => assert_eq!(got, code),
                other => panic!("code {code}: unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn close_reply_echoes_payload() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Client);

        let mut body = 1000u16.to_be_bytes().to_vec();
        body.extend_from_slice(b"bye");
        peer.write_all(&raw_frame(Opcode::Close, true, &body, None).await)
            .await
            .unwrap();
        let err = conn.read_message().await.unwrap_err();
        match err {
            Error::ConnectionClosed { code, reason } => {
                assert_eq!(code, Some(1000));
                assert_eq!(reason, "bye");
            }
            other => panic!("unexpected {other:?}"),
        }

        // The echoed Close is masked (client role): decode it.
        let mut fr = FrameReader::new(&mut peer);
        let frame = fr.read_frame().await.unwrap();
        assert_eq!(frame.opcode, Opcode::Close);
        assert!(frame.masked);
        assert_eq!(frame.payload, body);
    }

    #[tokio::test]
    async fn message_size_cap() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Client);
        conn.set_max_message_size(8);

        peer.write_all(&raw_frame(Opcode::Binary, true, &[0u8; 9], None).await)
            .await
            .unwrap();
        assert!(matches!(
            conn.read_message().await,
            Err(Error::MessageTooLarge)
        ));
    }

    #[tokio::test]
    async fn invalid_utf8_text_rejected() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Client);

        peer.write_all(&raw_frame(Opcode::Text, true, &[0xFF, 0xFE], None).await)
            .await
            .unwrap();
        assert!(matches!(conn.read_message().await, Err(Error::InvalidUtf8)));
    }

    #[tokio::test]
    async fn utf8_split_across_fragments_is_fine() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Client);

        // "é" = 0xC3 0xA9 split across two fragments; only the complete
        // message is validated.
        peer.write_all(&raw_frame(Opcode::Text, false, &[0xC3], None).await)
            .await
            .unwrap();
        peer.write_all(&raw_frame(Opcode::Continuation, true, &[0xA9], None).await)
            .await
            .unwrap();
        let (ty, data) = conn.read_message().await.unwrap();
        assert_eq!(ty, MessageType::Text);
        assert_eq!(data, "é".as_bytes());
    }

    #[tokio::test]
    async fn write_message_masks_for_clients() {
        let (local, peer) = pair();
        let conn = Connection::new(local, Role::Client);

        let mut data = b"Hello".to_vec();
        conn.write_message(MessageType::Text, &mut data).await.unwrap();
        // The caller's buffer was masked in place.
        assert_ne!(data, b"Hello");

        let mut fr = FrameReader::new(peer);
        let frame = fr.read_frame().await.unwrap();
        assert!(frame.masked);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"Hello");
    }

    #[tokio::test]
    async fn write_message_server_plain() {
        let (local, mut peer) = pair();
        let conn = Connection::new(local, Role::Server);

        conn.write_message(MessageType::Text, &mut b"Hello".to_vec())
            .await
            .unwrap();
        let mut bytes = [0u8; 7];
        peer.read_exact(&mut bytes).await.unwrap();
        assert_eq!(bytes, [0x81, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F]);
    }

    #[tokio::test]
    async fn write_text_validates_utf8() {
        let (local, _peer) = pair();
        let conn = Connection::new(local, Role::Server);
        assert!(matches!(
            conn.write_message(MessageType::Text, &mut [0xFF, 0xFE]).await,
            Err(Error::InvalidUtf8)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (local, mut peer) = pair();
        let conn = Connection::new(local, Role::Server);

        conn.close(1000, "done").await.unwrap();
        conn.close(1000, "done").await.unwrap();

        let mut bytes = Vec::new();
        peer.read_to_end(&mut bytes).await.unwrap();
        // Exactly one close frame: header + code + "done".
        assert_eq!(bytes.len(), 2 + 2 + 4);
        assert_eq!(&bytes[..4], &[0x88, 0x06, 0x03, 0xE8]);
        assert_eq!(&bytes[4..], b"done");
    }

    #[tokio::test]
    async fn close_rejects_reserved_codes() {
        let (local, _peer) = pair();
        let conn = Connection::new(local, Role::Server);
        assert!(matches!(
            conn.close(1005, "").await,
            Err(Error::InvalidCloseCode(1005))
        ));
    }

    #[tokio::test]
    async fn read_after_close_frame_fails() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Client);

        peer.write_all(&raw_frame(Opcode::Close, true, &1000u16.to_be_bytes(), None).await)
            .await
            .unwrap();
        assert!(matches!(
            conn.read_message().await,
            Err(Error::ConnectionClosed { .. })
        ));
        assert!(matches!(
            conn.read_message().await,
            Err(Error::ConnectionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn custom_handler_suppresses_pong() {
        struct Mute;
        impl ControlHandler for Mute {
            fn on_ping(&mut self, _: &[u8]) -> Result<bool> {
                Ok(false)
            }
        }

        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Server);
        conn.set_control_handler(Box::new(Mute));

        peer.write_all(&raw_frame(Opcode::Ping, true, b"hb", Some(KEY)).await)
            .await
            .unwrap();
        peer.write_all(&raw_frame(Opcode::Text, true, b"hi", Some(KEY)).await)
            .await
            .unwrap();
        let (_, data) = conn.read_message().await.unwrap();
        assert_eq!(data, b"hi");

        drop(conn);
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "no pong expected, got {rest:?}");
    }

    #[tokio::test]
    async fn read_message_into_caller_buffer() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Client);

        peer.write_all(&raw_frame(Opcode::Binary, false, b"ab", None).await)
            .await
            .unwrap();
        peer.write_all(&raw_frame(Opcode::Ping, true, b"x", None).await)
            .await
            .unwrap();
        peer.write_all(&raw_frame(Opcode::Continuation, true, b"cd", None).await)
            .await
            .unwrap();

        let mut buf = [0u8; 32];
        let (ty, n) = conn.read_message_into(&mut buf).await.unwrap();
        assert_eq!(ty, MessageType::Binary);
        assert_eq!(&buf[..n], b"abcd");
    }

    #[tokio::test]
    async fn read_message_into_small_buffer() {
        let (local, mut peer) = pair();
        let mut conn = Connection::new(local, Role::Client);

        peer.write_all(&raw_frame(Opcode::Binary, true, &[1u8; 64], None).await)
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            conn.read_message_into(&mut buf).await,
            Err(Error::FrameTooLarge)
        ));
    }

    #[tokio::test]
    async fn read_timeout_surfaces_as_io() {
        let (local, _peer) = pair();
        let mut conn = Connection::with_config(
            local,
            Role::Client,
            Config {
                read_timeout: Some(Duration::from_millis(20)),
                ..Config::default()
            },
        );
        match conn.read_message().await {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn sender_shares_write_lock() {
        let (local, peer) = pair();
        let conn = Connection::new(local, Role::Client);
        let sender = conn.sender();

        let a = sender.clone();
        let b = sender;
        let mut payload_a = [1u8, 2, 3];
        let mut payload_b = b"hb".to_vec();
        let (ra, rb) = tokio::join!(
            a.write_message(MessageType::Binary, &mut payload_a),
            b.write_ping(&mut payload_b),
        );
        ra.unwrap();
        rb.unwrap();

        // Both frames decode cleanly: no interleaving occurred.
        let mut fr = FrameReader::new(peer);
        let first = fr.read_frame().await.unwrap().opcode;
        let second = fr.read_frame().await.unwrap().opcode;
        let mut got = [first, second];
        got.sort_by_key(|op| *op as u8);
        assert_eq!(got, [Opcode::Binary, Opcode::Ping]);
    }
}
