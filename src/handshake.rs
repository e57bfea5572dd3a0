//! Opening handshake (RFC 6455 §4): server-side upgrade and client-side
//! connect. Both paths hand back a [`Connection`] with the right role, so
//! the masking direction is fixed at handshake time and never configurable.

use crate::connection::{Config, Connection, Role};
use crate::error::HandshakeError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::{HeaderMap, Method, Request};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Handshake responses larger than this are rejected as malformed.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Computes the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
///
/// ```rust
/// assert_eq!(
///     framewave::handshake::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(sec_ws_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(sec_ws_key.as_bytes());
    sha1.update(GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// Token-list header check: `Connection: keep-alive, Upgrade` counts as
/// containing `upgrade`. Comparison is case-insensitive per header token.
fn header_contains(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Cheap routing predicate: does this request ask for a WebSocket upgrade?
/// Full validation happens in [`Upgrader::upgrade`].
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    header_contains(req.headers(), "connection", "upgrade")
        && header_contains(req.headers(), "upgrade", "websocket")
}

type OriginCheck = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Server-side handshake policy: origin checking, subprotocol selection and
/// the connection config applied to accepted upgrades.
pub struct Upgrader {
    check_origin: Option<OriginCheck>,
    protocols: Vec<String>,
    config: Config,
}

impl Default for Upgrader {
    fn default() -> Self {
        Self::new()
    }
}

impl Upgrader {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            check_origin: None,
            protocols: Vec::new(),
            config,
        }
    }

    /// Origin allowlist predicate. The callback sees the raw `Origin` header
    /// value, or `""` when the request carried none. Without a check every
    /// origin is accepted.
    pub fn check_origin(mut self, f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.check_origin = Some(Box::new(f));
        self
    }

    /// Subprotocols this server supports. Selection honors the client's
    /// preference order, not the server's.
    pub fn protocols(mut self, protocols: &[&str]) -> Self {
        self.protocols = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Validates the upgrade request and completes the handshake on
    /// `stream`, writing either the `101 Switching Protocols` response or an
    /// HTTP rejection before returning.
    pub async fn upgrade<B, S>(
        &self,
        req: &Request<B>,
        mut stream: S,
    ) -> Result<Connection<S>, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.validate(req) {
            Ok((key, proto)) => {
                let accept = accept_key(key);
                let mut response = format!(
                    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n"
                );
                if let Some(proto) = &proto {
                    response.push_str(&format!("Sec-WebSocket-Protocol: {proto}\r\n"));
                }
                response.push_str("\r\n");
                stream.write_all(response.as_bytes()).await?;
                stream.flush().await?;
                tracing::debug!(subprotocol = ?proto, "upgrade accepted");

                let mut conn = Connection::with_config(stream, Role::Server, self.config.clone());
                conn.set_subprotocol(proto);
                Ok(conn)
            }
            Err(err) => {
                tracing::debug!(error = %err, status = %err.status(), "upgrade rejected");
                stream.write_all(err.response().as_bytes()).await?;
                stream.flush().await?;
                Err(err)
            }
        }
    }

    fn validate<'a, B>(
        &self,
        req: &'a Request<B>,
    ) -> Result<(&'a str, Option<String>), HandshakeError> {
        if req.method() != Method::GET {
            return Err(HandshakeError::MethodNotAllowed);
        }
        let headers = req.headers();
        if !header_contains(headers, "connection", "upgrade") {
            return Err(HandshakeError::NotWebSocket("missing `Connection: Upgrade`"));
        }
        if !header_contains(headers, "upgrade", "websocket") {
            return Err(HandshakeError::NotWebSocket("missing `Upgrade: websocket`"));
        }
        match headers
            .get("sec-websocket-version")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
        {
            Some("13") => {}
            _ => return Err(HandshakeError::UnsupportedVersion),
        }
        let key = headers
            .get("sec-websocket-key")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(HandshakeError::MissingKey)?;
        if let Some(check) = &self.check_origin {
            let origin = headers
                .get("origin")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !check(origin) {
                return Err(HandshakeError::OriginDenied);
            }
        }
        Ok((key, self.select_protocol(headers)))
    }

    /// First of the client's offered subprotocols that we support.
    fn select_protocol(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all("sec-websocket-protocol")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .find(|offered| self.protocols.iter().any(|p| p == offered))
            .map(str::to_owned)
    }
}

/// Performs the client side of the handshake over an established stream.
///
/// Sends the upgrade request, reads the response head byte by byte (so no
/// frame bytes are consumed), and verifies the `Sec-WebSocket-Accept` echo.
/// An accept mismatch is always fatal.
pub async fn connect<S>(
    mut stream: S,
    host: &str,
    path: &str,
    protocols: &[&str],
) -> Result<Connection<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce: [u8; 16] = rand::random();
    let key = BASE64.encode(nonce);
    let path = path.trim_start_matches('/');

    let mut request = format!(
        "GET /{path} HTTP/1.1\r\nHost: {host}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {key}\r\n"
    );
    if !protocols.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            protocols.join(", ")
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_response_head(&mut stream).await?;
    let response = Response::parse(&head).ok_or(HandshakeError::BadResponse)?;
    if response.status != 101 {
        return Err(HandshakeError::BadStatus(response.status));
    }
    if !response.header_has_token("upgrade", "websocket")
        || !response.header_has_token("connection", "upgrade")
    {
        return Err(HandshakeError::BadResponse);
    }
    if response.get("sec-websocket-accept") != Some(accept_key(&key).as_str()) {
        return Err(HandshakeError::AcceptMismatch);
    }
    let proto = response.get("sec-websocket-protocol").map(str::to_owned);
    if let Some(proto) = &proto {
        // Servers may only pick from what we offered.
        if !protocols.iter().any(|p| p.eq_ignore_ascii_case(proto)) {
            return Err(HandshakeError::BadResponse);
        }
    }
    tracing::debug!(subprotocol = ?proto, "handshake complete");

    let mut conn = Connection::new(stream, Role::Client);
    conn.set_subprotocol(proto);
    Ok(conn)
}

/// Dials `ws://host[:port]/path` over TCP and performs the handshake,
/// offering `protocols` as subprotocols. `wss://` needs a TLS stream from
/// the caller; use [`connect`] for that.
pub async fn dial(url: &str, protocols: &[&str]) -> Result<Connection<TcpStream>, HandshakeError> {
    let rest = url
        .strip_prefix("ws://")
        .ok_or(HandshakeError::NotWebSocket("only ws:// urls are supported"))?;
    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, path),
        None => (rest, ""),
    };
    if authority.is_empty() {
        return Err(HandshakeError::NotWebSocket("url is missing a host"));
    }
    let addr = if authority.contains(':') {
        authority.to_owned()
    } else {
        format!("{authority}:80")
    };
    let stream = TcpStream::connect(&addr).await.map_err(HandshakeError::Io)?;
    tracing::debug!(%addr, "tcp connected");
    connect(stream, authority, path, protocols).await
}

/// Reads up to and including the blank line terminating the response head,
/// one byte at a time, leaving any frame bytes unread on the stream.
async fn read_response_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, HandshakeError> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(HandshakeError::BadResponse);
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(HandshakeError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|_| HandshakeError::BadResponse)
}

/// Minimal HTTP/1.1 response head. Header names are lowercased on insert.
struct Response {
    status: u16,
    headers: HashMap<String, String>,
}

impl Response {
    fn parse(head: &str) -> Option<Self> {
        let mut lines = head.lines();
        let status_line = lines.next()?;
        let mut parts = status_line.splitn(3, ' ');
        if !parts.next()?.starts_with("HTTP/1.1") {
            return None;
        }
        let status = parts.next()?.parse().ok()?;
        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (key, value) = line.split_once(':')?;
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
        Some(Self { status, headers })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
    }
}
