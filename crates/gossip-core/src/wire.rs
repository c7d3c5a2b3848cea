//! Gossip wire format: one message per `\n`-terminated UTF-8 line.
//!
//! Every line is `<KIND> <payload>`. The kind is one of a closed set of
//! uppercase tags; everything after the first space is payload. There is no
//! escaping and no continuation: a message never spans two lines, so payloads
//! must not carry raw newlines. Receivers normalise any that slip through to
//! a single space before the message reaches application code.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed message: {raw:?}")]
    Malformed { raw: String },
    #[error("unknown message kind {kind:?} in {raw:?}")]
    UnknownKind { kind: String, raw: String },
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("invalid peer address {0:?}")]
    InvalidAddress(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Unknown kinds are logged and skipped; everything else ends the connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WireError::UnknownKind { .. })
    }
}

// ── Peer address ──────────────────────────────────────────────────────────────

/// Routable chat address of a peer: the host it connects from plus the port
/// it listens on. Unique key for a peer on both the directory and the nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address built from a connection's source IP and an announced port.
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self::new(ip.to_string(), port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| WireError::InvalidAddress(s.to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(WireError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| WireError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// Message kind tag. Closed set; the textual form is the uppercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Listening port announcement (node → directory, node → node).
    Hello,
    /// Broadcast chat text.
    Say,
    /// Private chat text, sent only on the recipient's link.
    SayTo,
    /// Display name binding: `<addr> <name>` from the directory, `<name>` between nodes.
    Name,
    /// Full current peer set, space-separated `host:port` list.
    Peers,
    /// Name assigned by the directory on accept.
    Welcome,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Hello => "HELLO",
            MessageKind::Say => "SAY",
            MessageKind::SayTo => "SAYTO",
            MessageKind::Name => "NAME",
            MessageKind::Peers => "PEERS",
            MessageKind::Welcome => "WELCOME",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "HELLO" => Some(MessageKind::Hello),
            "SAY" => Some(MessageKind::Say),
            "SAYTO" => Some(MessageKind::SayTo),
            "NAME" => Some(MessageKind::Name),
            "PEERS" => Some(MessageKind::Peers),
            "WELCOME" => Some(MessageKind::Welcome),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: String,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn hello(port: u16) -> Self {
        Self::new(MessageKind::Hello, port.to_string())
    }

    pub fn welcome(name: &str) -> Self {
        Self::new(MessageKind::Welcome, name)
    }

    pub fn say(text: &str) -> Self {
        Self::new(MessageKind::Say, text)
    }

    pub fn say_to(text: &str) -> Self {
        Self::new(MessageKind::SayTo, text)
    }

    /// Peer-to-peer name announcement.
    pub fn name(name: &str) -> Self {
        Self::new(MessageKind::Name, name)
    }

    /// Directory name binding for another peer.
    pub fn name_binding(addr: &PeerAddress, name: &str) -> Self {
        Self::new(MessageKind::Name, format!("{addr} {name}"))
    }

    pub fn peers<'a>(addrs: impl IntoIterator<Item = &'a PeerAddress>) -> Self {
        let list = addrs
            .into_iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        Self::new(MessageKind::Peers, list)
    }

    /// Port carried by a HELLO payload.
    pub fn hello_port(&self) -> Result<u16, WireError> {
        let raw = self.payload.trim();
        raw.parse::<u16>()
            .map_err(|_| WireError::InvalidPort(raw.to_string()))
    }

    /// Split a directory NAME payload into `(addr, name)`.
    pub fn parse_name_binding(&self) -> Result<(PeerAddress, String), WireError> {
        let (addr, name) = self
            .payload
            .trim()
            .split_once(' ')
            .ok_or_else(|| WireError::Malformed {
                raw: encode(self),
            })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(WireError::Malformed { raw: encode(self) });
        }
        Ok((addr.parse()?, name.to_string()))
    }

    /// Addresses in a PEERS payload. Tokens that are not `host:port` are skipped.
    pub fn parse_peer_list(&self) -> Vec<PeerAddress> {
        self.payload
            .split_whitespace()
            .filter_map(|token| token.parse().ok())
            .collect()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "[{}] <nil>", self.kind)
        } else {
            write!(f, "[{}] {}", self.kind, self.payload)
        }
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Replace every CR/LF with a single space.
pub fn normalize_newlines(s: &str) -> String {
    s.replace("\r\n", " ").replace(['\r', '\n'], " ")
}

/// Encode a message as one line, without the trailing `\n`.
pub fn encode(message: &Message) -> String {
    let payload = normalize_newlines(message.payload.trim());
    format!("{} {}", message.kind, payload)
}

/// Decode one line into a message.
pub fn decode(line: &str) -> Result<Message, WireError> {
    let raw = line.trim();
    let mut parts = raw.splitn(2, ' ');
    let tag = match parts.next() {
        Some(tag) if !tag.is_empty() => tag,
        _ => {
            return Err(WireError::Malformed {
                raw: line.to_string(),
            })
        }
    };
    let kind = MessageKind::from_tag(tag).ok_or_else(|| WireError::UnknownKind {
        kind: tag.to_string(),
        raw: raw.to_string(),
    })?;
    let payload = parts.next().map(normalize_newlines).unwrap_or_default();
    Ok(Message { kind, payload })
}

// ── Transport helpers ─────────────────────────────────────────────────────────

/// Read and decode the next line. EOF is reported as `ConnectionClosed`.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(WireError::ConnectionClosed);
    }
    decode(&line)
}

/// Encode and write one message followed by `\n`.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = encode(message);
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
