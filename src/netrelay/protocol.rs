//! Control channel wire format.
//!
//! Frames are CRLF-delimited text, not length-prefixed:
//!
//! ```text
//! F-RELAY/1\r\n
//! [[BEGIN]]\r\n
//! AGENT_ID:::<id>\r\n
//! REQUEST:::<code>=[<arg>,<arg>]\r\n      (agent -> server)
//! ORDER:::<code>=[<arg>,<arg>]\r\n        (server -> agent)
//! [[END]]\r\n
//! ```
//!
//! The same framing is reused on a TCP data channel to announce that the
//! channel is ready (`008`), and on the UDP penetration probe (`011`/`012`).

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_BYTES: usize = 256;

const HEADER: &str = "F-RELAY/1";
const BEGIN: &str = "[[BEGIN]]";
const END: &str = "[[END]]";
const CRLF: &str = "\r\n";
const END_LINE: &[u8] = b"[[END]]\r\n";
const FIELD_SEP: &str = ":::";

const KEY_AGENT_ID: &str = "AGENT_ID";
const KEY_ORDER: &str = "ORDER";
const KEY_REQUEST: &str = "REQUEST";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_BYTES})")]
    FrameTooLarge(usize),
    #[error("frame is not valid utf-8")]
    InvalidUtf8,
    #[error("bad frame header")]
    BadHeader,
    #[error("bad frame begin marker")]
    BadBegin,
    #[error("bad frame end marker")]
    BadEnd,
    #[error("bad field line {0:?}")]
    BadField(String),
    #[error("frame carries neither an order nor a request")]
    MissingDirective,
    #[error("frame carries both an order and a request")]
    AmbiguousDirective,
    #[error("invalid token {0:?} (must not contain ',', ']', '=' or line breaks)")]
    InvalidToken(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Directive codes exchanged on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Directive {
    Ping,
    RegisterControl,
    RegisterControlReply,
    RegisterTcpProxies,
    RegisterTcpProxiesReply,
    RegisterUdpProxies,
    RegisterUdpProxiesReply,
    NeedTcpRelay,
    TcpRelayReady,
    NeedUdpRelay,
    UdpRelayReady,
    UdpPenetration,
    UdpPenetrationAck,
    Shutdown,
    Unknown(String),
}

impl Directive {
    pub fn code(&self) -> &str {
        match self {
            Directive::Ping => "000",
            Directive::RegisterControl => "001",
            Directive::RegisterControlReply => "002",
            Directive::RegisterTcpProxies => "003",
            Directive::RegisterTcpProxiesReply => "004",
            Directive::RegisterUdpProxies => "005",
            Directive::RegisterUdpProxiesReply => "006",
            Directive::NeedTcpRelay => "007",
            Directive::TcpRelayReady => "008",
            Directive::NeedUdpRelay => "009",
            Directive::UdpRelayReady => "010",
            Directive::UdpPenetration => "011",
            Directive::UdpPenetrationAck => "012",
            Directive::Shutdown => "999",
            Directive::Unknown(code) => code,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "000" => Directive::Ping,
            "001" => Directive::RegisterControl,
            "002" => Directive::RegisterControlReply,
            "003" => Directive::RegisterTcpProxies,
            "004" => Directive::RegisterTcpProxiesReply,
            "005" => Directive::RegisterUdpProxies,
            "006" => Directive::RegisterUdpProxiesReply,
            "007" => Directive::NeedTcpRelay,
            "008" => Directive::TcpRelayReady,
            "009" => Directive::NeedUdpRelay,
            "010" => Directive::UdpRelayReady,
            "011" => Directive::UdpPenetration,
            "012" => Directive::UdpPenetrationAck,
            "999" => Directive::Shutdown,
            other => Directive::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A directive plus its ordered argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub directive: Directive,
    pub args: Vec<String>,
}

impl Method {
    pub fn new(directive: Directive, args: Vec<String>) -> Self {
        Self { directive, args }
    }
}

/// One control frame. At most one of `order` / `request` is populated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlMessage {
    pub agent_id: String,
    pub order: Option<Method>,
    pub request: Option<Method>,
}

impl ControlMessage {
    pub fn request(agent_id: impl Into<String>, directive: Directive, args: Vec<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            order: None,
            request: Some(Method::new(directive, args)),
        }
    }

    pub fn order(directive: Directive, args: Vec<String>) -> Self {
        Self {
            agent_id: String::new(),
            order: Some(Method::new(directive, args)),
            request: None,
        }
    }

    /// The populated directive, whichever direction it travels in.
    pub fn method(&self) -> Option<&Method> {
        self.order.as_ref().or(self.request.as_ref())
    }

    pub fn directive(&self) -> Option<&Directive> {
        self.method().map(|m| &m.directive)
    }

    pub fn args(&self) -> &[String] {
        self.method().map(|m| m.args.as_slice()).unwrap_or(&[])
    }

    /// Encode into a complete frame. The `AGENT_ID` line is written for every
    /// request and for orders that carry an id.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let (key, method) = match (&self.order, &self.request) {
            (Some(_), Some(_)) => return Err(ProtocolError::AmbiguousDirective),
            (None, None) => return Err(ProtocolError::MissingDirective),
            (Some(m), None) => (KEY_ORDER, m),
            (None, Some(m)) => (KEY_REQUEST, m),
        };

        check_token(&self.agent_id)?;
        check_token(method.directive.code())?;
        if method.directive.code().is_empty() {
            return Err(ProtocolError::InvalidToken(String::new()));
        }
        for a in &method.args {
            check_token(a)?;
        }

        let mut out = String::with_capacity(96);
        out.push_str(HEADER);
        out.push_str(CRLF);
        out.push_str(BEGIN);
        out.push_str(CRLF);
        if key == KEY_REQUEST || !self.agent_id.is_empty() {
            out.push_str(KEY_AGENT_ID);
            out.push_str(FIELD_SEP);
            out.push_str(&self.agent_id);
            out.push_str(CRLF);
        }
        out.push_str(key);
        out.push_str(FIELD_SEP);
        out.push_str(method.directive.code());
        if !method.args.is_empty() {
            out.push_str("=[");
            out.push_str(&method.args.join(","));
            out.push(']');
        }
        out.push_str(CRLF);
        out.push_str(END);
        out.push_str(CRLF);

        if out.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(out.len()));
        }
        Ok(out.into_bytes())
    }

    /// Strictly parse one complete frame (as delimited by [`find_message_end`]).
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)?;
        let body = text.strip_suffix(CRLF).ok_or(ProtocolError::BadEnd)?;

        let lines: Vec<&str> = body.split(CRLF).collect();
        if lines.first() != Some(&HEADER) {
            return Err(ProtocolError::BadHeader);
        }
        if lines.get(1) != Some(&BEGIN) {
            return Err(ProtocolError::BadBegin);
        }
        if lines.len() < 3 || lines.last() != Some(&END) {
            return Err(ProtocolError::BadEnd);
        }

        let mut msg = ControlMessage::default();
        for line in &lines[2..lines.len() - 1] {
            let Some((key, value)) = line.split_once(FIELD_SEP) else {
                return Err(ProtocolError::BadField(line.to_string()));
            };
            match key {
                KEY_AGENT_ID => msg.agent_id = value.to_string(),
                KEY_ORDER => msg.order = Some(parse_method(value)?),
                KEY_REQUEST => msg.request = Some(parse_method(value)?),
                _ => {}
            }
        }

        match (&msg.order, &msg.request) {
            (None, None) => Err(ProtocolError::MissingDirective),
            (Some(_), Some(_)) => Err(ProtocolError::AmbiguousDirective),
            _ => Ok(msg),
        }
    }
}

fn check_token(s: &str) -> Result<(), ProtocolError> {
    if s.contains([',', ']', '=', '\r', '\n']) || s.contains(FIELD_SEP) {
        return Err(ProtocolError::InvalidToken(s.to_string()));
    }
    Ok(())
}

fn parse_method(value: &str) -> Result<Method, ProtocolError> {
    let (name, args) = match value.split_once('=') {
        None => (value, Vec::new()),
        Some((name, list)) => {
            let inner = list
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .ok_or_else(|| ProtocolError::BadField(value.to_string()))?;
            let args = if inner.is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(str::to_string).collect()
            };
            (name, args)
        }
    };
    if name.is_empty() {
        return Err(ProtocolError::BadField(value.to_string()));
    }
    Ok(Method::new(Directive::from_code(name), args))
}

/// Offset one past the CRLF that terminates the first `[[END]]` line, or
/// `None` while the frame is still incomplete.
pub fn find_message_end(buf: &[u8]) -> Option<usize> {
    let mut from = 0;
    while from + END_LINE.len() <= buf.len() {
        let pos = buf[from..]
            .windows(END_LINE.len())
            .position(|w| w == END_LINE)?
            + from;
        if pos == 0 || buf[pos - 1] == b'\n' {
            return Some(pos + END_LINE.len());
        }
        from = pos + 1;
    }
    None
}

/// Accumulates bytes from a stream and yields whole frames in order.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_FRAME_BYTES * 2),
        }
    }

    #[cfg(test)]
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    #[cfg(test)]
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Pop the next complete frame. A malformed frame is consumed before the
    /// error is returned so the stream stays aligned.
    pub fn next_frame(&mut self) -> Result<Option<ControlMessage>, ProtocolError> {
        if let Some(end) = find_message_end(&self.buf) {
            let frame = self.buf.split_to(end);
            if frame.len() > MAX_FRAME_BYTES {
                return Err(ProtocolError::FrameTooLarge(frame.len()));
            }
            return ControlMessage::parse(&frame).map(Some);
        }
        if self.buf.len() > MAX_FRAME_BYTES {
            let n = self.buf.len();
            self.buf.advance(n);
            return Err(ProtocolError::FrameTooLarge(n));
        }
        Ok(None)
    }

    /// Read until one frame is available. `Ok(None)` means the peer closed
    /// the stream.
    pub async fn read_message<R: AsyncRead + Unpin>(
        &mut self,
        r: &mut R,
    ) -> Result<Option<ControlMessage>, ProtocolError> {
        loop {
            if let Some(msg) = self.next_frame()? {
                return Ok(Some(msg));
            }
            self.buf.reserve(MAX_FRAME_BYTES);
            let n = r.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &ControlMessage,
) -> Result<(), ProtocolError> {
    let frame = msg.encode()?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}
