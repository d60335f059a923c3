//! Request and Reply messages exchanged once at the start of every channel.
//!
//! Both messages carry weak additive checksums. They catch framing mistakes
//! and accidental corruption; they are not an integrity guarantee.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REQUEST_SEED: u8 = 233;
const EXTRAS_SEED: u8 = 66;
const REPLY_SEED: u8 = 233;

const CMD_CONNECT: &str = "connect";
const CMD_CHANNELS: &str = "channels";
const CMD_IMUX_PREFIX: &str = "chs2:";
const CMD_SPEEDTEST: &str = "speedtest";
const CMD_DNS_PREFIX: &str = "dns:";
const CMD_NETWORK: &str = "network";

/// Reply status codes.
pub mod status {
    pub const OK: u8 = 0;
    /// Generic failure; the message carries the reason.
    pub const FAILED: u8 = 1;
    /// DNS record type not supported.
    pub const UNSUPPORTED_RECORD: u8 = 2;
    /// Command not understood by this peer.
    pub const NOT_SUPPORTED: u8 = 255;
}

/// Diagnostic sent with [`status::NOT_SUPPORTED`].
pub const NOT_SUPPORTED_MESSAGE: &str = "notsupport";

/// Errors raised by the wire codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// A checksum byte did not match.
    #[error("checksum failed")]
    ChecksumFailed,

    /// The message ended inside a mandatory field.
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),

    /// Unknown address type byte.
    #[error("invalid address type {0:#04x}")]
    InvalidAddress(u8),

    /// A string field is not valid UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A string does not fit its length prefix.
    #[error("string too long ({0} bytes)")]
    StringTooLong(usize),

    /// More extras than the count byte can express.
    #[error("too many extra strings ({0})")]
    TooManyExtras(usize),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// A proxy destination: host (IP literal or name) and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The all-zero endpoint used when a reply has nothing to report.
    pub fn unspecified() -> Self {
        Self::new("0.0.0.0", 0)
    }

    fn bare_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host)
    }

    /// Append the address-type encoding to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let host = self.bare_host();
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&v4.octets());
        } else if let Ok(v6) = host.parse::<Ipv6Addr>() {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&v6.octets());
        } else {
            let bytes = host.as_bytes();
            if bytes.len() > u8::MAX as usize {
                return Err(WireError::StringTooLong(bytes.len()));
            }
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(bytes.len() as u8);
            buf.put_slice(bytes);
        }
        buf.put_u16(self.port);
        Ok(())
    }

    /// Decode one destination, advancing `cur` past it.
    pub fn decode(cur: &mut &[u8]) -> Result<Self> {
        read_address(cur)?.into_destination()
    }

    /// Resolve into a socket address if the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.bare_host()
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {s:?}"))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in {s:?}"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(format!("missing host in {s:?}"));
        }
        Ok(Self::new(host, port))
    }
}

/// Address bytes as they appeared on the wire, before UTF-8 validation.
struct RawAddress<'a> {
    atyp: u8,
    addr: &'a [u8],
    port: u16,
}

impl RawAddress<'_> {
    fn into_destination(self) -> Result<Destination> {
        let host = match self.atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(self.addr);
                Ipv4Addr::from(octets).to_string()
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.addr);
                Ipv6Addr::from(octets).to_string()
            }
            _ => std::str::from_utf8(self.addr)
                .map_err(|_| WireError::InvalidUtf8("host"))?
                .to_string(),
        };
        Ok(Destination::new(host, self.port))
    }
}

fn take<'a>(cur: &mut &'a [u8], n: usize, what: &'static str) -> Result<&'a [u8]> {
    if cur.len() < n {
        return Err(WireError::Truncated(what));
    }
    let (head, tail) = cur.split_at(n);
    *cur = tail;
    Ok(head)
}

fn take_u8(cur: &mut &[u8], what: &'static str) -> Result<u8> {
    Ok(take(cur, 1, what)?[0])
}

fn read_address<'a>(cur: &mut &'a [u8]) -> Result<RawAddress<'a>> {
    let atyp = take_u8(cur, "address type")?;
    let addr = match atyp {
        ATYP_IPV4 => take(cur, 4, "ipv4 address")?,
        ATYP_IPV6 => take(cur, 16, "ipv6 address")?,
        ATYP_DOMAIN => {
            let len = take_u8(cur, "domain length")? as usize;
            take(cur, len, "domain")?
        }
        other => return Err(WireError::InvalidAddress(other)),
    };
    let port = take(cur, 2, "port")?;
    Ok(RawAddress {
        atyp,
        addr,
        port: u16::from_be_bytes([port[0], port[1]]),
    })
}

fn additive(seed: u8, bytes: &[u8]) -> u8 {
    bytes.iter().fold(seed, |acc, b| acc.wrapping_add(*b))
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(WireError::StringTooLong(s.len()));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn read_str(cur: &mut &[u8], what: &'static str) -> Result<String> {
    let len = take(cur, 2, what)?;
    let len = u16::from_be_bytes([len[0], len[1]]) as usize;
    let bytes = take(cur, len, what)?;
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| WireError::InvalidUtf8(what))
}

/// One leg of an IMUX bootstrap, as advertised in `chs2:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImuxLeg {
    pub session_id: String,
    /// Duplex legs.
    pub ws: u16,
    /// This leg's slot.
    pub index: u16,
    /// Send-only legs (from the client's point of view).
    pub wsso: u16,
    /// Receive-only legs (from the client's point of view).
    pub http: u16,
}

impl ImuxLeg {
    /// Number of legs the session expects.
    pub fn total(&self) -> usize {
        self.ws as usize + self.wsso as usize + self.http as usize
    }

    fn parse(body: &str) -> Option<Self> {
        let parts: Vec<&str> = body.split(',').collect();
        let num = |i: usize| parts.get(i).and_then(|p| p.trim().parse::<u16>().ok());
        let (wsso, http) = match parts.len() {
            3 => (0, 0),
            5 => (num(3)?, num(4)?),
            _ => return None,
        };
        let session_id = parts[0].trim();
        if session_id.is_empty() {
            return None;
        }
        Some(Self {
            session_id: session_id.to_string(),
            ws: num(1)?,
            index: num(2)?,
            wsso,
            http,
        })
    }
}

/// The command carried by a Request, parsed once at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a proxied connection to the destination.
    Connect,
    /// Start a multiplexed session on this stream.
    Channels,
    /// One leg of an IMUX bootstrap.
    Imux(ImuxLeg),
    /// Line-based ping/throughput test.
    SpeedTest,
    /// Resolve a name; the record type travels in the first extra.
    Dns(String),
    /// Rendezvous registry sub-commands follow.
    Network,
    /// Anything else, kept verbatim for the reply log.
    Unsupported(String),
}

impl Command {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "" | CMD_CONNECT => Command::Connect,
            CMD_CHANNELS => Command::Channels,
            CMD_SPEEDTEST => Command::SpeedTest,
            CMD_NETWORK => Command::Network,
            _ => {
                if let Some(body) = raw.strip_prefix(CMD_IMUX_PREFIX) {
                    if let Some(leg) = ImuxLeg::parse(body) {
                        return Command::Imux(leg);
                    }
                } else if let Some(name) = raw.strip_prefix(CMD_DNS_PREFIX) {
                    if !name.is_empty() {
                        return Command::Dns(name.to_string());
                    }
                }
                Command::Unsupported(raw.to_string())
            }
        }
    }

    /// The command string as sent on the wire.
    pub fn to_wire(&self) -> String {
        match self {
            Command::Connect => CMD_CONNECT.to_string(),
            Command::Channels => CMD_CHANNELS.to_string(),
            Command::Imux(leg) => format!(
                "{CMD_IMUX_PREFIX}{},{},{},{},{}",
                leg.session_id, leg.ws, leg.index, leg.wsso, leg.http
            ),
            Command::SpeedTest => CMD_SPEEDTEST.to_string(),
            Command::Dns(name) => format!("{CMD_DNS_PREFIX}{name}"),
            Command::Network => CMD_NETWORK.to_string(),
            Command::Unsupported(raw) => raw.clone(),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect => "connect",
            Command::Channels => "channels",
            Command::Imux(_) => "imux",
            Command::SpeedTest => "speedtest",
            Command::Dns(_) => "dns",
            Command::Network => "network",
            Command::Unsupported(_) => "unsupported",
        }
    }
}

/// The first message on every channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub destination: Destination,
    pub command: Command,
    pub extras: Vec<String>,
}

impl Request {
    pub fn new(destination: Destination, command: Command) -> Self {
        Self {
            destination,
            command,
            extras: Vec::new(),
        }
    }

    pub fn with_extras(mut self, extras: Vec<String>) -> Self {
        self.extras = extras;
        self
    }

    /// A proxy connect request.
    pub fn connect(destination: Destination) -> Self {
        Self::new(destination, Command::Connect)
    }

    /// A name-resolution request.
    pub fn dns(name: &str, record_type: &str) -> Self {
        Self::new(Destination::unspecified(), Command::Dns(name.to_string()))
            .with_extras(vec![record_type.to_string()])
    }

    /// Encode with a random even padding byte.
    pub fn encode(&self) -> Result<Bytes> {
        self.encode_with_pad(rand::random::<u8>() & 0xFE)
    }

    pub(crate) fn encode_with_pad(&self, pad: u8) -> Result<Bytes> {
        if self.extras.len() > u8::MAX as usize {
            return Err(WireError::TooManyExtras(self.extras.len()));
        }

        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(pad & 0xFE);
        self.destination.encode(&mut buf)?;
        buf.put_u8(additive(REQUEST_SEED, &buf));

        let after_ck1 = buf.len();
        put_str(&mut buf, &self.command.to_wire())?;
        if !self.extras.is_empty() {
            buf.put_u8(self.extras.len() as u8);
            for extra in &self.extras {
                put_str(&mut buf, extra)?;
            }
            buf.put_u8(additive(EXTRAS_SEED, &buf[after_ck1..]));
        }
        Ok(buf.freeze())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cur = buf;
        take_u8(&mut cur, "padding")?;
        let raw = read_address(&mut cur)?;
        let header_len = buf.len() - cur.len();
        let ck1 = take_u8(&mut cur, "checksum")?;
        if additive(REQUEST_SEED, &buf[..header_len]) != ck1 {
            return Err(WireError::ChecksumFailed);
        }
        let destination = raw.into_destination()?;

        let after_ck1 = buf.len() - cur.len();
        let command = read_str(&mut cur, "command")?;

        let mut extras = Vec::new();
        if !cur.is_empty() {
            let count = take_u8(&mut cur, "extras count")?;
            for _ in 0..count {
                extras.push(read_str(&mut cur, "extra")?);
            }
            let covered = buf.len() - cur.len();
            let ck2 = take_u8(&mut cur, "extras checksum")?;
            if additive(EXTRAS_SEED, &buf[after_ck1..covered]) != ck2 {
                return Err(WireError::ChecksumFailed);
            }
        }

        Ok(Self {
            destination,
            command: Command::parse(&command),
            extras,
        })
    }
}

/// The answer to a Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub endpoint: Destination,
    pub status: u8,
    pub message: String,
}

impl Reply {
    pub fn ok(endpoint: Destination) -> Self {
        Self {
            endpoint,
            status: status::OK,
            message: String::new(),
        }
    }

    pub fn ok_with_message(message: impl Into<String>) -> Self {
        Self {
            endpoint: Destination::unspecified(),
            status: status::OK,
            message: message.into(),
        }
    }

    pub fn failure(status: u8, message: impl Into<String>) -> Self {
        Self {
            endpoint: Destination::unspecified(),
            status,
            message: message.into(),
        }
    }

    pub fn not_supported() -> Self {
        Self::failure(status::NOT_SUPPORTED, NOT_SUPPORTED_MESSAGE)
    }

    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(32 + self.message.len());
        buf.put_u8(0);
        self.endpoint.encode(&mut buf)?;
        buf.put_u8(self.status);
        buf.put_u8(additive(REPLY_SEED, &buf));
        if !self.message.is_empty() {
            put_str(&mut buf, &self.message)?;
        }
        Ok(buf.freeze())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cur = buf;
        take_u8(&mut cur, "reply marker")?;
        let raw = read_address(&mut cur)?;
        let status = take_u8(&mut cur, "status")?;
        let header_len = buf.len() - cur.len();
        let ck = take_u8(&mut cur, "checksum")?;
        if additive(REPLY_SEED, &buf[..header_len]) != ck {
            return Err(WireError::ChecksumFailed);
        }
        let endpoint = raw.into_destination()?;
        let message = if cur.is_empty() {
            String::new()
        } else {
            read_str(&mut cur, "message")?
        };
        Ok(Self {
            endpoint,
            status,
            message,
        })
    }
}

/// Encode a string array: `count(1) · str*`.
pub fn encode_strings<S: AsRef<str>>(items: &[S]) -> Result<Bytes> {
    if items.len() > u8::MAX as usize {
        return Err(WireError::TooManyExtras(items.len()));
    }
    let mut buf = BytesMut::new();
    buf.put_u8(items.len() as u8);
    for item in items {
        put_str(&mut buf, item.as_ref())?;
    }
    Ok(buf.freeze())
}

pub fn decode_strings(buf: &[u8]) -> Result<Vec<String>> {
    let mut cur = buf;
    let count = take_u8(&mut cur, "string count")?;
    (0..count).map(|_| read_str(&mut cur, "string")).collect()
}
