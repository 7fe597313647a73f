// lib.rs - SIP user-agent for intercom registration, calls and instant messages

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, space0, space1},
    combinator::{map_res, recognize},
    sequence::tuple,
    IResult,
};
use std::fmt::{self, Write as _};
use std::str::FromStr;
use thiserror::Error;

pub mod auth;
pub mod codec;
pub mod dialog;
pub mod events;
pub mod session;
pub mod transport;
pub mod utils;

pub use auth::{build_authorization, DigestChallenge};
pub use events::{EventHook, HandlerId, Inbound, ReceivedMessage, SessionEvents, SessionStatus, StatePublisher};
pub use session::{DeviceIdentity, ListenerExit, SessionConfig, SipSession};

// Limits applied to every inbound datagram before it reaches the state machine
pub const MAX_HEADER_LENGTH: usize = 8192;
pub const MAX_HEADERS: usize = 256;
pub const MAX_BODY_LENGTH: usize = 65536;
pub const MAX_MESSAGE_LENGTH: usize = MAX_HEADER_LENGTH + MAX_BODY_LENGTH;

pub const SIP_VERSION: &str = "SIP/2.0";

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Header too long: {0} bytes (max: {1})")]
    HeaderTooLong(usize, usize),

    #[error("Too many headers: {0} (max: {1})")]
    TooManyHeaders(usize, usize),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Empty message")]
    EmptyMessage,

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("No header called {0}")]
    HeaderNotFound(String),

    #[error("Invalid CSeq: {0}")]
    InvalidCSeq(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Digest challenge is missing {0}")]
    MissingChallengeParameter(&'static str),

    #[error("Unsupported qop: {0}")]
    UnsupportedQop(String),

    #[error("Cannot resolve address: {0}")]
    AddressResolution(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SipError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Info,
    Refer,
    Subscribe,
    Notify,
    Message,
    Other(String),
}

impl FromStr for SipMethod {
    type Err = SipError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 32 {
            return Err(SipError::InvalidMethod(s.to_string()));
        }

        if !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SipError::InvalidMethod(s.to_string()));
        }

        Ok(match s.to_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "REFER" => SipMethod::Refer,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "MESSAGE" => SipMethod::Message,
            method => SipMethod::Other(method.to_string()),
        })
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMethod::Register => write!(f, "REGISTER"),
            SipMethod::Invite => write!(f, "INVITE"),
            SipMethod::Ack => write!(f, "ACK"),
            SipMethod::Bye => write!(f, "BYE"),
            SipMethod::Cancel => write!(f, "CANCEL"),
            SipMethod::Options => write!(f, "OPTIONS"),
            SipMethod::Info => write!(f, "INFO"),
            SipMethod::Refer => write!(f, "REFER"),
            SipMethod::Subscribe => write!(f, "SUBSCRIBE"),
            SipMethod::Notify => write!(f, "NOTIFY"),
            SipMethod::Message => write!(f, "MESSAGE"),
            SipMethod::Other(s) => write!(f, "{}", s),
        }
    }
}

/// A single `name: value` header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A SIP request or response kept as text.
///
/// Headers are an ordered multimap: names may repeat (`Via`, `Record-Route`)
/// and insertion order is what goes on the wire. Lookups match names
/// case-insensitively but never reorder or merge entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Request line (`REGISTER sip:host SIP/2.0`) or status line (`SIP/2.0 200 OK`).
    pub status_line: String,
    headers: Vec<Header>,
    pub body: String,
}

impl Message {
    pub fn new(status_line: impl Into<String>) -> Self {
        Self {
            status_line: status_line.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Parse a datagram. Tolerates both CRLF and bare LF line endings.
    ///
    /// The first line is the start line, each following non-empty line is
    /// split on its first `:`, and everything after the first empty line is
    /// kept verbatim as the body.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() > MAX_MESSAGE_LENGTH {
            return Err(SipError::MessageTooLarge(raw.len(), MAX_MESSAGE_LENGTH));
        }

        let mut lines = raw.split_inclusive('\n');
        let first = lines.next().ok_or(SipError::EmptyMessage)?;
        let status_line = trim_line_ending(first);
        if status_line.trim().is_empty() {
            return Err(SipError::EmptyMessage);
        }

        let mut message = Message::new(status_line);
        let mut offset = first.len();
        let mut body_start = raw.len();

        for line in lines {
            offset += line.len();
            let text = trim_line_ending(line);
            if text.is_empty() {
                body_start = offset;
                break;
            }
            if text.len() > MAX_HEADER_LENGTH {
                return Err(SipError::HeaderTooLong(text.len(), MAX_HEADER_LENGTH));
            }
            if message.headers.len() >= MAX_HEADERS {
                return Err(SipError::TooManyHeaders(message.headers.len() + 1, MAX_HEADERS));
            }

            let (name, value) = text
                .split_once(':')
                .ok_or_else(|| SipError::MalformedHeader(text.to_string()))?;
            message.headers.push(Header::new(name.trim(), value.trim()));
        }

        message.body = raw[body_start..].to_string();
        Ok(message)
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First value of the named header, or `HeaderNotFound`.
    pub fn get_header(&self, name: &str) -> Result<&str> {
        self.header(name)
            .ok_or_else(|| SipError::HeaderNotFound(name.to_string()))
    }

    /// First value of the named header, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Every value of the named header, in message order.
    pub fn get_headers_iter<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Append a header, or with `replace` overwrite the first header of that
    /// name in place. Falls back to appending when nothing matches.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>, replace: bool) {
        let value = value.into();
        if replace {
            if let Some(existing) = self
                .headers
                .iter_mut()
                .find(|h| h.name.eq_ignore_ascii_case(name))
            {
                existing.value = value;
                return;
            }
        }
        self.headers.push(Header::new(name, value));
    }

    /// Insert a header at `index`, clamped to the current header count.
    pub fn insert_header(&mut self, index: usize, name: &str, value: impl Into<String>) {
        let index = index.min(self.headers.len());
        self.headers.insert(index, Header::new(name, value));
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// Render the message with CRLF line endings. `Content-Length` is written
    /// only if a header of that name has been set; see [`codec::SipCodec`].
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(
            self.status_line.len() + self.headers.len() * 48 + self.body.len() + 4,
        );
        out.push_str(&self.status_line);
        out.push_str("\r\n");
        for header in &self.headers {
            let _ = write!(out, "{}: {}\r\n", header.name, header.value);
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }

    /// Status code when the start line is a status line.
    pub fn status_code(&self) -> Option<u16> {
        parse_status_line(&self.status_line)
            .ok()
            .map(|(_, (code, _))| code)
    }

    /// Method when the start line is a request line.
    pub fn method(&self) -> Option<SipMethod> {
        parse_request_line(&self.status_line)
            .ok()
            .map(|(_, (method, _))| method)
    }

    /// Request-URI when the start line is a request line.
    pub fn request_uri(&self) -> Option<&str> {
        parse_request_line(&self.status_line)
            .ok()
            .map(|(_, (_, uri))| uri)
    }

    pub fn is_request(&self) -> bool {
        self.method().is_some()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

fn trim_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

// Start-line parsers using nom
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

fn parse_token(input: &str) -> IResult<&str, &str> {
    take_while1(is_token_char)(input)
}

fn parse_method(input: &str) -> IResult<&str, SipMethod> {
    map_res(parse_token, SipMethod::from_str)(input)
}

fn parse_sip_version(input: &str) -> IResult<&str, &str> {
    recognize(tuple((tag("SIP"), char('/'), digit1, char('.'), digit1)))(input)
}

fn parse_status_line(input: &str) -> IResult<&str, (u16, &str)> {
    let (input, _) = parse_sip_version(input)?;
    let (input, _) = space1(input)?;
    let (input, status_code) = map_res(digit1, |s: &str| s.parse::<u16>())(input)?;
    let (reason, _) = space0(input)?;

    Ok(("", (status_code, reason)))
}

fn parse_request_line(input: &str) -> IResult<&str, (SipMethod, &str)> {
    let (input, method) = parse_method(input)?;
    let (input, _) = space1(input)?;
    let (input, uri) = take_while1(|c: char| c != ' ')(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = parse_sip_version(input)?;

    Ok((input, (method, uri)))
}
