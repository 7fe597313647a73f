// utils.rs - Helper functions and utilities

use crate::{SipError, SipMethod, Result};
use lazy_static::lazy_static;
use nom::{
    character::complete::{alpha1, digit1, space1},
    combinator::{all_consuming, map_res},
    sequence::separated_pair,
    IResult,
};
use rand::{thread_rng, Rng};
use regex::Regex;

/// Remote port used when the configured domain carries none.
pub const DEFAULT_DOMAIN_PORT: u16 = 5065;

lazy_static! {
    static ref ANGLE_URI_REGEX: Regex = Regex::new(r"<sip:(.*?)>").unwrap();
}

/// Generate a Call-ID: ten random decimal digits
pub fn generate_call_id() -> String {
    let mut rng = thread_rng();
    (0..10)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Generate a digest client nonce: 32 lowercase hex characters
pub fn generate_cnonce() -> String {
    let bytes: [u8; 16] = thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Split a `host[:port]` domain into host and port
pub fn split_domain(domain: &str) -> Result<(String, u16)> {
    match domain.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| SipError::InvalidUri(domain.to_string()))?;
            Ok((host.to_string(), port))
        }
        None => Ok((domain.to_string(), DEFAULT_DOMAIN_PORT)),
    }
}

/// Extract the URI between angle brackets of a header value.
/// Values without brackets are returned up to the first `;` parameter.
pub fn parse_uri_from_header(header: &str) -> Option<&str> {
    if let Some(start) = header.find('<') {
        let end = header[start..].find('>')?;
        return Some(&header[start + 1..start + end]);
    }

    header.split(';').next().map(str::trim).filter(|s| !s.is_empty())
}

/// Target used in the digest URI: the `<sip:...>` part of a To header
/// with any port removed, e.g. `10000000005@192.168.0.71`.
pub fn digest_target(to_header: &str) -> Result<String> {
    let inner = ANGLE_URI_REGEX
        .captures(to_header)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| SipError::InvalidUri(to_header.to_string()))?;

    Ok(inner.split(':').next().unwrap_or(inner).to_string())
}

fn parse_cseq_parts(input: &str) -> IResult<&str, (u32, &str)> {
    all_consuming(separated_pair(
        map_res(digit1, |s: &str| s.parse::<u32>()),
        space1,
        alpha1,
    ))(input)
}

/// Parse a CSeq header value into its number and method name
pub fn parse_cseq(cseq: &str) -> Result<(u32, String)> {
    parse_cseq_parts(cseq.trim())
        .map(|(_, (seq, method))| (seq, method.to_string()))
        .map_err(|_| SipError::InvalidCSeq(cseq.to_string()))
}

/// CSeq method as a typed value
pub fn cseq_method(cseq: &str) -> Result<SipMethod> {
    let (_, method) = parse_cseq(cseq)?;
    method.parse()
}

/// Increment CSeq number
pub fn increment_cseq(cseq: &str) -> Result<String> {
    let (seq, method) = parse_cseq(cseq)?;
    let next = seq
        .checked_add(1)
        .ok_or_else(|| SipError::InvalidCSeq(cseq.to_string()))?;
    Ok(format!("{} {}", next, method))
}
