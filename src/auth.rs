//! HTTP Digest (RFC 2617, MD5) credentials for challenged requests.
//!
//! The nonce count is always `00000001`: every challenge is answered with a
//! freshly computed value and no counter is kept between challenges.

use crate::{utils, Result, SipError};
use lazy_static::lazy_static;
use regex::Regex;

/// Port written into the digest URI, whatever the configured domain port.
pub const DIGEST_URI_PORT: u16 = 5065;

pub const NONCE_COUNT: &str = "00000001";

lazy_static! {
    static ref REALM_REGEX: Regex = Regex::new(r#"(?:^|[\s,])realm="(.*?)""#).unwrap();
    static ref NONCE_REGEX: Regex = Regex::new(r#"(?:^|[\s,])nonce="(.*?)""#).unwrap();
    static ref OPAQUE_REGEX: Regex = Regex::new(r#"(?:^|[\s,])opaque="(.*?)""#).unwrap();
    static ref QOP_REGEX: Regex = Regex::new(r#"(?:^|[\s,])qop=(?:"([^"]*)"|([^,\s]+))"#).unwrap();
}

/// Parameters taken from a `WWW-Authenticate` or `Proxy-Authenticate` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<String>,
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Result<Self> {
        let realm = capture(&REALM_REGEX, header)
            .ok_or(SipError::MissingChallengeParameter("realm"))?;
        let nonce = capture(&NONCE_REGEX, header)
            .ok_or(SipError::MissingChallengeParameter("nonce"))?;

        Ok(Self {
            realm,
            nonce,
            opaque: capture(&OPAQUE_REGEX, header),
            qop: capture(&QOP_REGEX, header),
        })
    }
}

fn capture(regex: &Regex, header: &str) -> Option<String> {
    let caps = regex.captures(header)?;
    caps.iter()
        .skip(1)
        .flatten()
        .next()
        .map(|m| m.as_str().to_string())
}

/// MD5 of the UTF-8 bytes, as lowercase hex.
pub fn h(data: &str) -> String {
    format!("{:x}", md5::compute(data.as_bytes()))
}

pub fn kd(secret: &str, data: &str) -> String {
    h(&format!("{}:{}", secret, data))
}

pub fn digest_uri(target: &str) -> String {
    format!("sip:{}:{}", target, DIGEST_URI_PORT)
}

/// `KD(H(A1), nonce:H(A2))`, or with `qop` as `(cnonce, qop)`
/// `KD(H(A1), nonce:nc:cnonce:qop:H(A2))`.
pub fn compute_response(a1: &str, a2: &str, nonce: &str, qop: Option<(&str, &str)>) -> String {
    match qop {
        Some((cnonce, qop)) => kd(
            &h(a1),
            &format!("{}:{}:{}:{}:{}", nonce, NONCE_COUNT, cnonce, qop, h(a2)),
        ),
        None => kd(&h(a1), &format!("{}:{}", nonce, h(a2))),
    }
}

/// Build an `Authorization` header value answering `challenge_header`.
///
/// `target` is the host part used in the digest URI (see
/// [`utils::digest_target`]). `auth_username` replaces `username` when set.
pub fn build_authorization(
    challenge_header: &str,
    method: &str,
    target: &str,
    username: &str,
    password: &str,
    auth_username: Option<&str>,
) -> Result<String> {
    let challenge = DigestChallenge::parse(challenge_header)?;
    authorization_for(&challenge, method, target, auth_username.unwrap_or(username), password, &utils::generate_cnonce())
}

pub(crate) fn authorization_for(
    challenge: &DigestChallenge,
    method: &str,
    target: &str,
    username: &str,
    password: &str,
    cnonce: &str,
) -> Result<String> {
    let uri = digest_uri(target);
    let a1 = format!("{}:{}:{}", username, challenge.realm, password);
    let a2 = format!("{}:{}", method, uri);

    match &challenge.qop {
        Some(options) => {
            if !options.split(',').any(|option| option.trim() == "auth") {
                return Err(SipError::UnsupportedQop(options.clone()));
            }
            let response = compute_response(&a1, &a2, &challenge.nonce, Some((cnonce, "auth")));
            Ok(format!(
                "Digest username=\"{}\",realm=\"{}\",nonce=\"{}\",uri=\"{}\",response=\"{}\",cnonce=\"{}\",nc={},qop=auth,algorithm=MD5",
                username, challenge.realm, challenge.nonce, uri, response, cnonce, NONCE_COUNT
            ))
        }
        None => {
            let response = compute_response(&a1, &a2, &challenge.nonce, None);
            let mut value = format!(
                "Digest username=\"{}\",realm=\"{}\",nonce=\"{}\",uri=\"{}\",response=\"{}\",algorithm=MD5",
                username, challenge.realm, challenge.nonce, uri, response
            );
            if let Some(opaque) = &challenge.opaque {
                value.push_str(&format!(",opaque=\"{}\"", opaque));
            }
            Ok(value)
        }
    }
}
