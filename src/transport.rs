//! SIP Transport Layer
//!
//! A single UDP socket shared by the listener, the keepalive timer and the
//! request builders.

use crate::{codec::SipCodec, Message, Result, SipError};
use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::net::{lookup_host, UdpSocket};
use tokio_util::codec::Encoder;
use tracing::{debug, info};

/// Datagrams larger than this are truncated on receive.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 2048;

/// Transport layer configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// UDP listen address; port 0 lets the OS choose
    pub bind_addr: SocketAddr,

    /// Receive buffer per datagram
    pub recv_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5061)),
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

/// A datagram as received, decoded lossily as UTF-8.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub source: SocketAddr,
    pub raw: String,
}

pub struct SipTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer_size: usize,
}

impl SipTransport {
    pub async fn bind(config: &TransportConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        // The OS-assigned port wins over the requested one
        let local_addr = socket.local_addr()?;
        info!("UDP transport bound on {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            recv_buffer_size: config.recv_buffer_size.max(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Send a SIP message with a freshly computed `Content-Length`
    pub async fn send_message(&self, message: &Message, destination: SocketAddr) -> Result<usize> {
        let mut buf = BytesMut::new();
        SipCodec::new().encode(message, &mut buf)?;

        debug!(">{} {}", destination, String::from_utf8_lossy(&buf));
        let sent = self.socket.send_to(&buf, destination).await?;
        Ok(sent)
    }

    pub async fn recv_datagram(&self) -> Result<Datagram> {
        let mut buf = vec![0u8; self.recv_buffer_size];
        let (len, source) = self.socket.recv_from(&mut buf).await?;
        let raw = String::from_utf8_lossy(&buf[..len]).into_owned();
        debug!("<{} {}", source, raw);

        Ok(Datagram { source, raw })
    }
}

/// Resolve `host:port`, preferring IPv4 since the socket binds 0.0.0.0
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut candidates: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| SipError::AddressResolution(format!("{}:{}: {}", host, port, e)))?
        .collect();
    candidates.sort_by_key(|addr| !addr.is_ipv4());

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| SipError::AddressResolution(format!("{}:{}", host, port)))
}
