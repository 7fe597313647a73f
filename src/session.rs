//! SIP session: one registered extension on one UDP socket.
//!
//! A [`SipSession`] is a cheap handle. Construction binds the socket and
//! spawns the inbound listener; [`SipSession::register`] additionally spawns
//! a keepalive timer that resends the current REGISTER template. Both tasks
//! stop on [`SipSession::shutdown`] or when the last handle is dropped.

use crate::{
    auth,
    dialog::DialogTable,
    events::{Inbound, ReceivedMessage, SessionEvents},
    transport::{self, Datagram, SipTransport, TransportConfig, DEFAULT_RECV_BUFFER_SIZE},
    utils, Message, Result, SipError, SipMethod,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const USER_AGENT: &str = "eXosip/3.6.0";
pub const ALLOW: &str = "SUBSCRIBE, NOTIFY, INVITE, ACK, CANCEL, BYE, REFER, INFO, OPTIONS, MESSAGE";
pub const REGISTER_ALLOW: &str = "NOTIFY, INVITE, ACK, CANCEL, BYE, REFER, INFO, OPTIONS, MESSAGE";
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(600);
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

// Position of Authorization in the REGISTER template, right before Call-ID
const AUTHORIZATION_INDEX: usize = 5;

/// Identity advertised in the REGISTER body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub version: String,
    pub name: String,
    pub serial: String,
    pub mac_address: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            version: "V2.0.0".to_string(),
            name: "Asterisk".to_string(),
            serial: "Q12345678".to_string(),
            mac_address: "00:0c:29:12:12:12".to_string(),
        }
    }
}

impl DeviceIdentity {
    /// The vendor `regXML` document, LF separated, without trailing newline.
    pub fn to_xml(&self) -> String {
        format!(
            "<regXML>\n<version>{}</version>\n<regDevName>{}</regDevName>\n<regDevSerial>{}</regDevSerial>\n<regDevMacAddr>{}</regDevMacAddr>\n</regXML>",
            self.version, self.name, self.serial, self.mac_address
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Address written into Via and Contact
    pub local_ip: String,

    /// Extension number
    pub username: String,

    /// Digest username when it differs from the extension
    pub auth_username: Option<String>,

    pub password: String,

    /// Registrar as `host[:port]`
    pub domain: String,

    pub display_name: String,

    /// Local UDP port, 0 for OS-assigned
    pub bind_port: u16,

    /// Port written into REGISTER and INVITE request URIs
    pub account_port: u16,

    pub user_agent: String,

    pub device: DeviceIdentity,

    pub recv_buffer_size: usize,

    /// Distinct Call-IDs kept in the dialog table
    pub max_dialogs: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_ip: "127.0.0.1".to_string(),
            username: String::new(),
            auth_username: None,
            password: String::new(),
            domain: String::new(),
            display_name: "-".to_string(),
            bind_port: 5061,
            account_port: 5061,
            user_agent: USER_AGENT.to_string(),
            device: DeviceIdentity::default(),
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            max_dialogs: crate::dialog::DEFAULT_MAX_DIALOGS,
        }
    }
}

impl SessionConfig {
    pub fn new(local_ip: &str, username: &str, domain: &str, password: &str) -> Self {
        Self {
            local_ip: local_ip.to_string(),
            username: username.to_string(),
            domain: domain.to_string(),
            password: password.to_string(),
            ..Default::default()
        }
    }
}

/// Why the listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    Cancelled,
    SessionDropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundKind {
    Unauthorized,
    Forbidden,
    Message,
    Invite,
    Bye,
    Cancel,
    Ok,
    ClientError,
    Unhandled,
}

fn classify(message: &Message) -> InboundKind {
    if let Some(code) = message.status_code() {
        return match code {
            401 => InboundKind::Unauthorized,
            403 => InboundKind::Forbidden,
            200 => InboundKind::Ok,
            400..=499 => InboundKind::ClientError,
            _ => InboundKind::Unhandled,
        };
    }

    match message.method() {
        Some(SipMethod::Message) => InboundKind::Message,
        Some(SipMethod::Invite) => InboundKind::Invite,
        Some(SipMethod::Bye) => InboundKind::Bye,
        Some(SipMethod::Cancel) => InboundKind::Cancel,
        _ => InboundKind::Unhandled,
    }
}

fn copy_headers(from: &Message, to: &mut Message, name: &str) {
    for value in from.get_headers_iter(name) {
        to.set_header(name, value, false);
    }
}

fn is_register(cseq_method: &str) -> bool {
    matches!(cseq_method.parse::<SipMethod>(), Ok(SipMethod::Register))
}

fn set_authorization(request: &mut Message, cseq: String, authorization: String) {
    request.set_header("CSeq", cseq, true);
    if request.header("Authorization").is_some() {
        request.set_header("Authorization", authorization, true);
    } else {
        request.insert_header(AUTHORIZATION_INDEX, "Authorization", authorization);
    }
}

struct SessionState {
    register: Option<Message>,
    register_timer: Option<CancellationToken>,
    dialogs: DialogTable,
}

struct SessionInner {
    config: SessionConfig,
    transport: Arc<SipTransport>,
    domain_host: String,
    domain_port: u16,
    remote_addr: SocketAddr,
    events: SessionEvents<SipSession>,
    state: Mutex<SessionState>,
    shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<ListenerExit>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Clone)]
pub struct SipSession {
    inner: Arc<SessionInner>,
}

impl SipSession {
    /// Resolve the registrar, bind the socket and start listening.
    pub async fn connect(config: SessionConfig) -> Result<Self> {
        let (domain_host, domain_port) = utils::split_domain(&config.domain)?;
        let remote_addr = transport::resolve(&domain_host, domain_port).await?;

        let transport = Arc::new(
            SipTransport::bind(&TransportConfig {
                bind_addr: SocketAddr::from(([0, 0, 0, 0], config.bind_port)),
                recv_buffer_size: config.recv_buffer_size,
            })
            .await?,
        );

        let state = SessionState {
            register: None,
            register_timer: None,
            dialogs: DialogTable::with_capacity(config.max_dialogs),
        };

        let inner = Arc::new(SessionInner {
            config,
            transport: transport.clone(),
            domain_host,
            domain_port,
            remote_addr,
            events: SessionEvents::default(),
            state: Mutex::new(state),
            shutdown: CancellationToken::new(),
            listener: Mutex::new(None),
        });

        let handle = tokio::spawn(listen(
            Arc::downgrade(&inner),
            transport,
            inner.shutdown.clone(),
        ));
        *inner.listener.lock() = Some(handle);

        info!(
            "SIP session for {} on port {} -> {}",
            inner.config.username,
            inner.transport.local_port(),
            remote_addr
        );

        Ok(Self { inner })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &SessionEvents<SipSession> {
        &self.inner.events
    }

    /// Port actually bound, which may differ from the configured one.
    pub fn local_port(&self) -> u16 {
        self.inner.transport.local_port()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Copy of the messages sent under `call_id`.
    pub fn dialog(&self, call_id: &str) -> Option<Vec<Message>> {
        self.inner
            .state
            .lock()
            .dialogs
            .get(call_id)
            .map(<[Message]>::to_vec)
    }

    /// Current REGISTER template, including any Authorization added by a challenge.
    pub fn register_template(&self) -> Option<Message> {
        self.inner.state.lock().register.clone()
    }

    pub fn is_listening(&self) -> bool {
        self.inner
            .listener
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Stop the listener and every keepalive timer.
    pub fn shutdown(&self) {
        info!("Shutting down SIP session");
        self.inner.shutdown.cancel();
    }

    /// Wait for the listener to stop. Returns `None` if already awaited.
    pub async fn wait_listener(&self) -> Option<ListenerExit> {
        let handle = self.inner.listener.lock().take()?;
        match handle.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                error!("Listener task failed: {}", e);
                None
            }
        }
    }

    fn via(&self) -> String {
        format!("SIP/2.0/UDP {}:{};rport", self.inner.config.local_ip, self.local_port())
    }

    fn contact(&self) -> String {
        format!(
            "<sip:{}@{}:{}>",
            self.inner.config.username,
            self.inner.config.local_ip,
            self.local_port()
        )
    }

    fn from_header(&self, port: u16) -> String {
        let config = &self.inner.config;
        format!(
            "\"{}\"<sip:{}@{}:{}>",
            config.display_name, config.username, self.inner.domain_host, port
        )
    }

    fn record(&self, call_id: &str, message: &Message) {
        self.inner.state.lock().dialogs.record(call_id, message.clone());
    }

    pub fn build_register(&self, call_id: &str, refresh_interval: Duration) -> Message {
        let config = &self.inner.config;
        let mut register = Message::new(format!(
            "REGISTER sip:{}:{} SIP/2.0",
            self.inner.domain_host, config.account_port
        ));
        register.set_header("Via", self.via(), false);
        register.set_header("Max-Forwards", "70", false);
        register.set_header("Contact", self.contact(), false);
        register.set_header(
            "To",
            format!(
                "\"\"<sip:{}@{}:{}>",
                config.username, self.inner.domain_host, self.inner.domain_port
            ),
            false,
        );
        register.set_header("From", self.from_header(self.inner.domain_port), false);
        register.set_header("Call-ID", call_id, false);
        register.set_header("CSeq", "1 REGISTER", false);
        register.set_header("Expires", refresh_interval.as_secs().to_string(), false);
        register.set_header("Allow", REGISTER_ALLOW, false);
        register.set_header("Content-Type", "text/xml", false);
        register.set_header("User-Agent", config.user_agent.as_str(), false);
        register.body = config.device.to_xml();
        register
    }

    /// Send a fresh REGISTER, keep it as the live template and resend the
    /// template every `refresh_interval`. A previous keepalive is replaced.
    pub async fn register(&self, refresh_interval: Duration) -> Result<String> {
        let call_id = utils::generate_call_id();
        let register = self.build_register(&call_id, refresh_interval);
        let timer = self.inner.shutdown.child_token();

        {
            let mut state = self.inner.state.lock();
            state.register = Some(register.clone());
            state.dialogs.record(&call_id, register.clone());
            if let Some(previous) = state.register_timer.replace(timer.clone()) {
                previous.cancel();
            }
        }

        tokio::spawn(keepalive(
            Arc::downgrade(&self.inner),
            timer,
            refresh_interval.max(MIN_REFRESH_INTERVAL),
        ));

        info!("Registering {} (Call-ID {})", self.inner.config.username, call_id);
        self.inner
            .transport
            .send_message(&register, self.inner.remote_addr)
            .await?;

        Ok(call_id)
    }

    async fn resend_register(&self) -> Result<()> {
        let template = self.inner.state.lock().register.clone();
        if let Some(register) = template {
            info!("Registering");
            self.inner
                .transport
                .send_message(&register, self.inner.remote_addr)
                .await?;
        }
        Ok(())
    }

    /// Call `target` (`user@host`). Returns the new Call-ID.
    pub async fn invite(&self, target: &str, sdp: &str) -> Result<String> {
        let config = &self.inner.config;
        let call_id = utils::generate_call_id();

        let mut invite = Message::new(format!(
            "INVITE sip:{}:{} SIP/2.0",
            target, config.account_port
        ));
        invite.set_header("Via", self.via(), false);
        invite.set_header("Max-Forwards", "70", false);
        invite.set_header("Contact", self.contact(), false);
        invite.set_header("To", format!("<sip:{}:{}>", target, config.account_port), false);
        invite.set_header("From", self.from_header(config.account_port), false);
        invite.set_header("Call-ID", call_id.as_str(), false);
        invite.set_header("CSeq", "1 INVITE", false);
        invite.set_header("Allow", ALLOW, false);
        invite.set_header("Content-Type", "application/sdp", false);
        invite.set_header("Supported", "replaces", false);
        invite.set_header("User-Agent", config.user_agent.as_str(), false);
        invite.body = sdp.to_string();

        self.record(&call_id, &invite);
        info!("Calling {} (Call-ID {})", target, call_id);
        self.inner
            .transport
            .send_message(&invite, self.inner.remote_addr)
            .await?;

        Ok(call_id)
    }

    /// Send an instant message to `target` through the registrar.
    pub async fn send_message(&self, target: &str, body: &str) -> Result<String> {
        let config = &self.inner.config;
        let call_id = utils::generate_call_id();

        let mut message = Message::new(format!(
            "MESSAGE sip:{}@{} SIP/2.0",
            config.username, self.inner.domain_host
        ));
        message.set_header("Via", self.via(), false);
        message.set_header("Max-Forwards", "70", false);
        message.set_header("To", format!("<sip:{}>;messagetype=IM", target), false);
        message.set_header("From", self.from_header(self.inner.domain_port), false);
        message.set_header("Call-ID", call_id.as_str(), false);
        message.set_header("CSeq", "1 MESSAGE", false);
        message.set_header("Allow", ALLOW, false);
        message.set_header("Content-Type", "text/html", false);
        message.set_header("User-Agent", config.user_agent.as_str(), false);
        message.body = body.to_string();

        self.record(&call_id, &message);
        self.inner
            .transport
            .send_message(&message, self.inner.remote_addr)
            .await?;

        Ok(call_id)
    }

    pub fn build_answer(&self, invite: &Message, sdp: &str) -> Result<Message> {
        let call_id = invite.get_header("Call-ID")?;
        let from = invite.get_header("From")?;
        let to = invite.get_header("To")?;

        let mut reply = Message::new("SIP/2.0 200 OK");
        copy_headers(invite, &mut reply, "Via");
        copy_headers(invite, &mut reply, "Record-Route");
        reply.set_header("Contact", self.contact(), false);
        reply.set_header("To", to, false);
        reply.set_header("From", from, false);
        reply.set_header("Call-ID", call_id, false);
        reply.set_header("CSeq", "1 INVITE", false);
        reply.set_header("Allow", ALLOW, false);
        reply.set_header("Content-Type", "application/sdp", false);
        reply.set_header("Supported", "replaces", false);
        reply.set_header("User-Agent", self.inner.config.user_agent.as_str(), false);
        reply.body = sdp.to_string();
        Ok(reply)
    }

    /// Answer a previously received INVITE (raw text) through the registrar.
    pub async fn answer_call(&self, invite: &str, sdp: &str) -> Result<()> {
        let invite = Message::parse(invite)?;
        self.send_answer(&invite, sdp, self.inner.remote_addr).await
    }

    /// Answer an INVITE delivered by `call_ringing`, replying to its sender.
    pub async fn answer_inbound(&self, invite: &Inbound, sdp: &str) -> Result<()> {
        self.send_answer(&invite.message, sdp, invite.source).await
    }

    async fn send_answer(&self, invite: &Message, sdp: &str, destination: SocketAddr) -> Result<()> {
        let reply = self.build_answer(invite, sdp)?;
        self.record(invite.get_header("Call-ID")?, &reply);
        info!("Answering call from {}", invite.get_header("From")?);
        self.inner.transport.send_message(&reply, destination).await?;
        Ok(())
    }

    async fn handle_datagram(&self, datagram: &Datagram) -> Result<()> {
        let message = Message::parse(&datagram.raw)?;
        let source = datagram.source;
        let inbound = |message: &Message| Inbound {
            source,
            raw: datagram.raw.clone(),
            message: message.clone(),
        };

        match classify(&message) {
            InboundKind::Unauthorized => {
                info!("Handling authentication");
                self.on_unauthorized(&message, source).await
            }
            InboundKind::Forbidden => {
                info!("We are unauthorized");
                self.on_forbidden(&message);
                self.inner.events.call_rejected.fire(self, &inbound(&message));
                Ok(())
            }
            InboundKind::Message => self.on_message(&message, datagram).await,
            InboundKind::Invite => {
                info!("Received invite (call)");
                self.on_invite(&message, source).await?;
                self.inner.events.call_ringing.fire(self, &inbound(&message));
                Ok(())
            }
            InboundKind::Bye => {
                info!("Call ended by remote");
                self.send_ok(&message, source, message.get_header("CSeq")?).await?;
                self.inner.events.call_ended.fire(self, &inbound(&message));
                Ok(())
            }
            InboundKind::Cancel => {
                info!("Call ended by caller");
                self.on_cancel(&message, source).await?;
                self.inner.events.call_ended.fire(self, &inbound(&message));
                Ok(())
            }
            InboundKind::Ok => self.on_ok(&message, source, inbound(&message)).await,
            InboundKind::ClientError => {
                info!("Error: {}", message.status_line);
                self.inner.events.call_error.fire(self, &inbound(&message));
                Ok(())
            }
            InboundKind::Unhandled => {
                info!("Unhandled data: {}", message.status_line);
                Ok(())
            }
        }
    }

    async fn on_unauthorized(&self, response: &Message, source: SocketAddr) -> Result<()> {
        let challenge = response
            .header("WWW-Authenticate")
            .or_else(|| response.header("Proxy-Authenticate"))
            .ok_or_else(|| SipError::HeaderNotFound("WWW-Authenticate".to_string()))?;
        let call_id = response.get_header("Call-ID")?;
        let cseq = response.get_header("CSeq")?;
        let (_, cseq_method) = utils::parse_cseq(cseq)?;
        let next_cseq = utils::increment_cseq(cseq)?;
        let target = utils::digest_target(response.get_header("To")?)?;

        let config = &self.inner.config;
        let authorization = auth::build_authorization(
            challenge,
            &cseq_method,
            &target,
            &config.username,
            &config.password,
            config.auth_username.as_deref(),
        )?;

        let Some(retry) = self.prepare_retry(call_id, &cseq_method, next_cseq, authorization) else {
            warn!("No request to retry for {} challenge on Call-ID {}", cseq_method, call_id);
            return Ok(());
        };

        self.inner.transport.send_message(&retry, source).await?;
        Ok(())
    }

    /// Apply credentials to the request being challenged: the REGISTER
    /// template, or the last request recorded under `call_id`.
    fn prepare_retry(
        &self,
        call_id: &str,
        cseq_method: &str,
        cseq: String,
        authorization: String,
    ) -> Option<Message> {
        let mut state = self.inner.state.lock();

        let retry = if is_register(cseq_method) {
            let register = state.register.as_mut()?;
            set_authorization(register, cseq, authorization);
            register.clone()
        } else {
            let mut request = state.dialogs.last_request(call_id)?.clone();
            set_authorization(&mut request, cseq, authorization);
            request
        };

        state.dialogs.record(call_id, retry.clone());
        Some(retry)
    }

    fn on_forbidden(&self, response: &Message) {
        let register_flow = response
            .header("CSeq")
            .and_then(|cseq| utils::cseq_method(cseq).ok())
            == Some(SipMethod::Register);

        if register_flow {
            if let Some(timer) = self.inner.state.lock().register_timer.take() {
                warn!("Registration forbidden, stopping keepalive");
                timer.cancel();
            }
        }
    }

    async fn on_message(&self, message: &Message, datagram: &Datagram) -> Result<()> {
        let acknowledged = match message.get_header("CSeq") {
            Ok(cseq) => self.send_ok(message, datagram.source, cseq).await,
            Err(e) => Err(e),
        };
        if let Err(e) = acknowledged {
            warn!("Could not acknowledge MESSAGE from {}: {}", datagram.source, e);
        }

        if message.body.contains("isComposing") {
            debug!("Ignoring typing indicator");
            return Ok(());
        }

        info!("Message received");
        debug!("{}", message.body);
        self.inner.events.message_received.fire(
            self,
            &ReceivedMessage {
                source: datagram.source,
                raw: datagram.raw.clone(),
                body: message.body.clone(),
            },
        );
        Ok(())
    }

    async fn on_invite(&self, invite: &Message, source: SocketAddr) -> Result<()> {
        let from = invite.get_header("From")?;
        let to = invite.get_header("To")?;
        let call_id = invite.get_header("Call-ID")?;

        let mut trying = Message::new("SIP/2.0 100 Trying");
        copy_headers(invite, &mut trying, "Via");
        trying.set_header("To", to, false);
        trying.set_header("From", from, false);
        trying.set_header("Call-ID", call_id, false);
        trying.set_header("CSeq", "1 INVITE", false);
        self.inner.transport.send_message(&trying, source).await?;

        let mut ringing = Message::new("SIP/2.0 180 Ringing");
        copy_headers(invite, &mut ringing, "Via");
        copy_headers(invite, &mut ringing, "Record-Route");
        ringing.set_header("Contact", self.contact(), false);
        ringing.set_header("To", to, false);
        ringing.set_header("From", from, false);
        ringing.set_header("Call-ID", call_id, false);
        ringing.set_header("CSeq", "1 INVITE", false);
        ringing.set_header("User-Agent", self.inner.config.user_agent.as_str(), false);
        ringing.set_header("Allow-Events", "talk, hold", false);
        self.inner.transport.send_message(&ringing, source).await?;

        Ok(())
    }

    async fn on_cancel(&self, cancel: &Message, source: SocketAddr) -> Result<()> {
        let (cseq_number, _) = utils::parse_cseq(cancel.get_header("CSeq")?)?;
        self.send_ok(cancel, source, &format!("{} CANCEL", cseq_number)).await
    }

    /// `200 OK` echoing the request's Via, To, From and Call-ID.
    async fn send_ok(&self, request: &Message, source: SocketAddr, cseq: &str) -> Result<()> {
        let mut reply = Message::new("SIP/2.0 200 OK");
        copy_headers(request, &mut reply, "Via");
        reply.set_header("Contact", self.contact(), false);
        reply.set_header("To", request.get_header("To")?, false);
        reply.set_header("From", request.get_header("From")?, false);
        reply.set_header("Call-ID", request.get_header("Call-ID")?, false);
        reply.set_header("CSeq", cseq, false);
        reply.set_header("User-Agent", self.inner.config.user_agent.as_str(), false);
        reply.set_header("Allow-Events", "talk, hold", false);
        self.inner.transport.send_message(&reply, source).await?;
        Ok(())
    }

    async fn on_ok(&self, response: &Message, source: SocketAddr, inbound: Inbound) -> Result<()> {
        let (cseq_number, cseq_method) = utils::parse_cseq(response.get_header("CSeq")?)?;
        info!("OK {}", cseq_method);

        match cseq_method.parse::<SipMethod>()? {
            SipMethod::Invite => {
                let ack = self.build_ack(response, cseq_number)?;
                let call_id = response.get_header("Call-ID")?;
                self.record(call_id, &ack);
                self.inner.transport.send_message(&ack, source).await?;
                self.inner.events.call_accepted.fire(self, &inbound);
            }
            SipMethod::Message => {
                self.inner.events.message_sent.fire(self, &inbound);
            }
            SipMethod::Register => {
                self.inner.events.call_registered.fire(self, &inbound);
            }
            other => debug!("Ignoring 200 OK for {}", other),
        }
        Ok(())
    }

    fn build_ack(&self, response: &Message, cseq_number: u32) -> Result<Message> {
        let contact = response.get_header("Contact")?;
        let target = utils::parse_uri_from_header(contact)
            .ok_or_else(|| SipError::InvalidUri(contact.to_string()))?;

        let mut ack = Message::new(format!("ACK {} SIP/2.0", target));
        ack.set_header("Via", self.via(), false);
        ack.set_header("Max-Forwards", "70", false);
        let routes: Vec<&str> = response.get_headers_iter("Record-Route").collect();
        for route in routes.into_iter().rev() {
            ack.set_header("Route", route, false);
        }
        ack.set_header("Contact", self.contact(), false);
        ack.set_header("To", response.get_header("To")?, false);
        ack.set_header("From", response.get_header("From")?, false);
        ack.set_header("Call-ID", response.get_header("Call-ID")?, false);
        ack.set_header("CSeq", format!("{} ACK", cseq_number), false);
        ack.set_header("User-Agent", self.inner.config.user_agent.as_str(), false);
        Ok(ack)
    }
}

/// Inbound loop. A datagram that fails to parse or to be handled is logged
/// and skipped; only cancellation or the session going away ends the loop.
async fn listen(
    session: Weak<SessionInner>,
    transport: Arc<SipTransport>,
    shutdown: CancellationToken,
) -> ListenerExit {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Listener cancelled");
                return ListenerExit::Cancelled;
            }
            received = transport.recv_datagram() => received,
        };

        let datagram = match received {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("UDP receive error: {}", e);
                continue;
            }
        };

        let Some(inner) = session.upgrade() else {
            return ListenerExit::SessionDropped;
        };
        let session = SipSession { inner };
        let source = datagram.source;

        // A panicking handler takes down its own task, not the listener
        match tokio::spawn(async move { session.handle_datagram(&datagram).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Dropping datagram from {}: {}", source, e),
            Err(e) => error!("Handling datagram from {} failed: {}", source, e),
        }
    }
}

async fn keepalive(session: Weak<SessionInner>, timer: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            _ = timer.cancelled() => {
                debug!("Keepalive stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(inner) = session.upgrade() else {
            return;
        };
        if let Err(e) = (SipSession { inner }).resend_register().await {
            error!("Re-registration failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{h, kd};
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(300);

    async fn setup() -> (SipSession, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = SessionConfig {
            bind_port: 0,
            ..SessionConfig::new(
                "127.0.0.1",
                "10000000005",
                &format!("127.0.0.1:{}", peer.local_addr().unwrap().port()),
                "secret",
            )
        };
        let session = SipSession::connect(config).await.unwrap();
        (session, peer)
    }

    async fn recv(peer: &UdpSocket) -> Message {
        let mut buf = vec![0u8; 4096];
        let (len, _) = timeout(WAIT, peer.recv_from(&mut buf))
            .await
            .expect("no datagram from session")
            .unwrap();
        Message::parse(std::str::from_utf8(&buf[..len]).unwrap()).unwrap()
    }

    async fn assert_quiet(peer: &UdpSocket) {
        let mut buf = vec![0u8; 4096];
        assert!(timeout(QUIET, peer.recv_from(&mut buf)).await.is_err());
    }

    async fn drain(peer: &UdpSocket) {
        let mut buf = vec![0u8; 4096];
        while timeout(Duration::from_millis(50), peer.recv_from(&mut buf)).await.is_ok() {}
    }

    async fn send(peer: &UdpSocket, session: &SipSession, text: &str) {
        peer.send_to(text.as_bytes(), ("127.0.0.1", session.local_port()))
            .await
            .unwrap();
    }

    fn watch<P: Clone + Send + Sync + 'static>(
        hook: &crate::events::EventHook<SipSession, P>,
    ) -> mpsc::UnboundedReceiver<P> {
        let (tx, rx) = mpsc::unbounded_channel();
        hook.subscribe(move |_, payload: &P| {
            let _ = tx.send(payload.clone());
            Ok(())
        });
        rx
    }

    async fn expect_event<P>(rx: &mut mpsc::UnboundedReceiver<P>) -> P {
        timeout(WAIT, rx.recv()).await.expect("event not fired").unwrap()
    }

    #[test]
    fn test_classify() {
        let kind = |raw: &str| classify(&Message::parse(raw).unwrap());
        assert_eq!(kind("SIP/2.0 401 Unauthorized\r\n\r\n"), InboundKind::Unauthorized);
        assert_eq!(kind("SIP/2.0 403 Forbidden\r\n\r\n"), InboundKind::Forbidden);
        assert_eq!(kind("SIP/2.0 200 OK\r\n\r\n"), InboundKind::Ok);
        assert_eq!(kind("SIP/2.0 486 Busy Here\r\n\r\n"), InboundKind::ClientError);
        assert_eq!(kind("SIP/2.0 503 Service Unavailable\r\n\r\n"), InboundKind::Unhandled);
        assert_eq!(kind("MESSAGE sip:a@b SIP/2.0\r\n\r\n"), InboundKind::Message);
        assert_eq!(kind("INVITE sip:a@b SIP/2.0\r\n\r\n"), InboundKind::Invite);
        assert_eq!(kind("BYE sip:a@b SIP/2.0\r\n\r\n"), InboundKind::Bye);
        assert_eq!(kind("CANCEL sip:a@b SIP/2.0\r\n\r\n"), InboundKind::Cancel);
        assert_eq!(kind("OPTIONS sip:a@b SIP/2.0\r\n\r\n"), InboundKind::Unhandled);
    }

    #[test]
    fn test_register_body() {
        assert_eq!(
            DeviceIdentity::default().to_xml(),
            "<regXML>\n<version>V2.0.0</version>\n<regDevName>Asterisk</regDevName>\n<regDevSerial>Q12345678</regDevSerial>\n<regDevMacAddr>00:0c:29:12:12:12</regDevMacAddr>\n</regXML>"
        );
    }

    #[tokio::test]
    async fn test_register_layout() {
        let (session, _peer) = setup().await;
        let register = session.build_register("1234567890", Duration::from_secs(600));
        let port = session.remote_addr().port();

        assert_eq!(register.status_line, "REGISTER sip:127.0.0.1:5061 SIP/2.0");
        let names: Vec<&str> = register.headers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Via", "Max-Forwards", "Contact", "To", "From", "Call-ID", "CSeq", "Expires",
                "Allow", "Content-Type", "User-Agent"
            ]
        );
        assert_eq!(
            register.get_header("Via").unwrap(),
            format!("SIP/2.0/UDP 127.0.0.1:{};rport", session.local_port())
        );
        assert_eq!(
            register.get_header("To").unwrap(),
            format!("\"\"<sip:10000000005@127.0.0.1:{}>", port)
        );
        assert_eq!(
            register.get_header("From").unwrap(),
            format!("\"-\"<sip:10000000005@127.0.0.1:{}>", port)
        );
        assert_eq!(register.get_header("Expires").unwrap(), "600");
        assert_eq!(register.body, DeviceIdentity::default().to_xml());
    }

    #[tokio::test]
    async fn test_register_challenge_then_registered() {
        let (session, peer) = setup().await;
        let mut registered = watch(&session.events().call_registered);

        let call_id = session.register(Duration::from_secs(3600)).await.unwrap();
        let first = recv(&peer).await;
        assert_eq!(first.get_header("CSeq").unwrap(), "1 REGISTER");
        assert_eq!(first.get_header("Call-ID").unwrap(), call_id);
        assert!(first.header("Authorization").is_none());
        assert_eq!(
            first.get_header("Content-Length").unwrap(),
            first.body.len().to_string()
        );

        let port = session.remote_addr().port();
        send(&peer, &session, &format!(
            "SIP/2.0 401 Unauthorized\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:{};rport\r\n\
             To: \"\"<sip:10000000005@127.0.0.1:{}>\r\n\
             From: \"-\"<sip:10000000005@127.0.0.1:{}>\r\n\
             Call-ID: {}\r\n\
             CSeq: 1 REGISTER\r\n\
             WWW-Authenticate: Digest realm=\"r\", nonce=\"n\", opaque=\"o\"\r\n\
             Content-Length: 0\r\n\r\n",
            session.local_port(), port, port, call_id
        ))
        .await;

        let second = recv(&peer).await;
        assert_eq!(second.get_header("CSeq").unwrap(), "2 REGISTER");
        assert_eq!(second.get_header("Call-ID").unwrap(), call_id);
        assert_eq!(second.headers()[AUTHORIZATION_INDEX].name, "Authorization");
        assert_eq!(second.get_headers_iter("Authorization").count(), 1);

        let expected = kd(
            &h("10000000005:r:secret"),
            &format!("n:{}", h("REGISTER:sip:10000000005@127.0.0.1:5065")),
        );
        let authorization = second.get_header("Authorization").unwrap();
        assert!(authorization.contains(&format!("response=\"{}\"", expected)));
        assert!(authorization.contains("opaque=\"o\""));

        send(&peer, &session, &format!(
            "SIP/2.0 200 OK\r\nCall-ID: {}\r\nCSeq: 2 REGISTER\r\nContent-Length: 0\r\n\r\n",
            call_id
        ))
        .await;

        let event = expect_event(&mut registered).await;
        assert_eq!(event.message.get_header("CSeq").unwrap(), "2 REGISTER");

        assert_quiet(&peer).await;
        assert!(registered.try_recv().is_err());
        assert_eq!(
            session.register_template().unwrap().get_header("CSeq").unwrap(),
            "2 REGISTER"
        );
    }

    #[tokio::test]
    async fn test_second_challenge_replaces_authorization() {
        let (session, peer) = setup().await;
        let call_id = session.register(Duration::from_secs(3600)).await.unwrap();
        recv(&peer).await;

        for (cseq, nonce) in [(1, "n1"), (2, "n2")] {
            send(&peer, &session, &format!(
                "SIP/2.0 401 Unauthorized\r\nTo: <sip:10000000005@127.0.0.1>\r\nCall-ID: {}\r\nCSeq: {} REGISTER\r\nWWW-Authenticate: Digest realm=\"r\", nonce=\"{}\"\r\n\r\n",
                call_id, cseq, nonce
            ))
            .await;
            let retry = recv(&peer).await;
            assert_eq!(retry.get_header("CSeq").unwrap(), format!("{} REGISTER", cseq + 1));
            assert_eq!(retry.get_headers_iter("Authorization").count(), 1);
            assert!(retry.get_header("Authorization").unwrap().contains(&format!("nonce=\"{}\"", nonce)));
        }
    }

    #[tokio::test]
    async fn test_challenged_message_is_retried() {
        let (session, peer) = setup().await;
        let call_id = session.send_message("10010100001@127.0.0.1", "open door").await.unwrap();
        let first = recv(&peer).await;
        assert_eq!(first.status_line, "MESSAGE sip:10000000005@127.0.0.1 SIP/2.0");
        assert_eq!(first.get_header("To").unwrap(), "<sip:10010100001@127.0.0.1>;messagetype=IM");

        send(&peer, &session, &format!(
            "SIP/2.0 401 Unauthorized\r\nTo: <sip:10010100001@127.0.0.1>\r\nCall-ID: {}\r\nCSeq: 1 MESSAGE\r\nWWW-Authenticate: Digest realm=\"r\", nonce=\"n\", qop=\"auth\"\r\n\r\n",
            call_id
        ))
        .await;

        let retry = recv(&peer).await;
        assert_eq!(retry.get_header("CSeq").unwrap(), "2 MESSAGE");
        assert_eq!(retry.body, "open door");
        assert!(retry.get_header("Authorization").unwrap().contains("nc=00000001"));
        assert_eq!(session.dialog(&call_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_inbound_invite_trying_then_ringing() {
        let (session, peer) = setup().await;
        let mut ringing = watch(&session.events().call_ringing);

        send(&peer, &session,
            "INVITE sip:10000000005@127.0.0.1:5061 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5065;branch=z9hG4bK1\r\n\
             Via: SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bK2\r\n\
             Record-Route: <sip:127.0.0.1:5065;lr>\r\n\
             From: <sip:10010100001@127.0.0.1>;tag=77\r\n\
             To: <sip:10000000005@127.0.0.1>\r\n\
             Call-ID: 555\r\n\
             CSeq: 20 INVITE\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: 4\r\n\r\nv=0\n",
        )
        .await;

        let trying = recv(&peer).await;
        assert_eq!(trying.status_line, "SIP/2.0 100 Trying");
        let vias: Vec<&str> = trying.get_headers_iter("Via").collect();
        assert_eq!(
            vias,
            vec!["SIP/2.0/UDP 127.0.0.1:5065;branch=z9hG4bK1", "SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bK2"]
        );
        assert_eq!(trying.get_header("CSeq").unwrap(), "1 INVITE");

        let ring = recv(&peer).await;
        assert_eq!(ring.status_line, "SIP/2.0 180 Ringing");
        assert_eq!(ring.get_headers_iter("Via").count(), 2);
        assert_eq!(ring.get_header("Record-Route").unwrap(), "<sip:127.0.0.1:5065;lr>");
        assert_eq!(ring.get_header("Allow-Events").unwrap(), "talk, hold");
        assert_eq!(ring.get_header("Call-ID").unwrap(), "555");

        let event = expect_event(&mut ringing).await;
        assert_eq!(event.message.get_header("Call-ID").unwrap(), "555");
        assert_quiet(&peer).await;
        assert!(ringing.try_recv().is_err());

        session.answer_inbound(&event, "v=0\r\n").await.unwrap();
        let answer = recv(&peer).await;
        assert_eq!(answer.status_line, "SIP/2.0 200 OK");
        assert_eq!(answer.get_headers_iter("Via").count(), 2);
        assert_eq!(answer.get_header("Content-Type").unwrap(), "application/sdp");
        assert_eq!(answer.body, "v=0\r\n");
    }

    #[tokio::test]
    async fn test_answer_call_from_raw_invite() {
        let (session, peer) = setup().await;
        let invite = "INVITE sip:10000000005@127.0.0.1 SIP/2.0\r\n\
                      Via: SIP/2.0/UDP a;branch=1\r\n\
                      Record-Route: <sip:p1;lr>\r\n\
                      Via: SIP/2.0/UDP b;branch=2\r\n\
                      Record-Route: <sip:p2;lr>\r\n\
                      From: <sip:1@h>;tag=1\r\n\
                      To: <sip:2@h>\r\n\
                      Call-ID: 999\r\n\
                      CSeq: 3 INVITE\r\n\r\n";

        session.answer_call(invite, "v=0").await.unwrap();
        let answer = recv(&peer).await;

        let vias: Vec<&str> = answer.get_headers_iter("Via").collect();
        assert_eq!(vias, vec!["SIP/2.0/UDP a;branch=1", "SIP/2.0/UDP b;branch=2"]);
        let routes: Vec<&str> = answer.get_headers_iter("Record-Route").collect();
        assert_eq!(routes, vec!["<sip:p1;lr>", "<sip:p2;lr>"]);
        assert_eq!(answer.get_header("CSeq").unwrap(), "1 INVITE");
        assert_eq!(
            answer.get_header("Contact").unwrap(),
            format!("<sip:10000000005@127.0.0.1:{}>", session.local_port())
        );
        assert_eq!(session.dialog("999").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_outbound_invite_accepted_sends_ack() {
        let (session, peer) = setup().await;
        let mut accepted = watch(&session.events().call_accepted);

        let call_id = session.invite("10010100001@127.0.0.1", "v=0\r\n").await.unwrap();
        let invite = recv(&peer).await;
        assert_eq!(invite.status_line, "INVITE sip:10010100001@127.0.0.1:5061 SIP/2.0");
        assert_eq!(invite.get_header("Content-Type").unwrap(), "application/sdp");

        send(&peer, &session, &format!(
            "SIP/2.0 200 OK\r\n\
             Via: SIP/2.0/UDP 127.0.0.1;rport\r\n\
             Record-Route: <sip:proxy1;lr>\r\n\
             Record-Route: <sip:proxy2;lr>\r\n\
             Contact: <sip:bob@host:1234>\r\n\
             To: <sip:10010100001@127.0.0.1:5061>;tag=9\r\n\
             From: \"-\"<sip:10000000005@127.0.0.1:5061>\r\n\
             Call-ID: {}\r\n\
             CSeq: 1 INVITE\r\n\r\n",
            call_id
        ))
        .await;

        let ack = recv(&peer).await;
        assert_eq!(ack.status_line, "ACK sip:bob@host:1234 SIP/2.0");
        let routes: Vec<&str> = ack.get_headers_iter("Route").collect();
        assert_eq!(routes, vec!["<sip:proxy2;lr>", "<sip:proxy1;lr>"]);
        assert_eq!(ack.get_header("CSeq").unwrap(), "1 ACK");
        assert_eq!(ack.get_header("To").unwrap(), "<sip:10010100001@127.0.0.1:5061>;tag=9");
        assert_eq!(ack.get_header("Call-ID").unwrap(), call_id);

        expect_event(&mut accepted).await;
        assert_quiet(&peer).await;
        assert!(accepted.try_recv().is_err());

        let history = session.dialog(&call_id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].status_line, "ACK sip:bob@host:1234 SIP/2.0");
    }

    #[tokio::test]
    async fn test_message_sent_and_received() {
        let (session, peer) = setup().await;
        let mut sent = watch(&session.events().message_sent);
        let mut received = watch(&session.events().message_received);

        send(&peer, &session,
            "MESSAGE sip:10000000005@127.0.0.1 SIP/2.0\r\nVia: SIP/2.0/UDP 127.0.0.1\r\nTo: <sip:10000000005@127.0.0.1>\r\nFrom: <sip:1@127.0.0.1>\r\nCall-ID: 1\r\nCSeq: 1 MESSAGE\r\n\r\n<?xml version=\"1.0\"?><isComposing><state>active</state></isComposing>",
        )
        .await;
        let ok = recv(&peer).await;
        assert_eq!(ok.status_line, "SIP/2.0 200 OK");
        assert_eq!(ok.get_header("CSeq").unwrap(), "1 MESSAGE");

        send(&peer, &session,
            "MESSAGE sip:10000000005@127.0.0.1 SIP/2.0\r\nVia: SIP/2.0/UDP 127.0.0.1\r\nTo: <sip:10000000005@127.0.0.1>\r\nFrom: <sip:1@127.0.0.1>\r\nCall-ID: 2\r\nCSeq: 1 MESSAGE\r\n\r\nhello\r\nworld",
        )
        .await;
        recv(&peer).await;

        let message = expect_event(&mut received).await;
        assert_eq!(message.body, "hello\r\nworld");
        assert!(message.raw.starts_with("MESSAGE "));
        assert!(received.try_recv().is_err());

        send(&peer, &session, "SIP/2.0 200 OK\r\nCall-ID: 3\r\nCSeq: 1 MESSAGE\r\n\r\n").await;
        expect_event(&mut sent).await;
    }

    #[tokio::test]
    async fn test_cancel_and_bye_end_call() {
        let (session, peer) = setup().await;
        let mut ended = watch(&session.events().call_ended);

        send(&peer, &session,
            "CANCEL sip:10000000005@127.0.0.1 SIP/2.0\r\nVia: SIP/2.0/UDP 127.0.0.1;branch=z9hG4bKc\r\nTo: <sip:10000000005@127.0.0.1>\r\nFrom: <sip:1@127.0.0.1>;tag=1\r\nCall-ID: 42\r\nCSeq: 7 CANCEL\r\n\r\n",
        )
        .await;
        let ok = recv(&peer).await;
        assert_eq!(ok.status_line, "SIP/2.0 200 OK");
        assert_eq!(ok.get_header("CSeq").unwrap(), "7 CANCEL");
        assert_eq!(ok.get_header("Allow-Events").unwrap(), "talk, hold");
        assert_eq!(ok.get_header("Via").unwrap(), "SIP/2.0/UDP 127.0.0.1;branch=z9hG4bKc");
        expect_event(&mut ended).await;

        send(&peer, &session,
            "BYE sip:10000000005@127.0.0.1 SIP/2.0\r\nVia: SIP/2.0/UDP 127.0.0.1\r\nTo: <sip:10000000005@127.0.0.1>\r\nFrom: <sip:1@127.0.0.1>;tag=1\r\nCall-ID: 43\r\nCSeq: 21 BYE\r\n\r\n",
        )
        .await;
        let ok = recv(&peer).await;
        assert_eq!(ok.get_header("CSeq").unwrap(), "21 BYE");
        let event = expect_event(&mut ended).await;
        assert_eq!(event.message.get_header("Call-ID").unwrap(), "43");
    }

    #[tokio::test]
    async fn test_client_error_fires_call_error() {
        let (session, peer) = setup().await;
        let mut errors = watch(&session.events().call_error);

        send(&peer, &session, "SIP/2.0 486 Busy Here\r\nCall-ID: 1\r\nCSeq: 1 INVITE\r\n\r\n").await;
        let event = expect_event(&mut errors).await;
        assert_eq!(event.message.status_code(), Some(486));
    }

    #[tokio::test]
    async fn test_listener_survives_bad_datagrams() {
        let (session, peer) = setup().await;
        let mut received = watch(&session.events().message_received);
        let mut registered = watch(&session.events().call_registered);

        send(&peer, &session, "garbage\r\nno colon here\r\n\r\n").await;
        send(&peer, &session, "").await;
        send(&peer, &session, "SIP/2.0 401 Unauthorized\r\nCall-ID: 1\r\nCSeq: 1 REGISTER\r\n\r\n").await;
        send(&peer, &session, "SIP/2.0 401 Unauthorized\r\nTo: <sip:a@b>\r\nCall-ID: 1\r\nCSeq: 1 REGISTER\r\nWWW-Authenticate: Digest realm=\"r\"\r\n\r\n").await;
        send(&peer, &session, "SIP/2.0 200 OK\r\nCall-ID: 1\r\n\r\n").await;
        send(&peer, &session, "SIP/2.0 200 OK\r\nCSeq: 1 INVITE\r\nCall-ID: 1\r\n\r\n").await;
        send(&peer, &session, "INVITE sip:a@b SIP/2.0\r\nVia: x\r\n\r\n").await;
        assert_quiet(&peer).await;
        assert!(session.is_listening());

        send(&peer, &session, "SIP/2.0 200 OK\r\nCall-ID: 1\r\nCSeq: 1 REGISTER\r\n\r\n").await;
        expect_event(&mut registered).await;

        send(&peer, &session,
            "MESSAGE sip:a@b SIP/2.0\nVia: SIP/2.0/UDP 127.0.0.1\nTo: <sip:a@b>\nFrom: <sip:c@d>\nCall-ID: 9\nCSeq: 1 MESSAGE\n\nstill here",
        )
        .await;
        let message = expect_event(&mut received).await;
        assert_eq!(message.body, "still here");
    }

    #[tokio::test]
    async fn test_keepalive_resends_until_forbidden() {
        let (session, peer) = setup().await;
        let mut rejected = watch(&session.events().call_rejected);
        let mut received = watch(&session.events().message_received);

        let call_id = session.register(Duration::from_millis(200)).await.unwrap();
        let first = recv(&peer).await;
        let second = recv(&peer).await;
        assert_eq!(first.get_header("Call-ID").unwrap(), call_id);
        assert_eq!(second.get_header("Call-ID").unwrap(), call_id);
        assert_eq!(second.get_header("CSeq").unwrap(), "1 REGISTER");

        send(&peer, &session, &format!(
            "SIP/2.0 403 Forbidden\r\nCall-ID: {}\r\nCSeq: 1 REGISTER\r\n\r\n",
            call_id
        ))
        .await;
        expect_event(&mut rejected).await;

        drain(&peer).await;
        assert_quiet(&peer).await;
        assert_quiet(&peer).await;
        assert!(session.is_listening());

        send(&peer, &session,
            "MESSAGE sip:a@b SIP/2.0\r\nVia: v\r\nTo: <sip:a@b>\r\nFrom: <sip:c@d>\r\nCall-ID: 9\r\nCSeq: 1 MESSAGE\r\n\r\nafter 403",
        )
        .await;
        assert_eq!(expect_event(&mut received).await.body, "after 403");
    }

    #[tokio::test]
    async fn test_register_again_replaces_keepalive() {
        let (session, peer) = setup().await;
        let first_call = session.register(Duration::from_millis(200)).await.unwrap();
        recv(&peer).await;
        let second_call = session.register(Duration::from_secs(3600)).await.unwrap();
        assert_ne!(first_call, second_call);

        drain(&peer).await;
        assert_quiet(&peer).await;
        assert_quiet(&peer).await;
        assert_eq!(
            session.register_template().unwrap().get_header("Call-ID").unwrap(),
            second_call
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener() {
        let (session, peer) = setup().await;
        session.register(Duration::from_millis(200)).await.unwrap();
        recv(&peer).await;

        session.shutdown();
        assert_eq!(session.wait_listener().await, Some(ListenerExit::Cancelled));
        assert!(!session.is_listening());
        assert_eq!(session.wait_listener().await, None);

        drain(&peer).await;
        assert_quiet(&peer).await;
    }

    #[tokio::test]
    async fn test_event_payload_carries_session() {
        let (session, peer) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.events().call_error.subscribe(move |session: &SipSession, _| {
            let _ = tx.send(session.local_port());
            Ok(())
        });

        send(&peer, &session, "SIP/2.0 404 Not Found\r\n\r\n").await;
        assert_eq!(expect_event(&mut rx).await, session.local_port());
    }

    #[tokio::test]
    async fn test_overflowing_cseq_challenge_is_dropped() {
        let (session, peer) = setup().await;
        let mut received = watch(&session.events().message_received);
        let call_id = session.register(Duration::from_secs(3600)).await.unwrap();
        recv(&peer).await;

        send(&peer, &session, &format!(
            "SIP/2.0 401 Unauthorized\r\nTo: <sip:10000000005@127.0.0.1>\r\nCall-ID: {}\r\nCSeq: 4294967295 REGISTER\r\nWWW-Authenticate: Digest realm=\"r\", nonce=\"n\"\r\n\r\n",
            call_id
        ))
        .await;
        assert_quiet(&peer).await;
        assert!(session.is_listening());
        assert_eq!(
            session.register_template().unwrap().get_header("CSeq").unwrap(),
            "1 REGISTER"
        );

        send(&peer, &session,
            "MESSAGE sip:a@b SIP/2.0\r\nVia: v\r\nTo: <sip:a@b>\r\nFrom: <sip:c@d>\r\nCall-ID: 9\r\nCSeq: 1 MESSAGE\r\n\r\nafter overflow",
        )
        .await;
        assert_eq!(expect_event(&mut received).await.body, "after overflow");
    }

    #[tokio::test]
    async fn test_unacknowledgeable_message_is_still_delivered() {
        let (session, peer) = setup().await;
        let mut received = watch(&session.events().message_received);

        send(&peer, &session,
            "MESSAGE sip:10000000005@127.0.0.1 SIP/2.0\r\nVia: SIP/2.0/UDP 127.0.0.1\r\nFrom: <sip:1@127.0.0.1>\r\nCall-ID: 5\r\nCSeq: 1 MESSAGE\r\n\r\ndoor opened",
        )
        .await;

        assert_eq!(expect_event(&mut received).await.body, "door opened");
        assert_quiet(&peer).await;
    }

    mod listener_properties {
        use super::*;
        use proptest::prelude::*;

        const MARKER: &str = "still listening";

        fn start_line() -> impl Strategy<Value = String> {
            prop_oneof![
                (100u16..700).prop_map(|code| format!("SIP/2.0 {} Reason", code)),
                Just("SIP/2.0 401 Unauthorized".to_string()),
                Just("SIP/2.0 200 OK".to_string()),
                prop::sample::select(vec!["INVITE", "MESSAGE", "BYE", "CANCEL", "OPTIONS"])
                    .prop_map(|method| format!("{} sip:10000000005@127.0.0.1 SIP/2.0", method)),
                "[A-Za-z0-9 /.]{0,24}",
            ]
        }

        fn cseq() -> impl Strategy<Value = String> {
            (
                prop_oneof![Just(u32::MAX), Just(u32::MAX - 1), any::<u32>()],
                prop::sample::select(vec!["REGISTER", "INVITE", "MESSAGE", "BYE", "CANCEL", "FOO"]),
            )
                .prop_map(|(number, method)| format!("{} {}", number, method))
        }

        fn datagram() -> impl Strategy<Value = String> {
            (
                start_line(),
                prop::option::of(cseq()),
                any::<bool>(),
                any::<bool>(),
                any::<bool>(),
                any::<bool>(),
                any::<bool>(),
                "[ -~]{0,40}",
            )
                .prop_map(|(start, cseq, to, from, call_id, contact, challenge, body)| {
                    let mut raw = format!("{}\r\nVia: SIP/2.0/UDP 127.0.0.1:5065\r\n", start);
                    if to {
                        raw.push_str("To: <sip:10000000005@127.0.0.1>\r\n");
                    }
                    if from {
                        raw.push_str("From: <sip:10010100001@127.0.0.1>;tag=1\r\n");
                    }
                    if call_id {
                        raw.push_str("Call-ID: 1\r\n");
                    }
                    if let Some(cseq) = cseq {
                        raw.push_str(&format!("CSeq: {}\r\n", cseq));
                    }
                    if contact {
                        raw.push_str("Contact: <sip:10010100001@127.0.0.1:5060>\r\n");
                    }
                    if challenge {
                        raw.push_str("WWW-Authenticate: Digest realm=\"r\", nonce=\"n\"\r\n");
                    }
                    raw.push_str("\r\n");
                    raw.push_str(&body);
                    raw
                })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            #[test]
            fn listener_survives_any_datagram(datagrams in prop::collection::vec(datagram(), 1..6)) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();

                runtime.block_on(async {
                    let (session, peer) = setup().await;
                    let mut received = watch(&session.events().message_received);
                    session.register(Duration::from_secs(3600)).await.unwrap();

                    for raw in &datagrams {
                        send(&peer, &session, raw).await;
                    }
                    send(&peer, &session, &format!(
                        "MESSAGE sip:10000000005@127.0.0.1 SIP/2.0\r\nVia: v\r\nTo: <sip:a@b>\r\nFrom: <sip:c@d>\r\nCall-ID: 9\r\nCSeq: 1 MESSAGE\r\n\r\n{}",
                        MARKER
                    ))
                    .await;

                    while expect_event(&mut received).await.body != MARKER {}
                    assert!(session.is_listening());
                });
            }
        }
    }
}
