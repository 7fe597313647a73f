// main.rs - Register an intercom extension and report its call state

use anyhow::{Context, Result};
use clap::Parser;
use intercom_sip::{SessionConfig, SessionStatus, SipSession, StatePublisher};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Local IP address written into Via and Contact
    #[arg(long, env = "SIP_LOCAL_IP")]
    ip: String,

    /// Registrar as host[:port]
    #[arg(long, env = "SIP_DOMAIN")]
    domain: String,

    /// Digest username, when it differs from the extension
    #[arg(long, env = "SIP_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "SIP_EXTENSION", default_value = "10000000003")]
    extension: String,

    #[arg(long, env = "SIP_PASSWORD", default_value = "")]
    password: String,

    /// Display name
    #[arg(long, env = "SIP_NAME", default_value = "robot")]
    name: String,

    /// Local UDP port, 0 for OS-assigned
    #[arg(long, env = "SIP_PORT", default_value_t = 5061)]
    port: u16,

    /// Re-registration interval in seconds
    #[arg(long, env = "SIP_REFRESH", default_value_t = 600)]
    refresh: u64,

    /// Bearer token for the state callback
    #[arg(long, env = "SIP_STATE_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "SIP_STATE_URL")]
    state_url: Option<String>,

    #[arg(long)]
    debug: bool,
}

/// Posts `{"state": ...}` to an HTTP endpoint without waiting for the reply.
struct HttpStatePublisher {
    endpoint: String,
    token: String,
    client: reqwest::Client,
    runtime: Handle,
}

impl HttpStatePublisher {
    fn from_args(args: &Args) -> Option<Self> {
        let token = args.token.clone().filter(|t| !t.is_empty())?;
        let endpoint = args.state_url.clone().filter(|u| !u.is_empty())?;
        Some(Self {
            endpoint,
            token,
            client: reqwest::Client::new(),
            runtime: Handle::current(),
        })
    }
}

impl StatePublisher for HttpStatePublisher {
    fn publish(&self, status: SessionStatus) {
        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(5))
            .json(&json!({ "state": status.as_str() }));
        let endpoint = self.endpoint.clone();

        self.runtime.spawn(async move {
            match request.send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!("state post failed: status={} endpoint={}", resp.status(), endpoint);
                }
                Ok(_) => {}
                Err(e) => warn!("state post error: {} endpoint={}", e, endpoint),
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "intercom_sip=debug"
    } else {
        "intercom_sip=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let publisher = HttpStatePublisher::from_args(&args).map(Arc::new);
    if let Some(publisher) = &publisher {
        publisher.publish(SessionStatus::Init);
    }

    let config = SessionConfig {
        local_ip: args.ip.clone(),
        username: args.extension.clone(),
        auth_username: args.username.clone(),
        password: args.password.clone(),
        domain: args.domain.clone(),
        display_name: args.name.clone(),
        bind_port: args.port,
        ..Default::default()
    };

    info!("Starting intercom extension {} against {}", config.username, config.domain);
    let session = SipSession::connect(config)
        .await
        .context("failed to start SIP session")?;

    if let Some(publisher) = publisher {
        session.events().bind_status(publisher);
    }

    session
        .register(Duration::from_secs(args.refresh))
        .await
        .context("failed to send REGISTER")?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    session.shutdown();
    session.wait_listener().await;

    Ok(())
}
