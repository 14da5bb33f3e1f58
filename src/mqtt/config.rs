use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wire transport towards the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    #[default]
    Ws,
    Wss,
}

/// Where to connect: broker host, port and framing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub transport: TransportKind,
    /// Websocket path, ignored for plain TCP
    #[serde(default = "default_ws_path")]
    pub path: String,
}

fn default_ws_path() -> String {
    "/mqtt".to_string()
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, transport: TransportKind) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            path: default_ws_path(),
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, TransportKind::Tcp)
    }

    /// Broker address in the form the client library expects: a full URL for
    /// websocket transports, the bare host otherwise.
    pub fn broker_addr(&self) -> String {
        match self.transport {
            TransportKind::Tcp => self.host.clone(),
            TransportKind::Ws => format!("ws://{}:{}{}", self.host, self.port, self.path),
            TransportKind::Wss => format!("wss://{}:{}{}", self.host, self.port, self.path),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("202.74.74.42", 8084, TransportKind::Ws)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.transport {
            TransportKind::Tcp => write!(f, "mqtt://{}:{}", self.host, self.port),
            _ => write!(f, "{}", self.broker_addr()),
        }
    }
}

/// Automatic reconnection with exponential backoff.
///
/// The defaults reproduce a fixed five second period with unlimited attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given attempt (1-based), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

/// Everything the handler and the connector need to run a session.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub endpoint: Endpoint,
    pub client_id_prefix: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub request_capacity: usize,
    pub reconnect: ReconnectConfig,
    /// Registered as pending on startup and subscribed on every connect
    pub default_topics: Vec<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            client_id_prefix: "kostboard-dashboard".to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(8),
            ack_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(3),
            request_capacity: 64,
            reconnect: ReconnectConfig::default(),
            default_topics: Vec::new(),
        }
    }
}

impl MqttConfig {
    /// Fresh client identifier; every new link gets its own.
    pub fn generate_client_id(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.client_id_prefix, &suffix[..8])
    }
}
