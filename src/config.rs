use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::backend::AccountStatus;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_MAX_RECIPIENTS: usize = 100;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Policy attached to a listening port.
///
/// The trust level is decided by the listener that accepted the socket and
/// handed to the session at creation, never looked up from the port number
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Client submission (587): authentication required, STARTTLS offered,
    /// no AUTH over plaintext.
    Submission,
    /// MX relay (25): anonymous senders accepted, AUTH allowed in plaintext.
    Relay,
    /// Implicit TLS submission (465): TLS before the first SMTP byte.
    Smtps,
}

impl TrustLevel {
    pub const ALL: [TrustLevel; 3] = [TrustLevel::Submission, TrustLevel::Relay, TrustLevel::Smtps];

    pub fn requires_auth(self) -> bool {
        !matches!(self, TrustLevel::Relay)
    }

    pub fn implicit_tls(self) -> bool {
        matches!(self, TrustLevel::Smtps)
    }

    pub fn offers_starttls(self) -> bool {
        !self.implicit_tls()
    }

    pub fn allows_plaintext_auth(self) -> bool {
        matches!(self, TrustLevel::Relay)
    }

    pub fn default_port(self) -> u16 {
        match self {
            TrustLevel::Submission => 587,
            TrustLevel::Relay => 25,
            TrustLevel::Smtps => 465,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Submission => "submission",
            TrustLevel::Relay => "relay",
            TrustLevel::Smtps => "smtps",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of one listener. Immutable once the listener set is built.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub trust_level: TrustLevel,
    pub address: String,
    pub port: u16,
    pub hostname: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
}

impl ListenerConfig {
    pub fn new(trust_level: TrustLevel, port: u16) -> Self {
        Self {
            trust_level,
            address: "0.0.0.0".to_string(),
            port,
            hostname: "localhost".to_string(),
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_recipients: DEFAULT_MAX_RECIPIENTS,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub hostname: String,
    pub address: String,
    /// Listeners to run; all three by default.
    pub listeners: Vec<TrustLevel>,
    pub submission_port: u16,
    pub relay_port: u16,
    pub smtps_port: u16,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Connections accepted per client IP per minute, 0 for no limit.
    pub max_connections_per_minute: usize,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            address: "0.0.0.0".to_string(),
            listeners: TrustLevel::ALL.to_vec(),
            submission_port: TrustLevel::Submission.default_port(),
            relay_port: TrustLevel::Relay.default_port(),
            smtps_port: TrustLevel::Smtps.default_port(),
            max_message_size: DEFAULT_MAX_MESSAGE_BYTES,
            max_recipients: DEFAULT_MAX_RECIPIENTS,
            read_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            write_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            max_connections_per_minute: 0,
        }
    }
}

impl SmtpConfig {
    pub fn port(&self, trust_level: TrustLevel) -> u16 {
        match trust_level {
            TrustLevel::Submission => self.submission_port,
            TrustLevel::Relay => self.relay_port,
            TrustLevel::Smtps => self.smtps_port,
        }
    }

    pub fn listener(&self, trust_level: TrustLevel) -> ListenerConfig {
        ListenerConfig {
            trust_level,
            address: self.address.clone(),
            port: self.port(trust_level),
            hostname: self.hostname.clone(),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            max_message_bytes: self.max_message_size,
            max_recipients: self.max_recipients,
        }
    }

    pub fn listener_configs(&self) -> Vec<ListenerConfig> {
        TrustLevel::ALL
            .into_iter()
            .filter(|level| self.listeners.contains(level))
            .map(|level| self.listener(level))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub expiry_warning_days: u32,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_file: None,
            key_file: None,
            expiry_warning_days: 30,
        }
    }
}

impl TlsConfig {
    /// Both paths, when the operator configured a certificate on disk.
    pub fn files(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub status: AccountStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub dir: PathBuf,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/spool"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub smtp: SmtpConfig,
    pub tls: TlsConfig,
    pub spool: SpoolConfig,
    pub accounts: Vec<AccountConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smtp.hostname.trim().is_empty() {
            return Err(ConfigError::Invalid("smtp.hostname must not be empty".into()));
        }
        if self.smtp.listeners.is_empty() {
            return Err(ConfigError::Invalid("at least one listener must be enabled".into()));
        }
        if self.smtp.max_message_size == 0 {
            return Err(ConfigError::Invalid("smtp.max_message_size must be positive".into()));
        }
        if self.smtp.max_recipients == 0 {
            return Err(ConfigError::Invalid("smtp.max_recipients must be positive".into()));
        }
        if self.smtp.read_timeout_secs == 0 || self.smtp.write_timeout_secs == 0 {
            return Err(ConfigError::Invalid("smtp timeouts must be positive".into()));
        }
        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            return Err(ConfigError::Invalid(
                "tls.cert_file and tls.key_file must be configured together".into(),
            ));
        }

        let mut ports: Vec<u16> = self
            .smtp
            .listeners
            .iter()
            .map(|level| self.smtp.port(*level))
            .filter(|port| *port != 0)
            .collect();
        let before = ports.len();
        ports.sort_unstable();
        ports.dedup();
        if ports.len() != before {
            return Err(ConfigError::Invalid("listener ports must be distinct".into()));
        }

        Ok(())
    }
}
