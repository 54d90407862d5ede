use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::config::ListenerConfig;
use crate::ratelimiter::RateLimiter;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Disabled,
    Suspended,
}

impl AccountStatus {
    pub fn is_active(self) -> bool {
        matches!(self, AccountStatus::Active)
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccountStatus::Active => "active",
            AccountStatus::Disabled => "disabled",
            AccountStatus::Suspended => "suspended",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub username: String,
    pub status: AccountStatus,
}

/// Credential check. Called concurrently from every connection without any
/// serialization on our side.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> anyhow::Result<Account>;
}

/// Delivery queue intake. A successful return means the message is durably
/// queued; the session never retries.
pub trait Enqueuer: Send + Sync {
    fn enqueue(&self, sender: &str, recipients: &[String], message: &[u8]) -> anyhow::Result<String>;
}

/// Session factory shared by every listener.
#[derive(Clone)]
pub struct Backend {
    authenticator: Arc<dyn Authenticator>,
    enqueuer: Arc<dyn Enqueuer>,
    admission: Option<Arc<Mutex<RateLimiter>>>,
}

impl Backend {
    pub fn new(authenticator: Arc<dyn Authenticator>, enqueuer: Arc<dyn Enqueuer>) -> Self {
        Self {
            authenticator,
            enqueuer,
            admission: None,
        }
    }

    /// Cap accepted connections per client IP per minute. 0 disables the cap.
    pub fn with_connection_limit(mut self, per_minute: usize) -> Self {
        self.admission = (per_minute > 0).then(|| Arc::new(Mutex::new(RateLimiter::new(per_minute))));
        self
    }

    pub fn new_session(&self, remote_addr: SocketAddr, listener: &ListenerConfig) -> Session {
        Session::new(self.clone(), remote_addr, listener)
    }

    /// Records a connection attempt and reports whether it may proceed.
    pub fn admit(&self, ip: IpAddr) -> bool {
        match &self.admission {
            Some(limiter) => match limiter.lock() {
                Ok(mut limiter) => limiter.check_and_add(ip),
                Err(poisoned) => poisoned.into_inner().check_and_add(ip),
            },
            None => true,
        }
    }

    pub(crate) fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub(crate) fn enqueuer(&self) -> &dyn Enqueuer {
        self.enqueuer.as_ref()
    }
}
