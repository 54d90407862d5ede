//! SMTP ingestion engine: per-port trust policy over three listeners
//! (submission, relay and implicit TLS) sharing one backend, with a
//! reloadable TLS identity.

pub mod accounts;
pub mod backend;
pub mod config;
mod connection;
pub mod dot;
pub mod logging;
mod ratelimiter;
pub mod reply;
pub mod server;
pub mod session;
pub mod spool;
pub mod tls;
pub mod utils;

pub use backend::{Account, AccountStatus, Authenticator, Backend, Enqueuer};
pub use config::{Config, ListenerConfig, TrustLevel};
pub use server::{ListenerSet, ShutdownError};
pub use session::Session;
pub use tls::{CertificateManager, TlsError};
