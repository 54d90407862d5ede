use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing::{error, info, warn};

use mxgate::accounts::StaticAuthenticator;
use mxgate::spool::SpoolEnqueuer;
use mxgate::{logging, Backend, CertificateManager, Config, ListenerSet};

const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "mxgate",
    about = "SMTP ingestion engine: submission, relay and implicit TLS listeners",
    author = "2026, Philippe TEMESI <https://www.tems.be>",
    version = "0.1.0"
)]
pub struct Opt {
    /// TOML configuration file; command line options override it
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// Hostname announced in the banner and used for the self-signed certificate
    #[structopt(long = "hostname")]
    pub hostname: Option<String>,

    /// Listening address (default: 0.0.0.0)
    #[structopt(short = "a", long = "address")]
    pub address: Option<String>,

    /// Submission port (default: 587)
    #[structopt(long = "submission-port")]
    pub submission_port: Option<u16>,

    /// Relay port (default: 25)
    #[structopt(long = "relay-port")]
    pub relay_port: Option<u16>,

    /// Implicit TLS port (default: 465)
    #[structopt(long = "smtps-port")]
    pub smtps_port: Option<u16>,

    /// TLS certificate file (PEM chain)
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Directory accepted messages are spooled to
    #[structopt(long = "spool", parse(from_os_str))]
    pub spool: Option<PathBuf>,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Maximum connections per minute from same IP (0: unlimited)
    #[structopt(long = "max-connections")]
    pub max_connections_per_minute: Option<usize>,

    /// Verbose mode - log SMTP transcripts
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Write the active certificate and key as cert.pem and key.pem into this directory
    #[structopt(long = "save-self-signed", parse(from_os_str))]
    pub save_self_signed: Option<PathBuf>,
}

impl Opt {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(hostname) = &self.hostname {
            config.smtp.hostname = hostname.clone();
        }
        if let Some(address) = &self.address {
            config.smtp.address = address.clone();
        }
        if let Some(port) = self.submission_port {
            config.smtp.submission_port = port;
        }
        if let Some(port) = self.relay_port {
            config.smtp.relay_port = port;
        }
        if let Some(port) = self.smtps_port {
            config.smtp.smtps_port = port;
        }
        if let Some(limit) = self.max_connections_per_minute {
            config.smtp.max_connections_per_minute = limit;
        }
        if self.tls_cert.is_some() || self.tls_key.is_some() {
            config.tls.cert_file = self.tls_cert.clone();
            config.tls.key_file = self.tls_key.clone();
        }
        if let Some(spool) = &self.spool {
            config.spool.dir = spool.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();
    let config = opt.load_config()?;

    logging::init(opt.verbose, opt.log_file.as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "mxgate starting");

    let certificates = CertificateManager::new(&config.tls, &config.smtp.hostname)?;
    if let Some(dir) = &opt.save_self_signed {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        certificates.save_self_signed_cert(&dir.join("cert.pem"), &dir.join("key.pem"))?;
    }
    check_expiry(&certificates, config.tls.expiry_warning_days);
    let tls = certificates.tls_config()?;

    let authenticator = StaticAuthenticator::from_config(&config.accounts);
    if authenticator.is_empty() {
        warn!("no accounts configured, authenticated submission will always fail");
    }
    let spool = SpoolEnqueuer::new(&config.spool.dir)?;
    info!(spool = %spool.dir().display(), accounts = authenticator.len(), "backend ready");

    let backend = Backend::new(Arc::new(authenticator), Arc::new(spool))
        .with_connection_limit(config.smtp.max_connections_per_minute);
    let listeners = ListenerSet::new(config.smtp.listener_configs(), backend, Some(tls));
    listeners.start().await?;

    wait_for_shutdown(&certificates, config.tls.expiry_warning_days).await?;

    listeners.shutdown().await?;
    info!("shutdown complete");
    Ok(())
}

fn check_expiry(certificates: &CertificateManager, warning_days: u32) {
    if let Err(err) = certificates.validate_expiry(warning_days) {
        error!(error = %err, "TLS certificate check failed");
    }
}

#[cfg(unix)]
fn reload_certificate(certificates: &CertificateManager) {
    if let Err(err) = certificates.reload() {
        error!(error = %err, "certificate reload failed, keeping current certificate");
    }
}

/// Serves until interrupted. SIGHUP reloads the certificate, and its expiry
/// is checked once a day.
#[cfg(unix)]
async fn wait_for_shutdown(certificates: &CertificateManager, warning_days: u32) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut expiry_check = tokio::time::interval(EXPIRY_CHECK_INTERVAL);
    expiry_check.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("terminate received");
                return Ok(());
            }
            _ = hangup.recv() => reload_certificate(certificates),
            _ = expiry_check.tick() => check_expiry(certificates, warning_days),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(certificates: &CertificateManager, warning_days: u32) -> Result<()> {
    let mut expiry_check = tokio::time::interval(EXPIRY_CHECK_INTERVAL);
    expiry_check.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                return Ok(());
            }
            _ = expiry_check.tick() => check_expiry(certificates, warning_days),
        }
    }
}
