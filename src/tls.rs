//! Server TLS identity: loading, self-signing, hardened rustls
//! configuration, atomic reload and expiry monitoring.

use std::fs::OpenOptions;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{cipher_suite, version, Certificate, PrivateKey, ServerConfig, SupportedCipherSuite};
use rustls_pemfile::Item;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::TlsConfig;

const ORGANIZATION: &str = "mxgate";
const SELF_SIGNED_KEY_BITS: u32 = 2048;
const SELF_SIGNED_VALIDITY_DAYS: u32 = 365;
const SERIAL_BITS: i32 = 128;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("certificate chain is empty")]
    EmptyChain,
    #[error("private key does not match certificate")]
    KeyMismatch,
    #[error("unsupported private key type")]
    UnsupportedKey,
    #[error("certificate validity is out of range")]
    InvalidValidity,
    #[error("cannot reload: no certificate files configured")]
    NoFilesConfigured,
    #[error("certificate expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("openssl: {0}")]
    OpenSsl(#[from] ErrorStack),
    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// One immutable TLS identity. Replaced as a whole on reload.
pub struct CertificateSnapshot {
    chain: Vec<Certificate>,
    key: PrivateKey,
    certified: Arc<CertifiedKey>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    common_name: Option<String>,
    san: Vec<String>,
}

impl CertificateSnapshot {
    fn new(chain: Vec<Certificate>, key: PrivateKey) -> Result<Self, TlsError> {
        let leaf = X509::from_der(&chain.first().ok_or(TlsError::EmptyChain)?.0)?;
        let private = PKey::private_key_from_der(&key.0)?;
        if !leaf.public_key()?.public_eq(&private) {
            return Err(TlsError::KeyMismatch);
        }

        let signing = rustls::sign::any_supported_type(&key).map_err(|_| TlsError::UnsupportedKey)?;
        let certified = Arc::new(CertifiedKey::new(chain.clone(), signing));

        let common_name = leaf
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| String::from_utf8(entry.data().as_slice().to_vec()).ok());
        let san = leaf
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.dnsname().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            not_before: to_utc(leaf.not_before())?,
            not_after: to_utc(leaf.not_after())?,
            chain,
            key,
            certified,
            common_name,
            san,
        })
    }

    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn san(&self) -> &[String] {
        &self.san
    }
}

fn to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>, TlsError> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0).ok_or(TlsError::InvalidValidity)
}

/// Hands every new handshake whatever snapshot is current at that moment.
struct SnapshotResolver(Arc<ArcSwap<CertificateSnapshot>>);

impl ResolvesServerCert for SnapshotResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.load().certified.clone())
    }
}

/// AEAD suites with forward secrecy only, strongest first.
fn cipher_suites() -> Vec<SupportedCipherSuite> {
    vec![
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

pub struct CertificateManager {
    files: Option<(PathBuf, PathBuf)>,
    current: Arc<ArcSwap<CertificateSnapshot>>,
}

impl CertificateManager {
    /// Loads the configured certificate, or self-signs one for `hostname`
    /// when none is configured. A configured but unreadable certificate is
    /// an error, never a reason to fall back to self-signing.
    pub fn new(config: &TlsConfig, hostname: &str) -> Result<Self, TlsError> {
        let files = config
            .files()
            .map(|(cert, key)| (cert.to_path_buf(), key.to_path_buf()));

        let snapshot = match &files {
            Some((cert_path, key_path)) => {
                info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS certificate from files");
                let snapshot = load_snapshot(cert_path, key_path)?;
                info!(
                    common_name = snapshot.common_name().unwrap_or(""),
                    not_after = %snapshot.not_after(),
                    "TLS certificate loaded"
                );
                snapshot
            }
            None => {
                warn!("generating self-signed certificate (NOT FOR PRODUCTION USE)");
                let snapshot = generate_self_signed(hostname)?;
                info!(
                    common_name = hostname,
                    valid_days = SELF_SIGNED_VALIDITY_DAYS,
                    "self-signed certificate generated"
                );
                snapshot
            }
        };

        Ok(Self {
            files,
            current: Arc::new(ArcSwap::from_pointee(snapshot)),
        })
    }

    /// The identity new handshakes will use.
    pub fn snapshot(&self) -> Arc<CertificateSnapshot> {
        self.current.load_full()
    }

    /// Hardened server configuration. The certificate is resolved per
    /// handshake, so one config stays valid across reloads. rustls never
    /// renegotiates.
    pub fn tls_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let mut config = ServerConfig::builder()
            .with_cipher_suites(&cipher_suites())
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[&version::TLS13, &version::TLS12])?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SnapshotResolver(self.current.clone())));
        config.ignore_client_order = true;
        Ok(Arc::new(config))
    }

    /// Re-reads the configured files and swaps the identity in one step.
    /// Handshakes already in progress keep the snapshot they started with.
    pub fn reload(&self) -> Result<(), TlsError> {
        let Some((cert_path, key_path)) = &self.files else {
            return Err(TlsError::NoFilesConfigured);
        };

        info!("reloading TLS certificate");
        let snapshot = load_snapshot(cert_path, key_path)?;
        info!(
            common_name = snapshot.common_name().unwrap_or(""),
            not_after = %snapshot.not_after(),
            "TLS certificate reloaded"
        );
        self.current.store(Arc::new(snapshot));
        Ok(())
    }

    /// Monitoring hook: errors once the certificate has expired, warns when
    /// it expires within `warning_days`. Enforces nothing.
    pub fn validate_expiry(&self, warning_days: u32) -> Result<(), TlsError> {
        self.validate_expiry_at(warning_days, Utc::now())
    }

    fn validate_expiry_at(&self, warning_days: u32, now: DateTime<Utc>) -> Result<(), TlsError> {
        let snapshot = self.current.load();
        let not_after = snapshot.not_after();
        if now > not_after {
            return Err(TlsError::Expired(not_after));
        }

        let days_until_expiry = (not_after - now).num_days();
        if days_until_expiry <= i64::from(warning_days) {
            warn!(days_until_expiry, expires_at = %not_after, "certificate expiring soon");
        }
        Ok(())
    }

    /// Writes the current certificate chain and private key as PEM. The key
    /// file is readable by its owner only.
    pub fn save_self_signed_cert(&self, cert_path: &Path, key_path: &Path) -> Result<(), TlsError> {
        let snapshot = self.current.load();

        let mut cert_pem = Vec::new();
        for cert in snapshot.chain() {
            cert_pem.extend(X509::from_der(&cert.0)?.to_pem()?);
        }
        let key_pem = PKey::private_key_from_der(&snapshot.key.0)?.private_key_to_pem_pkcs8()?;

        write_file(cert_path, &cert_pem, 0o644)?;
        write_file(key_path, &key_pem, 0o600)?;

        info!(cert = %cert_path.display(), key = %key_path.display(), "certificate saved");
        Ok(())
    }
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), TlsError> {
    let io_err = |source: io::Error| TlsError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut file = options.open(path).map_err(io_err)?;

    // The mode above only applies to newly created files.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(io_err)?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    file.write_all(contents).map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

fn open(path: &Path) -> Result<BufReader<std::fs::File>, TlsError> {
    std::fs::File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_snapshot(cert_path: &Path, key_path: &Path) -> Result<CertificateSnapshot, TlsError> {
    let chain: Vec<Certificate> = rustls_pemfile::certs(&mut open(cert_path)?)
        .map_err(|source| TlsError::Io {
            path: cert_path.to_path_buf(),
            source,
        })?
        .into_iter()
        .map(Certificate)
        .collect();
    if chain.is_empty() {
        return Err(TlsError::NoCertificate(cert_path.to_path_buf()));
    }

    let mut reader = open(key_path)?;
    let key = loop {
        let item = rustls_pemfile::read_one(&mut reader).map_err(|source| TlsError::Io {
            path: key_path.to_path_buf(),
            source,
        })?;
        match item {
            Some(Item::RSAKey(key)) | Some(Item::PKCS8Key(key)) | Some(Item::ECKey(key)) => {
                break PrivateKey(key)
            }
            Some(_) => continue,
            None => return Err(TlsError::NoPrivateKey(key_path.to_path_buf())),
        }
    };

    CertificateSnapshot::new(chain, key)
}

fn generate_self_signed(hostname: &str) -> Result<CertificateSnapshot, TlsError> {
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(SELF_SIGNED_VALIDITY_DAYS)?;
    build_self_signed(hostname, &not_before, &not_after)
}

fn build_self_signed(
    hostname: &str,
    not_before: &Asn1TimeRef,
    not_after: &Asn1TimeRef,
) -> Result<CertificateSnapshot, TlsError> {
    // Key and serial both come from OpenSSL's CSPRNG.
    let key = PKey::from_rsa(Rsa::generate(SELF_SIGNED_KEY_BITS)?)?;
    let mut serial = BigNum::new()?;
    serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, ORGANIZATION)?;
    name.append_entry_by_nid(Nid::COMMONNAME, hostname)?;
    let name = name.build();

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.set_not_before(not_before)?;
    builder.set_not_after(not_after)?;
    builder.append_extension(BasicConstraints::new().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
    let san = SubjectAlternativeName::new()
        .dns(hostname)
        .build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;
    builder.sign(&key, MessageDigest::sha256())?;
    let cert = builder.build();

    CertificateSnapshot::new(
        vec![Certificate(cert.to_der()?)],
        PrivateKey(key.private_key_to_pkcs8()?),
    )
}
