mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::{ClientConfig, RootCertStore, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use common::{backend, listener, plain_credentials, Client, MemoryQueue};
use mxgate::config::TlsConfig;
use mxgate::server::{Lifecycle, ServerError};
use mxgate::{CertificateManager, ListenerSet, ShutdownError, TrustLevel};

async fn started(set: ListenerSet, trust_level: TrustLevel) -> (ListenerSet, SocketAddr) {
    set.start().await.unwrap();
    let addr = set.local_addr(trust_level).await.unwrap();
    (set, addr)
}

async fn relay(queue: &Arc<MemoryQueue>) -> (ListenerSet, SocketAddr) {
    let set = ListenerSet::new(vec![listener(TrustLevel::Relay)], backend(queue), None);
    started(set, TrustLevel::Relay).await
}

fn certificates() -> CertificateManager {
    CertificateManager::new(&TlsConfig::default(), "localhost").unwrap()
}

fn connector(certificates: &CertificateManager) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(&certificates.snapshot().chain()[0]).unwrap();
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn handshake(connector: &TlsConnector, stream: TcpStream) -> TlsStream<TcpStream> {
    let name = ServerName::try_from("localhost").unwrap();
    connector.connect(name, stream).await.unwrap()
}

#[tokio::test]
async fn relay_accepts_anonymous_mail() {
    let queue = Arc::new(MemoryQueue::default());
    let (set, addr) = relay(&queue).await;

    let mut client = Client::connect(addr).await;
    assert_eq!(client.reply().await, "220 mx.test ESMTP ready\r\n");

    let ehlo = client.command("EHLO client.test").await;
    assert!(ehlo.starts_with("250-mx.test Hello client.test\r\n"), "{ehlo}");
    assert!(ehlo.contains("250-PIPELINING\r\n"));
    assert!(ehlo.contains("SIZE 52428800"));
    assert!(ehlo.contains("AUTH PLAIN"));
    assert!(!ehlo.contains("STARTTLS"));

    assert!(client.command("MAIL FROM:<sender@example.org>").await.starts_with("250 "));
    assert!(client.command("RCPT TO:<one@example.com>").await.starts_with("250 "));
    assert!(client.command("RCPT TO:<two@example.com>").await.starts_with("250 "));
    assert!(client.command("DATA").await.starts_with("354 "));
    client
        .send("Subject: test\r\n\r\n..leading dot\r\nbody\r\n.\r\n")
        .await;
    assert_eq!(client.reply().await, "250 2.0.0 OK: queued as msg-1\r\n");
    assert!(client.command("QUIT").await.starts_with("221 "));

    let messages = queue.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender, "sender@example.org");
    assert_eq!(messages[0].recipients, vec!["one@example.com", "two@example.com"]);
    assert_eq!(messages[0].message, b"Subject: test\r\n\r\n.leading dot\r\nbody\r\n");

    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn session_is_reset_between_transactions() {
    let queue = Arc::new(MemoryQueue::default());
    let (set, addr) = relay(&queue).await;

    let mut client = Client::connect(addr).await;
    client.reply().await;
    client.command("HELO client.test").await;
    for n in 1..=2 {
        client.command(&format!("MAIL FROM:<s{n}@example.org>")).await;
        client.command(&format!("RCPT TO:<r{n}@example.com>")).await;
        client.command("DATA").await;
        client.send("x\r\n.\r\n").await;
        assert_eq!(client.reply().await, format!("250 2.0.0 OK: queued as msg-{n}\r\n"));
    }
    // Recipients do not carry over to the next transaction.
    assert!(client.command("DATA").await.starts_with("503 5.5.1"));

    let messages = queue.messages();
    assert_eq!(messages[1].sender, "s2@example.org");
    assert_eq!(messages[1].recipients, vec!["r2@example.com"]);

    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn pipelined_commands_are_answered_in_order() {
    let queue = Arc::new(MemoryQueue::default());
    let (set, addr) = relay(&queue).await;

    let mut client = Client::connect(addr).await;
    client.reply().await;
    client
        .send("EHLO client.test\r\nMAIL FROM:<a@example.org>\r\nRCPT TO:<b@example.com>\r\nDATA\r\n")
        .await;
    assert!(client.reply().await.starts_with("250-"));
    assert!(client.reply().await.starts_with("250 2.1.0"));
    assert!(client.reply().await.starts_with("250 2.1.5"));
    assert!(client.reply().await.starts_with("354 "));
    client.send("hi\r\n.\r\nNOOP\r\n").await;
    assert!(client.reply().await.starts_with("250 2.0.0 OK: queued"));
    assert_eq!(client.reply().await, "250 2.0.0 OK\r\n");

    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn submission_without_tls_refuses_mail_and_auth() {
    let queue = Arc::new(MemoryQueue::default());
    let set = ListenerSet::new(vec![listener(TrustLevel::Submission)], backend(&queue), None);
    let (set, addr) = started(set, TrustLevel::Submission).await;

    let mut client = Client::connect(addr).await;
    client.reply().await;
    let ehlo = client.command("EHLO client.test").await;
    assert!(!ehlo.contains("AUTH"));
    assert!(!ehlo.contains("STARTTLS"));

    assert_eq!(
        client.command("MAIL FROM:<a@example.org>").await,
        "530 5.7.0 Authentication required\r\n"
    );
    let auth = client
        .command(&format!("AUTH PLAIN {}", plain_credentials("alice@example.com", "secret")))
        .await;
    assert!(auth.starts_with("523 5.7.10"), "{auth}");
    assert!(queue.messages().is_empty());

    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn relay_auth_plain() {
    let queue = Arc::new(MemoryQueue::default());
    let (set, addr) = relay(&queue).await;

    let mut client = Client::connect(addr).await;
    client.reply().await;
    assert!(client.command("AUTH PLAIN").await.starts_with("503 5.5.1"));
    client.command("EHLO client.test").await;

    assert!(client.command("AUTH LOGIN").await.starts_with("504 5.7.4"));
    let wrong = client
        .command(&format!("AUTH PLAIN {}", plain_credentials("alice@example.com", "nope")))
        .await;
    assert!(wrong.starts_with("535 5.7.8"), "{wrong}");
    let disabled = client
        .command(&format!("AUTH PLAIN {}", plain_credentials("mallory@example.com", "secret")))
        .await;
    assert_eq!(wrong, disabled);

    // Challenge-response form.
    assert_eq!(client.command("AUTH PLAIN").await, "334 \r\n");
    let ok = client.command(&plain_credentials("alice@example.com", "secret")).await;
    assert!(ok.starts_with("235 2.7.0"), "{ok}");
    assert!(client
        .command(&format!("AUTH PLAIN {}", plain_credentials("alice@example.com", "secret")))
        .await
        .starts_with("503 5.5.1"));

    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn auth_cancelled_by_client() {
    let queue = Arc::new(MemoryQueue::default());
    let (set, addr) = relay(&queue).await;

    let mut client = Client::connect(addr).await;
    client.reply().await;
    client.command("EHLO client.test").await;
    assert_eq!(client.command("AUTH PLAIN").await, "334 \r\n");
    assert!(client.command("*").await.starts_with("501 "));
    assert!(client.command("NOOP").await.starts_with("250 "));

    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn oversized_message_never_reaches_queue() {
    let queue = Arc::new(MemoryQueue::default());
    let mut config = listener(TrustLevel::Relay);
    config.max_message_bytes = 16;
    let set = ListenerSet::new(vec![config], backend(&queue), None);
    let (set, addr) = started(set, TrustLevel::Relay).await;

    let mut client = Client::connect(addr).await;
    client.reply().await;
    client.command("EHLO client.test").await;
    client.command("MAIL FROM:<a@example.org>").await;
    client.command("RCPT TO:<b@example.com>").await;
    client.command("DATA").await;
    client.send(&format!("{}\r\n.\r\n", "x".repeat(100))).await;
    assert!(client.reply().await.starts_with("552 5.3.4"));

    // The rest of the body was consumed; the connection is still in sync.
    assert_eq!(client.command("RSET").await, "250 2.0.0 OK\r\n");
    assert!(queue.messages().is_empty());

    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn recipient_limit() {
    let queue = Arc::new(MemoryQueue::default());
    let mut config = listener(TrustLevel::Relay);
    config.max_recipients = 2;
    let set = ListenerSet::new(vec![config], backend(&queue), None);
    let (set, addr) = started(set, TrustLevel::Relay).await;

    let mut client = Client::connect(addr).await;
    client.reply().await;
    client.command("EHLO client.test").await;
    client.command("MAIL FROM:<a@example.org>").await;
    assert!(client.command("RCPT TO:<1@example.com>").await.starts_with("250 "));
    assert!(client.command("RCPT TO:<2@example.com>").await.starts_with("250 "));
    assert!(client.command("RCPT TO:<3@example.com>").await.starts_with("452 4.5.3"));

    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn submission_starttls_then_auth() {
    let queue = Arc::new(MemoryQueue::default());
    let certificates = certificates();
    let set = ListenerSet::new(
        vec![listener(TrustLevel::Submission)],
        backend(&queue),
        Some(certificates.tls_config().unwrap()),
    );
    let (set, addr) = started(set, TrustLevel::Submission).await;

    let mut client = Client::connect(addr).await;
    client.reply().await;
    let ehlo = client.command("EHLO client.test").await;
    assert!(ehlo.contains("STARTTLS"));
    assert!(!ehlo.contains("AUTH"));
    assert!(client.command("STARTTLS").await.starts_with("220 2.0.0"));

    let stream = handshake(&connector(&certificates), client.into_inner()).await;
    let mut client = Client::new(stream);
    // No banner after the upgrade, and the greeting must be repeated.
    assert!(client.command("MAIL FROM:<alice@example.com>").await.starts_with("503 5.5.1"));
    let ehlo = client.command("EHLO client.test").await;
    assert!(!ehlo.contains("STARTTLS"));
    assert!(ehlo.contains("AUTH PLAIN"));

    let auth = client
        .command(&format!("AUTH PLAIN {}", plain_credentials("alice@example.com", "secret")))
        .await;
    assert!(auth.starts_with("235 "), "{auth}");
    assert!(client.command("MAIL FROM:<alice@example.com>").await.starts_with("250 "));
    assert!(client.command("RCPT TO:<bob@example.org>").await.starts_with("250 "));
    assert!(client.command("DATA").await.starts_with("354 "));
    client.send("Subject: over TLS\r\n\r\nhello\r\n.\r\n").await;
    assert!(client.reply().await.starts_with("250 2.0.0 OK: queued"));
    assert!(client.command("QUIT").await.starts_with("221 "));

    assert_eq!(queue.messages()[0].sender, "alice@example.com");
    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn smtps_speaks_tls_from_the_first_byte() {
    let queue = Arc::new(MemoryQueue::default());
    let certificates = certificates();
    let set = ListenerSet::new(
        vec![listener(TrustLevel::Smtps)],
        backend(&queue),
        Some(certificates.tls_config().unwrap()),
    );
    let (set, addr) = started(set, TrustLevel::Smtps).await;

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut client = Client::new(handshake(&connector(&certificates), tcp).await);
    assert_eq!(client.reply().await, "220 mx.test ESMTP ready\r\n");

    let ehlo = client.command("EHLO client.test").await;
    assert!(!ehlo.contains("STARTTLS"));
    assert!(ehlo.contains("AUTH PLAIN"));
    assert!(client.command("STARTTLS").await.starts_with("454 "));
    assert!(client.command("MAIL FROM:<a@example.org>").await.starts_with("530 5.7.0"));

    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn smtps_is_skipped_without_tls() {
    let queue = Arc::new(MemoryQueue::default());
    let set = ListenerSet::new(
        vec![listener(TrustLevel::Relay), listener(TrustLevel::Smtps)],
        backend(&queue),
        None,
    );
    set.start().await.unwrap();

    let addrs = set.local_addrs().await;
    assert_eq!(addrs.len(), 1);
    assert_eq!(addrs[0].0, TrustLevel::Relay);
    assert!(set.local_addr(TrustLevel::Smtps).await.is_none());

    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn listeners_share_one_backend() {
    let queue = Arc::new(MemoryQueue::default());
    let certificates = certificates();
    let set = ListenerSet::new(
        vec![
            listener(TrustLevel::Submission),
            listener(TrustLevel::Relay),
            listener(TrustLevel::Smtps),
        ],
        backend(&queue),
        Some(certificates.tls_config().unwrap()),
    );
    set.start().await.unwrap();
    assert_eq!(set.local_addrs().await.len(), 3);

    let relay = set.local_addr(TrustLevel::Relay).await.unwrap();
    let smtps = set.local_addr(TrustLevel::Smtps).await.unwrap();

    let mut plain = Client::connect(relay).await;
    plain.reply().await;
    plain.command("HELO a.test").await;
    plain.command("MAIL FROM:<a@example.org>").await;
    plain.command("RCPT TO:<b@example.com>").await;
    plain.command("DATA").await;
    plain.send("one\r\n.\r\n").await;
    assert!(plain.reply().await.starts_with("250 2.0.0"));

    let tcp = TcpStream::connect(smtps).await.unwrap();
    let mut secure = Client::new(handshake(&connector(&certificates), tcp).await);
    secure.reply().await;
    secure.command("EHLO b.test").await;
    secure
        .command(&format!("AUTH PLAIN {}", plain_credentials("alice@example.com", "secret")))
        .await;
    secure.command("MAIL FROM:<alice@example.com>").await;
    secure.command("RCPT TO:<c@example.com>").await;
    secure.command("DATA").await;
    secure.send("two\r\n.\r\n").await;
    assert_eq!(secure.reply().await, "250 2.0.0 OK: queued as msg-2\r\n");

    assert_eq!(queue.messages().len(), 2);
    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn connection_rate_limit() {
    let queue = Arc::new(MemoryQueue::default());
    let set = ListenerSet::new(
        vec![listener(TrustLevel::Relay)],
        backend(&queue).with_connection_limit(1),
        None,
    );
    let (set, addr) = started(set, TrustLevel::Relay).await;

    let mut first = Client::connect(addr).await;
    assert!(first.reply().await.starts_with("220 "));
    let mut second = Client::connect(addr).await;
    assert!(second.reply().await.starts_with("421 4.7.0"));

    set.shutdown().await.unwrap();
}

#[tokio::test]
async fn lifecycle_transitions() {
    let queue = Arc::new(MemoryQueue::default());
    let set = ListenerSet::new(vec![listener(TrustLevel::Relay)], backend(&queue), None);

    assert_eq!(set.lifecycle(), Lifecycle::NotStarted);
    set.shutdown().await.unwrap();
    assert_eq!(set.lifecycle(), Lifecycle::NotStarted);

    set.start().await.unwrap();
    assert_eq!(set.lifecycle(), Lifecycle::Running);
    assert!(matches!(set.start().await, Err(ServerError::AlreadyStarted)));

    set.shutdown().await.unwrap();
    assert_eq!(set.lifecycle(), Lifecycle::Stopped);
    set.shutdown().await.unwrap();
    assert!(matches!(set.start().await, Err(ServerError::Stopped)));
}

#[tokio::test]
async fn idle_connections_are_told_about_shutdown() {
    let queue = Arc::new(MemoryQueue::default());
    let (set, addr) = relay(&queue).await;

    let mut client = Client::connect(addr).await;
    client.reply().await;
    client.command("EHLO client.test").await;

    set.shutdown().await.unwrap();
    assert_eq!(client.reply().await, "421 4.3.0 Service shutting down\r\n");
    assert_eq!(client.reply().await, "");
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn shutdown_deadline_abandons_busy_connections() {
    let queue = Arc::new(MemoryQueue::default());
    let (set, addr) = relay(&queue).await;

    // A client in the middle of DATA keeps its listener busy.
    let mut client = Client::connect(addr).await;
    client.reply().await;
    client.command("HELO client.test").await;
    client.command("MAIL FROM:<a@example.org>").await;
    client.command("RCPT TO:<b@example.com>").await;
    assert!(client.command("DATA").await.starts_with("354 "));
    client.send("partial body\r\n").await;

    let started = Instant::now();
    let result = set.shutdown_within(Duration::ZERO).await;
    assert!(matches!(result, Err(ShutdownError::Timeout(_))), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(set.lifecycle(), Lifecycle::Stopped);
    assert!(queue.messages().is_empty());
}

#[tokio::test]
async fn bind_failure_aborts_start() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let queue = Arc::new(MemoryQueue::default());
    let mut busy = listener(TrustLevel::Submission);
    busy.port = port;
    let set = ListenerSet::new(vec![listener(TrustLevel::Relay), busy], backend(&queue), None);

    match set.start().await {
        Err(ServerError::Bind { trust_level, .. }) => assert_eq!(trust_level, TrustLevel::Submission),
        other => panic!("unexpected start result: {other:?}"),
    }
    assert_eq!(set.lifecycle(), Lifecycle::NotStarted);
    assert!(set.local_addrs().await.is_empty());
}

async fn refuses_connections(addr: SocketAddr) -> bool {
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn expired_deadline_reports_timeout_even_when_idle() {
    let queue = Arc::new(MemoryQueue::default());
    let certificates = certificates();
    let set = ListenerSet::new(
        vec![
            listener(TrustLevel::Submission),
            listener(TrustLevel::Relay),
            listener(TrustLevel::Smtps),
        ],
        backend(&queue),
        Some(certificates.tls_config().unwrap()),
    );
    set.start().await.unwrap();
    let addrs = set.local_addrs().await;
    assert_eq!(addrs.len(), 3);

    let result = set.shutdown_within(Duration::ZERO).await;
    assert!(matches!(result, Err(ShutdownError::Timeout(_))), "{result:?}");
    assert_eq!(set.lifecycle(), Lifecycle::Stopped);
    for (trust_level, addr) in addrs {
        assert!(refuses_connections(addr).await, "{trust_level} still accepting");
    }
}

#[tokio::test]
async fn bound_addresses_stay_readable_during_shutdown() {
    let queue = Arc::new(MemoryQueue::default());
    let (set, addr) = relay(&queue).await;
    let set = Arc::new(set);

    let mut client = Client::connect(addr).await;
    client.reply().await;
    client.command("HELO client.test").await;
    client.command("MAIL FROM:<a@example.org>").await;
    client.command("RCPT TO:<b@example.com>").await;
    assert!(client.command("DATA").await.starts_with("354 "));

    let stopping = {
        let set = set.clone();
        tokio::spawn(async move { set.shutdown_within(Duration::from_secs(2)).await })
    };
    while set.lifecycle() != Lifecycle::ShuttingDown {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let addrs = tokio::time::timeout(Duration::from_millis(500), set.local_addrs())
        .await
        .expect("local_addrs blocked by shutdown");
    assert_eq!(addrs, vec![(TrustLevel::Relay, addr)]);
    // A second shutdown while the first drains returns at once.
    let again = tokio::time::timeout(Duration::from_millis(500), set.shutdown())
        .await
        .expect("second shutdown blocked");
    assert!(again.is_ok());

    let result = stopping.await.unwrap();
    assert!(matches!(result, Err(ShutdownError::Timeout(_))), "{result:?}");
    assert_eq!(set.lifecycle(), Lifecycle::Stopped);
}
