#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use mxgate::accounts::StaticAuthenticator;
use mxgate::config::AccountConfig;
use mxgate::{AccountStatus, Backend, Enqueuer, ListenerConfig, TrustLevel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queued {
    pub sender: String,
    pub recipients: Vec<String>,
    pub message: Vec<u8>,
}

#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<Vec<Queued>>,
}

impl MemoryQueue {
    pub fn messages(&self) -> Vec<Queued> {
        self.messages.lock().unwrap().clone()
    }
}

impl Enqueuer for MemoryQueue {
    fn enqueue(&self, sender: &str, recipients: &[String], message: &[u8]) -> anyhow::Result<String> {
        let mut messages = self.messages.lock().unwrap();
        messages.push(Queued {
            sender: sender.to_string(),
            recipients: recipients.to_vec(),
            message: message.to_vec(),
        });
        Ok(format!("msg-{}", messages.len()))
    }
}

pub fn accounts() -> StaticAuthenticator {
    StaticAuthenticator::from_config(&[
        AccountConfig {
            username: "alice@example.com".into(),
            password: "secret".into(),
            status: AccountStatus::Active,
        },
        AccountConfig {
            username: "mallory@example.com".into(),
            password: "secret".into(),
            status: AccountStatus::Disabled,
        },
    ])
}

pub fn backend(queue: &Arc<MemoryQueue>) -> Backend {
    Backend::new(Arc::new(accounts()), queue.clone())
}

pub fn listener(trust_level: TrustLevel) -> ListenerConfig {
    let mut config = ListenerConfig::new(trust_level, 0);
    config.address = "127.0.0.1".to_string();
    config.hostname = "mx.test".to_string();
    config.read_timeout = Duration::from_secs(5);
    config.write_timeout = Duration::from_secs(5);
    config
}

pub fn plain_credentials(username: &str, password: &str) -> String {
    STANDARD.encode(format!("\0{}\0{}", username, password))
}

/// Line-oriented SMTP client used to drive the listeners.
pub struct Client<S> {
    stream: BufReader<S>,
}

impl Client<TcpStream> {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        Client::new(TcpStream::connect(addr).await.unwrap())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// Reads one complete, possibly multi-line, reply. Empty on EOF.
    pub async fn reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(Duration::from_secs(10), self.stream.read_line(&mut line))
                .await
                .expect("reply timed out")
                .unwrap();
            if read == 0 {
                return reply;
            }
            reply.push_str(&line);
            if line.as_bytes().get(3) != Some(&b'-') {
                return reply;
            }
        }
    }

    pub async fn send(&mut self, data: &str) {
        let stream = self.stream.get_mut();
        stream.write_all(data.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
    }

    pub async fn command(&mut self, line: &str) -> String {
        self.send(&format!("{}\r\n", line)).await;
        self.reply().await
    }
}
