//! The listener set: one accept loop per trust level, started together and
//! stopped together.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::anyhow;
use rustls::ServerConfig;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, info_span, warn, Instrument};

use crate::backend::Backend;
use crate::config::{ListenerConfig, TrustLevel};
use crate::connection::{self, ConnectionContext};

/// Upper bound on any graceful shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listener set already started")]
    AlreadyStarted,
    #[error("listener set has been stopped")]
    Stopped,
    #[error("failed to bind {trust_level} listener on {addr}: {source}")]
    Bind {
        trust_level: TrustLevel,
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("listeners did not stop within {0:?}")]
    Timeout(Duration),
    #[error("{trust_level} listener failed: {reason}")]
    Listener { trust_level: TrustLevel, reason: String },
}

#[derive(Default)]
struct Running {
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<(TrustLevel, JoinHandle<anyhow::Result<()>>)>,
    local_addrs: Vec<(TrustLevel, SocketAddr)>,
}

pub struct ListenerSet {
    listeners: Vec<Arc<ListenerConfig>>,
    backend: Backend,
    tls: Option<TlsAcceptor>,
    lifecycle: StdMutex<Lifecycle>,
    running: Mutex<Running>,
}

impl ListenerSet {
    /// Builds the set. Without a TLS configuration the implicit TLS
    /// listener cannot serve anything and is left out.
    pub fn new(listeners: Vec<ListenerConfig>, backend: Backend, tls: Option<Arc<ServerConfig>>) -> Self {
        let listeners = listeners
            .into_iter()
            .filter(|listener| {
                if listener.trust_level.implicit_tls() && tls.is_none() {
                    warn!(port = listener.port, "no TLS configuration, smtps listener disabled");
                    return false;
                }
                true
            })
            .map(Arc::new)
            .collect();

        Self {
            listeners,
            backend,
            tls: tls.map(TlsAcceptor::from),
            lifecycle: StdMutex::new(Lifecycle::NotStarted),
            running: Mutex::new(Running::default()),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        *self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = lifecycle;
    }

    /// Bound addresses, available once started. Useful with port 0.
    pub async fn local_addrs(&self) -> Vec<(TrustLevel, SocketAddr)> {
        self.running.lock().await.local_addrs.clone()
    }

    pub async fn local_addr(&self, trust_level: TrustLevel) -> Option<SocketAddr> {
        self.running
            .lock()
            .await
            .local_addrs
            .iter()
            .find(|(level, _)| *level == trust_level)
            .map(|(_, addr)| *addr)
    }

    /// Binds every listener, then starts accepting on all of them. A bind
    /// failure aborts the whole start and nothing is left listening.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut running = self.running.lock().await;
        match self.lifecycle() {
            Lifecycle::NotStarted => {}
            Lifecycle::Running => return Err(ServerError::AlreadyStarted),
            Lifecycle::ShuttingDown | Lifecycle::Stopped => return Err(ServerError::Stopped),
        }

        let mut bound = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            let addr = listener.bind_addr();
            let bind_error = |source: std::io::Error| ServerError::Bind {
                trust_level: listener.trust_level,
                addr: addr.clone(),
                source,
            };
            let socket = TcpListener::bind(&addr).await.map_err(bind_error)?;
            let local_addr = socket.local_addr().map_err(bind_error)?;
            info!(trust_level = %listener.trust_level, address = %local_addr, "listening");
            bound.push((listener.clone(), socket, local_addr));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        for (listener, socket, local_addr) in bound {
            let trust_level = listener.trust_level;
            let ctx = ConnectionContext {
                tls: self.tls.clone(),
                backend: self.backend.clone(),
                shutdown: shutdown_rx.clone(),
                listener,
            };
            running.local_addrs.push((trust_level, local_addr));
            running.tasks.push((trust_level, tokio::spawn(supervise(socket, local_addr, ctx))));
        }
        running.shutdown_tx = Some(shutdown_tx);
        self.set_lifecycle(Lifecycle::Running);

        Ok(())
    }

    /// Graceful shutdown bounded by [`SHUTDOWN_TIMEOUT`].
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.shutdown_within(SHUTDOWN_TIMEOUT).await
    }

    /// Stops accepting on every listener, then waits for open connections
    /// to finish. Whatever is still running at the deadline is aborted and
    /// the call reports a timeout, also when the deadline had already
    /// passed on entry. Calling this before `start` or a second time does
    /// nothing.
    pub async fn shutdown_within(&self, limit: Duration) -> Result<(), ShutdownError> {
        let limit = limit.min(SHUTDOWN_TIMEOUT);
        let deadline = Instant::now() + limit;

        let mut tasks = {
            let mut running = self.running.lock().await;
            if self.lifecycle() != Lifecycle::Running {
                return Ok(());
            }
            self.set_lifecycle(Lifecycle::ShuttingDown);
            info!("shutting down listeners");

            // Every listener is told before any of them is waited on.
            if let Some(shutdown_tx) = running.shutdown_tx.take() {
                let _ = shutdown_tx.send(true);
            }
            std::mem::take(&mut running.tasks)
        };

        let drained = if Instant::now() >= deadline {
            None
        } else {
            tokio::time::timeout_at(deadline, drain(&mut tasks)).await.ok()
        };

        let result = match drained {
            Some(result) => result,
            None => {
                for (_, task) in &tasks {
                    task.abort();
                }
                warn!(timeout = ?limit, "shutdown timed out, remaining connections aborted");
                Err(ShutdownError::Timeout(limit))
            }
        };

        self.set_lifecycle(Lifecycle::Stopped);
        info!("listeners stopped");
        result
    }
}

/// Waits for every listener task, keeping the last failure.
async fn drain(tasks: &mut [(TrustLevel, JoinHandle<anyhow::Result<()>>)]) -> Result<(), ShutdownError> {
    let mut result = Ok(());
    for (trust_level, task) in tasks.iter_mut() {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(err) => Err(anyhow!("listener task failed: {err}")),
        };
        if let Err(err) = outcome {
            error!(trust_level = %trust_level, error = %err, "listener stopped with error");
            result = Err(ShutdownError::Listener {
                trust_level: *trust_level,
                reason: err.to_string(),
            });
        }
    }
    result
}

/// Accept loop of one listener. Returns once shutdown is requested and every
/// connection it spawned has finished.
async fn supervise(socket: TcpListener, local_addr: SocketAddr, ctx: ConnectionContext) -> anyhow::Result<()> {
    let trust_level = ctx.listener.trust_level;
    let port = local_addr.port();
    let mut shutdown = ctx.shutdown.clone();
    let mut connections = JoinSet::new();
    let mut failure = None;

    loop {
        tokio::select! {
            biased;
            _ = connection::shutdown_requested(&mut shutdown) => break,
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        error!(trust_level = %trust_level, "connection task panicked");
                        failure = Some(anyhow!("connection task panicked"));
                    }
                }
            }
            accepted = socket.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    let span = info_span!("smtp", %remote_addr, port);
                    connections.spawn(connection::handle(ctx.clone(), stream, remote_addr).instrument(span));
                }
                Err(err) => {
                    warn!(trust_level = %trust_level, error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    drop(socket);
    info!(trust_level = %trust_level, open_connections = connections.len(), "listener closed");

    while let Some(joined) = connections.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(trust_level = %trust_level, "connection task panicked");
                failure = Some(anyhow!("connection task panicked"));
            }
        }
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
