//! Broker socket server.
//!
//! Accepts connections on a Unix domain socket (and optionally a TCP
//! address), running one [`serve_connection`] task per client. A sweeper
//! task drives ack timeouts and redelivery backoff on a fixed interval.

use crate::{serve_connection, Broker, IpcError, IpcResult};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Broker server listening on a Unix domain socket.
pub struct BrokerServer {
    socket_path: PathBuf,
    tcp_addr: Option<String>,
    broker: Arc<Broker>,
    sweep_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl BrokerServer {
    /// Create a new server for `broker` bound at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>, broker: Arc<Broker>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            socket_path: socket_path.into(),
            tcp_addr: None,
            broker,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            shutdown_tx,
        }
    }

    /// Also accept connections on a TCP address.
    pub fn with_tcp(mut self, addr: &str) -> Self {
        self.tcp_addr = Some(addr.to_string());
        self
    }

    /// Interval between timeout/backoff sweeps.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Get a shutdown sender (for signal handlers that need to trigger shutdown).
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Trigger shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Start the server and serve until shutdown.
    ///
    /// Returns [`IpcError::Fatal`] if the stream store reported corruption.
    pub async fn run(&self) -> IpcResult<()> {
        // Remove a stale socket left by a previous run
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let unix = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "Broker listening");

        let tcp = match &self.tcp_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| IpcError::Socket(format!("Failed to bind {}: {}", addr, e)))?;
                info!(addr = %listener.local_addr()?, "Broker listening on TCP");
                Some(listener)
            }
            None => None,
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut fatal_rx = self.broker.subscribe_fatal();
        let sweeper = tokio::spawn(run_sweeper(
            self.broker.clone(),
            self.sweep_interval,
            self.shutdown_tx.subscribe(),
        ));
        let mut connections = JoinSet::new();

        let fatal = loop {
            tokio::select! {
                accepted = unix.accept() => match accepted {
                    Ok((stream, _)) => {
                        self.spawn_connection(&mut connections, stream);
                    }
                    Err(e) => error!(error = %e, "Accept error"),
                },
                accepted = accept_tcp(tcp.as_ref()) => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "TCP client connected");
                        let _ = stream.set_nodelay(true);
                        self.spawn_connection(&mut connections, stream);
                    }
                    Err(e) => error!(error = %e, "TCP accept error"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Connection task failed");
                    }
                }
                reason = fatal_rx.recv() => {
                    let reason = match reason {
                        Ok(reason) => reason,
                        Err(e) => e.to_string(),
                    };
                    break Some(reason);
                }
                _ = shutdown_rx.recv() => {
                    info!("Broker shutting down");
                    break None;
                }
            }
        };

        // Close every connection so inflight envelopes are requeued
        let _ = self.shutdown_tx.send(());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "Aborting connections after grace period");
            connections.abort_all();
        }
        sweeper.abort();

        let _ = std::fs::remove_file(&self.socket_path);

        match fatal {
            Some(reason) => Err(IpcError::Fatal(reason)),
            None => Ok(()),
        }
    }

    fn spawn_connection<S>(&self, connections: &mut JoinSet<()>, stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let broker = self.broker.clone();
        let shutdown = self.shutdown_tx.subscribe();
        connections.spawn(async move {
            if let Err(e) = serve_connection(stream, broker, shutdown).await {
                error!(error = %e, "Connection error");
            }
        });
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Periodically requeue timed-out envelopes, release backoff holds and
/// hand off dead letters.
async fn run_sweeper(broker: Arc<Broker>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match broker.sweep(Instant::now()).await {
                    Ok(0) => {}
                    Ok(requeued) => debug!(requeued, "Sweep requeued timed-out envelopes"),
                    Err(e) => {
                        broker.report_fatal(&e);
                        break;
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
