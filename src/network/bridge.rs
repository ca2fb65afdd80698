use crate::network::endpoint::RelayTarget;
use crate::network::error::{ErrorKind, RelayError, TransportError};
use crate::network::session::SessionConfig;
use crate::network::stream::{RelayStream, MAX_WRITE_SIZE, MIN_READ_SIZE};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

/// How long relay data is still forwarded after a client half-closes.
pub const HALF_CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Decides which local clients may use the tunnel.
pub trait AcceptPolicy: Send + Sync {
    fn accept(&self, peer: &SocketAddr) -> bool;
}

pub struct AllowAll;

impl AcceptPolicy for AllowAll {
    fn accept(&self, _: &SocketAddr) -> bool {
        true
    }
}

/// Accept loopback clients only.
pub struct LoopbackOnly;

impl AcceptPolicy for LoopbackOnly {
    fn accept(&self, peer: &SocketAddr) -> bool {
        peer.ip().is_loopback()
    }
}

/// Accept clients from a fixed set of addresses.
pub struct AllowList(pub Vec<IpAddr>);

impl AcceptPolicy for AllowList {
    fn accept(&self, peer: &SocketAddr) -> bool {
        self.0.contains(&peer.ip())
    }
}

/// Notifications about bridged clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    ClientConnected {
        client_id: usize,
        peer: SocketAddr,
    },
    ClientRejected {
        peer: SocketAddr,
    },
    ClientDisconnected {
        client_id: usize,
        bytes_sent: u64,
        bytes_received: u64,
    },
    ClientFailed {
        client_id: usize,
        error: String,
        kind: Option<ErrorKind>,
    },
}

/// Totals across all clients of a bridge.
#[derive(Debug, Default)]
pub struct BridgeStatistics {
    accepted: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    active: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl BridgeStatistics {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Bytes sent from local clients to the relay
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes received from the relay and passed to local clients
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// Forwards local TCP clients through relay streams.
pub struct Bridge {
    listener: TcpListener,
    target: Arc<dyn RelayTarget>,
    session_config: SessionConfig,
    policy: Arc<dyn AcceptPolicy>,
    events: Option<mpsc::UnboundedSender<BridgeEvent>>,
    statistics: Arc<BridgeStatistics>,
}

impl Bridge {
    pub async fn bind(addr: &str, target: Arc<dyn RelayTarget>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind bridge to address: {}", addr))?;

        info!("Bridge listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            target,
            session_config: SessionConfig::default(),
            policy: Arc::new(LoopbackOnly),
            events: None,
            statistics: Arc::new(BridgeStatistics::default()),
        })
    }

    pub fn with_policy(mut self, policy: Arc<dyn AcceptPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Report client lifecycle events on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<BridgeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read bridge address")
    }

    pub fn statistics(&self) -> Arc<BridgeStatistics> {
        Arc::clone(&self.statistics)
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept clients until `shutdown` completes, then abort active clients.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut active_clients: HashMap<usize, JoinHandle<()>> = HashMap::new();
        let mut client_counter = 0usize;

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept client: {}", e);
                    continue;
                }
            };

            if !self.policy.accept(&peer) {
                warn!("Rejecting client from {}", peer);
                self.statistics.rejected.fetch_add(1, Ordering::Relaxed);
                self.emit(BridgeEvent::ClientRejected { peer });
                continue;
            }

            client_counter += 1;
            let client_id = client_counter;
            info!("Accepted client {} from {}", client_id, peer);
            self.statistics.accepted.fetch_add(1, Ordering::Relaxed);
            self.emit(BridgeEvent::ClientConnected { client_id, peer });

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for client {}: {}", client_id, e);
            }

            let relay = Arc::new(RelayStream::with_config(
                Arc::clone(&self.target),
                self.session_config,
            ));
            let events = self.events.clone();
            let statistics = Arc::clone(&self.statistics);

            let handle = task::spawn(async move {
                Self::handle_client(stream, relay, client_id, events, statistics).await;
            });
            active_clients.insert(client_id, handle);

            active_clients.retain(|id, handle| {
                if handle.is_finished() {
                    debug!("Cleaning up finished client {}", id);
                    false
                } else {
                    true
                }
            });
        }

        info!(
            "Bridge shutting down, aborting {} active clients",
            active_clients.len()
        );
        for (_, handle) in active_clients {
            handle.abort();
        }
        Ok(())
    }

    fn emit(&self, event: BridgeEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    #[instrument(skip(stream, relay, events, statistics), fields(client_id = client_id))]
    async fn handle_client(
        stream: tokio::net::TcpStream,
        relay: Arc<RelayStream>,
        client_id: usize,
        events: Option<mpsc::UnboundedSender<BridgeEvent>>,
        statistics: Arc<BridgeStatistics>,
    ) {
        statistics.active.fetch_add(1, Ordering::Relaxed);
        let result = pump(stream, Arc::clone(&relay)).await;
        statistics.active.fetch_sub(1, Ordering::Relaxed);
        statistics
            .bytes_sent
            .fetch_add(relay.bytes_sent(), Ordering::Relaxed);
        statistics
            .bytes_received
            .fetch_add(relay.bytes_received(), Ordering::Relaxed);

        let event = match result {
            Ok(()) => {
                info!("Client {} disconnected ({})", client_id, relay);
                BridgeEvent::ClientDisconnected {
                    client_id,
                    bytes_sent: relay.bytes_sent(),
                    bytes_received: relay.bytes_received(),
                }
            }
            Err(e) => {
                error!("Client {} failed: {}", client_id, e);
                statistics.failed.fetch_add(1, Ordering::Relaxed);
                BridgeEvent::ClientFailed {
                    client_id,
                    error: e.to_string(),
                    kind: Some(e.kind()),
                }
            }
        };

        if let Some(events) = events {
            let _ = events.send(event);
        }
    }
}

async fn client_to_relay<R>(mut client: R, relay: &RelayStream) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; MAX_WRITE_SIZE];
    loop {
        let n = client.read(&mut buffer).await.map_err(TransportError::Io)?;
        if n == 0 {
            debug!("Client closed its side");
            return Ok(());
        }
        relay.write_all(&buffer[..n]).await?;
    }
}

async fn relay_to_client<W>(mut client: W, relay: &RelayStream) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; MIN_READ_SIZE];
    loop {
        let n = relay.read(&mut buffer).await?;
        if n == 0 {
            debug!("Relay closed the stream");
            let _ = client.shutdown().await;
            return Ok(());
        }
        client
            .write_all(&buffer[..n])
            .await
            .map_err(TransportError::Io)?;
    }
}

/// Copy bytes between `client` and `relay` until either side closes or
/// fails, then close the relay stream.
///
/// After the client closes its sending side, data from the relay is still
/// forwarded for up to [`HALF_CLOSE_LINGER`].
pub async fn pump<S>(client: S, relay: Arc<RelayStream>) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (reader, writer) = tokio::io::split(client);
    let downstream = relay_to_client(writer, &relay);
    tokio::pin!(downstream);

    let result = tokio::select! {
        result = client_to_relay(reader, &relay) => match result {
            Ok(()) => match tokio::time::timeout(HALF_CLOSE_LINGER, &mut downstream).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Relay still open {:?} after client EOF", HALF_CLOSE_LINGER);
                    Ok(())
                }
            },
            Err(e) => Err(e),
        },
        result = &mut downstream => result,
    };

    relay.close().await;
    result
}

/// Expose `relay` as an in-process `AsyncRead + AsyncWrite` stream.
///
/// Bytes written to the returned stream go to the relay and vice versa.
/// Dropping the returned stream closes the relay stream.
pub fn relay_io(relay: Arc<RelayStream>) -> DuplexStream {
    let (local, remote) = tokio::io::duplex(4 * MAX_WRITE_SIZE);
    task::spawn(async move {
        if let Err(e) = pump(remote, relay).await {
            debug!("Relay pump ended: {}", e);
        }
    });
    local
}
