//! Relay sessions
//!
//! A [`RelaySession`] owns the current connection to the relay and the
//! counters that describe how far each direction of the byte stream has
//! progressed. Connections are opened lazily, replaced after a break and
//! resumed by sid so that the byte stream seen by the backend has no gaps.
//!
//! All connection changes (connect, reconnect, disconnect, replay) happen
//! under one async lock. Reads and writes only clone the current connection
//! and run without holding it.

use crate::messages::wire::{self, MAX_MESSAGE_SIZE};
use crate::messages::{CloseCode, CloseDisposition, MessageTag};
use crate::network::endpoint::RelayTarget;
use crate::network::error::{RelayError, TransportError};
use crate::network::transport::NetworkStream;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

/// Default number of reconnects per operation (three attempts in total).
pub const DEFAULT_MAX_RECONNECTS: u32 = 2;

/// Default amount of data a reader consumes before it forces an ACK.
pub const DEFAULT_MAX_READ_DATA_PER_ACK: u64 = 1024 * 1024;

const NORMAL_CLOSURE: u16 = 1000;

/// Tunables for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_reconnects: u32,
    pub max_read_data_per_ack: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            max_read_data_per_ack: DEFAULT_MAX_READ_DATA_PER_ACK,
        }
    }
}

/// How a normal close by the server is reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Report end of stream (zero bytes).
    TreatAsEof,
    /// Report an error.
    TreatAsError,
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No connection has been opened yet.
    New,
    /// A connect or reconnect handshake is in progress.
    Connecting,
    Connected,
    /// The last connection broke or was dropped. The next operation reconnects.
    Disconnected,
    /// Closed by the client. Terminal.
    Closed,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionStatus::New,
            1 => SessionStatus::Connecting,
            2 => SessionStatus::Connected,
            3 => SessionStatus::Disconnected,
            _ => SessionStatus::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionStatus::New => 0,
            SessionStatus::Connecting => 1,
            SessionStatus::Connected => 2,
            SessionStatus::Disconnected => 3,
            SessionStatus::Closed => 4,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::New => "new",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Byte counters of a session. All values only ever grow.
#[derive(Debug, Default)]
pub struct SessionState {
    last_ack_received: AtomicU64,
    last_ack_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl SessionState {
    /// Highest cumulative ACK received from the relay
    pub fn last_ack_received(&self) -> u64 {
        self.last_ack_received.load(Ordering::Acquire)
    }

    /// Highest cumulative ACK sent to the relay
    pub fn last_ack_sent(&self) -> u64 {
        self.last_ack_sent.load(Ordering::Acquire)
    }

    /// Payload bytes received from the relay
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Acquire)
    }

    /// Payload bytes handed to the relay, including unacknowledged ones
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    /// Raise the received ACK. Returns the previous value.
    pub fn record_ack_received(&self, ack: u64) -> u64 {
        self.last_ack_received.fetch_max(ack, Ordering::AcqRel)
    }

    pub fn record_ack_sent(&self, ack: u64) {
        self.last_ack_sent.fetch_max(ack, Ordering::AcqRel);
    }

    pub fn add_bytes_received(&self, count: u64) -> u64 {
        self.bytes_received.fetch_add(count, Ordering::AcqRel) + count
    }

    /// Reserve `count` bytes of the outbound stream. Returns the sequence
    /// number of the first reserved byte.
    pub fn reserve_bytes_sent(&self, count: u64) -> u64 {
        self.bytes_sent.fetch_add(count, Ordering::AcqRel)
    }

    /// Whether received data has not been acknowledged yet
    pub fn ack_pending(&self) -> bool {
        self.bytes_received() > self.last_ack_sent()
    }

    /// Received bytes not yet covered by an ACK
    pub fn unacknowledged_received(&self) -> u64 {
        self.bytes_received().saturating_sub(self.last_ack_sent())
    }
}

/// One unit of work run against the current connection by
/// [`RelaySession::transact`]. Runs again on a fresh connection after a
/// transient break, so implementations must be safe to repeat.
#[async_trait]
pub trait RelayIo: Send {
    async fn run(&mut self, connection: &Arc<dyn NetworkStream>) -> Result<usize, RelayError>;
}

/// Re-sends unacknowledged data on a newly established connection.
#[async_trait]
pub trait Replay: Send + Sync {
    async fn resend(
        &self,
        connection: &dyn NetworkStream,
        last_ack_received: u64,
    ) -> Result<(), RelayError>;
}

/// Replay for sessions that never send data, such as probes.
pub struct NoReplay;

#[async_trait]
impl Replay for NoReplay {
    async fn resend(&self, _: &dyn NetworkStream, _: u64) -> Result<(), RelayError> {
        Ok(())
    }
}

/// A resumable session with the relay.
pub struct RelaySession {
    target: Arc<dyn RelayTarget>,
    config: SessionConfig,
    connection: Mutex<Option<Arc<dyn NetworkStream>>>,
    sid: std::sync::Mutex<Option<String>>,
    state: SessionState,
    status: AtomicU8,
    stale: AtomicBool,
    closed: AtomicBool,
}

impl RelaySession {
    pub fn new(target: Arc<dyn RelayTarget>) -> Self {
        Self::with_config(target, SessionConfig::default())
    }

    pub fn with_config(target: Arc<dyn RelayTarget>, config: SessionConfig) -> Self {
        Self {
            target,
            config,
            connection: Mutex::new(None),
            sid: std::sync::Mutex::new(None),
            state: SessionState::default(),
            status: AtomicU8::new(SessionStatus::New.as_u8()),
            stale: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Session id assigned by the relay. Kept across disconnects.
    pub fn sid(&self) -> Option<String> {
        self.sid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_status(&self, status: SessionStatus) {
        if !self.is_closed() || status == SessionStatus::Closed {
            self.status.store(status.as_u8(), Ordering::Release);
        }
    }

    fn set_sid(&self, sid: String) {
        *self
            .sid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sid);
    }

    /// Flag the current connection as unusable. The next call to
    /// [`get_connection`](Self::get_connection) replaces it.
    ///
    /// Used when a write was interrupted part-way and the connection may
    /// carry a truncated message.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Return the current connection, establishing or resuming one if needed.
    ///
    /// A new connection is only stored once its handshake and the replay of
    /// unacknowledged data have completed.
    pub async fn get_connection(
        &self,
        replay: &dyn Replay,
    ) -> Result<Arc<dyn NetworkStream>, RelayError> {
        if self.is_closed() {
            return Err(TransportError::ClosedByClient.into());
        }

        let mut guard = self.connection.lock().await;

        if self.is_closed() {
            return Err(TransportError::ClosedByClient.into());
        }

        if self.stale.swap(false, Ordering::AcqRel) {
            if let Some(connection) = guard.take() {
                debug!(session = %self, "Replacing stale connection");
                close_quietly(connection.as_ref()).await;
            }
        }

        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }

        let handshake = Handshake::begin(self);
        // Once the relay has assigned a sid the session is only ever resumed.
        let result = match self.sid() {
            None => self.connect(replay).await,
            Some(sid) => self.reconnect(sid, replay).await,
        };

        match result {
            Ok(connection) => {
                *guard = Some(connection.clone());
                handshake.finish(SessionStatus::Connected);
                Ok(connection)
            }
            Err(e) => {
                handshake.finish(SessionStatus::Disconnected);
                Err(e)
            }
        }
    }

    #[instrument(level = "debug", skip_all)]
    async fn connect(&self, replay: &dyn Replay) -> Result<Arc<dyn NetworkStream>, RelayError> {
        let connection = self.target.connect().await?;

        match self.await_connect_success(connection.as_ref()).await {
            Ok(sid) => {
                info!(sid = %sid_prefix(&sid), "Connected to relay");
                self.set_sid(sid);
            }
            Err(e) => {
                close_quietly(connection.as_ref()).await;
                return Err(e);
            }
        }

        // Writes queued before the relay assigned a sid go out now.
        if let Err(e) = replay.resend(connection.as_ref(), 0).await {
            close_quietly(connection.as_ref()).await;
            return Err(e);
        }
        Ok(connection)
    }

    #[instrument(level = "debug", skip_all)]
    async fn reconnect(
        &self,
        sid: String,
        replay: &dyn Replay,
    ) -> Result<Arc<dyn NetworkStream>, RelayError> {
        let last_byte_consumed = self.state.bytes_received();

        let connection = self.target.reconnect(&sid, last_byte_consumed).await?;

        let ack = match self.await_reconnect_success(connection.as_ref()).await {
            Ok(ack) => ack,
            Err(e) => {
                close_quietly(connection.as_ref()).await;
                return Err(e);
            }
        };

        let previous = self.state.record_ack_received(ack);
        if ack < previous {
            warn!(ack, previous, "Relay acknowledged less data than before");
        }
        // The reconnect request carried our consumed position.
        self.state.record_ack_sent(last_byte_consumed);

        info!(session = %self, ack, "Reconnected to relay");

        if let Err(e) = replay
            .resend(connection.as_ref(), self.state.last_ack_received())
            .await
        {
            close_quietly(connection.as_ref()).await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Read one handshake message. A normal close yields `ClosedByServer`
    /// with code 1000.
    async fn read_handshake_message<'a>(
        &self,
        connection: &dyn NetworkStream,
        buffer: &'a mut [u8],
    ) -> Result<(MessageTag, &'a [u8]), RelayError> {
        let n = connection.read(buffer).await?;
        if n == 0 {
            return Err(TransportError::closed_by_server(
                NORMAL_CLOSURE,
                "The connection was closed during the handshake",
            )
            .into());
        }
        if n < wire::TAG_LENGTH {
            return Err(RelayError::ProtocolViolation(format!(
                "Received a {} byte message during the handshake",
                n
            )));
        }
        let message = &buffer[..n];
        let (tag, _) = wire::decode_tag(message)?;
        Ok((tag, message))
    }

    async fn await_connect_success(
        &self,
        connection: &dyn NetworkStream,
    ) -> Result<String, RelayError> {
        let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            let (tag, message) = self.read_handshake_message(connection, &mut buffer).await?;
            match tag {
                MessageTag::ConnectSuccessSid => {
                    let (sid, _) = wire::decode_connect_success_sid(message)?;
                    return Ok(sid);
                }
                other => {
                    debug!(tag = %other, "Ignoring message while waiting for CONNECT_SUCCESS_SID");
                }
            }
        }
    }

    async fn await_reconnect_success(
        &self,
        connection: &dyn NetworkStream,
    ) -> Result<u64, RelayError> {
        let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            let (tag, message) = self.read_handshake_message(connection, &mut buffer).await?;
            match tag {
                MessageTag::ReconnectSuccessAck => {
                    let (ack, _) = wire::decode_reconnect_ack(message)?;
                    let sent = self.state.bytes_sent();
                    if ack > sent {
                        return Err(RelayError::ProtocolViolation(format!(
                            "Relay acknowledged {} bytes but only {} were sent",
                            ack, sent
                        )));
                    }
                    return Ok(ack);
                }
                MessageTag::ConnectSuccessSid => {
                    return Err(RelayError::ProtocolViolation(
                        "Received CONNECT_SUCCESS_SID while resuming a session".into(),
                    ));
                }
                other => {
                    debug!(tag = %other, "Ignoring message while waiting for RECONNECT_SUCCESS_ACK");
                }
            }
        }
    }

    /// Close and drop the current connection. The sid is kept so the next
    /// operation resumes the session.
    pub async fn disconnect(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            close_quietly(connection.as_ref()).await;
            self.set_status(SessionStatus::Disconnected);
        }
    }

    /// Disconnect only if `connection` is still the current connection.
    ///
    /// Returns `false` if another task already replaced it.
    pub async fn disconnect_if_current(&self, connection: &Arc<dyn NetworkStream>) -> bool {
        let mut guard = self.connection.lock().await;
        let is_current = guard
            .as_ref()
            .map(|current| Arc::ptr_eq(current, connection))
            .unwrap_or(false);
        if is_current {
            if let Some(current) = guard.take() {
                close_quietly(current.as_ref()).await;
            }
            self.set_status(SessionStatus::Disconnected);
        }
        is_current
    }

    /// Close the session for good. Pending and later operations fail with
    /// [`TransportError::ClosedByClient`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_status(SessionStatus::Closed);

        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            close_quietly(connection.as_ref()).await;
        }
        debug!(session = %self, "Session closed");
    }

    /// Run `io` against the current connection, reconnecting after
    /// transient breaks.
    ///
    /// Server closes are classified by close code: normal closes follow
    /// `policy`, denials and invalid sessions fail at once, everything else
    /// is retried up to `max_reconnects` times.
    pub async fn transact<I>(
        &self,
        io: &mut I,
        replay: &dyn Replay,
        policy: ClosePolicy,
    ) -> Result<usize, RelayError>
    where
        I: RelayIo + ?Sized,
    {
        let mut attempt: u32 = 0;
        loop {
            let mut used = None;
            let result = match self.get_connection(replay).await {
                Ok(connection) => {
                    let result = io.run(&connection).await;
                    used = Some(connection);
                    result
                }
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(n) => return Ok(n),
                Err(e) => e,
            };

            let source = match error {
                RelayError::Transport(TransportError::ClosedByClient) => {
                    if self.is_closed() {
                        return Err(error);
                    }
                    // Another task replaced the connection underneath us.
                    trace!(session = %self, "Connection was replaced, retrying");
                    TransportError::ClosedByClient
                }
                RelayError::Transport(TransportError::ClosedByServer { code, reason }) => {
                    match CloseCode::from_u16(code).disposition() {
                        CloseDisposition::EndOfStream => {
                            debug!(session = %self, code, "Connection closed by server");
                            return match policy {
                                ClosePolicy::TreatAsEof => Ok(0),
                                ClosePolicy::TreatAsError => {
                                    Err(TransportError::ClosedByServer { code, reason }.into())
                                }
                            };
                        }
                        CloseDisposition::AccessDenied => {
                            return Err(RelayError::AccessDenied(reason));
                        }
                        CloseDisposition::SessionInvalid => {
                            return Err(RelayError::ReconnectFailed(reason));
                        }
                        CloseDisposition::BackendUnreachable => {
                            return Err(RelayError::BackendConnectFailed(reason));
                        }
                        CloseDisposition::BackendNotFound => {
                            return Err(RelayError::BackendNotFound(reason));
                        }
                        CloseDisposition::Transient => {
                            TransportError::ClosedByServer { code, reason }
                        }
                    }
                }
                other => return Err(other),
            };

            if attempt >= self.config.max_reconnects {
                warn!(session = %self, attempts = attempt + 1, "Giving up on connection");
                return Err(RelayError::ConnectionFailed {
                    attempts: attempt + 1,
                    source,
                });
            }
            attempt += 1;

            info!(session = %self, attempt, error = %source, "Connection broken, reconnecting");
            if let Some(connection) = used {
                self.disconnect_if_current(&connection).await;
            }
        }
    }
}

impl fmt::Display for RelaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sid = self.sid();
        write!(
            f,
            "{} [AR={} AS={} TR={} TX={}]",
            sid.as_deref().map(sid_prefix).unwrap_or("-"),
            self.state.last_ack_received(),
            self.state.last_ack_sent(),
            self.state.bytes_received(),
            self.state.bytes_sent(),
        )
    }
}

/// Holds the session in `Connecting` for the duration of a handshake.
///
/// A handshake future that is dropped before finishing leaves the session
/// `Disconnected`.
struct Handshake<'a> {
    session: &'a RelaySession,
    finished: bool,
}

impl<'a> Handshake<'a> {
    fn begin(session: &'a RelaySession) -> Self {
        session.set_status(SessionStatus::Connecting);
        Self {
            session,
            finished: false,
        }
    }

    fn finish(mut self, status: SessionStatus) {
        self.finished = true;
        self.session.set_status(status);
    }
}

impl Drop for Handshake<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Handshake cancelled");
            self.session.set_status(SessionStatus::Disconnected);
        }
    }
}

fn sid_prefix(sid: &str) -> &str {
    sid.get(..8).unwrap_or(sid)
}

async fn close_quietly(connection: &dyn NetworkStream) {
    if let Err(e) = connection.close().await {
        debug!(error = %e, "Ignoring error while closing connection");
    }
}
