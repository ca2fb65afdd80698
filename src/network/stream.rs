//! Relay streams
//!
//! [`RelayStream`] turns a [`RelaySession`] into a reliable byte stream.
//! Every write is kept in an unacknowledged queue until the relay confirms
//! it, and is replayed on each new connection until then.

use crate::messages::wire::{self, MAX_ARRAY_LENGTH, MAX_MESSAGE_SIZE, TAG_LENGTH};
use crate::messages::MessageTag;
use crate::network::endpoint::RelayTarget;
use crate::network::error::{RelayError, TransportError};
use crate::network::session::{
    ClosePolicy, NoReplay, RelayIo, RelaySession, Replay, SessionConfig, SessionState,
};
use crate::network::transport::NetworkStream;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace, warn};

/// Largest payload a single write accepts.
pub const MAX_WRITE_SIZE: usize = MAX_ARRAY_LENGTH;

/// Smallest buffer a read accepts. Any DATA message fits.
pub const MIN_READ_SIZE: usize = MAX_ARRAY_LENGTH;

const NORMAL_CLOSURE: u16 = 1000;

/// A DATA message the relay has not acknowledged yet.
#[derive(Debug, Clone)]
pub struct UnacknowledgedWrite {
    /// Encoded message, replayed byte-for-byte.
    pub data: Vec<u8>,
    /// Stream offset of the first payload byte.
    pub sequence_number: u64,
    /// ACK value that confirms the whole payload.
    pub expected_ack: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<UnacknowledgedWrite>,
    // Bumped by every replay. Lets a writer tell whether a replay already
    // re-sent its message.
    replay_epoch: u64,
}

/// FIFO of unacknowledged writes, ordered by sequence number.
#[derive(Debug, Default)]
pub struct UnackedQueue {
    state: Mutex<QueueState>,
}

impl UnackedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve sequence space for `message` and queue it. Returns the entry's
    /// sequence number and the current replay epoch.
    async fn enqueue(
        &self,
        session: &SessionState,
        message: Vec<u8>,
        payload_len: usize,
    ) -> (u64, u64) {
        let mut state = self.state.lock().await;
        let sequence_number = session.reserve_bytes_sent(payload_len as u64);
        state.entries.push_back(UnacknowledgedWrite {
            data: message,
            sequence_number,
            expected_ack: sequence_number + payload_len as u64,
        });
        (sequence_number, state.replay_epoch)
    }

    async fn replay_epoch(&self) -> u64 {
        self.state.lock().await.replay_epoch
    }

    /// Drop every entry confirmed by `ack`. Returns the number removed.
    pub async fn acknowledge(&self, ack: u64) -> usize {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        while state
            .entries
            .front()
            .map(|entry| entry.expected_ack <= ack)
            .unwrap_or(false)
        {
            state.entries.pop_front();
        }
        before - state.entries.len()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Expected ACK of the oldest outstanding write
    pub async fn oldest_expected_ack(&self) -> Option<u64> {
        self.state
            .lock()
            .await
            .entries
            .front()
            .map(|entry| entry.expected_ack)
    }
}

#[async_trait]
impl Replay for UnackedQueue {
    async fn resend(
        &self,
        connection: &dyn NetworkStream,
        last_ack_received: u64,
    ) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        state.replay_epoch += 1;

        while state
            .entries
            .front()
            .map(|entry| entry.expected_ack <= last_ack_received)
            .unwrap_or(false)
        {
            state.entries.pop_front();
        }

        if !state.entries.is_empty() {
            debug!(
                count = state.entries.len(),
                last_ack_received, "Replaying unacknowledged writes"
            );
        }

        // Entries stay queued until acknowledged; this connection may break too.
        for entry in state.entries.iter() {
            trace!(
                sequence_number = entry.sequence_number,
                expected_ack = entry.expected_ack,
                "Replaying write"
            );
            connection.write(&entry.data).await?;
        }
        Ok(())
    }
}

/// Marks the session stale if dropped while a wire write is in progress.
struct InFlightGuard<'a> {
    session: &'a RelaySession,
    armed: bool,
}

impl<'a> InFlightGuard<'a> {
    fn arm(session: &'a RelaySession) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Write was interrupted, connection will be replaced");
            self.session.mark_stale();
        }
    }
}

/// Send an ACK if received data has not been acknowledged yet.
async fn flush_ack(
    session: &RelaySession,
    connection: &Arc<dyn NetworkStream>,
) -> Result<(), RelayError> {
    let state = session.state();
    if !state.ack_pending() {
        return Ok(());
    }

    let ack = state.bytes_received();
    let guard = InFlightGuard::arm(session);
    let result = connection.write(&wire::ack_message(ack)).await;
    guard.disarm();
    result?;

    state.record_ack_sent(ack);
    trace!(ack, "Sent ACK");
    Ok(())
}

struct AckIo<'a> {
    session: &'a RelaySession,
}

#[async_trait]
impl RelayIo for AckIo<'_> {
    async fn run(&mut self, connection: &Arc<dyn NetworkStream>) -> Result<usize, RelayError> {
        flush_ack(self.session, connection).await?;
        Ok(0)
    }
}

struct WriteIo<'a> {
    session: &'a RelaySession,
    queue: &'a UnackedQueue,
    message: Vec<u8>,
    payload_len: usize,
    // Replay epoch observed when the message was queued.
    queued_at: Option<u64>,
}

#[async_trait]
impl RelayIo for WriteIo<'_> {
    async fn run(&mut self, connection: &Arc<dyn NetworkStream>) -> Result<usize, RelayError> {
        flush_ack(self.session, connection).await?;

        match self.queued_at {
            None => {
                let (sequence_number, epoch) = self
                    .queue
                    .enqueue(self.session.state(), self.message.clone(), self.payload_len)
                    .await;
                self.queued_at = Some(epoch);
                trace!(sequence_number, length = self.payload_len, "Queued write");
            }
            Some(epoch) => {
                if self.queue.replay_epoch().await != epoch {
                    // A replay after queueing already re-sent the message.
                    return Ok(self.payload_len);
                }
            }
        }

        let guard = InFlightGuard::arm(self.session);
        let result = connection.write(&self.message).await;
        guard.disarm();
        result?;

        Ok(self.payload_len)
    }
}

struct ReadIo<'a> {
    session: &'a RelaySession,
    queue: &'a UnackedQueue,
    target: &'a mut [u8],
    message: Vec<u8>,
}

impl ReadIo<'_> {
    async fn handle_ack(&self, message: &[u8]) -> Result<(), RelayError> {
        let (ack, _) = wire::decode_ack(message)?;
        let state = self.session.state();
        let sent = state.bytes_sent();

        if ack == 0 || ack > sent {
            return Err(RelayError::ProtocolViolation(format!(
                "Received invalid ACK {} with {} bytes sent",
                ack, sent
            )));
        }

        state.record_ack_received(ack);
        let removed = self.queue.acknowledge(ack).await;
        trace!(ack, removed, "Received ACK");
        Ok(())
    }
}

#[async_trait]
impl RelayIo for ReadIo<'_> {
    async fn run(&mut self, connection: &Arc<dyn NetworkStream>) -> Result<usize, RelayError> {
        loop {
            let n = connection.read(&mut self.message).await?;
            if n == 0 {
                return Err(TransportError::closed_by_server(
                    NORMAL_CLOSURE,
                    "The relay closed the connection",
                )
                .into());
            }
            if n < TAG_LENGTH {
                return Err(RelayError::ProtocolViolation(format!(
                    "Received a {} byte message",
                    n
                )));
            }

            let message = &self.message[..n];
            let (tag, _) = wire::decode_tag(message)?;
            match tag {
                MessageTag::Data => {
                    let (length, consumed) = wire::decode_data(message, self.target)?;
                    if consumed != n {
                        return Err(RelayError::ProtocolViolation(format!(
                            "DATA message of {} bytes carries {} trailing bytes",
                            n,
                            n - consumed
                        )));
                    }
                    self.session.state().add_bytes_received(length as u64);
                    return Ok(length);
                }
                MessageTag::Ack => {
                    self.handle_ack(message).await?;
                }
                MessageTag::LongClose => {
                    let (close, _) = wire::decode_long_close(message)?;
                    debug!(code = close.code, reason = %close.reason, "Received LONG_CLOSE");
                }
                other => {
                    debug!(tag = %other, length = n, "Skipping message");
                }
            }
        }
    }
}

struct HandshakeIo;

#[async_trait]
impl RelayIo for HandshakeIo {
    async fn run(&mut self, _: &Arc<dyn NetworkStream>) -> Result<usize, RelayError> {
        Ok(0)
    }
}

/// Reliable byte stream over a relay session.
///
/// At most one read and one write run at a time; concurrent callers on the
/// same side wait for each other.
pub struct RelayStream {
    session: RelaySession,
    queue: UnackedQueue,
    reader: Mutex<()>,
    writer: Mutex<()>,
}

impl RelayStream {
    pub fn new(target: Arc<dyn RelayTarget>) -> Self {
        Self::with_config(target, SessionConfig::default())
    }

    pub fn with_config(target: Arc<dyn RelayTarget>, config: SessionConfig) -> Self {
        Self {
            session: RelaySession::with_config(target, config),
            queue: UnackedQueue::new(),
            reader: Mutex::new(()),
            writer: Mutex::new(()),
        }
    }

    pub fn session(&self) -> &RelaySession {
        &self.session
    }

    /// Connect (or reconnect) without transferring data
    pub async fn connect(&self) -> Result<(), RelayError> {
        self.session.get_connection(&self.queue).await.map(|_| ())
    }

    /// Write up to [`MAX_WRITE_SIZE`] bytes as one DATA message.
    ///
    /// A zero-length write only sends a pending ACK.
    #[instrument(level = "trace", skip_all, fields(length = buffer.len()))]
    pub async fn write(&self, buffer: &[u8]) -> Result<usize, RelayError> {
        if buffer.len() > MAX_WRITE_SIZE {
            return Err(RelayError::WriteTooLarge {
                size: buffer.len(),
                max: MAX_WRITE_SIZE,
            });
        }

        let _writer = self.writer.lock().await;

        if buffer.is_empty() {
            let mut io = AckIo {
                session: &self.session,
            };
            self.session
                .transact(&mut io, &self.queue, ClosePolicy::TreatAsError)
                .await?;
            return Ok(0);
        }

        let mut io = WriteIo {
            session: &self.session,
            queue: &self.queue,
            message: wire::data_message(buffer)?,
            payload_len: buffer.len(),
            queued_at: None,
        };
        self.session
            .transact(&mut io, &self.queue, ClosePolicy::TreatAsError)
            .await
    }

    /// Write all of `data`, split into chunks of at most [`MAX_WRITE_SIZE`].
    pub async fn write_all(&self, data: &[u8]) -> Result<(), RelayError> {
        for chunk in data.chunks(MAX_WRITE_SIZE) {
            self.write(chunk).await?;
        }
        Ok(())
    }

    /// Read the payload of the next DATA message into `buffer`.
    ///
    /// Returns 0 once the relay has closed the stream normally.
    pub async fn read(&self, buffer: &mut [u8]) -> Result<usize, RelayError> {
        self.read_with_policy(buffer, ClosePolicy::TreatAsEof).await
    }

    #[instrument(level = "trace", skip_all, fields(capacity = buffer.len()))]
    pub async fn read_with_policy(
        &self,
        buffer: &mut [u8],
        policy: ClosePolicy,
    ) -> Result<usize, RelayError> {
        if buffer.len() < MIN_READ_SIZE {
            return Err(RelayError::ReadBufferTooSmall {
                size: buffer.len(),
                min: MIN_READ_SIZE,
            });
        }

        let n = {
            let _reader = self.reader.lock().await;
            let mut io = ReadIo {
                session: &self.session,
                queue: &self.queue,
                target: buffer,
                message: vec![0u8; MAX_MESSAGE_SIZE],
            };
            self.session.transact(&mut io, &self.queue, policy).await?
        };

        let state = self.session.state();
        if n > 0 && state.unacknowledged_received() > self.session.config().max_read_data_per_ack {
            trace!(
                pending = state.unacknowledged_received(),
                "Forcing ACK after reading without writing"
            );
            self.write(&[]).await?;
        }

        Ok(n)
    }

    /// Close the stream. Pending and later operations fail.
    pub async fn close(&self) {
        self.session.close().await;
    }

    pub fn sid(&self) -> Option<String> {
        self.session.sid()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.session.state().bytes_sent()
    }

    pub fn bytes_received(&self) -> u64 {
        self.session.state().bytes_received()
    }

    pub async fn unacknowledged_count(&self) -> usize {
        self.queue.len().await
    }

    /// ACK value that would confirm the oldest outstanding write
    pub async fn expected_ack(&self) -> Option<u64> {
        self.queue.oldest_expected_ack().await
    }

    /// Check that the relay accepts a session for `target`, without
    /// transferring data.
    pub async fn probe(target: Arc<dyn RelayTarget>, timeout: Duration) -> Result<(), RelayError> {
        let session = RelaySession::new(target);
        let result = tokio::time::timeout(
            timeout,
            session.transact(&mut HandshakeIo, &NoReplay, ClosePolicy::TreatAsError),
        )
        .await;
        session.close().await;

        match result {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(RelayError::ProbeTimeout(timeout)),
        }
    }
}

impl fmt::Display for RelayStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.session, f)
    }
}
