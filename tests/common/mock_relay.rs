//! Scripted relay connections for testing sessions and streams
//!
//! A [`MockNetworkStream`] replays inbound messages pushed by the test and
//! records everything written to it. A [`MockRelayTarget`] hands out
//! prepared streams for connect and reconnect calls and counts them.

use async_trait::async_trait;
use relay_tunnel::network::{NetworkStream, RelayError, RelayTarget, TransportError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const NORMAL_CLOSURE: u16 = 1000;

/// Something the mock relay sends to the client
#[derive(Debug, Clone)]
pub enum Inbound {
    Message(Vec<u8>),
    /// The relay closes the WebSocket with a code and reason.
    Close(u16, String),
}

pub struct MockNetworkStream {
    sender: mpsc::UnboundedSender<Inbound>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    written: Mutex<Vec<Vec<u8>>>,
    closed_tx: watch::Sender<bool>,
    closed: AtomicBool,
    server_close: Mutex<Option<(u16, String)>>,
    fail_writes: Mutex<Option<u16>>,
}

impl MockNetworkStream {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            written: Mutex::new(Vec::new()),
            closed_tx,
            closed: AtomicBool::new(false),
            server_close: Mutex::new(None),
            fail_writes: Mutex::new(None),
        })
    }

    /// A stream whose first message is CONNECT_SUCCESS_SID
    pub fn connected(sid: &str) -> Arc<Self> {
        let stream = Self::new();
        stream.push_message(super::sid_message(sid));
        stream
    }

    /// A stream whose first message is RECONNECT_SUCCESS_ACK
    pub fn reconnected(ack: u64) -> Arc<Self> {
        let stream = Self::new();
        stream.push_message(super::reconnect_ack_message(ack));
        stream
    }

    pub fn push_message(&self, message: Vec<u8>) {
        let _ = self.sender.send(Inbound::Message(message));
    }

    pub fn push_close(&self, code: u16, reason: &str) {
        let _ = self.sender.send(Inbound::Close(code, reason.to_string()));
    }

    /// Make every following write fail as if the relay closed with `code`
    pub fn fail_writes_with(&self, code: u16) {
        *self.fail_writes.lock().unwrap() = Some(code);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    /// Wait until at least `count` messages were written
    pub async fn wait_for_writes(&self, count: usize) -> Vec<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let written = self.written();
            if written.len() >= count {
                return written;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "Timed out waiting for {} writes, got {}",
                count,
                written.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Whether the client closed this stream
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn server_closed(&self) -> Option<(u16, String)> {
        self.server_close.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkStream for MockNetworkStream {
    async fn read(&self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ClosedByClient);
        }
        if let Some((code, reason)) = self.server_closed() {
            return Err(TransportError::ClosedByServer { code, reason });
        }

        let mut closed = self.closed_tx.subscribe();
        let mut receiver = self.receiver.lock().await;

        let inbound = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => {
                return Err(TransportError::ClosedByClient);
            }
            inbound = receiver.recv() => inbound,
        };

        match inbound {
            Some(Inbound::Message(message)) => {
                assert!(message.len() <= buffer.len(), "Message exceeds read buffer");
                buffer[..message.len()].copy_from_slice(&message);
                Ok(message.len())
            }
            Some(Inbound::Close(code, reason)) => {
                *self.server_close.lock().unwrap() = Some((code, reason.clone()));
                if code == NORMAL_CLOSURE {
                    Ok(0)
                } else {
                    Err(TransportError::ClosedByServer { code, reason })
                }
            }
            None => Err(TransportError::closed_by_server(1006u16, "channel closed")),
        }
    }

    async fn write(&self, buffer: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ClosedByClient);
        }
        if let Some((code, reason)) = self.server_closed() {
            return Err(TransportError::ClosedByServer { code, reason });
        }
        if let Some(code) = *self.fail_writes.lock().unwrap() {
            let reason = "write failed".to_string();
            *self.server_close.lock().unwrap() = Some((code, reason.clone()));
            return Err(TransportError::ClosedByServer { code, reason });
        }

        self.written.lock().unwrap().push(buffer.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
        Ok(())
    }
}

/// Relay target that hands out prepared streams.
#[derive(Default)]
pub struct MockRelayTarget {
    connects: Mutex<VecDeque<Arc<MockNetworkStream>>>,
    reconnects: Mutex<VecDeque<Arc<MockNetworkStream>>>,
    connect_calls: AtomicUsize,
    reconnect_calls: AtomicUsize,
    reconnect_args: Mutex<Vec<(String, u64)>>,
}

impl MockRelayTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_connect(&self, stream: Arc<MockNetworkStream>) {
        self.connects.lock().unwrap().push_back(stream);
    }

    pub fn add_reconnect(&self, stream: Arc<MockNetworkStream>) {
        self.reconnects.lock().unwrap().push_back(stream);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn reconnect_calls(&self) -> usize {
        self.reconnect_calls.load(Ordering::SeqCst)
    }

    pub fn reconnect_args(&self) -> Vec<(String, u64)> {
        self.reconnect_args.lock().unwrap().clone()
    }

    fn exhausted(kind: &str) -> RelayError {
        TransportError::WebSocket(format!("No scripted {} stream left", kind)).into()
    }
}

#[async_trait]
impl RelayTarget for MockRelayTarget {
    async fn connect(&self) -> Result<Arc<dyn NetworkStream>, RelayError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to race.
        tokio::task::yield_now().await;

        let stream = self.connects.lock().unwrap().pop_front();
        match stream {
            Some(stream) => Ok(stream),
            None => Err(Self::exhausted("connect")),
        }
    }

    async fn reconnect(
        &self,
        sid: &str,
        last_byte_consumed: u64,
    ) -> Result<Arc<dyn NetworkStream>, RelayError> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.reconnect_args
            .lock()
            .unwrap()
            .push((sid.to_string(), last_byte_consumed));
        tokio::task::yield_now().await;

        let stream = self.reconnects.lock().unwrap().pop_front();
        match stream {
            Some(stream) => Ok(stream),
            None => Err(Self::exhausted("reconnect")),
        }
    }
}
