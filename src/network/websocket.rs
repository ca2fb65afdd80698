//! WebSocket transport
//!
//! Adapts a `tokio-tungstenite` socket to [`NetworkStream`]. The socket is
//! split so that one task can block in `read` while another writes.

use crate::network::error::TransportError;
use crate::network::transport::{NetworkStream, ABNORMAL_CLOSURE};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io::ErrorKind as IoErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

const NORMAL_CLOSURE: u16 = 1000;

pub struct WebSocketTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    source: Mutex<SplitStream<WebSocketStream<S>>>,
    close_initiated: AtomicBool,
    closed_by_server: std::sync::Mutex<Option<(u16, String)>>,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an open WebSocket
    pub fn new(socket: WebSocketStream<S>) -> Self {
        let (sink, source) = socket.split();
        Self {
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            close_initiated: AtomicBool::new(false),
            closed_by_server: std::sync::Mutex::new(None),
        }
    }

    /// Whether `close` has been called
    pub fn is_close_initiated(&self) -> bool {
        self.close_initiated.load(Ordering::Acquire)
    }

    fn server_close(&self) -> Option<(u16, String)> {
        self.closed_by_server
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn verify_not_closed(&self) -> Result<(), TransportError> {
        if self.is_close_initiated() {
            return Err(TransportError::ClosedByClient);
        }
        if let Some((code, reason)) = self.server_close() {
            return Err(TransportError::ClosedByServer { code, reason });
        }
        Ok(())
    }

    fn record_server_close(&self, code: u16, reason: String) -> TransportError {
        let mut closed = self
            .closed_by_server
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if closed.is_none() {
            *closed = Some((code, reason.clone()));
        }
        TransportError::ClosedByServer { code, reason }
    }

    fn translate(&self, error: WsError) -> TransportError {
        match error {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                if self.is_close_initiated() {
                    TransportError::ClosedByClient
                } else {
                    self.record_server_close(ABNORMAL_CLOSURE, "The connection is closed".into())
                }
            }
            WsError::Io(e)
                if matches!(
                    e.kind(),
                    IoErrorKind::ConnectionReset
                        | IoErrorKind::ConnectionAborted
                        | IoErrorKind::BrokenPipe
                        | IoErrorKind::UnexpectedEof
                ) =>
            {
                debug!(error = %e, "WebSocket connection aborted");
                self.record_server_close(ABNORMAL_CLOSURE, e.to_string())
            }
            WsError::Io(e) => TransportError::Io(e),
            WsError::Protocol(e) => {
                debug!(error = %e, "WebSocket protocol error");
                self.record_server_close(ABNORMAL_CLOSURE, e.to_string())
            }
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

#[async_trait]
impl<S> NetworkStream for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        self.verify_not_closed()?;

        let mut source = self.source.lock().await;
        loop {
            let message = match source.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(self.translate(e)),
                None => {
                    return Err(self.record_server_close(
                        ABNORMAL_CLOSURE,
                        "The connection ended without a close frame".into(),
                    ))
                }
            };

            match message {
                Message::Binary(data) => {
                    if data.is_empty() {
                        continue;
                    }
                    if data.len() > buffer.len() {
                        return Err(TransportError::MessageTooLarge {
                            size: data.len(),
                            capacity: buffer.len(),
                        });
                    }
                    buffer[..data.len()].copy_from_slice(&data);
                    trace!(bytes = data.len(), "WebSocket message received");
                    return Ok(data.len());
                }
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((NORMAL_CLOSURE, String::new()));
                    debug!(code, reason = %reason, "Connection closed by server");

                    if self.is_close_initiated() {
                        return Err(TransportError::ClosedByClient);
                    }
                    let error = self.record_server_close(code, reason);
                    return if code == NORMAL_CLOSURE { Ok(0) } else { Err(error) };
                }
                Message::Text(text) => {
                    warn!(length = text.len(), "Ignoring unexpected text message");
                }
                _ => {}
            }
        }
    }

    async fn write(&self, buffer: &[u8]) -> Result<(), TransportError> {
        self.verify_not_closed()?;

        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(buffer.to_vec()))
            .await
            .map_err(|e| self.translate(e))?;
        trace!(bytes = buffer.len(), "WebSocket message sent");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.close_initiated.swap(true, Ordering::AcqRel) || self.server_close().is_some() {
            return Ok(());
        }

        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code: WsCloseCode::Normal,
            reason: "".into(),
        };
        match sink.send(Message::Close(Some(frame))).await {
            Ok(()) => Ok(()),
            // The peer may already be gone; nothing left to close.
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Protocol(_)) => Ok(()),
            Err(WsError::Io(e)) => {
                debug!(error = %e, "Ignoring IO error while closing");
                Ok(())
            }
            Err(e) => Err(TransportError::WebSocket(e.to_string())),
        }
    }
}
