//! Transport abstraction the relay session runs on.

use crate::network::error::TransportError;
use async_trait::async_trait;

/// Close code used when a connection drops without a closing handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// A message-oriented bidirectional connection.
///
/// Reads and writes may run concurrently from different tasks, so all
/// methods take `&self`. Every `write` sends exactly one message and every
/// successful `read` returns exactly one message.
#[async_trait]
pub trait NetworkStream: Send + Sync {
    /// Read one message into `buffer`.
    ///
    /// Returns `Ok(0)` when the peer closed the connection normally. Abnormal
    /// closes are reported as [`TransportError::ClosedByServer`].
    async fn read(&self, buffer: &mut [u8]) -> Result<usize, TransportError>;

    /// Send `buffer` as a single message.
    async fn write(&self, buffer: &[u8]) -> Result<(), TransportError>;

    /// Initiate a graceful close. Subsequent reads and writes fail with
    /// [`TransportError::ClosedByClient`].
    async fn close(&self) -> Result<(), TransportError>;
}

impl std::fmt::Debug for dyn NetworkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NetworkStream")
    }
}
