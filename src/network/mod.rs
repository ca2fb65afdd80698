pub mod bridge;
pub mod endpoint;
pub mod error;
pub mod session;
pub mod stream;
pub mod transport;
pub mod websocket;

pub use bridge::{
    pump, relay_io, AcceptPolicy, AllowAll, AllowList, Bridge, BridgeEvent, BridgeStatistics,
    LoopbackOnly,
};
pub use endpoint::{
    EndpointConfig, InstanceLocator, RelayEndpoint, RelayTarget, StaticToken, TokenSource,
};
pub use error::{ErrorKind, RelayError, TransportError};
pub use session::{
    ClosePolicy, NoReplay, RelayIo, RelaySession, Replay, SessionConfig, SessionState,
    SessionStatus,
};
pub use stream::{RelayStream, UnackedQueue, UnacknowledgedWrite, MAX_WRITE_SIZE, MIN_READ_SIZE};
pub use transport::NetworkStream;
pub use websocket::WebSocketTransport;
