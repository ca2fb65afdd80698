pub mod cli;
pub mod messages;
pub mod network;

// Re-export key types for easy testing
pub use messages::{CloseCode, MessageTag};
pub use network::{
    Bridge, InstanceLocator, NetworkStream, RelayEndpoint, RelayError, RelaySession, RelayStream,
    RelayTarget,
};
