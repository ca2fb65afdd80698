pub mod types;
pub mod wire;

pub use types::{CloseCode, CloseDisposition, MessageTag};
pub use wire::{
    // Codec types
    LongClose,
    WireProtocolError,

    // Wire protocol constants
    ACK_MESSAGE_LENGTH,
    DATA_HEADER_LENGTH,
    MAX_ARRAY_LENGTH,
    MAX_DATA_PAYLOAD_LENGTH,
    MAX_MESSAGE_SIZE,
    TAG_LENGTH,
};
