use std::fmt;

/// Tag carried in the first two bytes of every relay message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Unused,
    ConnectSuccessSid,
    ReconnectSuccessAck,
    Deprecated,
    Data,
    Ack,
    LongClose,
    /// Any value this client does not know about. Receivers skip these.
    Unknown(u16),
}

impl MessageTag {
    /// Map a raw wire value to a tag
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => MessageTag::Unused,
            1 => MessageTag::ConnectSuccessSid,
            2 => MessageTag::ReconnectSuccessAck,
            3 => MessageTag::Deprecated,
            4 => MessageTag::Data,
            7 => MessageTag::Ack,
            10 => MessageTag::LongClose,
            other => MessageTag::Unknown(other),
        }
    }

    /// Raw wire value of this tag
    pub fn as_u16(self) -> u16 {
        match self {
            MessageTag::Unused => 0,
            MessageTag::ConnectSuccessSid => 1,
            MessageTag::ReconnectSuccessAck => 2,
            MessageTag::Deprecated => 3,
            MessageTag::Data => 4,
            MessageTag::Ack => 7,
            MessageTag::LongClose => 10,
            MessageTag::Unknown(value) => value,
        }
    }

    /// Get the message type as a string
    pub fn message_type(&self) -> &'static str {
        match self {
            MessageTag::Unused => "UNUSED",
            MessageTag::ConnectSuccessSid => "CONNECT_SUCCESS_SID",
            MessageTag::ReconnectSuccessAck => "RECONNECT_SUCCESS_ACK",
            MessageTag::Deprecated => "DEPRECATED",
            MessageTag::Data => "DATA",
            MessageTag::Ack => "ACK",
            MessageTag::LongClose => "LONG_CLOSE",
            MessageTag::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageTag::Unknown(value) => write!(f, "UNKNOWN({})", value),
            other => f.write_str(other.message_type()),
        }
    }
}

/// WebSocket close codes used by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    Normal,
    ErrorUnknown,
    SidUnknown,
    SidInUse,
    FailedToConnectToBackend,
    ReauthenticationRequired,
    BadAck,
    InvalidAck,
    InvalidWebSocketOpcode,
    InvalidTag,
    DestinationWriteFailed,
    DestinationReadFailed,
    InvalidData,
    NotAuthorized,
    LookupFailed,
    LookupFailedReconnect,
    FailedToRewind,
    Other(u16),
}

/// What a server-side close means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// The relay or the backend ended the stream deliberately.
    EndOfStream,
    /// The caller lacks permission to use the tunnel.
    AccessDenied,
    /// The relay will not resume this session.
    SessionInvalid,
    /// The relay could not open a connection to the backend.
    BackendUnreachable,
    /// The backend could not be resolved.
    BackendNotFound,
    /// Anything else: reconnect and try again.
    Transient,
}

impl CloseCode {
    /// Every code the relay documents, in numeric order.
    pub const DOCUMENTED: [CloseCode; 17] = [
        CloseCode::Normal,
        CloseCode::ErrorUnknown,
        CloseCode::SidUnknown,
        CloseCode::SidInUse,
        CloseCode::FailedToConnectToBackend,
        CloseCode::ReauthenticationRequired,
        CloseCode::BadAck,
        CloseCode::InvalidAck,
        CloseCode::InvalidWebSocketOpcode,
        CloseCode::InvalidTag,
        CloseCode::DestinationWriteFailed,
        CloseCode::DestinationReadFailed,
        CloseCode::InvalidData,
        CloseCode::NotAuthorized,
        CloseCode::LookupFailed,
        CloseCode::LookupFailedReconnect,
        CloseCode::FailedToRewind,
    ];

    pub fn from_u16(value: u16) -> Self {
        match value {
            1000 => CloseCode::Normal,
            4000 => CloseCode::ErrorUnknown,
            4001 => CloseCode::SidUnknown,
            4002 => CloseCode::SidInUse,
            4003 => CloseCode::FailedToConnectToBackend,
            4004 => CloseCode::ReauthenticationRequired,
            4005 => CloseCode::BadAck,
            4006 => CloseCode::InvalidAck,
            4007 => CloseCode::InvalidWebSocketOpcode,
            4008 => CloseCode::InvalidTag,
            4009 => CloseCode::DestinationWriteFailed,
            4010 => CloseCode::DestinationReadFailed,
            4013 => CloseCode::InvalidData,
            4033 => CloseCode::NotAuthorized,
            4047 => CloseCode::LookupFailed,
            4051 => CloseCode::LookupFailedReconnect,
            4074 => CloseCode::FailedToRewind,
            other => CloseCode::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::ErrorUnknown => 4000,
            CloseCode::SidUnknown => 4001,
            CloseCode::SidInUse => 4002,
            CloseCode::FailedToConnectToBackend => 4003,
            CloseCode::ReauthenticationRequired => 4004,
            CloseCode::BadAck => 4005,
            CloseCode::InvalidAck => 4006,
            CloseCode::InvalidWebSocketOpcode => 4007,
            CloseCode::InvalidTag => 4008,
            CloseCode::DestinationWriteFailed => 4009,
            CloseCode::DestinationReadFailed => 4010,
            CloseCode::InvalidData => 4013,
            CloseCode::NotAuthorized => 4033,
            CloseCode::LookupFailed => 4047,
            CloseCode::LookupFailedReconnect => 4051,
            CloseCode::FailedToRewind => 4074,
            CloseCode::Other(value) => value,
        }
    }

    /// Classify a close code. This table is the only place close codes are
    /// interpreted.
    pub fn disposition(self) -> CloseDisposition {
        match self {
            // DESTINATION_*_FAILED means the backend closed its side, not the relay.
            CloseCode::Normal
            | CloseCode::DestinationReadFailed
            | CloseCode::DestinationWriteFailed => CloseDisposition::EndOfStream,

            CloseCode::NotAuthorized => CloseDisposition::AccessDenied,

            CloseCode::SidUnknown | CloseCode::SidInUse | CloseCode::FailedToRewind => {
                CloseDisposition::SessionInvalid
            }

            CloseCode::FailedToConnectToBackend => CloseDisposition::BackendUnreachable,

            CloseCode::LookupFailed | CloseCode::LookupFailedReconnect => {
                CloseDisposition::BackendNotFound
            }

            CloseCode::ErrorUnknown
            | CloseCode::ReauthenticationRequired
            | CloseCode::BadAck
            | CloseCode::InvalidAck
            | CloseCode::InvalidWebSocketOpcode
            | CloseCode::InvalidTag
            | CloseCode::InvalidData
            | CloseCode::Other(_) => CloseDisposition::Transient,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        CloseCode::from_u16(value)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.as_u16())
    }
}
