//! Diameter error types

use std::time::Duration;

use thiserror::Error;

/// Diameter error type
#[derive(Error, Debug)]
pub enum DiameterError {
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Invalid AVP: {0}")]
    InvalidAvp(String),

    #[error("Missing mandatory AVP: {0}")]
    MissingAvp(String),

    #[error("Buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("No answer for hop-by-hop id {hop_by_hop_id:#010x} within {timeout:?}")]
    CorrelationTimeout { hop_by_hop_id: u32, timeout: Duration },

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("No application {application_id} registered for peer {peer}")]
    Routing { application_id: u32, peer: String },

    #[error("Dispatch queue full for application {0}")]
    Capacity(u32),

    #[error("Application {application_id} already registered on peer {peer}")]
    DuplicateApplication { application_id: u32, peer: String },

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Application {0} is already attached to a node")]
    AlreadyAttached(u32),

    #[error("Application {0} is not attached to a node")]
    NotAttached(u32),

    #[error("No peer became ready within {0:?}")]
    NotReady(Duration),

    #[error("Node shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DiameterError {
    /// Transport-level failures are the only ones recovered locally
    /// (reconnect for persistent peers).
    pub fn is_transport(&self) -> bool {
        matches!(self, DiameterError::Transport(_))
    }

    /// Malformed input or failed negotiation.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            DiameterError::InvalidMessage(_)
                | DiameterError::InvalidAvp(_)
                | DiameterError::MissingAvp(_)
                | DiameterError::BufferTooSmall { .. }
                | DiameterError::Protocol(_)
        )
    }
}

/// Diameter result type
pub type DiameterResult<T> = Result<T, DiameterError>;

/// Diameter Result-Code values (RFC 6733 Section 7.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode {
    MultiRoundAuth = 1001,

    Success = 2001,
    LimitedSuccess = 2002,

    CommandUnsupported = 3001,
    UnableToDeliver = 3002,
    RealmNotServed = 3003,
    TooBusy = 3004,
    LoopDetected = 3005,
    RedirectIndication = 3006,
    ApplicationUnsupported = 3007,
    InvalidHdrBits = 3008,
    InvalidAvpBits = 3009,
    UnknownPeer = 3010,

    AuthenticationRejected = 4001,
    OutOfSpace = 4002,
    ElectionLost = 4003,

    AvpUnsupported = 5001,
    UnknownSessionId = 5002,
    AuthorizationRejected = 5003,
    InvalidAvpValue = 5004,
    MissingAvp = 5005,
    ResourcesExceeded = 5006,
    NoCommonApplication = 5010,
    UnsupportedVersion = 5011,
    UnableToComply = 5012,
    InvalidMessageLength = 5015,
    NoCommonSecurity = 5017,
}

impl ResultCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Map a raw Result-Code; unknown values yield `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        let rc = match code {
            1001 => ResultCode::MultiRoundAuth,
            2001 => ResultCode::Success,
            2002 => ResultCode::LimitedSuccess,
            3001 => ResultCode::CommandUnsupported,
            3002 => ResultCode::UnableToDeliver,
            3003 => ResultCode::RealmNotServed,
            3004 => ResultCode::TooBusy,
            3005 => ResultCode::LoopDetected,
            3006 => ResultCode::RedirectIndication,
            3007 => ResultCode::ApplicationUnsupported,
            3008 => ResultCode::InvalidHdrBits,
            3009 => ResultCode::InvalidAvpBits,
            3010 => ResultCode::UnknownPeer,
            4001 => ResultCode::AuthenticationRejected,
            4002 => ResultCode::OutOfSpace,
            4003 => ResultCode::ElectionLost,
            5001 => ResultCode::AvpUnsupported,
            5002 => ResultCode::UnknownSessionId,
            5003 => ResultCode::AuthorizationRejected,
            5004 => ResultCode::InvalidAvpValue,
            5005 => ResultCode::MissingAvp,
            5006 => ResultCode::ResourcesExceeded,
            5010 => ResultCode::NoCommonApplication,
            5011 => ResultCode::UnsupportedVersion,
            5012 => ResultCode::UnableToComply,
            5015 => ResultCode::InvalidMessageLength,
            5017 => ResultCode::NoCommonSecurity,
            _ => return None,
        };
        Some(rc)
    }

    pub fn is_success(self) -> bool {
        is_success_code(self.code())
    }

    /// Protocol errors (3xxx) are sent with the E bit set.
    pub fn is_protocol_error(self) -> bool {
        (3000..4000).contains(&self.code())
    }

    pub fn is_transient_failure(self) -> bool {
        (4000..5000).contains(&self.code())
    }

    pub fn is_permanent_failure(self) -> bool {
        (5000..6000).contains(&self.code())
    }
}

impl From<ResultCode> for u32 {
    fn from(rc: ResultCode) -> u32 {
        rc as u32
    }
}

/// Success class check on a raw Result-Code value
pub fn is_success_code(code: u32) -> bool {
    (2000..3000).contains(&code)
}
