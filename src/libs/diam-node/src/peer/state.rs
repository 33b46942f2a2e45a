//! Peer connection state machine (RFC 6733 Section 5.6, reduced)
//!
//!   Closed  -> Connecting   (Connect)
//!   Closed  -> WaitCapabilitiesExchange (Accepted)
//!   Connecting -> WaitCapabilitiesExchange (TransportUp)
//!   Connecting -> Closed    (TransportFailed, Stop)
//!   WaitCapabilitiesExchange -> Open   (CapabilitiesAccepted)
//!   WaitCapabilitiesExchange -> Closed (CapabilitiesRejected, CapabilitiesTimeout, Stop)
//!   WaitCapabilitiesExchange -> Closing (TransportError)
//!   Open    -> Open         (Traffic)
//!   Open    -> Closing      (Stop, TransportError, ProtocolError, WatchdogExpired,
//!                            DisconnectRequested)
//!   Closing -> Closed       (Drained, TransportError)
//!
//! A transport error in any live state passes through Closing; the
//! connection task applies Drained once the socket is torn down.

use std::fmt;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// No connection
    Closed,
    /// Outbound transport connect in progress
    Connecting,
    /// Transport up, CER/CEA pending
    WaitCapabilitiesExchange,
    /// Capabilities exchanged, application traffic allowed
    Open,
    /// Disconnect initiated, draining
    Closing,
}

impl PeerState {
    pub fn is_open(self) -> bool {
        self == PeerState::Open
    }

    /// Feed one input to the state machine.
    ///
    /// Returns the next state, or `None` when the input is not valid in the
    /// current state (the caller leaves the state untouched).
    pub fn on(self, input: PeerInput) -> Option<PeerState> {
        use PeerInput::*;
        use PeerState::*;

        match (self, input) {
            (Closed, Connect) => Some(Connecting),
            (Closed, Accepted) => Some(WaitCapabilitiesExchange),

            (Connecting, TransportUp) => Some(WaitCapabilitiesExchange),
            (Connecting, TransportFailed | Stop) => Some(Closed),

            (WaitCapabilitiesExchange, CapabilitiesAccepted) => Some(Open),
            (WaitCapabilitiesExchange, CapabilitiesRejected | CapabilitiesTimeout | Stop) => {
                Some(Closed)
            }
            (WaitCapabilitiesExchange, TransportError) => Some(Closing),

            (Open, Traffic) => Some(Open),
            (
                Open,
                Stop | TransportError | ProtocolError | WatchdogExpired | DisconnectRequested,
            ) => Some(Closing),

            (Closing, Drained | TransportError) => Some(Closed),

            _ => None,
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Closed => "Closed",
            PeerState::Connecting => "Connecting",
            PeerState::WaitCapabilitiesExchange => "WaitCE",
            PeerState::Open => "Open",
            PeerState::Closing => "Closing",
        };
        f.write_str(name)
    }
}

/// Inputs driving [`PeerState::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerInput {
    /// Outbound connection attempt starts
    Connect,
    /// Outbound transport connected
    TransportUp,
    /// Outbound transport connect failed on every candidate address
    TransportFailed,
    /// Inbound transport accepted and claimed for this peer
    Accepted,
    /// CER/CEA succeeded with at least one common application
    CapabilitiesAccepted,
    /// CEA carried a failure, or no common application
    CapabilitiesRejected,
    /// No CER/CEA within the capabilities timeout
    CapabilitiesTimeout,
    /// Any message received on an open connection
    Traffic,
    /// Local stop
    Stop,
    /// Read or write failure on an established transport
    TransportError,
    /// Malformed message on an open connection
    ProtocolError,
    /// No traffic after the watchdog retry
    WatchdogExpired,
    /// Remote sent DPR
    DisconnectRequested,
    /// Connection torn down after Closing
    Drained,
}
