//! Common Diameter constants

/// AVP codes used by the node engine
pub mod avp_code {
    // RFC 6733 Base Protocol AVPs
    pub const USER_NAME: u32 = 1;
    pub const HOST_IP_ADDRESS: u32 = 257;
    pub const AUTH_APPLICATION_ID: u32 = 258;
    pub const ACCT_APPLICATION_ID: u32 = 259;
    pub const VENDOR_SPECIFIC_APPLICATION_ID: u32 = 260;
    pub const SESSION_ID: u32 = 263;
    pub const ORIGIN_HOST: u32 = 264;
    pub const SUPPORTED_VENDOR_ID: u32 = 265;
    pub const VENDOR_ID: u32 = 266;
    pub const FIRMWARE_REVISION: u32 = 267;
    pub const RESULT_CODE: u32 = 268;
    pub const PRODUCT_NAME: u32 = 269;
    pub const DISCONNECT_CAUSE: u32 = 273;
    pub const AUTH_REQUEST_TYPE: u32 = 274;
    pub const ORIGIN_STATE_ID: u32 = 278;
    pub const ERROR_MESSAGE: u32 = 281;
    pub const DESTINATION_REALM: u32 = 283;
    pub const DESTINATION_HOST: u32 = 293;
    pub const ORIGIN_REALM: u32 = 296;

    // RFC 4072 Diameter EAP
    pub const EAP_PAYLOAD: u32 = 462;
}

/// Well-known application identifiers
pub mod app_id {
    /// Diameter common messages (CER/DWR/DPR)
    pub const BASE: u32 = 0;
    pub const NASREQ: u32 = 1;
    pub const BASE_ACCOUNTING: u32 = 3;
    /// Diameter EAP (RFC 4072)
    pub const EAP: u32 = 5;
    /// Relay: matches every application during capabilities exchange
    pub const RELAY: u32 = 0xffff_ffff;
}

/// Disconnect-Cause values for DPR (RFC 6733 Section 5.4.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectCause {
    Rebooting = 0,
    Busy = 1,
    DoNotWantToTalkToYou = 2,
}

impl DisconnectCause {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(DisconnectCause::Rebooting),
            1 => Some(DisconnectCause::Busy),
            2 => Some(DisconnectCause::DoNotWantToTalkToYou),
            _ => None,
        }
    }
}

/// Auth-Request-Type values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthRequestType {
    AuthenticateOnly = 1,
    AuthorizeOnly = 2,
    AuthorizeAuthenticate = 3,
}
