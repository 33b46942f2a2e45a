//! Diameter message header and message types
//!
//! Message format (RFC 6733 Section 3):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |                 Message Length                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | command flags |                  Command-Code                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Application-ID                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Hop-by-Hop Identifier                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      End-to-End Identifier                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  AVPs ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::avp::{self, get_u24, put_u24, Avp};
use crate::common::avp_code;
use crate::error::{DiameterError, DiameterResult, ResultCode};
use crate::DIAMETER_VERSION;

/// Diameter message header size
pub const DIAMETER_HEADER_SIZE: usize = 20;

/// Command flags
pub mod cmd_flags {
    /// Request bit
    pub const REQUEST: u8 = 0x80;
    /// Proxiable bit
    pub const PROXIABLE: u8 = 0x40;
    /// Error bit
    pub const ERROR: u8 = 0x20;
    /// Potentially re-transmitted bit
    pub const RETRANSMIT: u8 = 0x10;
}

/// Base Diameter command codes (RFC 6733)
pub mod base_cmd {
    /// Capabilities-Exchange-Request/Answer
    pub const CAPABILITIES_EXCHANGE: u32 = 257;
    /// Device-Watchdog-Request/Answer
    pub const DEVICE_WATCHDOG: u32 = 280;
    /// Disconnect-Peer-Request/Answer
    pub const DISCONNECT_PEER: u32 = 282;
}

/// Diameter-EAP-Request/Answer (RFC 4072)
pub const DIAMETER_EAP_CMD: u32 = 268;

/// Diameter message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiameterHeader {
    pub version: u8,
    /// Message length including header; recomputed on encode
    pub length: u32,
    pub flags: u8,
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop_id: u32,
    pub end_to_end_id: u32,
}

impl DiameterHeader {
    pub fn new_request(command_code: u32, application_id: u32) -> Self {
        Self {
            version: DIAMETER_VERSION,
            length: DIAMETER_HEADER_SIZE as u32,
            flags: cmd_flags::REQUEST,
            command_code,
            application_id,
            hop_by_hop_id: 0,
            end_to_end_id: 0,
        }
    }

    /// Answer header: same command, application and identifiers, R bit
    /// cleared, P bit inherited.
    pub fn answer_to(request: &DiameterHeader) -> Self {
        Self {
            version: DIAMETER_VERSION,
            length: DIAMETER_HEADER_SIZE as u32,
            flags: request.flags & cmd_flags::PROXIABLE,
            command_code: request.command_code,
            application_id: request.application_id,
            hop_by_hop_id: request.hop_by_hop_id,
            end_to_end_id: request.end_to_end_id,
        }
    }

    pub fn is_request(&self) -> bool {
        self.flags & cmd_flags::REQUEST != 0
    }

    pub fn is_answer(&self) -> bool {
        !self.is_request()
    }

    pub fn is_proxiable(&self) -> bool {
        self.flags & cmd_flags::PROXIABLE != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & cmd_flags::ERROR != 0
    }

    pub fn set_proxiable(&mut self) {
        self.flags |= cmd_flags::PROXIABLE;
    }

    pub fn set_error(&mut self) {
        self.flags |= cmd_flags::ERROR;
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        put_u24(buf, self.length);
        buf.put_u8(self.flags);
        put_u24(buf, self.command_code);
        buf.put_u32(self.application_id);
        buf.put_u32(self.hop_by_hop_id);
        buf.put_u32(self.end_to_end_id);
    }

    pub fn decode(buf: &mut Bytes) -> DiameterResult<Self> {
        if buf.remaining() < DIAMETER_HEADER_SIZE {
            return Err(DiameterError::BufferTooSmall {
                needed: DIAMETER_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let version = buf.get_u8();
        if version != DIAMETER_VERSION {
            return Err(DiameterError::Protocol(format!(
                "unsupported Diameter version {version}"
            )));
        }
        let length = get_u24(buf);
        let flags = buf.get_u8();
        let command_code = get_u24(buf);

        Ok(Self {
            version,
            length,
            flags,
            command_code,
            application_id: buf.get_u32(),
            hop_by_hop_id: buf.get_u32(),
            end_to_end_id: buf.get_u32(),
        })
    }
}

/// Diameter message (header + AVPs)
#[derive(Debug, Clone, PartialEq)]
pub struct DiameterMessage {
    pub header: DiameterHeader,
    pub avps: Vec<Avp>,
}

impl DiameterMessage {
    pub fn new(header: DiameterHeader, avps: Vec<Avp>) -> Self {
        Self { header, avps }
    }

    pub fn new_request(command_code: u32, application_id: u32) -> Self {
        Self::new(DiameterHeader::new_request(command_code, application_id), Vec::new())
    }

    /// Bare answer carrying the request's correlation identifiers
    pub fn new_answer(request: &DiameterMessage) -> Self {
        Self::new(DiameterHeader::answer_to(&request.header), Vec::new())
    }

    /// Answer with the standard leading AVPs: Session-Id (copied from the
    /// request), Result-Code, Origin-Host, Origin-Realm and an optional
    /// Error-Message. Protocol errors (3xxx) get the E bit.
    pub fn answer_with_result(
        request: &DiameterMessage,
        origin_host: &str,
        origin_realm: &str,
        result_code: ResultCode,
        error_message: Option<&str>,
    ) -> Self {
        let mut answer = Self::new_answer(request);
        if result_code.is_protocol_error() {
            answer.header.set_error();
        }
        if let Some(session_id) = request.session_id() {
            answer.add_avp(Avp::utf8(avp_code::SESSION_ID, session_id));
        }
        answer.add_avp(Avp::unsigned32(avp_code::RESULT_CODE, result_code.code()));
        answer.add_avp(Avp::identity(avp_code::ORIGIN_HOST, origin_host));
        answer.add_avp(Avp::identity(avp_code::ORIGIN_REALM, origin_realm));
        if let Some(text) = error_message {
            answer.add_avp(Avp::optional(
                avp_code::ERROR_MESSAGE,
                avp::AvpData::Utf8String(text.to_string()),
            ));
        }
        answer
    }

    pub fn add_avp(&mut self, avp: Avp) {
        self.avps.push(avp);
    }

    /// Builder-style [`add_avp`](Self::add_avp)
    pub fn with_avp(mut self, avp: Avp) -> Self {
        self.avps.push(avp);
        self
    }

    pub fn find_avp(&self, code: u32) -> Option<&Avp> {
        avp::find_avp(&self.avps, code)
    }

    pub fn is_request(&self) -> bool {
        self.header.is_request()
    }

    pub fn is_answer(&self) -> bool {
        self.header.is_answer()
    }

    pub fn command_code(&self) -> u32 {
        self.header.command_code
    }

    pub fn application_id(&self) -> u32 {
        self.header.application_id
    }

    pub fn hop_by_hop_id(&self) -> u32 {
        self.header.hop_by_hop_id
    }

    pub fn end_to_end_id(&self) -> u32 {
        self.header.end_to_end_id
    }

    pub fn calculate_length(&self) -> u32 {
        let avp_len: usize = self.avps.iter().map(Avp::encoded_len).sum();
        (DIAMETER_HEADER_SIZE + avp_len) as u32
    }

    pub fn encode(&self) -> Bytes {
        let length = self.calculate_length();
        let mut buf = BytesMut::with_capacity(length as usize);

        let header = DiameterHeader {
            length,
            ..self.header.clone()
        };
        header.encode(&mut buf);
        for avp in &self.avps {
            avp.encode(&mut buf);
        }

        buf.freeze()
    }

    pub fn decode(buf: &mut Bytes) -> DiameterResult<Self> {
        let header = DiameterHeader::decode(buf)?;

        let length = header.length as usize;
        if length < DIAMETER_HEADER_SIZE {
            return Err(DiameterError::InvalidMessage(format!(
                "message length {length} is less than header size"
            )));
        }
        let avp_len = length - DIAMETER_HEADER_SIZE;
        if buf.remaining() < avp_len {
            return Err(DiameterError::BufferTooSmall {
                needed: avp_len,
                available: buf.remaining(),
            });
        }

        let avps = avp::decode_all(buf.copy_to_bytes(avp_len))?;
        Ok(Self { header, avps })
    }

    fn string_avp(&self, code: u32) -> Option<&str> {
        self.find_avp(code)?.as_utf8_string()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.string_avp(avp_code::SESSION_ID)
    }

    pub fn origin_host(&self) -> Option<&str> {
        self.string_avp(avp_code::ORIGIN_HOST)
    }

    pub fn origin_realm(&self) -> Option<&str> {
        self.string_avp(avp_code::ORIGIN_REALM)
    }

    pub fn destination_host(&self) -> Option<&str> {
        self.string_avp(avp_code::DESTINATION_HOST)
    }

    pub fn destination_realm(&self) -> Option<&str> {
        self.string_avp(avp_code::DESTINATION_REALM)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.string_avp(avp_code::ERROR_MESSAGE)
    }

    pub fn result_code(&self) -> Option<u32> {
        self.find_avp(avp_code::RESULT_CODE)?.as_u32()
    }

    /// Auth-Application-Id values, including those nested in
    /// Vendor-Specific-Application-Id.
    pub fn auth_application_ids(&self) -> Vec<u32> {
        self.application_ids(avp_code::AUTH_APPLICATION_ID)
    }

    /// Acct-Application-Id values, including those nested in
    /// Vendor-Specific-Application-Id.
    pub fn acct_application_ids(&self) -> Vec<u32> {
        self.application_ids(avp_code::ACCT_APPLICATION_ID)
    }

    fn application_ids(&self, code: u32) -> Vec<u32> {
        let mut ids: Vec<u32> = avp::find_all_avps(&self.avps, code)
            .filter_map(Avp::as_u32)
            .collect();

        for vsai in avp::find_all_avps(&self.avps, avp_code::VENDOR_SPECIFIC_APPLICATION_ID) {
            match vsai.grouped() {
                Ok(members) => ids.extend(
                    avp::find_all_avps(&members, code).filter_map(Avp::as_u32),
                ),
                Err(e) => log::debug!("ignoring malformed Vendor-Specific-Application-Id: {e}"),
            }
        }
        ids
    }
}

impl fmt::Display for DiameterMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{} app={} hbh={:#010x} e2e={:#010x}",
            command_name(self.header.command_code),
            if self.is_request() { "R" } else { "A" },
            if self.header.is_error() { "/E" } else { "" },
            self.header.application_id,
            self.header.hop_by_hop_id,
            self.header.end_to_end_id,
        )?;
        if let Some(session_id) = self.session_id() {
            write!(f, " session={session_id}")?;
        }
        if let Some(rc) = self.result_code() {
            write!(f, " result={rc}")?;
        }
        Ok(())
    }
}

fn command_name(code: u32) -> String {
    match code {
        base_cmd::CAPABILITIES_EXCHANGE => "CE".to_string(),
        base_cmd::DEVICE_WATCHDOG => "DW".to_string(),
        base_cmd::DISCONNECT_PEER => "DP".to_string(),
        DIAMETER_EAP_CMD => "DE".to_string(),
        other => other.to_string(),
    }
}
