//! Diameter AVP (Attribute-Value Pair) encoding and decoding
//!
//! AVP format (RFC 6733 Section 4.1):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           AVP Code                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V M P r r r r r|                  AVP Length                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Vendor-ID (opt)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Data ...
//! +-+-+-+-+-+-+-+-+
//! ```
//!
//! Decoding never interprets the payload: every decoded AVP carries
//! [`AvpData::Raw`] and the typed accessors convert on demand.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{DiameterError, DiameterResult};

/// AVP flags
pub mod avp_flags {
    /// Vendor-Specific bit
    pub const VENDOR: u8 = 0x80;
    /// Mandatory bit
    pub const MANDATORY: u8 = 0x40;
    /// Protected bit
    pub const PROTECTED: u8 = 0x20;
}

/// AVP header size without vendor ID
pub const AVP_HEADER_SIZE: usize = 8;
/// AVP header size with vendor ID
pub const AVP_HEADER_SIZE_VENDOR: usize = 12;

const ADDRESS_FAMILY_IPV4: u16 = 1;
const ADDRESS_FAMILY_IPV6: u16 = 2;

/// Diameter AVP
#[derive(Debug, Clone, PartialEq)]
pub struct Avp {
    pub code: u32,
    pub flags: u8,
    pub vendor_id: Option<u32>,
    pub data: AvpData,
}

/// AVP payload
#[derive(Debug, Clone, PartialEq)]
pub enum AvpData {
    OctetString(Bytes),
    Integer32(i32),
    Unsigned32(u32),
    Unsigned64(u64),
    Enumerated(i32),
    Utf8String(String),
    DiameterIdentity(String),
    Address(IpAddr),
    Grouped(Vec<Avp>),
    /// Undecoded payload as received from the wire
    Raw(Bytes),
}

impl Avp {
    pub fn new(code: u32, flags: u8, vendor_id: Option<u32>, data: AvpData) -> Self {
        let flags = match vendor_id {
            Some(_) => flags | avp_flags::VENDOR,
            None => flags & !avp_flags::VENDOR,
        };
        Self {
            code,
            flags,
            vendor_id,
            data,
        }
    }

    /// Create a mandatory (M bit) AVP
    pub fn mandatory(code: u32, data: AvpData) -> Self {
        Self::new(code, avp_flags::MANDATORY, None, data)
    }

    /// Create an AVP with no flags set
    pub fn optional(code: u32, data: AvpData) -> Self {
        Self::new(code, 0, None, data)
    }

    pub fn identity(code: u32, value: impl Into<String>) -> Self {
        Self::mandatory(code, AvpData::DiameterIdentity(value.into()))
    }

    pub fn utf8(code: u32, value: impl Into<String>) -> Self {
        Self::mandatory(code, AvpData::Utf8String(value.into()))
    }

    pub fn unsigned32(code: u32, value: u32) -> Self {
        Self::mandatory(code, AvpData::Unsigned32(value))
    }

    pub fn is_vendor_specific(&self) -> bool {
        self.flags & avp_flags::VENDOR != 0
    }

    pub fn is_mandatory(&self) -> bool {
        self.flags & avp_flags::MANDATORY != 0
    }

    fn header_len(&self) -> usize {
        if self.is_vendor_specific() {
            AVP_HEADER_SIZE_VENDOR
        } else {
            AVP_HEADER_SIZE
        }
    }

    /// Length written into the AVP Length field (no padding)
    pub fn unpadded_len(&self) -> usize {
        self.header_len() + self.data.encoded_len()
    }

    /// Bytes occupied on the wire, padded to a 4-byte boundary
    pub fn encoded_len(&self) -> usize {
        (self.unpadded_len() + 3) & !3
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let avp_len = self.unpadded_len();

        buf.put_u32(self.code);
        buf.put_u8(self.flags);
        put_u24(buf, avp_len as u32);
        if let Some(vendor_id) = self.vendor_id {
            buf.put_u32(vendor_id);
        }

        self.data.encode(buf);

        buf.put_bytes(0, self.encoded_len() - avp_len);
    }

    pub fn decode(buf: &mut Bytes) -> DiameterResult<Self> {
        ensure_remaining(buf, AVP_HEADER_SIZE)?;

        let code = buf.get_u32();
        let flags = buf.get_u8();
        let avp_len = get_u24(buf) as usize;

        let header_len = if flags & avp_flags::VENDOR != 0 {
            AVP_HEADER_SIZE_VENDOR
        } else {
            AVP_HEADER_SIZE
        };
        if avp_len < header_len {
            return Err(DiameterError::InvalidAvp(format!(
                "AVP {code} length {avp_len} shorter than its header ({header_len})"
            )));
        }

        let vendor_id = if header_len == AVP_HEADER_SIZE_VENDOR {
            ensure_remaining(buf, 4)?;
            Some(buf.get_u32())
        } else {
            None
        };

        let data_len = avp_len - header_len;
        ensure_remaining(buf, data_len)?;
        let data = buf.copy_to_bytes(data_len);

        // Trailing padding may be absent on the last AVP of a message
        let padding = ((data_len + 3) & !3) - data_len;
        buf.advance(padding.min(buf.remaining()));

        Ok(Self {
            code,
            flags,
            vendor_id,
            data: AvpData::Raw(data),
        })
    }

    pub fn as_u32(&self) -> Option<u32> {
        match &self.data {
            AvpData::Unsigned32(v) => Some(*v),
            AvpData::Integer32(v) | AvpData::Enumerated(v) => Some(*v as u32),
            AvpData::Raw(b) if b.len() == 4 => Some(b.clone().get_u32()),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match &self.data {
            AvpData::Unsigned64(v) => Some(*v),
            AvpData::Raw(b) if b.len() == 8 => Some(b.clone().get_u64()),
            _ => None,
        }
    }

    pub fn as_utf8_string(&self) -> Option<&str> {
        match &self.data {
            AvpData::Utf8String(s) | AvpData::DiameterIdentity(s) => Some(s),
            AvpData::Raw(b) | AvpData::OctetString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<IpAddr> {
        match &self.data {
            AvpData::Address(addr) => Some(*addr),
            AvpData::Raw(b) | AvpData::OctetString(b) => decode_address(b.clone()),
            _ => None,
        }
    }

    /// Members of a grouped AVP, decoding raw payloads on demand
    pub fn grouped(&self) -> DiameterResult<Vec<Avp>> {
        match &self.data {
            AvpData::Grouped(avps) => Ok(avps.clone()),
            AvpData::Raw(b) => decode_all(b.clone()),
            _ => Err(DiameterError::InvalidAvp(format!(
                "AVP {} is not grouped",
                self.code
            ))),
        }
    }
}

impl AvpData {
    pub fn encoded_len(&self) -> usize {
        match self {
            AvpData::OctetString(b) | AvpData::Raw(b) => b.len(),
            AvpData::Integer32(_) | AvpData::Unsigned32(_) | AvpData::Enumerated(_) => 4,
            AvpData::Unsigned64(_) => 8,
            AvpData::Utf8String(s) | AvpData::DiameterIdentity(s) => s.len(),
            AvpData::Address(IpAddr::V4(_)) => 2 + 4,
            AvpData::Address(IpAddr::V6(_)) => 2 + 16,
            AvpData::Grouped(avps) => avps.iter().map(Avp::encoded_len).sum(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            AvpData::OctetString(b) | AvpData::Raw(b) => buf.put_slice(b),
            AvpData::Integer32(v) | AvpData::Enumerated(v) => buf.put_i32(*v),
            AvpData::Unsigned32(v) => buf.put_u32(*v),
            AvpData::Unsigned64(v) => buf.put_u64(*v),
            AvpData::Utf8String(s) | AvpData::DiameterIdentity(s) => buf.put_slice(s.as_bytes()),
            AvpData::Address(IpAddr::V4(v4)) => {
                buf.put_u16(ADDRESS_FAMILY_IPV4);
                buf.put_slice(&v4.octets());
            }
            AvpData::Address(IpAddr::V6(v6)) => {
                buf.put_u16(ADDRESS_FAMILY_IPV6);
                buf.put_slice(&v6.octets());
            }
            AvpData::Grouped(avps) => {
                for avp in avps {
                    avp.encode(buf);
                }
            }
        }
    }
}

/// Decode a run of AVPs until the buffer is exhausted
pub fn decode_all(mut buf: Bytes) -> DiameterResult<Vec<Avp>> {
    let mut avps = Vec::new();
    while buf.has_remaining() {
        avps.push(Avp::decode(&mut buf)?);
    }
    Ok(avps)
}

pub fn find_avp(avps: &[Avp], code: u32) -> Option<&Avp> {
    avps.iter().find(|a| a.code == code && a.vendor_id.is_none())
}

pub fn find_all_avps(avps: &[Avp], code: u32) -> impl Iterator<Item = &Avp> {
    avps.iter().filter(move |a| a.code == code && a.vendor_id.is_none())
}

fn decode_address(mut b: Bytes) -> Option<IpAddr> {
    if b.len() < 2 {
        return None;
    }
    match (b.get_u16(), b.len()) {
        (ADDRESS_FAMILY_IPV4, 4) => {
            let mut octets = [0u8; 4];
            b.copy_to_slice(&mut octets);
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        (ADDRESS_FAMILY_IPV6, 16) => {
            let mut octets = [0u8; 16];
            b.copy_to_slice(&mut octets);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn ensure_remaining(buf: &Bytes, needed: usize) -> DiameterResult<()> {
    if buf.remaining() < needed {
        return Err(DiameterError::BufferTooSmall {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8(((value >> 16) & 0xff) as u8);
    buf.put_u16((value & 0xffff) as u16);
}

pub(crate) fn get_u24(buf: &mut Bytes) -> u32 {
    let high = buf.get_u8() as u32;
    let low = buf.get_u16() as u32;
    (high << 16) | low
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::avp_code;

    fn roundtrip(avp: &Avp) -> Avp {
        let mut buf = BytesMut::new();
        avp.encode(&mut buf);
        assert_eq!(buf.len(), avp.encoded_len());
        Avp::decode(&mut buf.freeze()).unwrap()
    }

    #[test]
    fn test_unsigned32_avp() {
        let decoded = roundtrip(&Avp::unsigned32(avp_code::RESULT_CODE, 2001));
        assert_eq!(decoded.code, avp_code::RESULT_CODE);
        assert!(decoded.is_mandatory());
        assert_eq!(decoded.as_u32(), Some(2001));
    }

    #[test]
    fn test_string_avp_is_padded() {
        let avp = Avp::utf8(avp_code::SESSION_ID, "abc");
        assert_eq!(avp.unpadded_len(), 11);
        assert_eq!(avp.encoded_len(), 12);
        let decoded = roundtrip(&avp);
        assert_eq!(decoded.as_utf8_string(), Some("abc"));
    }

    #[test]
    fn test_address_avp() {
        let addr: IpAddr = "10.1.2.3".parse().unwrap();
        let decoded = roundtrip(&Avp::mandatory(
            avp_code::HOST_IP_ADDRESS,
            AvpData::Address(addr),
        ));
        assert_eq!(decoded.as_address(), Some(addr));
    }

    #[test]
    fn test_grouped_decoded_on_demand() {
        let group = Avp::mandatory(
            avp_code::VENDOR_SPECIFIC_APPLICATION_ID,
            AvpData::Grouped(vec![
                Avp::unsigned32(avp_code::VENDOR_ID, 10415),
                Avp::unsigned32(avp_code::AUTH_APPLICATION_ID, 16777251),
            ]),
        );
        let decoded = roundtrip(&group);
        let members = decoded.grouped().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(
            find_avp(&members, avp_code::AUTH_APPLICATION_ID).and_then(Avp::as_u32),
            Some(16777251)
        );
    }

    #[test]
    fn test_vendor_flag_follows_vendor_id() {
        let avp = Avp::new(1032, avp_flags::MANDATORY, Some(10415), AvpData::Enumerated(1004));
        assert!(avp.is_vendor_specific());
        let decoded = roundtrip(&avp);
        assert_eq!(decoded.vendor_id, Some(10415));
        assert!(find_avp(&[decoded], 1032).is_none());
    }

    #[test]
    fn test_truncated_avp_is_rejected() {
        let mut buf = BytesMut::new();
        Avp::utf8(avp_code::SESSION_ID, "session").encode(&mut buf);
        let mut short = buf.freeze().slice(0..10);
        assert!(matches!(
            Avp::decode(&mut short),
            Err(DiameterError::BufferTooSmall { .. })
        ));
    }
}
