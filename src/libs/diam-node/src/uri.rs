//! DiameterURI parsing (RFC 6733 Section 4.3.1)
//!
//! `aaa://FQDN[:port][;transport=tcp|sctp][;protocol=diameter]`

use std::fmt;
use std::str::FromStr;

use crate::error::{DiameterError, DiameterResult};
use crate::{DIAMETER_PORT, DIAMETER_TLS_PORT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
    Aaa,
    Aaas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
    Sctp,
}

/// Parsed peer URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUri {
    pub scheme: UriScheme,
    pub fqdn: String,
    pub port: u16,
    pub transport: TransportProtocol,
}

impl PeerUri {
    pub fn parse(uri: &str) -> DiameterResult<Self> {
        let invalid = |reason: &str| DiameterError::Config(format!("invalid peer URI {uri:?}: {reason}"));

        let (scheme, rest) = if let Some(rest) = uri.strip_prefix("aaa://") {
            (UriScheme::Aaa, rest)
        } else if let Some(rest) = uri.strip_prefix("aaas://") {
            (UriScheme::Aaas, rest)
        } else {
            return Err(invalid("scheme must be aaa:// or aaas://"));
        };

        let mut segments = rest.split(';');
        let authority = segments.next().unwrap_or_default();

        let (fqdn, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                (host, port)
            }
            None => (
                authority,
                match scheme {
                    UriScheme::Aaa => DIAMETER_PORT,
                    UriScheme::Aaas => DIAMETER_TLS_PORT,
                },
            ),
        };
        if fqdn.is_empty() {
            return Err(invalid("missing host"));
        }

        let mut transport = TransportProtocol::Tcp;
        for param in segments {
            match param.split_once('=') {
                Some(("transport", "tcp")) => transport = TransportProtocol::Tcp,
                Some(("transport", "sctp")) => transport = TransportProtocol::Sctp,
                Some(("transport", other)) => {
                    return Err(invalid(&format!("unsupported transport {other}")))
                }
                Some(("protocol", "diameter")) => {}
                Some(("protocol", other)) => {
                    return Err(invalid(&format!("unsupported protocol {other}")))
                }
                _ => return Err(invalid(&format!("unknown parameter {param}"))),
            }
        }

        Ok(Self {
            scheme,
            fqdn: fqdn.to_ascii_lowercase(),
            port,
            transport,
        })
    }
}

impl FromStr for PeerUri {
    type Err = DiameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            UriScheme::Aaa => "aaa",
            UriScheme::Aaas => "aaas",
        };
        let transport = match self.transport {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Sctp => "sctp",
        };
        write!(f, "{scheme}://{}:{};transport={transport}", self.fqdn, self.port)
    }
}
