//! Destination address for proxied connections
//!
//! The first plaintext bytes of a client stream carry a SOCKS5-style
//! address: a one-byte type, the address bytes, and a 2-byte big-endian
//! port. Everything after it is relayed verbatim.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Read a SOCKS5-style destination address from a stream.
    ///
    /// An undefined address type byte is an error; the caller closes the
    /// connection without replying.
    pub async fn read_from<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Self> {
        let mut atyp = [0u8; 1];
        stream.read_exact(&mut atyp).await?;

        match atyp[0] {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let port = read_port(stream).await?;
                Ok(Address::Socket(SocketAddr::new(
                    Ipv4Addr::from(addr).into(),
                    port,
                )))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                stream.read_exact(&mut domain).await?;
                let port = read_port(stream).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|_| Error::InvalidAddress("domain is not valid UTF-8".to_string()))?;
                Ok(Address::Domain(domain, port))
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let port = read_port(stream).await?;
                Ok(Address::Socket(SocketAddr::new(
                    Ipv6Addr::from(addr).into(),
                    port,
                )))
            }
            other => Err(Error::InvalidAddress(format!(
                "unsupported address type: {:#04x}",
                other
            ))),
        }
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

async fn read_port<R: AsyncRead + Unpin>(stream: &mut R) -> Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}
