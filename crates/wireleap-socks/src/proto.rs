//! Barebones SOCKSv5 server handshake per RFC 1928.
//!
//! <https://datatracker.ietf.org/doc/html/rfc1928>

use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Error;

/// Protocol version byte.
pub const SOCKS_V5: u8 = 0x05;
/// CONNECT command.
pub const CONNECT: u8 = 0x01;
/// UDP ASSOCIATE command.
pub const UDP_ASSOC: u8 = 0x03;

/// IPv4 address type.
const ADDR_IPV4: u8 = 0x01;
/// Fully qualified domain name address type.
const ADDR_FQDN: u8 = 0x03;
/// IPv6 address type.
const ADDR_IPV6: u8 = 0x04;
/// Reserved byte.
const RSV: u8 = 0x00;

/// SOCKS reply status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)] // names track RFC 1928 §6
#[non_exhaustive]
pub enum SocksStatus {
    Ok = 0,
    GeneralFailure = 1,
    NotAllowed = 2,
    NetworkUnreachable = 3,
    HostUnreachable = 4,
    ConnRefused = 5,
    TtlExpired = 6,
    CommandNotSupported = 7,
    AddressNotSupported = 8,
}

/// A SOCKS wire address: ATYP byte, address bytes, and two port bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr(Vec<u8>);

impl Addr {
    /// Encode a socket address.
    pub fn from_socketaddr(sa: SocketAddr) -> Self {
        let mut v = Vec::with_capacity(19);
        match sa.ip() {
            IpAddr::V4(ip) => {
                v.push(ADDR_IPV4);
                v.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                v.push(ADDR_IPV6);
                v.extend_from_slice(&ip.octets());
            }
        }
        v.extend_from_slice(&sa.port().to_be_bytes());
        Addr(v)
    }

    /// Decode `host:port` text into wire form (FQDN if the host is not an
    /// IP literal).
    pub fn from_hostport(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Addr::from_socketaddr(SocketAddr::new(ip, port)),
            Err(_) => {
                let mut v = Vec::with_capacity(4 + host.len());
                v.push(ADDR_FQDN);
                v.push(host.len() as u8);
                v.extend_from_slice(host.as_bytes());
                v.extend_from_slice(&port.to_be_bytes());
                Addr(v)
            }
        }
    }

    /// The raw wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Wire length of this address.
    fn len(&self) -> usize {
        self.0.len()
    }

    /// Render as `host:port` for use as a dial target.
    pub fn to_target(&self) -> String {
        let b = &self.0;
        match b.first() {
            Some(&ADDR_IPV4) if b.len() >= 7 => {
                let ip = IpAddr::from([b[1], b[2], b[3], b[4]]);
                let port = u16::from_be_bytes([b[5], b[6]]);
                format!("{}:{}", ip, port)
            }
            Some(&ADDR_IPV6) if b.len() >= 19 => {
                let mut o = [0_u8; 16];
                o.copy_from_slice(&b[1..17]);
                let ip = IpAddr::from(o);
                let port = u16::from_be_bytes([b[17], b[18]]);
                format!("{}:{}", ip, port)
            }
            Some(&ADDR_FQDN) if b.len() >= 2 => {
                let n = b[1] as usize;
                if b.len() < 2 + n + 2 {
                    return String::new();
                }
                let host = String::from_utf8_lossy(&b[2..2 + n]);
                let port = u16::from_be_bytes([b[2 + n], b[2 + n + 1]]);
                format!("{}:{}", host, port)
            }
            _ => String::new(),
        }
    }
}

/// Write a SOCKS reply with the given status and bound address.
pub async fn write_status<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: SocksStatus,
    addr: Addr,
) -> std::io::Result<()> {
    let mut reply = vec![SOCKS_V5, status as u8, RSV];
    reply.extend_from_slice(addr.as_bytes());
    w.write_all(&reply).await?;
    w.flush().await
}

/// Perform the server side of the SOCKSv5 handshake.
///
/// Returns the requested command and the target address (`host:port`).
/// For a `UDP ASSOCIATE` with a null address the target is empty.  On an
/// unsupported command, the matching reply status has already been sent
/// before the error is returned.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut S,
    local: SocketAddr,
) -> Result<(u8, String), Error> {
    // Version and auth method negotiation: accept no-auth only.
    let ver = conn.read_u8().await?;
    if ver != SOCKS_V5 {
        write_status(conn, SocksStatus::GeneralFailure, Addr::from_socketaddr(local)).await?;
        return Err(Error::BadVersion(ver));
    }
    let n_methods = conn.read_u8().await?;
    let mut methods = vec![0_u8; n_methods as usize];
    conn.read_exact(&mut methods).await?;
    conn.write_all(&[SOCKS_V5, 0x00]).await?;

    // Request: VER CMD RSV ATYP ADDR PORT.
    let ver = conn.read_u8().await?;
    if ver != SOCKS_V5 {
        write_status(conn, SocksStatus::GeneralFailure, Addr::from_socketaddr(local)).await?;
        return Err(Error::BadVersion(ver));
    }
    let cmd = conn.read_u8().await?;
    if cmd != CONNECT && cmd != UDP_ASSOC {
        write_status(
            conn,
            SocksStatus::CommandNotSupported,
            Addr::from_socketaddr(local),
        )
        .await?;
        return Err(Error::BadCommand(cmd));
    }
    let _rsv = conn.read_u8().await?;
    let atyp = conn.read_u8().await?;
    let (host, null_host) = match atyp {
        ADDR_IPV4 => {
            let mut b = [0_u8; 4];
            conn.read_exact(&mut b).await?;
            (IpAddr::from(b).to_string(), b == [0_u8; 4])
        }
        ADDR_IPV6 => {
            let mut b = [0_u8; 16];
            conn.read_exact(&mut b).await?;
            (IpAddr::from(b).to_string(), b == [0_u8; 16])
        }
        ADDR_FQDN => {
            let n = conn.read_u8().await?;
            let mut b = vec![0_u8; n as usize];
            conn.read_exact(&mut b).await?;
            (String::from_utf8_lossy(&b).into_owned(), b.is_empty())
        }
        other => {
            write_status(
                conn,
                SocksStatus::AddressNotSupported,
                Addr::from_socketaddr(local),
            )
            .await?;
            return Err(Error::BadAddrType(other));
        }
    };
    let port = conn.read_u16().await?;
    if cmd == UDP_ASSOC && null_host && port == 0 {
        // "I will tell you my source address by using it."
        return Ok((cmd, String::new()));
    }
    Ok((cmd, format!("{}:{}", host, port)))
}

/// Wrap a return datagram: RSV RSV FRAG ATYP ADDR PORT DATA.
pub fn compose_udp(dstaddr: &Addr, payload: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(3 + dstaddr.len() + payload.len());
    v.extend_from_slice(&[0, 0, 0]);
    v.extend_from_slice(dstaddr.as_bytes());
    v.extend_from_slice(payload);
    v
}

/// Dissect a datagram received on the UDP listener.
///
/// Returns the destination address and the payload.  Fragmented messages
/// (`FRAG != 0`) are refused.
pub fn dissect_udp(p: &[u8]) -> Result<(Addr, &[u8]), Error> {
    if p.len() < 4 {
        return Err(Error::Truncated);
    }
    if p[2] != 0 {
        return Err(Error::Fragmented);
    }
    let atyp = p[3];
    let addr_len = match atyp {
        ADDR_IPV4 => 1 + 4 + 2,
        ADDR_IPV6 => 1 + 16 + 2,
        ADDR_FQDN => {
            let n = *p.get(4).ok_or(Error::Truncated)? as usize;
            1 + 1 + n + 2
        }
        other => return Err(Error::BadAddrType(other)),
    };
    if p.len() < 3 + addr_len {
        return Err(Error::Truncated);
    }
    let addr = Addr(p[3..3 + addr_len].to_vec());
    Ok((addr, &p[3 + addr_len..]))
}
