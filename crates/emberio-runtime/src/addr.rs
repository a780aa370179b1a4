//! Platform-uniform network address.
//!
//! Thin wrapper over `SocketAddr` with conversions to and from the raw
//! `sockaddr_storage` the socket layer feeds to libc. Name resolution is
//! blocking (getaddrinfo underneath) and therefore belongs on a worker
//! thread, never on the reactor.

use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use emberio_core::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress(SocketAddr);

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    /// Wildcard IPv4 address for a listener.
    pub fn any(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    pub fn loopback(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// Parse `"ip:port"` or a bare ip with an explicit port.
    pub fn parse(addr: &str, port: u16) -> Result<Self> {
        if let Ok(sa) = addr.parse::<SocketAddr>() {
            return Ok(Self(sa));
        }
        if let Ok(ip) = addr.parse::<IpAddr>() {
            return Ok(Self(SocketAddr::new(ip, port)));
        }
        Err(EngineError::Os(-libc::EINVAL))
    }

    /// Resolve a host name (RFC 1035 caps names at 255 bytes). Blocking;
    /// call from a worker task.
    pub fn resolve(host: &str, port: u16) -> Result<Self> {
        let mut addrs = (host, port)
            .to_socket_addrs()
            .map_err(|_| EngineError::Os(-libc::EADDRNOTAVAIL))?;
        addrs
            .next()
            .map(Self)
            .ok_or(EngineError::Os(-libc::EADDRNOTAVAIL))
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    #[inline]
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[inline]
    pub fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }

    #[inline]
    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }

    pub(crate) fn to_storage(&self) -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        match self.0 {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        &sin as *const _ as *const u8,
                        &mut storage as *mut _ as *mut u8,
                        mem::size_of::<libc::sockaddr_in>(),
                    );
                }
                (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        &sin6 as *const _ as *const u8,
                        &mut storage as *mut _ as *mut u8,
                        mem::size_of::<libc::sockaddr_in6>(),
                    );
                }
                (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
            }
        }
    }

    pub(crate) fn from_storage(storage: &libc::sockaddr_storage) -> Option<Self> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin: &libc::sockaddr_in =
                    unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Some(Self(SocketAddr::new(
                    IpAddr::V4(ip),
                    u16::from_be(sin.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let sin6: &libc::sockaddr_in6 =
                    unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Some(Self(SocketAddr::new(
                    IpAddr::V6(ip),
                    u16::from_be(sin6.sin6_port),
                )))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(sa: SocketAddr) -> Self {
        Self(sa)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        let a = NetAddress::parse("127.0.0.1:9000", 0).unwrap();
        assert_eq!(a.port(), 9000);
        let b = NetAddress::parse("10.0.0.1", 8080).unwrap();
        assert_eq!(b.port(), 8080);
        assert!(NetAddress::parse("not an address", 1).is_err());
    }

    #[test]
    fn storage_round_trip_v4() {
        let a = NetAddress::loopback(4242);
        let (storage, _len) = a.to_storage();
        let back = NetAddress::from_storage(&storage).unwrap();
        assert_eq!(a, back);
    }

    #[test]
    fn storage_round_trip_v6() {
        let a = NetAddress::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 4243);
        let (storage, _len) = a.to_storage();
        let back = NetAddress::from_storage(&storage).unwrap();
        assert_eq!(a, back);
        assert!(back.is_ipv6());
    }

    #[test]
    fn resolve_localhost() {
        let a = NetAddress::resolve("localhost", 80).unwrap();
        assert_eq!(a.port(), 80);
        assert!(a.ip().is_loopback());
    }
}
