//! Native socket address representation.
//!
//! `SockAddr` carries a `sockaddr_storage` plus its length and converts
//! to and from `std::net::SocketAddr` without losing the family tag, the
//! network-byte-order port, or the V6 flowinfo/scope fields.

use std::mem::{self};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;

use libc::{sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t, AF_INET, AF_INET6};

use crate::error::Error;

#[derive(Clone)]
pub struct SockAddr {
    storage: sockaddr_storage,
    len: socklen_t,
}

impl SockAddr {
    /// An empty storage sized for whatever the kernel writes back.
    pub fn zeroed() -> Self {
        Self {
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<sockaddr_storage>() as socklen_t,
        }
    }

    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        let mut out = Self::zeroed();
        match addr {
            SocketAddr::V4(v4) => {
                let mut sin: sockaddr_in = unsafe { mem::zeroed() };
                sin.sin_family = AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets()).to_be();
                unsafe {
                    ptr::copy_nonoverlapping(
                        &sin as *const _ as *const u8,
                        &mut out.storage as *mut _ as *mut u8,
                        mem::size_of::<sockaddr_in>(),
                    );
                }
                out.len = mem::size_of::<sockaddr_in>() as socklen_t;
            }
            SocketAddr::V6(v6) => {
                let mut sin6: sockaddr_in6 = unsafe { mem::zeroed() };
                sin6.sin6_family = AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();
                unsafe {
                    ptr::copy_nonoverlapping(
                        &sin6 as *const _ as *const u8,
                        &mut out.storage as *mut _ as *mut u8,
                        mem::size_of::<sockaddr_in6>(),
                    );
                }
                out.len = mem::size_of::<sockaddr_in6>() as socklen_t;
            }
        }
        out
    }

    /// Decodes the stored form back into a `SocketAddr`.
    ///
    /// `None` when the family tag is neither AF_INET nor AF_INET6 (e.g. a
    /// zeroed storage the kernel never filled in).
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        unsafe {
            match self.storage.ss_family as i32 {
                AF_INET => {
                    let sin = &*(&self.storage as *const _ as *const sockaddr_in);
                    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr).to_ne_bytes());
                    Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
                }
                AF_INET6 => {
                    let sin6 = &*(&self.storage as *const _ as *const sockaddr_in6);
                    let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                    Some(SocketAddr::new(
                        IpAddr::V6(ip),
                        u16::from_be(sin6.sin6_port),
                    ))
                }
                _ => None,
            }
        }
    }

    /// Address family stored in the tag, or `AF_UNSPEC` for an empty storage.
    pub fn family(&self) -> i32 {
        self.storage.ss_family as i32
    }

    pub fn as_ptr(&self) -> *const sockaddr {
        &self.storage as *const _ as *const sockaddr
    }

    pub fn as_mut_ptr(&mut self) -> *mut sockaddr {
        &mut self.storage as *mut _ as *mut sockaddr
    }

    pub fn len(&self) -> socklen_t {
        self.len
    }

    pub fn len_mut(&mut self) -> &mut socklen_t {
        &mut self.len
    }
}

/// Rejects address families the reactor does not speak, before any native
/// call can see a mismatched tag.
pub(crate) fn check_family(addr: &SocketAddr) -> Result<(), Error> {
    match addr {
        SocketAddr::V4(_) | SocketAddr::V6(_) => Ok(()),
    }
}

/// Domain constant for socket(2) matching the endpoint's family.
pub(crate) fn domain_of(addr: &SocketAddr) -> i32 {
    match addr {
        SocketAddr::V4(_) => AF_INET,
        SocketAddr::V6(_) => AF_INET6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip_exact() {
        let addr: SocketAddr = "192.168.7.41:9000".parse().unwrap();
        let native = SockAddr::from_socket_addr(&addr);
        assert_eq!(native.family(), AF_INET);
        assert_eq!(native.to_socket_addr(), Some(addr));
    }

    #[test]
    fn v6_round_trip_preserves_scope_and_flow() {
        let addr: SocketAddr = "[fe80::1%3]:8080".parse().unwrap();
        let native = SockAddr::from_socket_addr(&addr);
        assert_eq!(native.family(), AF_INET6);
        let back = native.to_socket_addr().expect("decode failed");
        assert_eq!(back, addr);
        match back {
            SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 3),
            _ => panic!("family changed in round trip"),
        }
    }

    #[test]
    fn zeroed_storage_decodes_to_none() {
        assert!(SockAddr::zeroed().to_socket_addr().is_none());
    }

    #[test]
    fn port_crosses_in_network_byte_order() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let native = SockAddr::from_socket_addr(&addr);
        // Port 1 must sit in the high byte on little-endian hosts.
        let sin = unsafe { &*(native.as_ptr() as *const sockaddr_in) };
        assert_eq!(sin.sin_port, 1u16.to_be());
    }
}
