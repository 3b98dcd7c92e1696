//! Socket addresses.
//!
//! Conversion between the BSD `sockaddr` representation, [`SockAddr`], and
//! the address type of the stack, [`IpAddress`].

use std::mem::{size_of, zeroed};
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::{fmt, io, ptr};

use crate::errno;
use crate::stack::IpAddress;

/// BSD socket address.
///
/// Wraps a `sockaddr_storage` and the length of the address stored in it.
/// Port and IPv4 address are stored in network byte order, like the OS does.
#[derive(Copy, Clone)]
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    length: libc::socklen_t,
}

impl SockAddr {
    /// Create an `AF_UNSPEC` address.
    ///
    /// Passing this to [`NetworkingCore::connect`] dissolves the association
    /// of a datagram socket.
    ///
    /// [`NetworkingCore::connect`]: crate::NetworkingCore::connect
    pub fn unspecified() -> SockAddr {
        // SAFETY: all zeroes is a valid `sockaddr_storage`.
        let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
        storage.ss_family = libc::AF_UNSPEC as libc::sa_family_t;
        SockAddr {
            storage,
            length: size_of::<libc::sa_family_t>() as libc::socklen_t,
        }
    }

    /// Create an address by copying `length` bytes from `address`.
    ///
    /// # Safety
    ///
    /// Caller must ensure that `address` points to at least `length`
    /// initialised bytes.
    pub unsafe fn from_raw(
        address: *const libc::sockaddr,
        length: libc::socklen_t,
    ) -> io::Result<SockAddr> {
        if (length as usize) > size_of::<libc::sockaddr_storage>()
            || (length as usize) < size_of::<libc::sa_family_t>()
        {
            return Err(errno::error(libc::EINVAL));
        }
        // SAFETY: all zeroes is a valid `sockaddr_storage`.
        let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
        // SAFETY: checked the length above, caller ensures `address` is valid.
        unsafe {
            ptr::copy_nonoverlapping(
                address.cast::<u8>(),
                ptr::addr_of_mut!(storage).cast::<u8>(),
                length as usize,
            );
        }
        Ok(SockAddr { storage, length })
    }

    /// Link layer address for `interface`, used with `AF_PACKET` sockets.
    #[cfg(any(target_os = "android", target_os = "linux"))]
    pub fn link(interface: usize, protocol: u16) -> SockAddr {
        // SAFETY: all zeroes is a valid `sockaddr_storage`.
        let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
        // SAFETY: `sockaddr_storage` is large enough and suitably aligned for
        // all address types.
        let ll = unsafe { &mut *ptr::addr_of_mut!(storage).cast::<libc::sockaddr_ll>() };
        ll.sll_family = libc::AF_PACKET as libc::c_ushort;
        ll.sll_protocol = protocol.to_be();
        ll.sll_ifindex = interface as libc::c_int;
        SockAddr {
            storage,
            length: size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        }
    }

    /// Address family, e.g. `AF_INET`.
    pub fn family(&self) -> libc::c_int {
        libc::c_int::from(self.storage.ss_family)
    }

    /// Length of the address in bytes.
    pub const fn len(&self) -> libc::socklen_t {
        self.length
    }

    /// Pointer to the address, valid for [`SockAddr::len`] bytes.
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        ptr::addr_of!(self.storage).cast()
    }

    /// Returns the address as `SocketAddr`, if it's an IPv4 or IPv6 address.
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        let (address, port) = to_native(self, self.family()).ok()?;
        Some(SocketAddr::new(IpAddr::from(address), port))
    }

    /// Interface index of a link layer address.
    #[cfg(any(target_os = "android", target_os = "linux"))]
    pub fn interface(&self) -> Option<usize> {
        if self.family() != libc::AF_PACKET
            || (self.length as usize) < size_of::<libc::sockaddr_ll>()
        {
            return None;
        }
        // SAFETY: checked the family and length above.
        let ll = unsafe { &*self.as_ptr().cast::<libc::sockaddr_ll>() };
        usize::try_from(ll.sll_ifindex).ok()
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(address: SocketAddr) -> SockAddr {
        // SAFETY: all zeroes is a valid `sockaddr_storage`.
        let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
        let length = match address {
            SocketAddr::V4(address) => {
                // SAFETY: `sockaddr_storage` is large enough and suitably
                // aligned for a `sockaddr_in`.
                let sin = unsafe { &mut *ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in>() };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = address.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(address.ip().octets()),
                };
                size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(address) => {
                // SAFETY: see above.
                let sin6 =
                    unsafe { &mut *ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in6>() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = address.port().to_be();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: address.ip().octets(),
                };
                sin6.sin6_flowinfo = address.flowinfo();
                sin6.sin6_scope_id = address.scope_id();
                size_of::<libc::sockaddr_in6>()
            }
        };
        SockAddr {
            storage,
            length: length as libc::socklen_t,
        }
    }
}

impl From<SocketAddrV4> for SockAddr {
    fn from(address: SocketAddrV4) -> SockAddr {
        SockAddr::from(SocketAddr::V4(address))
    }
}

impl From<SocketAddrV6> for SockAddr {
    fn from(address: SocketAddrV6) -> SockAddr {
        SockAddr::from(SocketAddr::V6(address))
    }
}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_socket_addr() {
            Some(address) => address.fmt(f),
            None => f
                .debug_struct("SockAddr")
                .field("family", &self.family())
                .field("length", &self.length)
                .finish(),
        }
    }
}

/// Convert `address` into the representation used by the stack.
///
/// Returns `EAFNOSUPPORT` if the address isn't of `family` and `EINVAL` if
/// the address is too short.
pub(crate) fn to_native(address: &SockAddr, family: libc::c_int) -> io::Result<(IpAddress, u16)> {
    if address.family() != family {
        return Err(errno::error(libc::EAFNOSUPPORT));
    }
    match family {
        libc::AF_INET => {
            if (address.length as usize) < size_of::<libc::sockaddr_in>() {
                return Err(errno::error(libc::EINVAL));
            }
            // SAFETY: checked the family and length above.
            let sin = unsafe { &*address.as_ptr().cast::<libc::sockaddr_in>() };
            let ip = u32::from_be(sin.sin_addr.s_addr);
            Ok((IpAddress::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            if (address.length as usize) < size_of::<libc::sockaddr_in6>() {
                return Err(errno::error(libc::EINVAL));
            }
            // SAFETY: checked the family and length above.
            let sin6 = unsafe { &*address.as_ptr().cast::<libc::sockaddr_in6>() };
            let ip = IpAddress::from(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)));
            Ok((ip, u16::from_be(sin6.sin6_port)))
        }
        _ => Err(errno::error(libc::EAFNOSUPPORT)),
    }
}

/// Convert an address of the stack into a [`SockAddr`].
pub(crate) fn from_native(address: IpAddress, port: u16) -> SockAddr {
    match IpAddr::from(address) {
        IpAddr::V4(ip) => SockAddr::from(SocketAddrV4::new(ip, port)),
        IpAddr::V6(ip) => SockAddr::from(SocketAddrV6::new(ip, port, 0, 0)),
    }
}

/// Wildcard address for `family`.
pub(crate) const fn any_address(family: libc::c_int) -> IpAddress {
    if family == libc::AF_INET6 {
        IpAddress::V6_ANY
    } else {
        IpAddress::V4_ANY
    }
}

#[test]
fn ipv4_round_trip_uses_network_byte_order() {
    let address = SockAddr::from("192.168.1.10:5000".parse::<SocketAddr>().unwrap());
    assert_eq!(address.family(), libc::AF_INET);
    assert_eq!(address.len() as usize, size_of::<libc::sockaddr_in>());

    // SAFETY: created as IPv4 address above.
    let sin = unsafe { &*address.as_ptr().cast::<libc::sockaddr_in>() };
    assert_eq!(sin.sin_port, 5000u16.to_be());
    assert_eq!(sin.sin_addr.s_addr.to_ne_bytes(), [192, 168, 1, 10]);

    let (ip, port) = to_native(&address, libc::AF_INET).unwrap();
    assert_eq!(ip, IpAddress::V4(0xC0A8_010A));
    assert_eq!(port, 5000);
}

#[test]
fn ipv6_to_native() {
    let address = SockAddr::from("[2001:db8::1]:80".parse::<SocketAddr>().unwrap());
    let (ip, port) = to_native(&address, libc::AF_INET6).unwrap();
    assert_eq!(ip, IpAddress::V6([0x2001_0db8, 0, 0, 1]));
    assert_eq!(port, 80);
    assert_eq!(
        from_native(ip, port).as_socket_addr(),
        Some("[2001:db8::1]:80".parse().unwrap())
    );
}

#[test]
fn wrong_family_is_rejected() {
    let address = SockAddr::from("127.0.0.1:1".parse::<SocketAddr>().unwrap());
    let err = to_native(&address, libc::AF_INET6).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EAFNOSUPPORT));
}

#[test]
fn short_address_is_rejected() {
    let full = SockAddr::from("127.0.0.1:1".parse::<SocketAddr>().unwrap());
    // SAFETY: `full` is valid for more bytes than we copy.
    let short = unsafe { SockAddr::from_raw(full.as_ptr(), 4) }.unwrap();
    let err = to_native(&short, libc::AF_INET).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}
