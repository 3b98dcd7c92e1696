//! Socket options.
//!
//! See [`NetworkingCore::socket_option`] and
//! [`NetworkingCore::set_socket_option`] for the typed interface, and
//! [`NetworkingCore::getsockopt`] and [`NetworkingCore::setsockopt`] for the
//! raw BSD interface.

use std::ffi::c_void;
use std::mem::{size_of, MaybeUninit};
use std::os::fd::RawFd;
use std::time::Duration;
use std::{fmt, io, ptr};

use crate::errno;
use crate::net;
use crate::stack::Stack;
use crate::table::{Flags, Kind, Socket};
use crate::NetworkingCore;

macro_rules! new_option {
    (
        $(
        $(#[$type_meta:meta])*
        $type_vis: vis $type_name: ident {
            type Storage = $storage: ty;
            const LEVEL = $level: expr;
            const OPT = $opt: expr;

            // option::Get implementation.
            $(
            $(
            unsafe fn as_mut_ptr($as_mut_ptr_storage: ident: &mut MaybeUninit<Self::Storage>) -> (*mut c_void, u32) $as_mut_ptr: block
            )?

            unsafe fn init($init_storage: ident: MaybeUninit<Self::Storage>, $init_length: ident: u32) -> $output: ty $init: block
            )?

            // option::Set implementation.
            $(
            fn as_storage($as_storage_value: ident: $value: ty) -> Self::Storage $as_storage: block
            )?
        }
        )*
    ) => {
        $(
        $(#[$type_meta])*
        #[allow(missing_debug_implementations)]
        pub enum $type_name {}

        $(
        impl Get for $type_name {
            type Output = $output;
            type Storage = $storage;

            const LEVEL: Level = $level;
            const OPT: Opt = $opt.into_opt();

            $(
            unsafe fn as_mut_ptr($as_mut_ptr_storage: &mut MaybeUninit<Self::Storage>) -> (*mut c_void, u32) {
                $as_mut_ptr
            }
            )?

            unsafe fn init($init_storage: MaybeUninit<Self::Storage>, $init_length: u32) -> Self::Output {
                $init
            }
        }
        )?

        $(
        impl Set for $type_name {
            type Value = $value;
            type Storage = $storage;

            const LEVEL: Level = $level;
            const OPT: Opt = $opt.into_opt();

            fn as_storage($as_storage_value: Self::Value) -> Self::Storage {
                $as_storage
            }
        }
        )?
        )*
    };
}

/// Not an option of the OS, picked to not collide with any of them.
const RAW_RX_NO_HEADER: libc::c_int = 0x101;

/// Socket option level.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Level(pub(crate) libc::c_int);

impl Level {
    /// Options on the socket itself.
    #[doc(alias = "SOL_SOCKET")]
    pub const SOCKET: Level = Level(libc::SOL_SOCKET);
    /// IPv4 options.
    #[doc(alias = "IPPROTO_IP")]
    pub const IPV4: Level = Level(libc::IPPROTO_IP);
    /// TCP options.
    #[doc(alias = "IPPROTO_TCP")]
    pub const TCP: Level = Level(libc::IPPROTO_TCP);
}

impl From<libc::c_int> for Level {
    fn from(level: libc::c_int) -> Level {
        Level(level)
    }
}

impl fmt::Debug for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            libc::SOL_SOCKET => f.write_str("SOL_SOCKET"),
            libc::IPPROTO_IP => f.write_str("IPPROTO_IP"),
            libc::IPPROTO_TCP => f.write_str("IPPROTO_TCP"),
            level => write!(f, "{level}"),
        }
    }
}

/// Socket option, the meaning depends on the [`Level`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Opt(pub(crate) libc::c_int);

impl From<libc::c_int> for Opt {
    fn from(opt: libc::c_int) -> Opt {
        Opt(opt)
    }
}

/// Options on [`Level::SOCKET`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SocketOpt(libc::c_int);

impl SocketOpt {
    /// Pending error, cleared when read.
    #[doc(alias = "SO_ERROR")]
    pub const ERROR: SocketOpt = SocketOpt(libc::SO_ERROR);
    /// Socket type.
    #[doc(alias = "SO_TYPE")]
    pub const TYPE: SocketOpt = SocketOpt(libc::SO_TYPE);
    /// Allow reuse of local addresses.
    #[doc(alias = "SO_REUSEADDR")]
    pub const REUSE_ADDR: SocketOpt = SocketOpt(libc::SO_REUSEADDR);
    /// Size of the receive queue.
    #[doc(alias = "SO_RCVBUF")]
    pub const RECEIVE_BUFFER: SocketOpt = SocketOpt(libc::SO_RCVBUF);
    /// Timeout of blocking receive calls.
    #[doc(alias = "SO_RCVTIMEO")]
    pub const RECEIVE_TIMEOUT: SocketOpt = SocketOpt(libc::SO_RCVTIMEO);
    /// Timeout of blocking send and connect calls.
    #[doc(alias = "SO_SNDTIMEO")]
    pub const SEND_TIMEOUT: SocketOpt = SocketOpt(libc::SO_SNDTIMEO);
    /// Send keep alive probes.
    #[doc(alias = "SO_KEEPALIVE")]
    pub const KEEP_ALIVE: SocketOpt = SocketOpt(libc::SO_KEEPALIVE);
    /// Allow sending to broadcast addresses.
    #[doc(alias = "SO_BROADCAST")]
    pub const BROADCAST: SocketOpt = SocketOpt(libc::SO_BROADCAST);
    /// Wait for unsent data when closing.
    #[doc(alias = "SO_LINGER")]
    pub const LINGER: SocketOpt = SocketOpt(libc::SO_LINGER);

    /// Convert into an [`Opt`].
    pub const fn into_opt(self) -> Opt {
        Opt(self.0)
    }
}

/// Options on [`Level::IPV4`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IpOpt(libc::c_int);

impl IpOpt {
    /// Data sent on a raw socket starts with the IP header.
    #[doc(alias = "IP_HDRINCL")]
    pub const HEADER_INCLUDED: IpOpt = IpOpt(libc::IP_HDRINCL);
    /// Strip the IP header from packets received on a raw socket.
    #[doc(alias = "IP_RAW_RX_NO_HEADER")]
    pub const RAW_RX_NO_HEADER: IpOpt = IpOpt(RAW_RX_NO_HEADER);

    /// Convert into an [`Opt`].
    pub const fn into_opt(self) -> Opt {
        Opt(self.0)
    }
}

/// Options on [`Level::TCP`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TcpOpt(libc::c_int);

impl TcpOpt {
    /// Disable Nagle's algorithm.
    #[doc(alias = "TCP_NODELAY")]
    pub const NO_DELAY: TcpOpt = TcpOpt(libc::TCP_NODELAY);

    /// Convert into an [`Opt`].
    pub const fn into_opt(self) -> Opt {
        Opt(self.0)
    }
}

/// Trait that defines how get the value of a socket option.
///
/// See [`NetworkingCore::socket_option`].
pub trait Get {
    /// Returned output.
    type Output: Sized;
    /// Type passed in the `getsockopt` call.
    type Storage: Sized;

    /// Level to use, see [`Level`].
    const LEVEL: Level;
    /// Option to retrieve, see [`Opt`].
    const OPT: Opt;

    /// Returns a mutable raw pointer and length to `storage`.
    ///
    /// Default implementation casts a the pointer to `storage` and returns the
    /// size of `Storage` as length.
    ///
    /// # Safety
    ///
    /// Only initialised bytes may be written to the pointer returned.
    unsafe fn as_mut_ptr(storage: &mut MaybeUninit<Self::Storage>) -> (*mut c_void, u32) {
        (
            storage.as_mut_ptr().cast(),
            size_of::<Self::Storage>() as u32,
        )
    }

    /// Initialise the value from `storage`, to which at least `length` bytes
    /// have been written.
    ///
    /// # Safety
    ///
    /// Caller must ensure that at least `length` bytes have been written to
    /// `storage`.
    unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> Self::Output;
}

/// Trait that defines how set the value of a socket option.
///
/// See [`NetworkingCore::set_socket_option`].
pub trait Set {
    /// Value to set.
    type Value: Sized;
    /// Type passed in the `setsockopt` call.
    type Storage: Sized;

    /// Level to use, see [`Level`].
    const LEVEL: Level;
    /// Option to set, see [`Opt`].
    const OPT: Opt;

    /// Returns the value as storage for the `setsockopt` call.
    fn as_storage(value: Self::Value) -> Self::Storage;
}

new_option! {
    /// Get and clear the pending socket error.
    #[doc(alias = "SO_ERROR")]
    #[doc(alias = "take_error")] // Used by types in std lib.
    pub Error {
        type Storage = libc::c_int;
        const LEVEL = Level::SOCKET;
        const OPT = SocketOpt::ERROR;

        unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> Option<io::Error> {
            assert!(length == size_of::<Self::Storage>() as u32);
            let errno = unsafe { storage.assume_init() };
            if errno == 0 {
                None
            } else {
                Some(io::Error::from_raw_os_error(errno))
            }
        }
    }

    /// Socket type.
    #[doc(alias = "SO_TYPE")]
    pub Type {
        type Storage = libc::c_int;
        const LEVEL = Level::SOCKET;
        const OPT = SocketOpt::TYPE;

        unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> net::Type {
            assert!(length == size_of::<Self::Storage>() as u32);
            unsafe { net::Type(storage.assume_init()) }
        }
    }

    /// Allow datagram sockets to share a port.
    #[doc(alias = "SO_REUSEADDR")]
    pub ReuseAddress {
        type Storage = libc::c_int;
        const LEVEL = Level::SOCKET;
        const OPT = SocketOpt::REUSE_ADDR;

        unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> bool {
            assert!(length == size_of::<Self::Storage>() as u32);
            unsafe { storage.assume_init() >= 1 }
        }

        fn as_storage(value: bool) -> Self::Storage {
            value.into()
        }
    }

    /// Maximum number of bytes in the receive queue.
    #[doc(alias = "SO_RCVBUF")]
    pub ReceiveBuffer {
        type Storage = libc::c_int;
        const LEVEL = Level::SOCKET;
        const OPT = SocketOpt::RECEIVE_BUFFER;

        unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> usize {
            assert!(length == size_of::<Self::Storage>() as u32);
            unsafe { storage.assume_init() as usize }
        }

        fn as_storage(value: usize) -> Self::Storage {
            libc::c_int::try_from(value).unwrap_or(libc::c_int::MAX)
        }
    }

    /// Timeout of blocking receive calls, `None` blocks forever.
    #[doc(alias = "SO_RCVTIMEO")]
    pub ReceiveTimeout {
        type Storage = libc::timeval;
        const LEVEL = Level::SOCKET;
        const OPT = SocketOpt::RECEIVE_TIMEOUT;

        unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> Option<Duration> {
            assert!(length == size_of::<Self::Storage>() as u32);
            from_timeval(unsafe { storage.assume_init() })
        }

        fn as_storage(value: Option<Duration>) -> Self::Storage {
            to_timeval(value)
        }
    }

    /// Timeout of blocking connect calls, `None` uses the configured default.
    #[doc(alias = "SO_SNDTIMEO")]
    pub SendTimeout {
        type Storage = libc::timeval;
        const LEVEL = Level::SOCKET;
        const OPT = SocketOpt::SEND_TIMEOUT;

        unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> Option<Duration> {
            assert!(length == size_of::<Self::Storage>() as u32);
            from_timeval(unsafe { storage.assume_init() })
        }

        fn as_storage(value: Option<Duration>) -> Self::Storage {
            to_timeval(value)
        }
    }

    /// Enable sending of keep-alive messages on connection-oriented
    /// sockets.
    #[doc(alias = "SO_KEEPALIVE")]
    pub KeepAlive {
        type Storage = libc::c_int;
        const LEVEL = Level::SOCKET;
        const OPT = SocketOpt::KEEP_ALIVE;

        unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> bool {
            assert!(length == size_of::<Self::Storage>() as u32);
            unsafe { storage.assume_init() >= 1 }
        }

        fn as_storage(value: bool) -> Self::Storage {
            value.into()
        }
    }

    /// Permit sending of broadcast datagrams.
    #[doc(alias = "SO_BROADCAST")]
    pub Broadcast {
        type Storage = libc::c_int;
        const LEVEL = Level::SOCKET;
        const OPT = SocketOpt::BROADCAST;

        unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> bool {
            assert!(length == size_of::<Self::Storage>() as u32);
            unsafe { storage.assume_init() >= 1 }
        }

        fn as_storage(value: bool) -> Self::Storage {
            value.into()
        }
    }

    /// Linger option.
    #[doc(alias = "SO_LINGER")]
    pub Linger {
        type Storage = libc::linger;
        const LEVEL = Level::SOCKET;
        const OPT = SocketOpt::LINGER;

        unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> Option<u32> {
            assert!(length == size_of::<Self::Storage>() as u32);
            let linger = unsafe { storage.assume_init() };
            if linger.l_onoff > 0 {
                Some(linger.l_linger as u32)
            } else {
                None
            }
        }

        fn as_storage(value: Option<u32>) -> Self::Storage {
            libc::linger {
                l_onoff: value.is_some().into(),
                l_linger: value.unwrap_or(0) as libc::c_int,
            }
        }
    }

    /// Data sent on a raw socket includes the IP header.
    #[doc(alias = "IP_HDRINCL")]
    pub HeaderIncluded {
        type Storage = libc::c_int;
        const LEVEL = Level::IPV4;
        const OPT = IpOpt::HEADER_INCLUDED;

        unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> bool {
            assert!(length == size_of::<Self::Storage>() as u32);
            unsafe { storage.assume_init() >= 1 }
        }

        fn as_storage(value: bool) -> Self::Storage {
            value.into()
        }
    }

    /// Receive raw packets without the IP header.
    #[doc(alias = "IP_RAW_RX_NO_HEADER")]
    pub RawNoHeader {
        type Storage = libc::c_int;
        const LEVEL = Level::IPV4;
        const OPT = IpOpt::RAW_RX_NO_HEADER;

        unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> bool {
            assert!(length == size_of::<Self::Storage>() as u32);
            unsafe { storage.assume_init() >= 1 }
        }

        fn as_storage(value: bool) -> Self::Storage {
            value.into()
        }
    }

    /// Disable Nagle's algorithm.
    #[doc(alias = "TCP_NODELAY")]
    pub NoDelay {
        type Storage = libc::c_int;
        const LEVEL = Level::TCP;
        const OPT = TcpOpt::NO_DELAY;

        unsafe fn init(storage: MaybeUninit<Self::Storage>, length: u32) -> bool {
            assert!(length == size_of::<Self::Storage>() as u32);
            unsafe { storage.assume_init() >= 1 }
        }

        fn as_storage(value: bool) -> Self::Storage {
            value.into()
        }
    }
}

fn to_timeval(timeout: Option<Duration>) -> libc::timeval {
    let timeout = timeout.unwrap_or_default();
    libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    }
}

fn from_timeval(timeval: libc::timeval) -> Option<Duration> {
    let secs = u64::try_from(timeval.tv_sec).ok()?;
    let micros = u64::try_from(timeval.tv_usec).ok()?;
    let timeout = Duration::from_secs(secs) + Duration::from_micros(micros);
    (!timeout.is_zero()).then_some(timeout)
}

/// Value of an option as it's copied to or from the caller.
enum Value {
    Int(libc::c_int),
    Linger(libc::linger),
    Time(libc::timeval),
}

impl Value {
    /// Write the value to `value`, which has room for `*length` bytes.
    ///
    /// # Safety
    ///
    /// `value` must be valid for writes of `*length` bytes.
    unsafe fn write(&self, value: *mut c_void, length: *mut libc::socklen_t) -> io::Result<()> {
        let (src, size) = match self {
            Value::Int(int) => (ptr::from_ref(int).cast::<u8>(), size_of::<libc::c_int>()),
            Value::Linger(linger) => (ptr::from_ref(linger).cast::<u8>(), size_of::<libc::linger>()),
            Value::Time(time) => (ptr::from_ref(time).cast::<u8>(), size_of::<libc::timeval>()),
        };
        // SAFETY: caller ensures `length` is valid.
        if value.is_null() || length.is_null() || (unsafe { *length } as usize) < size {
            return Err(errno::error(libc::EINVAL));
        }
        // SAFETY: checked the size above, caller ensures `value` is valid.
        unsafe {
            ptr::copy_nonoverlapping(src, value.cast::<u8>(), size);
            *length = size as libc::socklen_t;
        }
        Ok(())
    }
}

/// Read a `T` from `value`.
///
/// # Safety
///
/// `value` must be valid for reads of `length` bytes.
unsafe fn read<T>(value: *const c_void, length: libc::socklen_t) -> io::Result<T> {
    if value.is_null() || (length as usize) < size_of::<T>() {
        return Err(errno::error(libc::EINVAL));
    }
    // SAFETY: checked the length above, caller ensures the pointer is valid.
    Ok(unsafe { ptr::read_unaligned(value.cast::<T>()) })
}

/// Read a boolean flag stored as `c_int`.
unsafe fn read_flag(value: *const c_void, length: libc::socklen_t) -> io::Result<bool> {
    // SAFETY: caller ensures the pointer is valid.
    unsafe { read::<libc::c_int>(value, length).map(|value| value != 0) }
}

const fn socket_type(socket: &Socket) -> libc::c_int {
    match socket.kind {
        Kind::Stream => libc::SOCK_STREAM,
        Kind::Datagram => libc::SOCK_DGRAM,
        Kind::Raw => libc::SOCK_RAW,
    }
}

/// Returns `ENOPROTOOPT` if the option doesn't apply to `socket`.
fn require(applies: bool) -> io::Result<()> {
    if applies {
        Ok(())
    } else {
        Err(errno::error(libc::ENOPROTOOPT))
    }
}

/// Operations of the socket options.
impl<S: Stack> NetworkingCore<S> {
    /// Get the value of a socket option.
    ///
    /// See the types in the [`option`](self) module.
    pub fn socket_option<T: Get>(&self, fd: RawFd) -> io::Result<T::Output> {
        let mut storage = MaybeUninit::<T::Storage>::uninit();
        // SAFETY: `getsockopt` only writes initialised bytes.
        let (ptr, mut length) = unsafe { T::as_mut_ptr(&mut storage) };
        // SAFETY: `ptr` is valid for `length` bytes.
        unsafe { self.getsockopt(fd, T::LEVEL, T::OPT, ptr, &mut length)? };
        // SAFETY: `getsockopt` wrote `length` bytes.
        Ok(unsafe { T::init(storage, length) })
    }

    /// Set the value of a socket option.
    ///
    /// See the types in the [`option`](self) module.
    pub fn set_socket_option<T: Set>(&self, fd: RawFd, value: T::Value) -> io::Result<()> {
        let storage = T::as_storage(value);
        let length = size_of::<T::Storage>() as libc::socklen_t;
        // SAFETY: `storage` is valid for `length` bytes.
        unsafe { self.setsockopt(fd, T::LEVEL, T::OPT, ptr::from_ref(&storage).cast(), length) }
    }

    /// Get the value of a socket option, BSD style.
    ///
    /// On input `length` must hold the size of the buffer `value` points to,
    /// on output it holds the size of the value written.
    ///
    /// # Safety
    ///
    /// `value` must be valid for writes of `*length` bytes and `length` must
    /// be valid for reads and writes.
    pub unsafe fn getsockopt(
        &self,
        fd: RawFd,
        level: Level,
        opt: Opt,
        value: *mut c_void,
        length: *mut libc::socklen_t,
    ) -> io::Result<()> {
        // SAFETY: caller ensures the pointers are valid.
        errno::record(unsafe { self.get_option(fd, level, opt, value, length) })
    }

    unsafe fn get_option(
        &self,
        fd: RawFd,
        level: Level,
        opt: Opt,
        value: *mut c_void,
        length: *mut libc::socklen_t,
    ) -> io::Result<()> {
        let mut state = self.lock()?;
        let index = state.table.lookup(fd).ok_or_else(|| errno::error(libc::EBADF))?;
        let socket = state.table.get_mut(index).ok_or_else(|| errno::error(libc::EBADF))?;
        let flag = |flag: bool| Value::Int(flag.into());
        let result = match (level.0, opt.0) {
            (libc::SOL_SOCKET, libc::SO_ERROR) => Value::Int(socket.take_error().unwrap_or(0)),
            (libc::SOL_SOCKET, libc::SO_TYPE) => Value::Int(socket_type(socket)),
            (libc::SOL_SOCKET, libc::SO_REUSEADDR) => {
                flag(socket.flags.contains(Flags::REUSEADDR))
            }
            (libc::SOL_SOCKET, libc::SO_RCVBUF) => {
                Value::Int(libc::c_int::try_from(socket.queue.max_bytes()).unwrap_or(libc::c_int::MAX))
            }
            (libc::SOL_SOCKET, libc::SO_RCVTIMEO) => {
                Value::Time(to_timeval(socket.options.receive_timeout))
            }
            (libc::SOL_SOCKET, libc::SO_SNDTIMEO) => {
                Value::Time(to_timeval(socket.options.send_timeout))
            }
            (libc::SOL_SOCKET, libc::SO_KEEPALIVE) => flag(socket.options.keep_alive),
            (libc::SOL_SOCKET, libc::SO_BROADCAST) => flag(socket.options.broadcast),
            (libc::SOL_SOCKET, libc::SO_LINGER) => Value::Linger(libc::linger {
                l_onoff: socket.options.linger.is_some().into(),
                l_linger: socket.options.linger.unwrap_or(0) as libc::c_int,
            }),
            (libc::IPPROTO_IP, libc::IP_HDRINCL) => {
                require(socket.kind == Kind::Raw)?;
                flag(socket.flags.contains(Flags::TX_HDR_INCLUDE))
            }
            (libc::IPPROTO_IP, RAW_RX_NO_HEADER) => {
                require(socket.kind == Kind::Raw)?;
                flag(socket.flags.contains(Flags::RX_NO_HDR))
            }
            (libc::IPPROTO_TCP, libc::TCP_NODELAY) => {
                require(socket.is_stream())?;
                flag(socket.options.no_delay)
            }
            _ => return Err(errno::error(libc::ENOPROTOOPT)),
        };
        // SAFETY: caller ensures the pointers are valid.
        unsafe { result.write(value, length) }
    }

    /// Set the value of a socket option, BSD style.
    ///
    /// # Safety
    ///
    /// `value` must be valid for reads of `length` bytes.
    pub unsafe fn setsockopt(
        &self,
        fd: RawFd,
        level: Level,
        opt: Opt,
        value: *const c_void,
        length: libc::socklen_t,
    ) -> io::Result<()> {
        // SAFETY: caller ensures the pointer is valid.
        errno::record(unsafe { self.set_option(fd, level, opt, value, length) })
    }

    unsafe fn set_option(
        &self,
        fd: RawFd,
        level: Level,
        opt: Opt,
        value: *const c_void,
        length: libc::socklen_t,
    ) -> io::Result<()> {
        let mut state = self.lock()?;
        let index = state.table.lookup(fd).ok_or_else(|| errno::error(libc::EBADF))?;
        let socket = state.table.get_mut(index).ok_or_else(|| errno::error(libc::EBADF))?;
        // SAFETY: caller ensures the pointer is valid for all reads below.
        unsafe {
            match (level.0, opt.0) {
                (libc::SOL_SOCKET, libc::SO_REUSEADDR) => {
                    socket.flags.set(Flags::REUSEADDR, read_flag(value, length)?);
                }
                (libc::SOL_SOCKET, libc::SO_RCVBUF) => {
                    let size = read::<libc::c_int>(value, length)?;
                    let size = usize::try_from(size)
                        .ok()
                        .filter(|size| *size > 0)
                        .ok_or_else(|| errno::error(libc::EINVAL))?;
                    socket.queue.set_max_bytes(size);
                }
                (libc::SOL_SOCKET, libc::SO_RCVTIMEO) => {
                    socket.options.receive_timeout = read_timeout(value, length)?;
                }
                (libc::SOL_SOCKET, libc::SO_SNDTIMEO) => {
                    socket.options.send_timeout = read_timeout(value, length)?;
                }
                (libc::SOL_SOCKET, libc::SO_KEEPALIVE) => {
                    socket.options.keep_alive = read_flag(value, length)?;
                }
                (libc::SOL_SOCKET, libc::SO_BROADCAST) => {
                    socket.options.broadcast = read_flag(value, length)?;
                }
                (libc::SOL_SOCKET, libc::SO_LINGER) => {
                    let linger = read::<libc::linger>(value, length)?;
                    socket.options.linger = if linger.l_onoff != 0 {
                        Some(u32::try_from(linger.l_linger).map_err(|_| errno::error(libc::EINVAL))?)
                    } else {
                        None
                    };
                }
                (libc::IPPROTO_IP, libc::IP_HDRINCL) => {
                    require(socket.kind == Kind::Raw)?;
                    socket.flags.set(Flags::TX_HDR_INCLUDE, read_flag(value, length)?);
                }
                (libc::IPPROTO_IP, RAW_RX_NO_HEADER) => {
                    require(socket.kind == Kind::Raw)?;
                    socket.flags.set(Flags::RX_NO_HDR, read_flag(value, length)?);
                }
                (libc::IPPROTO_TCP, libc::TCP_NODELAY) => {
                    require(socket.is_stream())?;
                    socket.options.no_delay = read_flag(value, length)?;
                }
                _ => return Err(errno::error(libc::ENOPROTOOPT)),
            }
        }
        log::trace!(fd = fd, level = level.0, opt = opt.0; "set socket option");
        Ok(())
    }
}

/// Read a timeout, zero means no timeout.
unsafe fn read_timeout(value: *const c_void, length: libc::socklen_t) -> io::Result<Option<Duration>> {
    // SAFETY: caller ensures the pointer is valid.
    let timeval = unsafe { read::<libc::timeval>(value, length)? };
    if timeval.tv_sec < 0 || timeval.tv_usec < 0 || timeval.tv_usec >= 1_000_000 {
        return Err(errno::error(libc::EDOM));
    }
    Ok(from_timeval(timeval))
}

#[test]
fn timeval_conversion() {
    assert_eq!(from_timeval(to_timeval(None)), None);
    let timeout = Duration::from_millis(1500);
    assert_eq!(from_timeval(to_timeval(Some(timeout))), Some(timeout));
}
