//! Non-blocking TCP socket helpers
//!
//! Thin wrappers over the socket syscalls. Every descriptor created here
//! is non-blocking and close-on-exec, and comes back as an `OwnedFd`.

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use urpc_core::{Error, Result};

/// Outcome of a non-blocking `connect(2)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    InProgress,
}

/// Resolve `"host:port"` to the first socket address it names.
pub fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .ok_or_else(|| Error::InvalidAddress(addr.to_owned()))
}

fn to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is plain old data; all-zero is valid.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_storage is large enough for any sockaddr.
            unsafe { (&mut storage as *mut _ as *mut libc::sockaddr_in).write(sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            // SAFETY: as above.
            unsafe { (&mut storage as *mut _ as *mut libc::sockaddr_in6).write(sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn from_raw(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: family says this is a sockaddr_in.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            // SAFETY: family says this is a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// New non-blocking, close-on-exec TCP socket for `addr`'s family.
pub fn tcp_socket(addr: &SocketAddr) -> std::result::Result<OwnedFd, Errno> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    // SAFETY: plain syscall.
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    let fd = Errno::result(fd)?;
    // SAFETY: `fd` was just returned by socket(2) and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_int_opt(
    fd: BorrowedFd<'_>,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> std::result::Result<(), Errno> {
    // SAFETY: `value` outlives the call; length matches its type.
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    Errno::result(ret).map(drop)
}

pub fn set_reuse_addr(fd: BorrowedFd<'_>, on: bool) -> std::result::Result<(), Errno> {
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
}

pub fn set_reuse_port(fd: BorrowedFd<'_>, on: bool) -> std::result::Result<(), Errno> {
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as libc::c_int)
}

pub fn set_nodelay(fd: BorrowedFd<'_>, on: bool) -> std::result::Result<(), Errno> {
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
}

/// Pending socket error (`SO_ERROR`), cleared by reading it.
pub fn take_error(fd: BorrowedFd<'_>) -> std::result::Result<Option<Errno>, Errno> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `value` and `len` are valid for writes and sized correctly.
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    Errno::result(ret)?;
    Ok((value != 0).then(|| Errno::from_raw(value)))
}

pub fn bind(fd: BorrowedFd<'_>, addr: &SocketAddr) -> std::result::Result<(), Errno> {
    let (storage, len) = to_raw(addr);
    // SAFETY: `storage` holds a sockaddr of `len` bytes.
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    };
    Errno::result(ret).map(drop)
}

pub fn listen(fd: BorrowedFd<'_>, backlog: i32) -> std::result::Result<(), Errno> {
    // SAFETY: plain syscall.
    Errno::result(unsafe { libc::listen(fd.as_raw_fd(), backlog) }).map(drop)
}

/// Start a non-blocking connect.
pub fn connect(fd: BorrowedFd<'_>, addr: &SocketAddr) -> std::result::Result<ConnectStatus, Errno> {
    let (storage, len) = to_raw(addr);
    // SAFETY: `storage` holds a sockaddr of `len` bytes.
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    };
    match Errno::result(ret) {
        Ok(_) => Ok(ConnectStatus::Connected),
        // An interrupted non-blocking connect keeps going in the background.
        Err(Errno::EINPROGRESS) | Err(Errno::EINTR) => Ok(ConnectStatus::InProgress),
        Err(e) => Err(e),
    }
}

/// Accept one connection as a non-blocking, close-on-exec descriptor.
pub fn accept(fd: BorrowedFd<'_>) -> std::result::Result<(OwnedFd, Option<SocketAddr>), Errno> {
    // SAFETY: all-zero sockaddr_storage is valid.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: `storage`/`len` describe a writable buffer of the right size.
    let ret = unsafe {
        libc::accept4(
            fd.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    let client = Errno::result(ret)?;
    // SAFETY: accept4 returned a fresh descriptor we now own.
    let client = unsafe { OwnedFd::from_raw_fd(client) };
    Ok((client, from_raw(&storage)))
}

pub fn local_addr(fd: BorrowedFd<'_>) -> std::result::Result<SocketAddr, Errno> {
    // SAFETY: all-zero sockaddr_storage is valid.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: `storage`/`len` describe a writable buffer of the right size.
    let ret = unsafe {
        libc::getsockname(
            fd.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    Errno::result(ret)?;
    from_raw(&storage).ok_or(Errno::EAFNOSUPPORT)
}

/// Listening socket: create, setsockopt, bind, listen.
pub fn tcp_listener(addr: &SocketAddr, backlog: i32, reuse_port: bool) -> Result<OwnedFd> {
    let fd = tcp_socket(addr).map_err(|e| Error::os("socket", e))?;
    set_reuse_addr(fd.as_fd(), true).map_err(|e| Error::os("setsockopt(SO_REUSEADDR)", e))?;
    if reuse_port {
        set_reuse_port(fd.as_fd(), true)
            .map_err(|e| Error::os("setsockopt(SO_REUSEPORT)", e))?;
    }
    bind(fd.as_fd(), addr).map_err(|e| Error::os("bind", e))?;
    listen(fd.as_fd(), backlog).map_err(|e| Error::os("listen", e))?;
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let addr = resolve("127.0.0.1:8080").unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(matches!(resolve("not an address"), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_sockaddr_roundtrip() {
        for s in ["127.0.0.1:4321", "[::1]:9"] {
            let addr: SocketAddr = s.parse().unwrap();
            let (storage, _) = to_raw(&addr);
            assert_eq!(from_raw(&storage), Some(addr));
        }
    }

    #[test]
    fn test_listen_accept_connect() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = tcp_listener(&any, 16, false).unwrap();
        let bound = local_addr(listener.as_fd()).unwrap();
        assert_ne!(bound.port(), 0);

        assert_eq!(accept(listener.as_fd()).err(), Some(Errno::EAGAIN));

        let client = tcp_socket(&bound).unwrap();
        set_nodelay(client.as_fd(), true).unwrap();
        connect(client.as_fd(), &bound).unwrap();

        // The handshake completes in the kernel; poll accept until it shows up.
        let mut accepted = None;
        for _ in 0..1000 {
            match accept(listener.as_fd()) {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(Errno::EAGAIN) => std::thread::sleep(std::time::Duration::from_millis(1)),
                Err(e) => panic!("accept: {e}"),
            }
        }
        let (_conn, peer) = accepted.expect("connection accepted");
        assert!(peer.is_some());
        assert_eq!(take_error(client.as_fd()).unwrap(), None);
    }
}
