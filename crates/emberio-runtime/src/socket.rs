//! Raw nonblocking socket operations.
//!
//! Every fd the reactor touches goes through this wrapper: sockets are
//! created `SOCK_NONBLOCK | SOCK_CLOEXEC`, and read/write/accept report
//! results in the engine's completion convention — a non-negative count on
//! success, a negative errno otherwise. The wrapper owns the fd and closes
//! it on drop.

use std::os::unix::io::RawFd;

use emberio_core::error::{last_os_error, EngineError, Result};

use crate::addr::NetAddress;

pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// New nonblocking TCP socket for the address family of `addr`.
    pub fn tcp(addr: &NetAddress) -> Result<Self> {
        let family = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
        let fd = unsafe {
            libc::socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(EngineError::Os(last_os_error()));
        }
        Ok(Self { fd })
    }

    /// Wrap an already-open fd (an accepted connection).
    pub(crate) fn from_raw(fd: RawFd) -> Self {
        Self { fd }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_reuse(&self) -> Result<()> {
        let opt: libc::c_int = 1;
        unsafe {
            if libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                4,
            ) != 0
            {
                return Err(EngineError::Os(last_os_error()));
            }
            // Best effort; not all kernels expose SO_REUSEPORT.
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &opt as *const _ as *const libc::c_void,
                4,
            );
        }
        Ok(())
    }

    pub fn set_nodelay(&self) {
        let opt: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &opt as *const _ as *const libc::c_void,
                4,
            );
        }
    }

    pub fn bind(&self, addr: &NetAddress) -> Result<()> {
        let (storage, len) = addr.to_storage();
        let ret = unsafe {
            libc::bind(self.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            return Err(EngineError::Os(last_os_error()));
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        if unsafe { libc::listen(self.fd, backlog) } != 0 {
            return Err(EngineError::Os(last_os_error()));
        }
        Ok(())
    }

    /// Accept one connection. `Ok` carries the nonblocking client socket and
    /// its peer address; `Err` carries a negative errno (`-EAGAIN` when the
    /// backlog is drained).
    pub fn accept(&self) -> std::result::Result<(Socket, NetAddress), i32> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(last_os_error());
        }
        let sock = Socket::from_raw(fd);
        sock.set_nodelay();
        let peer = NetAddress::from_storage(&storage).unwrap_or_else(|| NetAddress::any(0));
        Ok((sock, peer))
    }

    /// Start a nonblocking connect. `Ok(true)` means connected immediately,
    /// `Ok(false)` means in progress (await writability), `Err` a negative
    /// errno.
    pub fn connect(&self, addr: &NetAddress) -> std::result::Result<bool, i32> {
        let (storage, len) = addr.to_storage();
        let ret = unsafe {
            libc::connect(self.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret == 0 {
            return Ok(true);
        }
        let errno = last_os_error();
        if -errno == libc::EINPROGRESS {
            Ok(false)
        } else {
            Err(errno)
        }
    }

    /// Pending connect outcome: 0 for success, negative errno otherwise.
    pub fn take_error(&self) -> i32 {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return last_os_error();
        }
        -err
    }

    /// Bytes read (0 = peer closed), or negative errno.
    pub fn read(&self, buf: &mut [u8]) -> isize {
        let n = unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n < 0 {
            last_os_error() as isize
        } else {
            n
        }
    }

    /// Bytes written, or negative errno. MSG_NOSIGNAL keeps a dead peer from
    /// raising SIGPIPE on the reactor thread.
    pub fn write(&self, buf: &[u8]) -> isize {
        let n = unsafe {
            libc::send(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            last_os_error() as isize
        } else {
            n
        }
    }

    pub fn local_addr(&self) -> Result<NetAddress> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return Err(EngineError::Os(last_os_error()));
        }
        NetAddress::from_storage(&storage).ok_or(EngineError::Os(-libc::EAFNOSUPPORT))
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
