//! TLS transport.
//!
//! The reactor treats a TLS session as an opaque byte pump: on readability
//! it feeds wire bytes into the rustls machine and pulls plaintext out, on
//! writability it flushes whatever the machine wants on the wire. Handshake
//! progress is a side effect of pumping; the protocol layer above never sees
//! it. Results use the engine convention: non-negative counts, negative
//! errno, `-EAGAIN` for "wait for readiness".

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use emberio_core::error::{EngineError, Result};

/// Per-stream transport choice, made once at accept time.
pub(crate) enum Transport {
    Plain,
    Tls(Box<TlsSession>),
}

impl Transport {
    /// True when the TLS machine has wire bytes waiting for writability.
    pub(crate) fn wants_flush(&self) -> bool {
        match self {
            Transport::Plain => false,
            Transport::Tls(sess) => sess.conn.wants_write(),
        }
    }
}

/// io::Read/Write over a raw nonblocking fd, for rustls to pump through.
struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.0,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn errno_of(e: &io::Error) -> i32 {
    -e.raw_os_error().unwrap_or(libc::EIO)
}

pub(crate) struct TlsSession {
    conn: rustls::ServerConnection,
}

impl TlsSession {
    pub(crate) fn accept(config: Arc<rustls::ServerConfig>) -> Result<Self> {
        let conn = rustls::ServerConnection::new(config)
            .map_err(|e| EngineError::TlsConfig(e.to_string()))?;
        Ok(Self { conn })
    }

    /// Read plaintext into `buf`. Returns bytes read, 0 for end of stream
    /// (close_notify or TCP EOF), `-EAGAIN` when blocked on the wire, a
    /// negative errno otherwise (`-EPROTO` for TLS protocol failures).
    pub(crate) fn read_into(&mut self, fd: RawFd, buf: &mut [u8]) -> isize {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return n as isize,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    // peer vanished without close_notify; surface as reset
                    return -(libc::ECONNRESET as isize);
                }
                Err(e) => return errno_of(&e) as isize,
            }

            // No plaintext buffered; pull wire bytes.
            match self.conn.read_tls(&mut FdIo(fd)) {
                Ok(0) => return 0,
                Ok(_) => {
                    if self.conn.process_new_packets().is_err() {
                        // best-effort alert, then give up on the session
                        let _ = self.conn.write_tls(&mut FdIo(fd));
                        return -(libc::EPROTO as isize);
                    }
                    // Handshake responses become flushable immediately.
                    let _ = self.flush(fd);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return -(libc::EAGAIN as isize);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return errno_of(&e) as isize,
            }
        }
    }

    /// Queue plaintext and flush as much of the resulting wire data as the
    /// socket accepts. Returns plaintext bytes accepted (possibly short when
    /// rustls' send buffer is full), or a negative errno.
    pub(crate) fn write_from(&mut self, fd: RawFd, data: &[u8]) -> isize {
        let accepted = match self.conn.writer().write(data) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return errno_of(&e) as isize,
        };
        if let Err(e) = self.flush(fd) {
            return e as isize;
        }
        if accepted == 0 {
            -(libc::EAGAIN as isize)
        } else {
            accepted as isize
        }
    }

    /// Push buffered wire bytes at the socket until done or it blocks.
    pub(crate) fn flush(&mut self, fd: RawFd) -> std::result::Result<(), i32> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut FdIo(fd)) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(errno_of(&e)),
            }
        }
        Ok(())
    }

    /// Best-effort clean shutdown before the fd closes.
    pub(crate) fn send_close_notify(&mut self, fd: RawFd) {
        self.conn.send_close_notify();
        let _ = self.flush(fd);
    }
}

/// Load a PEM cert chain + private key into a server config for listeners.
pub fn load_server_config(cert: &Path, key: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let mut cert_reader = BufReader::new(
        File::open(cert).map_err(|e| EngineError::TlsConfig(format!("cert: {}", e)))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| EngineError::TlsConfig(format!("cert parse: {}", e)))?;
    if certs.is_empty() {
        return Err(EngineError::TlsConfig("no certificates in chain".into()));
    }

    let mut key_reader = BufReader::new(
        File::open(key).map_err(|e| EngineError::TlsConfig(format!("key: {}", e)))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| EngineError::TlsConfig(format!("key parse: {}", e)))?
        .ok_or_else(|| EngineError::TlsConfig("no private key found".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| EngineError::TlsConfig(e.to_string()))?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_is_a_config_error() {
        let err = load_server_config(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        match err {
            Err(EngineError::TlsConfig(msg)) => assert!(msg.contains("cert")),
            other => panic!("expected TlsConfig error, got {:?}", other.err()),
        }
    }

    #[test]
    fn plain_transport_never_wants_flush() {
        assert!(!Transport::Plain.wants_flush());
    }
}
