//! Per-connection HTTP driver.
//!
//! An `HttpLayer` owns one stream handle's protocol state: the scanner, the
//! active message, and an inbound byte cache for data that arrives ahead of
//! where the scanner wants to be. It lives in an `Rc<RefCell<..>>`; every
//! reactor callback holds only a `Weak` and checks liveness before touching
//! the layer, so completions that outlive the connection fall through
//! harmlessly.
//!
//! A message is "active" from message-begin until its response write has
//! completed and message-complete has been processed. A new message-begin
//! (or buffered bytes) during that window is a pipelining violation and
//! closes the connection.

use std::cell::RefCell;
use std::rc::Rc;

use emberio_core::cache::ByteCache;
use emberio_core::error::{Result, CANCELED};
use emberio_core::{edebug, etrace, ewarn};
use emberio_runtime::{Completion, EngineConfig, HandleId, Reactor, TimeoutAction};

use crate::msg::{HttpMsg, Station};
use crate::scanner::{ScanError, ScanHead, ScanResult, ScanSink, Scanner};
use crate::site::Site;

pub struct HttpLayer {
    handle: HandleId,
    scanner: Scanner,
    msg: Option<Rc<RefCell<HttpMsg>>>,
    site: Rc<RefCell<dyn Site>>,
    inbound: ByteCache,
    max_body: usize,
    /// Sink-side pairing: true while the current header field is open.
    field_open: bool,
    read_armed: bool,
    write_pending: bool,
    closing: bool,
    eof_seen: bool,
}

impl HttpLayer {
    /// Wire a freshly adopted stream handle: close callback, idle timeout,
    /// first read.
    pub fn attach(
        re: &mut Reactor,
        h: HandleId,
        site: Rc<RefCell<dyn Site>>,
        cfg: &EngineConfig,
    ) -> Result<Rc<RefCell<Self>>> {
        let layer = Rc::new(RefCell::new(HttpLayer {
            handle: h,
            scanner: Scanner::new(),
            msg: None,
            site,
            inbound: ByteCache::new(),
            max_body: cfg.max_body_size,
            field_open: false,
            read_armed: false,
            write_pending: false,
            closing: false,
            eof_seen: false,
        }));
        let weak = Rc::downgrade(&layer);
        re.set_close_callback(h, move |_re, _h| {
            if let Some(l) = weak.upgrade() {
                let mut l = l.borrow_mut();
                l.closing = true;
                if let Some(m) = l.msg.take() {
                    m.borrow_mut().set_station(Station::Close);
                }
                etrace!("http connection torn down");
            }
        })?;
        let weak = Rc::downgrade(&layer);
        re.set_timeout(h, cfg.idle_gap, cfg.idle_max, cfg.idle_repeats, move |_re, _h| {
            if weak.upgrade().is_some() {
                edebug!("http connection idle past limit, closing");
            }
            TimeoutAction::Close
        })?;
        Self::arm_read(re, &layer)?;
        Ok(layer)
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    fn arm_read(re: &mut Reactor, this: &Rc<RefCell<Self>>) -> Result<()> {
        let h = {
            let mut l = this.borrow_mut();
            if l.read_armed || l.closing || l.eof_seen {
                return Ok(());
            }
            l.read_armed = true;
            l.handle
        };
        let weak = Rc::downgrade(this);
        let res = re.submit_read(h, move |re, done| {
            if let Some(l) = weak.upgrade() {
                HttpLayer::on_read(re, &l, done);
            }
        });
        if res.is_err() {
            this.borrow_mut().read_armed = false;
        }
        res
    }

    fn on_read(re: &mut Reactor, this: &Rc<RefCell<Self>>, done: Completion) {
        this.borrow_mut().read_armed = false;
        if done.error == CANCELED {
            return;
        }
        if done.error != 0 {
            edebug!("http read failed: {}", done.error);
            Self::shutdown(re, this);
            return;
        }
        if done.is_peer_closed() {
            Self::on_eof(re, this);
            return;
        }
        this.borrow_mut().inbound.write(done.data());
        Self::pump(re, this);
    }

    /// Scan buffered bytes, flush any serialized response, finish the
    /// exchange if both sides are done, then re-arm the read.
    fn pump(re: &mut Reactor, this: &Rc<RefCell<Self>>) {
        enum Step {
            Scan(Vec<u8>, Scanner),
            Wait,
            Violation,
        }
        loop {
            let step = {
                let mut l = this.borrow_mut();
                if l.closing {
                    return;
                }
                let mut return_step = None;
                if l.scanner.is_done() {
                    if l.msg.is_none() {
                        l.scanner.reset();
                    } else if !l.inbound.is_empty() {
                        // bytes for a next message while this exchange is
                        // still active
                        return_step = Some(Step::Violation);
                    }
                }
                if let Some(s) = return_step {
                    s
                } else if l.inbound.is_empty() || l.scanner.is_done() {
                    Step::Wait
                } else {
                    Step::Scan(
                        l.inbound.peek_head().to_vec(),
                        std::mem::take(&mut l.scanner),
                    )
                }
            };
            match step {
                Step::Violation => {
                    Self::fail(re, this, ScanError::Pipelined);
                    return;
                }
                Step::Wait => break,
                Step::Scan(data, mut scanner) => {
                    let res = {
                        let mut l = this.borrow_mut();
                        let r = scanner.scan(&mut *l, &data);
                        l.scanner = scanner;
                        if let Ok(n) = r {
                            l.inbound.commit_head(n);
                        }
                        r
                    };
                    match res {
                        Err(e) => {
                            Self::fail(re, this, e);
                            return;
                        }
                        Ok(0) => break,
                        Ok(_) => {
                            Self::flush_response(re, this);
                            Self::maybe_finish(re, this);
                            if this.borrow().closing {
                                return;
                            }
                        }
                    }
                }
            }
        }
        if Self::arm_read(re, this).is_err() {
            Self::shutdown(re, this);
        }
    }

    /// Submit whatever the message has serialized since the last flush.
    fn flush_response(re: &mut Reactor, this: &Rc<RefCell<Self>>) {
        let (h, bytes) = {
            let l = this.borrow();
            let msg = match &l.msg {
                Some(m) => m,
                None => return,
            };
            let mut m = msg.borrow_mut();
            if m.output_len() == 0 {
                return;
            }
            (l.handle, m.take_output())
        };
        let weak = Rc::downgrade(this);
        let res = re.submit_write(h, bytes, move |re, done| {
            if let Some(l) = weak.upgrade() {
                HttpLayer::on_write(re, &l, done);
            }
        });
        match res {
            Ok(()) => this.borrow_mut().write_pending = true,
            Err(e) => {
                ewarn!("http response submit failed: {}", e);
                Self::shutdown(re, this);
            }
        }
    }

    fn on_write(re: &mut Reactor, this: &Rc<RefCell<Self>>, done: Completion) {
        let closing = {
            let mut l = this.borrow_mut();
            l.write_pending = false;
            l.closing
        };
        if done.error == CANCELED {
            return;
        }
        if done.error != 0 {
            edebug!("http write failed: {}", done.error);
            Self::shutdown(re, this);
            return;
        }
        if closing {
            // error/violation path held the close until this write flushed
            Self::shutdown(re, this);
            return;
        }
        Self::maybe_finish(re, this);
    }

    /// Exchange teardown once the response is fully on the wire and the
    /// request fully parsed: keep-alive resets for the next message,
    /// otherwise the connection closes.
    fn maybe_finish(re: &mut Reactor, this: &Rc<RefCell<Self>>) {
        let (finished, keep_alive) = {
            let l = this.borrow();
            match &l.msg {
                Some(m) => {
                    let m = m.borrow();
                    (
                        m.resp_sent() && m.station() == Station::BodyDone && !l.write_pending,
                        m.keep_alive(),
                    )
                }
                None => (false, false),
            }
        };
        if !finished {
            return;
        }
        if keep_alive {
            {
                let mut l = this.borrow_mut();
                l.msg = None;
                l.scanner.reset();
            }
            etrace!("http exchange complete, keeping alive");
            Self::pump(re, this);
        } else {
            etrace!("http exchange complete, closing");
            Self::shutdown(re, this);
        }
    }

    fn on_eof(re: &mut Reactor, this: &Rc<RefCell<Self>>) {
        let first = {
            let mut l = this.borrow_mut();
            let first = !l.eof_seen;
            l.eof_seen = true;
            first
        };
        if !first {
            return;
        }
        etrace!("http peer closed");
        Self::shutdown(re, this);
    }

    /// Protocol or collaborator failure: best-effort error response when no
    /// response bytes have gone out yet, then close.
    fn fail(re: &mut Reactor, this: &Rc<RefCell<Self>>, err: ScanError) {
        let (h, bytes, defer_to_write) = {
            let mut l = this.borrow_mut();
            if l.closing {
                return;
            }
            l.closing = true;
            if let Some(m) = &l.msg {
                m.borrow_mut().set_station(Station::Error);
            }
            let h = l.handle;
            if l.write_pending {
                (h, Vec::new(), true)
            } else {
                let already_sent = l.msg.as_ref().map_or(false, |m| m.borrow().resp_sent());
                let bytes = match err {
                    // the collaborator said close; flush anything it wrote
                    ScanError::Aborted(_) => l
                        .msg
                        .as_ref()
                        .map(|m| m.borrow_mut().take_output())
                        .unwrap_or_default(),
                    _ if !already_sent => {
                        let (code, reason) = match err {
                            ScanError::BodyTooLarge => (413, "Payload Too Large"),
                            _ => (400, "Bad Request"),
                        };
                        format!(
                            "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                            code, reason
                        )
                        .into_bytes()
                    }
                    _ => Vec::new(),
                };
                (h, bytes, false)
            }
        };
        ewarn!("http error, closing connection: {}", err);
        if defer_to_write {
            return;
        }
        if bytes.is_empty() {
            re.close(h);
        } else if re
            .submit_write(h, bytes, |re, done| re.close(done.handle))
            .is_err()
        {
            re.close(h);
        }
    }

    fn shutdown(re: &mut Reactor, this: &Rc<RefCell<Self>>) {
        let h = {
            let mut l = this.borrow_mut();
            l.closing = true;
            l.handle
        };
        re.close(h);
    }

    fn active_msg(&self) -> Option<Rc<RefCell<HttpMsg>>> {
        self.msg.clone()
    }
}

impl ScanSink for HttpLayer {
    fn on_message_begin(&mut self) -> ScanResult {
        if self.msg.is_some() {
            return Err(ScanError::Pipelined);
        }
        let mut m = HttpMsg::new(self.max_body);
        m.set_station(Station::Path);
        self.msg = Some(Rc::new(RefCell::new(m)));
        self.field_open = false;
        Ok(())
    }

    fn on_path(&mut self, bytes: &[u8]) -> ScanResult {
        if let Some(m) = self.active_msg() {
            m.borrow_mut().push_target(bytes);
        }
        Ok(())
    }

    fn on_header_field(&mut self, bytes: &[u8]) -> ScanResult {
        if let Some(m) = self.active_msg() {
            let mut m = m.borrow_mut();
            if !self.field_open {
                m.open_header();
                self.field_open = true;
            }
            m.append_header_field(bytes);
        }
        Ok(())
    }

    fn on_header_value(&mut self, bytes: &[u8]) -> ScanResult {
        self.field_open = false;
        if let Some(m) = self.active_msg() {
            m.borrow_mut().append_header_value(bytes);
        }
        Ok(())
    }

    fn on_headers_complete(&mut self, head: &ScanHead) -> ScanResult {
        let msg = match self.active_msg() {
            Some(m) => m,
            None => return Ok(()),
        };
        {
            let mut m = msg.borrow_mut();
            m.set_method(&head.method);
            m.set_version(head.major, head.minor);
            m.set_keep_alive(head.keep_alive);
            m.set_station(Station::Head);
        }
        let rc = self.site.borrow_mut().step_msg(&mut msg.borrow_mut());
        if rc != 0 {
            return Err(ScanError::Aborted(rc));
        }
        Ok(())
    }

    fn on_body(&mut self, bytes: &[u8]) -> ScanResult {
        let msg = match self.active_msg() {
            Some(m) => m,
            None => return Ok(()),
        };
        let mut m = msg.borrow_mut();
        m.set_station(Station::Body);
        if !m.append_body(bytes) {
            return Err(ScanError::BodyTooLarge);
        }
        Ok(())
    }

    fn on_chunk_header(&mut self, _size: u64) -> ScanResult {
        Ok(())
    }

    fn on_chunk_complete(&mut self) -> ScanResult {
        Ok(())
    }

    fn on_message_complete(&mut self) -> ScanResult {
        let msg = match self.active_msg() {
            Some(m) => m,
            None => return Ok(()),
        };
        msg.borrow_mut().set_station(Station::BodyDone);
        let rc = self.site.borrow_mut().step_msg(&mut msg.borrow_mut());
        if rc != 0 {
            return Err(ScanError::Aborted(rc));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::HelloSite;
    use emberio_runtime::NetAddress;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::thread;
    use std::time::Duration;

    fn arm_accept(re: &mut Reactor, lh: HandleId, site: Rc<RefCell<dyn Site>>, cfg: EngineConfig) {
        let s2 = Rc::clone(&site);
        let cfg2 = cfg.clone();
        let _ = re.submit_accept(lh, move |re, done| {
            if !done.is_ok() {
                return;
            }
            if let Some(acc) = done.accepted {
                if let Ok(h) = re.adopt_accepted(acc) {
                    let _ = HttpLayer::attach(re, h, Rc::clone(&s2), &cfg2);
                }
            }
            arm_accept(re, lh, s2, cfg2);
        });
    }

    fn serve(cfg: EngineConfig) -> (Reactor, std::net::SocketAddr) {
        let mut re = Reactor::new(&cfg).unwrap();
        let lh = re.open_listener(&NetAddress::loopback(0), 16, None).unwrap();
        let addr = re.local_addr(lh).unwrap().as_socket_addr();
        let site: Rc<RefCell<dyn Site>> = Rc::new(RefCell::new(HelloSite));
        arm_accept(&mut re, lh, site, cfg);
        re.add_timer(Duration::from_secs(10), None, 1, |re| re.stop())
            .unwrap();
        (re, addr)
    }

    fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 1024];
        loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_string();
                let cl = head
                    .lines()
                    .find_map(|l| {
                        let low = l.to_ascii_lowercase();
                        low.strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                let mut body = buf[pos + 4..].to_vec();
                while body.len() < cl {
                    let n = stream.read(&mut tmp).unwrap();
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&tmp[..n]);
                }
                body.truncate(cl);
                return (head, body);
            }
            let n = stream.read(&mut tmp).unwrap();
            assert_ne!(n, 0, "connection closed before response headers");
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    fn exchange(stream: &mut TcpStream, req: &[u8]) -> (String, Vec<u8>) {
        stream.write_all(req).unwrap();
        read_response(stream)
    }

    #[test]
    fn get_then_keep_alive_second_request() {
        let (mut re, addr) = serve(EngineConfig::from_env());
        let waker = re.waker();
        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            let (head, body) = exchange(&mut s, b"GET /test HTTP/1.1\r\nHost: a\r\n\r\n");
            assert!(head.starts_with("HTTP/1.1 200"), "got: {}", head);
            assert_eq!(body, b"hello\n");
            let (head2, body2) = exchange(&mut s, b"GET /again HTTP/1.1\r\nHost: a\r\n\r\n");
            assert!(head2.starts_with("HTTP/1.1 200"));
            assert_eq!(body2, b"hello\n");
            waker.post(|re| re.stop()).unwrap();
        });
        re.run().unwrap();
        client.join().unwrap();
    }

    #[test]
    fn post_body_is_echoed() {
        let (mut re, addr) = serve(EngineConfig::from_env());
        let waker = re.waker();
        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            let (head, body) = exchange(
                &mut s,
                b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nabcd",
            );
            assert!(head.starts_with("HTTP/1.1 200"));
            assert_eq!(body, b"abcd");
            waker.post(|re| re.stop()).unwrap();
        });
        re.run().unwrap();
        client.join().unwrap();
    }

    #[test]
    fn chunked_post_assembles_body() {
        let (mut re, addr) = serve(EngineConfig::from_env());
        let waker = re.waker();
        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            let (head, body) = exchange(
                &mut s,
                b"POST /c HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            );
            assert!(head.starts_with("HTTP/1.1 200"));
            assert_eq!(body, b"hello world");
            waker.post(|re| re.stop()).unwrap();
        });
        re.run().unwrap();
        client.join().unwrap();
    }

    #[test]
    fn body_at_cap_accepted_one_over_rejected() {
        let mut cfg = EngineConfig::from_env();
        cfg.max_body_size = 4;
        let (mut re, addr) = serve(cfg);
        let waker = re.waker();
        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            let (head, body) = exchange(
                &mut s,
                b"POST /u HTTP/1.1\r\nContent-Length: 4\r\nConnection: close\r\n\r\nabcd",
            );
            assert!(head.starts_with("HTTP/1.1 200"));
            assert_eq!(body, b"abcd");

            let mut s = TcpStream::connect(addr).unwrap();
            let (head, _) = exchange(
                &mut s,
                b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcde",
            );
            assert!(head.starts_with("HTTP/1.1 413"), "got: {}", head);
            // server closes after the error response
            let mut tmp = [0u8; 16];
            assert_eq!(s.read(&mut tmp).unwrap(), 0);
            waker.post(|re| re.stop()).unwrap();
        });
        re.run().unwrap();
        client.join().unwrap();
    }

    #[test]
    fn pipelined_overlap_closes_the_connection() {
        let (mut re, addr) = serve(EngineConfig::from_env());
        let waker = re.waker();
        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            // both requests in one segment: the second begins while the
            // first exchange is still active
            s.write_all(
                b"GET /1 HTTP/1.1\r\nHost: a\r\n\r\nGET /2 HTTP/1.1\r\nHost: a\r\n\r\n",
            )
            .unwrap();
            let (head, body) = read_response(&mut s);
            assert!(head.starts_with("HTTP/1.1 200"));
            assert_eq!(body, b"hello\n");
            // no second response; the connection is torn down
            let mut tmp = [0u8; 16];
            assert_eq!(s.read(&mut tmp).unwrap(), 0);
            waker.post(|re| re.stop()).unwrap();
        });
        re.run().unwrap();
        client.join().unwrap();
    }

    #[test]
    fn eof_mid_request_closes_once() {
        let (mut re, addr) = serve(EngineConfig::from_env());
        let waker = re.waker();
        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            s.write_all(b"GET /incomplete HTT").unwrap();
            s.shutdown(Shutdown::Write).unwrap();
            let mut tmp = [0u8; 16];
            // abrupt close, no response
            assert_eq!(s.read(&mut tmp).unwrap(), 0);
            waker.post(|re| re.stop()).unwrap();
        });
        re.run().unwrap();
        client.join().unwrap();
    }

    #[test]
    fn teardown_marks_an_active_exchange_closed() {
        let cfg = EngineConfig::from_env();
        let mut re = Reactor::new(&cfg).unwrap();
        let lh = re.open_listener(&NetAddress::loopback(0), 16, None).unwrap();
        let addr = re.local_addr(lh).unwrap().as_socket_addr();
        let layer_slot: Rc<RefCell<Option<Rc<RefCell<HttpLayer>>>>> =
            Rc::new(RefCell::new(None));
        let slot = Rc::clone(&layer_slot);
        let cfg2 = cfg.clone();
        re.submit_accept(lh, move |re, done| {
            let h = re.adopt_accepted(done.accepted.unwrap()).unwrap();
            let site: Rc<RefCell<dyn Site>> = Rc::new(RefCell::new(HelloSite));
            *slot.borrow_mut() = Some(HttpLayer::attach(re, h, site, &cfg2).unwrap());
        })
        .unwrap();

        let msg_slot: Rc<RefCell<Option<Rc<RefCell<HttpMsg>>>>> = Rc::new(RefCell::new(None));
        let captured = Rc::clone(&msg_slot);
        let slot = Rc::clone(&layer_slot);
        re.add_timer(Duration::from_millis(100), None, 1, move |re| {
            let h = {
                let guard = slot.borrow();
                let layer = guard.as_ref().expect("connection adopted").borrow();
                *captured.borrow_mut() = layer.msg.clone();
                layer.handle
            };
            re.close(h);
        })
        .unwrap();
        re.add_timer(Duration::from_millis(200), None, 1, |re| re.stop())
            .unwrap();

        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            // headers complete, body pending: the exchange stays active
            s.write_all(b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nab")
                .unwrap();
            let mut tmp = [0u8; 16];
            assert_eq!(s.read(&mut tmp).unwrap(), 0);
        });
        re.run().unwrap();
        client.join().unwrap();
        let msg = msg_slot
            .borrow()
            .clone()
            .expect("exchange was active at close");
        assert_eq!(msg.borrow().station(), Station::Close);
    }

    #[test]
    fn malformed_request_gets_best_effort_400() {
        let (mut re, addr) = serve(EngineConfig::from_env());
        let waker = re.waker();
        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            let (head, _) = exchange(&mut s, b"GET / HTTP/2.0\r\n\r\n");
            assert!(head.starts_with("HTTP/1.1 400"), "got: {}", head);
            waker.post(|re| re.stop()).unwrap();
        });
        re.run().unwrap();
        client.join().unwrap();
    }
}
