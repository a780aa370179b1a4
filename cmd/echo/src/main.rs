//! # emberio echo server
//!
//! TCP echo on the raw reactor surface: no protocol layer, just chained
//! read/write submissions per connection. A periodic ticker reports live
//! resources, and per-connection summaries are formatted off the loop by the
//! worker pool.
//!
//! Modes:
//!   Default: echo server
//!   --connect HOST: one-shot client — connect, send a line, print the echo
//!
//! ## Usage
//!
//!     cargo run -p emberio-echo --release -- [--port 7777] [--bind 0.0.0.0]
//!     cargo run -p emberio-echo --release -- --connect 127.0.0.1 --port 7777

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use emberio_core::{eerror, einfo};
use emberio_runtime::{Completion, EngineConfig, HandleId, NetAddress, Reactor, WorkerPool};

static TOTAL_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static TOTAL_BYTES: AtomicU64 = AtomicU64::new(0);

// ── Per-connection echo chain ──

fn arm_echo_read(re: &mut Reactor, h: HandleId, bytes: Rc<Cell<u64>>) {
    let res = re.submit_read(h, move |re, done| on_echo_read(re, done, bytes));
    if res.is_err() {
        re.close(h);
    }
}

fn on_echo_read(re: &mut Reactor, done: Completion, bytes: Rc<Cell<u64>>) {
    if !done.is_ok() || done.is_peer_closed() {
        re.close(done.handle);
        return;
    }
    let h = done.handle;
    let n = done.data().len() as u64;
    bytes.set(bytes.get() + n);
    TOTAL_BYTES.fetch_add(n, Ordering::Relaxed);
    let echoed = done.data().to_vec();
    let res = re.submit_write(h, echoed, move |re, done| {
        if !done.is_ok() {
            re.close(done.handle);
            return;
        }
        arm_echo_read(re, done.handle, bytes);
    });
    if res.is_err() {
        re.close(h);
    }
}

fn arm_accept(re: &mut Reactor, lh: HandleId, pool: Arc<WorkerPool>) {
    let p2 = Arc::clone(&pool);
    let res = re.submit_accept(lh, move |re, done| {
        if done.is_ok() {
            if let Some(acc) = done.accepted {
                let peer = acc.peer;
                match re.adopt_accepted(acc) {
                    Ok(h) => {
                        TOTAL_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
                        let bytes = Rc::new(Cell::new(0u64));
                        let report = Rc::clone(&bytes);
                        let pool = Arc::clone(&p2);
                        let _ = re.set_close_callback(h, move |_re, _h| {
                            let n = report.get();
                            if let Err(e) =
                                pool.submit(move || {
                                    einfo!("echo: {} done, {} bytes", peer, n);
                                    Ok(())
                                })
                            {
                                eerror!("echo: summary task dropped: {}", e);
                            }
                        });
                        arm_echo_read(re, h, bytes);
                    }
                    Err(e) => eerror!("echo: adopt failed: {}", e),
                }
            }
        } else {
            eerror!("echo: accept failed: {}", done.error);
        }
        arm_accept(re, lh, p2);
    });
    if let Err(e) = res {
        eerror!("echo: cannot re-arm accept: {}", e);
        re.stop();
    }
}

// ── Modes ──

fn serve(cfg: EngineConfig) -> emberio_core::error::Result<()> {
    let pool = Arc::new(WorkerPool::new(cfg.worker_threads, cfg.max_queued_tasks));
    let mut re = Reactor::new(&cfg)?;
    let addr = NetAddress::parse(&cfg.bind_addr, cfg.port)?;
    let lh = re.open_listener(&addr, cfg.backlog, None)?;
    einfo!("echo: listening on {}", re.local_addr(lh)?);
    arm_accept(&mut re, lh, pool);

    // ticker
    re.add_timer(Duration::from_secs(5), Some(Duration::from_secs(5)), -1, |re| {
        einfo!(
            "echo: conns={} bytes={} live_handles={} live_requests={}",
            TOTAL_CONNECTIONS.load(Ordering::Relaxed),
            TOTAL_BYTES.load(Ordering::Relaxed),
            re.live_handles(),
            re.live_requests(),
        );
    })?;

    re.run()
}

fn connect_once(cfg: EngineConfig, host: &str, line: String) -> emberio_core::error::Result<()> {
    let mut re = Reactor::new(&cfg)?;
    let addr = NetAddress::parse(host, cfg.port)?;
    re.open_stream(&addr, move |re, done| {
        if done.error != 0 {
            eerror!("echo: connect failed: {}", done.error);
            re.stop();
            return;
        }
        let h = done.handle;
        let res = re.submit_write(h, line.into_bytes(), |re, done| {
            if !done.is_ok() {
                re.stop();
                return;
            }
            let _ = re.submit_read(done.handle, |re, done| {
                if done.is_ok() && !done.is_peer_closed() {
                    println!("{}", String::from_utf8_lossy(done.data()));
                }
                re.close(done.handle);
                re.stop();
            });
        });
        if res.is_err() {
            re.stop();
        }
    })?;
    re.run()
}

// ── Main ──

fn usage() -> ! {
    eprintln!("usage: emberio-echo [--port N] [--bind ADDR] [--connect HOST [--msg TEXT]]");
    std::process::exit(2);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mut cfg = EngineConfig::from_env();
    let mut connect: Option<String> = None;
    let mut msg = String::from("hello over emberio\n");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                match args.get(i).and_then(|s| s.parse().ok()) {
                    Some(p) => cfg.port = p,
                    None => usage(),
                }
            }
            "--bind" => {
                i += 1;
                match args.get(i) {
                    Some(a) => cfg.bind_addr = a.clone(),
                    None => usage(),
                }
            }
            "--connect" => {
                i += 1;
                match args.get(i) {
                    Some(h) => connect = Some(h.clone()),
                    None => usage(),
                }
            }
            "--msg" => {
                i += 1;
                match args.get(i) {
                    Some(m) => msg = m.clone(),
                    None => usage(),
                }
            }
            _ => usage(),
        }
        i += 1;
    }

    let res = match connect {
        Some(host) => connect_once(cfg, &host, msg),
        None => serve(cfg),
    };
    if let Err(e) = res {
        eerror!("echo: {}", e);
        std::process::exit(1);
    }
}
