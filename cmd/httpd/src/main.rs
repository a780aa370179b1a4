//! # emberio HTTP/1.1 server
//!
//! Single-threaded callback model: one reactor thread runs the accept loop,
//! every connection's parser and site, and all timers. No locks on the hot
//! path.
//!
//! Modes:
//!   Default: answers "hello\n" (or echoes the request body) for every request
//!   --dir <path>: serves static files from a directory
//!
//! TLS is enabled when both a certificate and a key are given, via flags or
//! `EMB_TLS_CERT` / `EMB_TLS_KEY`.
//!
//! ## Usage
//!
//!     cargo run -p emberio-httpd --release -- [--port 8080] [--bind 0.0.0.0]
//!         [--dir ./www] [--cert server.pem --key server.key]
//!
//! ## Benchmark
//!
//!     wrk -t4 -c100 -d10s http://127.0.0.1:8080/

use std::cell::RefCell;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use emberio_core::{eerror, einfo};
use emberio_http::{mime_of, HelloSite, HttpLayer, HttpMsg, Site, Station};
use emberio_runtime::{EngineConfig, HandleId, NetAddress, Reactor};

static TOTAL_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static TOTAL_REQUESTS: AtomicU64 = AtomicU64::new(0);

// ── Static file site ──

struct FileSite {
    root: PathBuf,
}

impl FileSite {
    /// Map a request target onto the document root. Dot-dot components are
    /// rejected outright; a directory target falls through to index.html.
    fn resolve(&self, target: &str) -> Option<PathBuf> {
        let rel = Path::new(target.trim_start_matches('/'));
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return None;
        }
        let mut full = self.root.join(rel);
        if full.is_dir() {
            full.push("index.html");
        }
        Some(full)
    }
}

impl Site for FileSite {
    fn step_msg(&mut self, msg: &mut HttpMsg) -> i32 {
        if msg.station() != Station::BodyDone || msg.resp_sent() {
            return 0;
        }
        let target = msg.path().to_string();
        let loaded = self
            .resolve(&target)
            .and_then(|p| std::fs::read(&p).ok().map(|body| (p, body)));
        match loaded {
            Some((path, body)) => {
                let mime = mime_of(&path.to_string_lossy());
                msg.write_status(200, "OK");
                msg.write_head("Content-Type", mime);
                msg.write_head("Server", "emberio-httpd");
                msg.write_body(&body);
            }
            None => {
                msg.write_status(404, "Not Found");
                msg.write_head("Content-Type", "text/plain");
                msg.write_body(b"404 Not Found\n");
            }
        }
        msg.mark_resp_sent();
        0
    }
}

/// Counts completed requests around any inner site.
struct Counted<S: Site>(S);

impl<S: Site> Site for Counted<S> {
    fn step_msg(&mut self, msg: &mut HttpMsg) -> i32 {
        if msg.station() == Station::BodyDone && !msg.resp_sent() {
            TOTAL_REQUESTS.fetch_add(1, Ordering::Relaxed);
        }
        self.0.step_msg(msg)
    }
}

// ── Accept loop ──

fn arm_accept(re: &mut Reactor, lh: HandleId, site: Rc<RefCell<dyn Site>>, cfg: EngineConfig) {
    let s2 = Rc::clone(&site);
    let cfg2 = cfg.clone();
    let res = re.submit_accept(lh, move |re, done| {
        if done.is_ok() {
            if let Some(acc) = done.accepted {
                TOTAL_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
                match re.adopt_accepted(acc) {
                    Ok(h) => {
                        if let Err(e) = HttpLayer::attach(re, h, Rc::clone(&s2), &cfg2) {
                            eerror!("httpd: attach failed: {}", e);
                            re.close(h);
                        }
                    }
                    Err(e) => eerror!("httpd: adopt failed: {}", e),
                }
            }
        } else {
            eerror!("httpd: accept failed: {}", done.error);
        }
        arm_accept(re, lh, s2, cfg2);
    });
    if let Err(e) = res {
        eerror!("httpd: cannot re-arm accept: {}", e);
        re.stop();
    }
}

// ── Main ──

fn usage() -> ! {
    eprintln!(
        "usage: emberio-httpd [--port N] [--bind ADDR] [--dir PATH] \
         [--cert PEM --key PEM]"
    );
    std::process::exit(2);
}

fn run() -> emberio_core::error::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut cfg = EngineConfig::from_env();
    let mut dir: Option<PathBuf> = None;

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
            "--dir" => {
                i += 1;
                match args.get(i) {
                    Some(d) => dir = Some(PathBuf::from(d)),
                    None => usage(),
                }
            }
            "--cert" => {
                i += 1;
                match args.get(i) {
                    Some(c) => cfg.tls_cert = Some(PathBuf::from(c)),
                    None => usage(),
                }
            }
            "--key" => {
                i += 1;
                match args.get(i) {
                    Some(k) => cfg.tls_key = Some(PathBuf::from(k)),
                    None => usage(),
                }
            }
            _ => usage(),
        }
        i += 1;
    }

    let tls = match (&cfg.tls_cert, &cfg.tls_key) {
        (Some(cert), Some(key)) => Some(emberio_runtime::tls::load_server_config(cert, key)?),
        _ => None,
    };

    let mut re = Reactor::new(&cfg)?;
    let addr = NetAddress::parse(&cfg.bind_addr, cfg.port)?;
    let lh = re.open_listener(&addr, cfg.backlog, tls.clone())?;
    einfo!(
        "httpd: serving {} on {} ({})",
        dir.as_deref().map(Path::to_string_lossy).unwrap_or_else(|| "hello".into()),
        re.local_addr(lh)?,
        if tls.is_some() { "https" } else { "http" }
    );

    let site: Rc<RefCell<dyn Site>> = match dir {
        Some(root) => Rc::new(RefCell::new(Counted(FileSite { root }))),
        None => Rc::new(RefCell::new(Counted(HelloSite))),
    };
    arm_accept(&mut re, lh, site, cfg);

    re.add_timer(Duration::from_secs(5), Some(Duration::from_secs(5)), -1, |re| {
        einfo!(
            "httpd: conns={} reqs={} live_handles={} live_requests={}",
            TOTAL_CONNECTIONS.load(Ordering::Relaxed),
            TOTAL_REQUESTS.load(Ordering::Relaxed),
            re.live_handles(),
            re.live_requests(),
        );
    })?;

    re.run()
}

fn main() {
    if let Err(e) = run() {
        eerror!("httpd: {}", e);
        std::process::exit(1);
    }
}
