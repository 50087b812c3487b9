//! Per-connection HTTP transfer requests.
//!
//! A request object pairs scheduler-owned state (the [`ReqStatus`] machine,
//! the byte range, the post URL) with a [`TransportShared`] handle that the
//! dispatcher's I/O thread fills in as the request progresses. The scheduler
//! polls the shared handle each tick; it never blocks on the network.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::chunkmac::ChunkMacMap;
use crate::piece::FilePiece;

/// Scheduler-side request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStatus {
    Ready,
    Prepared,
    Inflight,
    Success,
    Failure,
    Decrypting,
    Decrypted,
    Encrypting,
    AsyncIo,
    Done,
}

/// Transport phase published by the dispatcher thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Inflight = 1,
    Success = 2,
    Failure = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            1 => Phase::Inflight,
            2 => Phase::Success,
            3 => Phase::Failure,
            _ => Phase::Idle,
        }
    }
}

struct TransportBody {
    body: Vec<u8>,
    content_type: String,
    lastdata: Option<Instant>,
}

/// State shared between the scheduler and the dispatcher's I/O thread.
pub struct TransportShared {
    phase: AtomicU8,
    httpstatus: AtomicU16,
    contentlength: AtomicI64,
    sent: AtomicUsize,
    /// Server-supplied overquota wait in seconds; -1 when absent.
    timeleft: AtomicI64,
    cancelled: AtomicBool,
    inner: Mutex<TransportBody>,
}

impl TransportShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            phase: AtomicU8::new(Phase::Idle as u8),
            httpstatus: AtomicU16::new(0),
            contentlength: AtomicI64::new(-1),
            sent: AtomicUsize::new(0),
            timeleft: AtomicI64::new(-1),
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(TransportBody {
                body: Vec::new(),
                content_type: String::new(),
                lastdata: None,
            }),
        })
    }

    pub fn reset(&self) {
        self.phase.store(Phase::Idle as u8, Ordering::SeqCst);
        self.httpstatus.store(0, Ordering::SeqCst);
        self.contentlength.store(-1, Ordering::SeqCst);
        self.sent.store(0, Ordering::SeqCst);
        self.timeleft.store(-1, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        inner.body.clear();
        inner.content_type.clear();
        inner.lastdata = None;
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn httpstatus(&self) -> u16 {
        self.httpstatus.load(Ordering::SeqCst)
    }

    pub fn contentlength(&self) -> i64 {
        self.contentlength.load(Ordering::SeqCst)
    }

    /// Bytes of response body received so far.
    pub fn bufpos(&self) -> usize {
        self.inner.lock().unwrap().body.len()
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn timeleft_secs(&self) -> Option<u64> {
        let v = self.timeleft.load(Ordering::SeqCst);
        (v >= 0).then_some(v as u64)
    }

    pub fn lastdata(&self) -> Option<Instant> {
        self.inner.lock().unwrap().lastdata
    }

    pub fn content_type(&self) -> String {
        self.inner.lock().unwrap().content_type.clone()
    }

    pub fn take_body(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().unwrap().body)
    }

    pub fn body_snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().body.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    // -- dispatcher-side publishing --

    pub fn start(&self, now: Instant) {
        self.inner.lock().unwrap().lastdata = Some(now);
        self.phase.store(Phase::Inflight as u8, Ordering::SeqCst);
    }

    pub fn append_body(&self, chunk: &[u8], now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.body.extend_from_slice(chunk);
        inner.lastdata = Some(now);
    }

    pub fn add_sent(&self, n: usize, now: Instant) {
        self.sent.fetch_add(n, Ordering::SeqCst);
        self.inner.lock().unwrap().lastdata = Some(now);
    }

    pub fn set_meta(&self, httpstatus: u16, contentlength: i64, content_type: &str) {
        self.httpstatus.store(httpstatus, Ordering::SeqCst);
        self.contentlength.store(contentlength, Ordering::SeqCst);
        self.inner.lock().unwrap().content_type = content_type.to_string();
    }

    pub fn set_timeleft(&self, secs: u64) {
        self.timeleft.store(secs as i64, Ordering::SeqCst);
    }

    pub fn finish(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }
}

/// Work order handed to a dispatcher: a GET when `body` is `None`, a POST
/// otherwise. The dispatcher reports everything through `shared`.
pub struct DispatchRequest {
    pub url: String,
    pub body: Option<Vec<u8>>,
    pub shared: Arc<TransportShared>,
}

/// The HTTP collaborator. Implementations must not block the caller.
pub trait HttpDispatcher: Send + Sync {
    fn dispatch(&self, req: DispatchRequest);
}

// ---------------------------------------------------------------------------
// ureq-backed dispatcher
// ---------------------------------------------------------------------------

/// Production dispatcher: one background thread per in-flight request,
/// streaming bodies into the shared transport state.
pub struct UreqDispatcher {
    agent: ureq::Agent,
}

const BODY_READ_CHUNK: usize = 64 * 1024;

impl UreqDispatcher {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(120))
            .timeout_write(Duration::from_secs(120))
            .build();
        Self { agent }
    }

    fn run(agent: ureq::Agent, req: DispatchRequest) {
        use std::io::Read;

        req.shared.start(Instant::now());

        let result = match &req.body {
            Some(body) => {
                let r = agent.post(&req.url).send_bytes(body);
                if r.is_ok() {
                    req.shared.add_sent(body.len(), Instant::now());
                }
                r
            }
            None => agent.get(&req.url).call(),
        };

        let resp = match result {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, resp)) => {
                let timeleft = resp
                    .header("Retry-After")
                    .and_then(|v| v.parse::<u64>().ok());
                req.shared
                    .set_meta(code, -1, resp.content_type());
                if let Some(secs) = timeleft {
                    req.shared.set_timeleft(secs);
                }
                req.shared.finish(Phase::Failure);
                return;
            }
            Err(ureq::Error::Transport(e)) => {
                debug!("transport error: {e}");
                req.shared.set_meta(0, -1, "");
                req.shared.finish(Phase::Failure);
                return;
            }
        };

        let contentlength = resp
            .header("Content-Length")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(-1);
        req.shared
            .set_meta(resp.status(), contentlength, resp.content_type());

        let mut reader = resp.into_reader();
        let mut chunk = vec![0u8; BODY_READ_CHUNK];
        loop {
            if req.shared.is_cancelled() {
                req.shared.finish(Phase::Failure);
                return;
            }
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => req.shared.append_body(&chunk[..n], Instant::now()),
                Err(e) => {
                    warn!("body read error: {e}");
                    req.shared.finish(Phase::Failure);
                    return;
                }
            }
        }
        req.shared.finish(Phase::Success);
    }
}

impl Default for UreqDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDispatcher for UreqDispatcher {
    fn dispatch(&self, req: DispatchRequest) {
        let agent = self.agent.clone();
        std::thread::spawn(move || Self::run(agent, req));
    }
}

// ---------------------------------------------------------------------------
// Request objects
// ---------------------------------------------------------------------------

/// Direction-specific payload state.
pub enum XferPayload {
    Upload {
        /// MACs of the chunks this request carries, merged into the
        /// transfer once the chunk is known uploaded.
        chunk_macs: ChunkMacMap,
    },
    Download {
        /// Set once the receive buffer was handed to the buffer manager.
        buffer_released: bool,
    },
}

/// One connection's in-flight transfer request.
pub struct HttpXfer {
    pub status: ReqStatus,
    /// File offset (or RAID part offset) of the first requested byte.
    pub pos: i64,
    /// Requested byte count.
    pub size: u32,
    /// Full post URL, range suffix and port adjustments included.
    pub url: String,
    /// Outgoing body (uploads).
    pub out: Vec<u8>,
    pub shared: Arc<TransportShared>,
    pub payload: XferPayload,
}

impl HttpXfer {
    pub fn new_download() -> Self {
        Self {
            status: ReqStatus::Ready,
            pos: 0,
            size: 0,
            url: String::new(),
            out: Vec::new(),
            shared: TransportShared::new(),
            payload: XferPayload::Download {
                buffer_released: false,
            },
        }
    }

    pub fn new_upload() -> Self {
        Self {
            status: ReqStatus::Ready,
            pos: 0,
            size: 0,
            url: String::new(),
            out: Vec::new(),
            shared: TransportShared::new(),
            payload: XferPayload::Upload {
                chunk_macs: ChunkMacMap::new(),
            },
        }
    }

    pub fn is_upload(&self) -> bool {
        matches!(self.payload, XferPayload::Upload { .. })
    }

    /// Build a ranged download request: `base/start-end` (end inclusive).
    pub fn prepare_download(&mut self, tempurl: &str, start: i64, end: i64, alt_port: bool) {
        debug_assert!(end > start);
        self.url = format!("{tempurl}/{start}-{}", end - 1);
        if alt_port {
            toggle_port_in_url(&mut self.url);
        }
        self.pos = start;
        self.size = (end - start) as u32;
        self.out.clear();
        self.shared.reset();
        if let XferPayload::Download { buffer_released } = &mut self.payload {
            *buffer_released = false;
        }
        self.status = ReqStatus::Prepared;
    }

    /// Build an upload request from a finalized (MAC'd + encrypted) piece:
    /// `base/start` with the ciphertext as the body.
    pub fn prepare_upload_from_piece(&mut self, tempurl: &str, piece: &FilePiece, alt_port: bool) {
        debug_assert!(piece.is_finalized());
        self.url = format!("{tempurl}/{}", piece.pos());
        if alt_port {
            toggle_port_in_url(&mut self.url);
        }
        self.pos = piece.pos();
        self.size = piece.len() as u32;
        self.out = piece.take_data();
        self.out.truncate(self.size as usize);
        self.shared.reset();
        if let XferPayload::Upload { chunk_macs } = &mut self.payload {
            *chunk_macs = piece.chunk_macs();
        }
        self.status = ReqStatus::Prepared;
    }

    /// Fire the request through the dispatcher.
    pub fn post(&mut self, dispatcher: &dyn HttpDispatcher) {
        self.shared.reset();
        let body = self.is_upload().then(|| self.out.clone());
        dispatcher.dispatch(DispatchRequest {
            url: self.url.clone(),
            body,
            shared: Arc::clone(&self.shared),
        });
        self.status = ReqStatus::Inflight;
    }

    /// Map the dispatcher's transport phase into the scheduler status.
    pub fn poll_transport(&mut self) {
        if self.status == ReqStatus::Inflight {
            match self.shared.phase() {
                Phase::Success => self.status = ReqStatus::Success,
                Phase::Failure => self.status = ReqStatus::Failure,
                Phase::Idle | Phase::Inflight => {}
            }
        }
    }

    /// Bytes moved by this request so far, for progress accounting.
    pub fn transferred(&self) -> u64 {
        if self.is_upload() {
            self.shared.sent() as u64
        } else {
            self.shared.bufpos() as u64
        }
    }

    pub fn disconnect(&self) {
        self.shared.cancel();
    }

    pub fn toggle_port(&mut self) {
        toggle_port_in_url(&mut self.url);
    }

    /// Plain-http request that came back as HTML: the storage server is
    /// being intercepted, upgrade the session to HTTPS.
    pub fn looks_like_intercepted_http(&self) -> bool {
        self.url.starts_with("http:") && self.shared.content_type().contains("text/html")
    }
}

/// Insert the alternative `:8080` port after the host of a plain-http
/// URL, or remove an explicit port if one is present. No-op for https.
pub fn toggle_port_in_url(url: &mut String) {
    if !url.starts_with("http:") {
        return;
    }
    let Some(host_end) = url[8..].find('/').map(|i| i + 8) else {
        return;
    };
    match url[8..host_end].find(':') {
        None => {
            url.insert_str(host_end, ":8080");
            debug!("enabled alternative port: {url}");
        }
        Some(i) => {
            url.replace_range(8 + i..host_end, "");
            debug!("disabled alternative port: {url}");
        }
    }
}
