//! In-process test doubles for the engine's collaborators.
//!
//! The mock dispatcher answers requests synchronously from a handler
//! closure, so state-machine tests are fully deterministic; the in-memory
//! filesystem backs file access with shared byte vectors and supports
//! write-failure injection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::fs::{FileAccess, FsAccess};
use crate::http::{DispatchRequest, HttpDispatcher, Phase};

/// How the mock answers one request.
pub enum MockReply {
    /// Deliver the whole body and succeed with this HTTP status.
    Ok { status: u16, body: Vec<u8> },
    /// Fail at the HTTP level (no body). Status 0 = transport error.
    Fail {
        status: u16,
        content_type: String,
        retry_after: Option<u64>,
    },
    /// Good headers, but the connection drops after `deliver` body bytes.
    Truncate { body: Vec<u8>, deliver: usize },
    /// Good headers and `deliver` body bytes, then silence: the request
    /// stays in flight with a partial body.
    StallAfter { body: Vec<u8>, deliver: usize },
    /// Never answer; the request stays in flight.
    Stall,
}

pub type MockHandler = Box<dyn Fn(&str, Option<&[u8]>) -> MockReply + Send + Sync>;

/// Deterministic dispatcher: answers in the caller's thread from a
/// handler closure and logs every URL it saw.
pub struct MockDispatcher {
    handler: MockHandler,
    pub log: Mutex<Vec<String>>,
}

impl MockDispatcher {
    pub fn new(handler: MockHandler) -> Arc<Self> {
        Arc::new(Self {
            handler,
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl HttpDispatcher for MockDispatcher {
    fn dispatch(&self, req: DispatchRequest) {
        self.log.lock().unwrap().push(req.url.clone());
        let now = Instant::now();
        req.shared.start(now);
        match (self.handler)(&req.url, req.body.as_deref()) {
            MockReply::Ok { status, body } => {
                req.shared.set_meta(status, body.len() as i64, "application/octet-stream");
                if let Some(sent) = &req.body {
                    req.shared.add_sent(sent.len(), now);
                }
                req.shared.append_body(&body, now);
                req.shared.finish(Phase::Success);
            }
            MockReply::Fail {
                status,
                content_type,
                retry_after,
            } => {
                req.shared.set_meta(status, -1, &content_type);
                if let Some(secs) = retry_after {
                    req.shared.set_timeleft(secs);
                }
                req.shared.finish(Phase::Failure);
            }
            MockReply::Truncate { body, deliver } => {
                req.shared.set_meta(200, body.len() as i64, "application/octet-stream");
                req.shared.append_body(&body[..deliver.min(body.len())], now);
                req.shared.finish(Phase::Failure);
            }
            MockReply::StallAfter { body, deliver } => {
                req.shared.set_meta(200, body.len() as i64, "application/octet-stream");
                req.shared.append_body(&body[..deliver.min(body.len())], now);
            }
            MockReply::Stall => {
                // Headers only; the scheduler sees a silent connection.
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory filesystem
// ---------------------------------------------------------------------------

type SharedFiles = Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>;

/// Shared in-memory file store handed to the engine as its filesystem.
#[derive(Clone, Default)]
pub struct MemFs {
    files: SharedFiles,
    /// Next N writes fail (retryable).
    fail_writes: Arc<Mutex<u32>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        self.files.lock().unwrap().insert(path.into(), data);
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path.as_ref()).cloned()
    }

    pub fn inject_write_failures(&self, count: u32) {
        *self.fail_writes.lock().unwrap() = count;
    }
}

impl FsAccess for MemFs {
    fn new_file_access(&self) -> Box<dyn FileAccess> {
        Box::new(MemFileAccess {
            fs: self.clone(),
            path: None,
            retry: false,
        })
    }
}

pub struct MemFileAccess {
    fs: MemFs,
    path: Option<PathBuf>,
    retry: bool,
}

impl FileAccess for MemFileAccess {
    fn fopen(&mut self, path: &Path, write: bool, existing: bool) -> bool {
        let mut files = self.fs.files.lock().unwrap();
        let present = files.contains_key(path);
        if !present {
            if existing || !write {
                return false;
            }
            files.insert(path.to_path_buf(), Vec::new());
        }
        self.path = Some(path.to_path_buf());
        true
    }

    fn fwrite(&mut self, buf: &[u8], pos: i64) -> bool {
        {
            let mut failures = self.fs.fail_writes.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                self.retry = true;
                return false;
            }
        }
        let Some(path) = &self.path else {
            self.retry = false;
            return false;
        };
        let mut files = self.fs.files.lock().unwrap();
        let file = files.entry(path.clone()).or_default();
        let end = pos as usize + buf.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[pos as usize..end].copy_from_slice(buf);
        true
    }

    fn fread(&mut self, out: &mut Vec<u8>, len: usize, pad: usize, pos: i64) -> bool {
        let Some(path) = &self.path else {
            self.retry = false;
            return false;
        };
        let files = self.fs.files.lock().unwrap();
        let Some(file) = files.get(path) else {
            self.retry = false;
            return false;
        };
        let end = pos as usize + len;
        if file.len() < end {
            self.retry = false;
            return false;
        }
        out.clear();
        out.extend_from_slice(&file[pos as usize..end]);
        out.resize(len + pad, 0);
        true
    }

    fn retry(&self) -> bool {
        self.retry
    }
}

// ---------------------------------------------------------------------------
// Shared cache and listener
// ---------------------------------------------------------------------------

/// Cloneable in-memory transfer cache, so a test can hand the same store
/// to a second engine and exercise resumption.
#[derive(Clone, Default)]
pub struct SharedCache {
    records: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl SharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, key: &str) -> Option<Vec<u8>> {
        self.records.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }
}

impl crate::cache::TransferCache for SharedCache {
    fn put(&mut self, key: &str, record: &[u8]) -> nimbus_types::Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(key.to_string(), record.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> nimbus_types::Result<Option<Vec<u8>>> {
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    fn remove(&mut self, key: &str) -> nimbus_types::Result<()> {
        self.records.lock().unwrap().remove(key);
        Ok(())
    }
}

/// App listener that records every event it sees.
#[derive(Clone, Default)]
pub struct RecordingListener {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl crate::context::AppListener for RecordingListener {
    fn transfer_update(&mut self, t: &crate::transfer::Transfer) {
        self.events
            .lock()
            .unwrap()
            .push(format!("update:{}", t.progresscompleted));
    }

    fn transfer_failed(&mut self, _t: &crate::transfer::Transfer, e: &nimbus_types::NimbusError) {
        self.events.lock().unwrap().push(format!("failed:{e}"));
    }

    fn transfer_complete(&mut self, _t: &crate::transfer::Transfer) {
        self.events.lock().unwrap().push("complete".to_string());
    }

    fn notify_change_to_https(&mut self) {
        self.events.lock().unwrap().push("https".to_string());
    }
}

/// Split a ciphertext stream into the six raid parts, parity first.
/// Mirrors the server-side striping so tests can serve part URLs.
pub fn encode_raid_parts(data: &[u8]) -> Vec<Vec<u8>> {
    use crate::raid::{RAIDLINE, RAIDSECTOR, RAIDPARTS};
    let size = data.len() as i64;
    let mut parts = vec![Vec::new(); RAIDPARTS];
    let lines = (size + RAIDLINE - 1) / RAIDLINE;
    for line in 0..lines {
        let mut parity = [0u8; 16];
        for s in 0..5usize {
            let lo = (line * RAIDLINE + s as i64 * RAIDSECTOR).min(size) as usize;
            let hi = (line * RAIDLINE + (s as i64 + 1) * RAIDSECTOR).min(size) as usize;
            let mut sec = [0u8; 16];
            sec[..hi - lo].copy_from_slice(&data[lo..hi]);
            for (p, b) in parity.iter_mut().zip(sec) {
                *p ^= b;
            }
            parts[s + 1].extend_from_slice(&data[lo..hi]);
        }
        parts[0].extend_from_slice(&parity);
    }
    let p1 = parts[1].len();
    parts[0].truncate(p1);
    parts
}

/// Parse a ranged download URL's `start-end` suffix (end inclusive).
pub fn parse_range_suffix(url: &str) -> Option<(usize, usize)> {
    let tail = url.rsplit('/').next()?;
    let (a, b) = tail.split_once('-')?;
    Some((a.parse().ok()?, b.parse::<usize>().ok()? + 1))
}
