//! Filesystem access abstraction for transfer I/O.
//!
//! Slots read upload sources and write download targets through positional
//! I/O on an open handle. Implementations may additionally offer
//! asynchronous reads/writes; results are polled through [`AsyncIoHandle`]
//! (`finished` / `failed` / `retry`), matching the request state machine's
//! `AsyncIo` phase.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Poll-able handle to an in-flight asynchronous file operation.
pub trait AsyncIoHandle: Send {
    fn finished(&self) -> bool;
    fn failed(&self) -> bool;
    /// Whether the failure is worth retrying.
    fn retry(&self) -> bool;
    fn pos(&self) -> i64;
    fn len(&self) -> usize;
    /// For reads: move the data out once finished.
    fn take_buffer(&mut self) -> Option<Vec<u8>>;
    /// Block until the operation settles (used by the shutdown flush).
    fn wait(&self);
}

pub trait FileAccess: Send {
    fn fopen(&mut self, path: &Path, write: bool, existing: bool) -> bool;

    /// Write `buf` at absolute offset `pos`. On failure, `retry()` tells
    /// whether the condition is transient.
    fn fwrite(&mut self, buf: &[u8], pos: i64) -> bool;

    /// Read `len` bytes at `pos` into `out`, then append `pad` zero bytes.
    fn fread(&mut self, out: &mut Vec<u8>, len: usize, pad: usize, pos: i64) -> bool;

    /// Whether the last failed operation is retryable.
    fn retry(&self) -> bool;

    fn async_available(&self) -> bool {
        false
    }

    fn async_fwrite(&mut self, _data: Vec<u8>, _pos: i64) -> Option<Box<dyn AsyncIoHandle>> {
        None
    }

    fn async_fread(
        &mut self,
        _len: usize,
        _pad: usize,
        _pos: i64,
    ) -> Option<Box<dyn AsyncIoHandle>> {
        None
    }
}

/// Factory handed to the engine so each slot can open its own handle.
pub trait FsAccess: Send {
    fn new_file_access(&self) -> Box<dyn FileAccess>;
}

fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::WouldBlock
    )
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], pos: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, pos)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], pos: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, pos)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], pos: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut off = pos;
    let mut rest = buf;
    while !rest.is_empty() {
        let n = file.seek_write(rest, off)?;
        off += n as u64;
        rest = &rest[n..];
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], pos: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut off = pos;
    let mut rest = &mut buf[..];
    while !rest.is_empty() {
        let n = file.seek_read(rest, off)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read",
            ));
        }
        off += n as u64;
        rest = &mut rest[n..];
    }
    Ok(())
}

/// Synchronous file access over `std::fs`.
pub struct StdFileAccess {
    file: Option<File>,
    retry: bool,
}

impl StdFileAccess {
    pub fn new() -> Self {
        Self {
            file: None,
            retry: false,
        }
    }
}

impl Default for StdFileAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl FileAccess for StdFileAccess {
    fn fopen(&mut self, path: &Path, write: bool, existing: bool) -> bool {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if write {
            opts.write(true);
            if !existing {
                opts.create(true);
            }
        }
        match opts.open(path) {
            Ok(f) => {
                self.file = Some(f);
                self.retry = false;
                true
            }
            Err(e) => {
                self.retry = is_retryable_io(&e);
                false
            }
        }
    }

    fn fwrite(&mut self, buf: &[u8], pos: i64) -> bool {
        let Some(file) = self.file.as_ref() else {
            self.retry = false;
            return false;
        };
        match write_at(file, buf, pos as u64) {
            Ok(()) => true,
            Err(e) => {
                self.retry = is_retryable_io(&e);
                false
            }
        }
    }

    fn fread(&mut self, out: &mut Vec<u8>, len: usize, pad: usize, pos: i64) -> bool {
        let Some(file) = self.file.as_ref() else {
            self.retry = false;
            return false;
        };
        out.clear();
        out.resize(len, 0);
        match read_exact_at(file, out, pos as u64) {
            Ok(()) => {
                out.resize(len + pad, 0);
                true
            }
            Err(e) => {
                out.clear();
                self.retry = is_retryable_io(&e);
                false
            }
        }
    }

    fn retry(&self) -> bool {
        self.retry
    }
}

pub struct StdFsAccess;

impl FsAccess for StdFsAccess {
    fn new_file_access(&self) -> Box<dyn FileAccess> {
        Box::new(StdFileAccess::new())
    }
}

// ---------------------------------------------------------------------------
// Thread-backed asynchronous access
// ---------------------------------------------------------------------------

struct AsyncState {
    finished: bool,
    failed: bool,
    retry: bool,
    buffer: Option<Vec<u8>>,
}

struct ThreadIoHandle {
    state: Arc<(Mutex<AsyncState>, std::sync::Condvar)>,
    pos: i64,
    len: usize,
}

impl AsyncIoHandle for ThreadIoHandle {
    fn finished(&self) -> bool {
        self.state.0.lock().unwrap().finished
    }

    fn failed(&self) -> bool {
        self.state.0.lock().unwrap().failed
    }

    fn retry(&self) -> bool {
        self.state.0.lock().unwrap().retry
    }

    fn pos(&self) -> i64 {
        self.pos
    }

    fn len(&self) -> usize {
        self.len
    }

    fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.state.0.lock().unwrap().buffer.take()
    }

    fn wait(&self) {
        let (lock, cv) = &*self.state;
        let mut st = lock.lock().unwrap();
        while !st.finished {
            st = cv.wait(st).unwrap();
        }
    }
}

/// File access running reads and writes on short-lived background
/// threads, exposing the poll-able async interface.
pub struct ThreadedFileAccess {
    inner: StdFileAccess,
    path: Option<PathBuf>,
}

impl ThreadedFileAccess {
    pub fn new() -> Self {
        Self {
            inner: StdFileAccess::new(),
            path: None,
        }
    }

    fn spawn_op(
        pos: i64,
        len: usize,
        op: impl FnOnce() -> std::io::Result<Option<Vec<u8>>> + Send + 'static,
    ) -> Box<dyn AsyncIoHandle> {
        let state = Arc::new((
            Mutex::new(AsyncState {
                finished: false,
                failed: false,
                retry: false,
                buffer: None,
            }),
            std::sync::Condvar::new(),
        ));
        let state2 = Arc::clone(&state);
        std::thread::spawn(move || {
            let result = op();
            let (lock, cv) = &*state2;
            let mut st = lock.lock().unwrap();
            match result {
                Ok(buf) => st.buffer = buf,
                Err(e) => {
                    st.failed = true;
                    st.retry = is_retryable_io(&e);
                }
            }
            st.finished = true;
            cv.notify_all();
        });
        Box::new(ThreadIoHandle { state, pos, len })
    }
}

impl Default for ThreadedFileAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl FileAccess for ThreadedFileAccess {
    fn fopen(&mut self, path: &Path, write: bool, existing: bool) -> bool {
        self.path = Some(path.to_path_buf());
        self.inner.fopen(path, write, existing)
    }

    fn fwrite(&mut self, buf: &[u8], pos: i64) -> bool {
        self.inner.fwrite(buf, pos)
    }

    fn fread(&mut self, out: &mut Vec<u8>, len: usize, pad: usize, pos: i64) -> bool {
        self.inner.fread(out, len, pad, pos)
    }

    fn retry(&self) -> bool {
        self.inner.retry()
    }

    fn async_available(&self) -> bool {
        true
    }

    fn async_fwrite(&mut self, data: Vec<u8>, pos: i64) -> Option<Box<dyn AsyncIoHandle>> {
        let file = self.inner.file.as_ref()?.try_clone().ok()?;
        let len = data.len();
        Some(Self::spawn_op(pos, len, move || {
            write_at(&file, &data, pos as u64).map(|()| None)
        }))
    }

    fn async_fread(&mut self, len: usize, pad: usize, pos: i64) -> Option<Box<dyn AsyncIoHandle>> {
        let file = self.inner.file.as_ref()?.try_clone().ok()?;
        Some(Self::spawn_op(pos, len, move || {
            let mut buf = vec![0u8; len];
            read_exact_at(&file, &mut buf, pos as u64)?;
            buf.resize(len + pad, 0);
            Ok(Some(buf))
        }))
    }
}

pub struct ThreadedFsAccess;

impl FsAccess for ThreadedFsAccess {
    fn new_file_access(&self) -> Box<dyn FileAccess> {
        Box::new(ThreadedFileAccess::new())
    }
}
