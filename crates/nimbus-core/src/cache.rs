//! Transfer-record persistence.
//!
//! Slots persist transfer state at every durable step so an interrupted
//! transfer resumes from the last completed write. The record format is a
//! fixed little-endian layout (not a serde format): readers reject short
//! input and trailing bytes, and unknown expansion flags are an error.

use std::path::PathBuf;

use nimbus_types::{NimbusError, NodeHandle, Result};
use tracing::debug;

use crate::chunkmac::{ChunkMac, ChunkMacMap};
use crate::transfer::{ClientFile, Direction, Transfer, UploadToken};

// ---------------------------------------------------------------------------
// Record writer / reader
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// u16-length-prefixed string.
    pub fn put_string(&mut self, v: &str) {
        debug_assert!(v.len() <= u16::MAX as usize);
        self.put_u16(v.len() as u16);
        self.buf.extend_from_slice(v.as_bytes());
    }

    /// LEB128 unsigned varint.
    pub fn put_varint(&mut self, mut v: u64) {
        loop {
            let mut b = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                b |= 0x80;
            }
            self.buf.push(b);
            if v == 0 {
                break;
            }
        }
    }
}

pub struct RecordReader<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.off < n {
            return Err(NimbusError::InvalidFormat("record truncated".into()));
        }
        let s = &self.data[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| NimbusError::InvalidFormat("non-utf8 string".into()))
    }

    pub fn get_varint(&mut self) -> Result<u64> {
        let mut v = 0u64;
        let mut shift = 0;
        loop {
            let b = self.get_u8()?;
            if shift >= 64 {
                return Err(NimbusError::InvalidFormat("varint overflow".into()));
            }
            v |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
        }
    }

    /// Fail unless every byte was consumed.
    pub fn finish(&self) -> Result<()> {
        if self.off != self.data.len() {
            return Err(NimbusError::InvalidFormat("trailing data in record".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File sink records
// ---------------------------------------------------------------------------

const FLAG_SHORTNAME: u8 = 1;

pub fn serialize_file_sink(f: &ClientFile, w: &mut RecordWriter) {
    w.put_i64(f.size);
    w.put_u64(f.fsid);
    w.put_u32(f.parent_dbid);
    w.put_bytes(f.node_handle.as_bytes());
    w.put_string(&f.localname);
    if f.size >= 0 {
        w.put_bytes(&f.crc);
        w.put_varint(f.mtime);
    }
    w.put_u8(f.syncable as u8);
    let flags = if f.shortname.is_some() {
        FLAG_SHORTNAME
    } else {
        0
    };
    w.put_u8(flags);
    if let Some(sn) = &f.shortname {
        w.put_string(sn);
    }
}

pub fn deserialize_file_sink(r: &mut RecordReader<'_>) -> Result<ClientFile> {
    let size = r.get_i64()?;
    let fsid = r.get_u64()?;
    let parent_dbid = r.get_u32()?;
    let node_handle = NodeHandle(r.get_array::<6>()?);
    let localname = r.get_string()?;
    let (crc, mtime) = if size >= 0 {
        (r.get_array::<16>()?, r.get_varint()?)
    } else {
        ([0u8; 16], 0)
    };
    let syncable = match r.get_u8()? {
        0 => false,
        1 => true,
        v => {
            return Err(NimbusError::InvalidFormat(format!(
                "bad syncable byte {v}"
            )))
        }
    };
    let flags = r.get_u8()?;
    if flags & !FLAG_SHORTNAME != 0 {
        return Err(NimbusError::InvalidFormat(format!(
            "unknown expansion flags {flags:#x}"
        )));
    }
    let shortname = if flags & FLAG_SHORTNAME != 0 {
        Some(r.get_string()?)
    } else {
        None
    };
    Ok(ClientFile {
        size,
        fsid,
        parent_dbid,
        node_handle,
        localname,
        crc,
        mtime,
        syncable,
        shortname,
    })
}

// ---------------------------------------------------------------------------
// Transfer records
// ---------------------------------------------------------------------------

pub fn serialize_transfer(t: &Transfer) -> Vec<u8> {
    let mut w = RecordWriter::new();
    w.put_u8(match t.direction {
        Direction::Get => 0,
        Direction::Put => 1,
    });
    w.put_i64(t.size);
    w.put_bytes(&t.transferkey);
    w.put_u64(t.ctriv);
    w.put_i64(t.metamac);
    w.put_i64(t.pos);
    w.put_i64(t.progresscompleted);
    w.put_i64(t.fingerprint.mtime);
    w.put_bytes(&t.fingerprint.crc);
    w.put_string(&t.localfilename.to_string_lossy());

    w.put_u32(t.chunkmacs.len() as u32);
    for (&pos, e) in t.chunkmacs.iter() {
        w.put_i64(pos);
        w.put_bytes(&e.mac);
        w.put_varint(e.offset as u64);
        w.put_u8(e.finished as u8);
    }

    match &t.ultoken {
        Some(tok) => {
            w.put_u8(1);
            let b = tok.as_bytes();
            w.put_u8(b.len() as u8);
            w.put_bytes(b);
        }
        None => w.put_u8(0),
    }

    w.put_u32(t.files.len() as u32);
    for f in &t.files {
        serialize_file_sink(f, &mut w);
    }
    w.into_bytes()
}

pub fn deserialize_transfer(data: &[u8]) -> Result<Transfer> {
    let mut r = RecordReader::new(data);
    let direction = match r.get_u8()? {
        0 => Direction::Get,
        1 => Direction::Put,
        v => return Err(NimbusError::InvalidFormat(format!("bad direction {v}"))),
    };
    let size = r.get_i64()?;
    let transferkey = r.get_array::<16>()?;
    let ctriv = r.get_u64()?;
    let metamac = r.get_i64()?;
    let pos = r.get_i64()?;
    let progresscompleted = r.get_i64()?;
    let fp_mtime = r.get_i64()?;
    let fp_crc = r.get_array::<16>()?;
    let localfilename = PathBuf::from(r.get_string()?);

    let n = r.get_u32()? as usize;
    let mut chunkmacs = ChunkMacMap::new();
    for _ in 0..n {
        let cpos = r.get_i64()?;
        let mac = r.get_array::<16>()?;
        let offset = r.get_varint()? as i64;
        let finished = r.get_u8()? != 0;
        chunkmacs.insert(
            cpos,
            ChunkMac {
                mac,
                offset,
                finished,
            },
        );
    }

    let ultoken = match r.get_u8()? {
        0 => None,
        1 => {
            let len = r.get_u8()? as usize;
            let bytes = RecordReader::take(&mut r, len)?.to_vec();
            Some(
                UploadToken::from_raw(&bytes)
                    .ok_or_else(|| NimbusError::InvalidFormat("bad upload token".into()))?,
            )
        }
        v => return Err(NimbusError::InvalidFormat(format!("bad token flag {v}"))),
    };

    let nfiles = r.get_u32()? as usize;
    let mut files = Vec::with_capacity(nfiles.min(1024));
    for _ in 0..nfiles {
        files.push(deserialize_file_sink(&mut r)?);
    }
    r.finish()?;

    let mut t = Transfer::from_parts(
        direction,
        size,
        transferkey,
        ctriv,
        metamac,
        localfilename,
        fp_mtime,
        fp_crc,
    );
    t.pos = pos;
    t.progresscompleted = progresscompleted;
    t.chunkmacs = chunkmacs;
    t.ultoken = ultoken;
    t.files = files;
    t.update_contiguous_progress();
    Ok(t)
}

// ---------------------------------------------------------------------------
// Cache collaborators
// ---------------------------------------------------------------------------

/// Persistent store for in-progress transfer records.
pub trait TransferCache: Send {
    fn put(&mut self, key: &str, record: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// One record file per transfer under a cache directory.
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.xfer"))
    }
}

impl TransferCache for DirCache {
    fn put(&mut self, key: &str, record: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{key}.tmp"));
        std::fs::write(&tmp, record)?;
        std::fs::rename(&tmp, self.path(key))?;
        debug!("cached transfer record {key} ({} bytes)", record.len());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
