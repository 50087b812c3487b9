//! Per-file transfer descriptor.

use std::path::PathBuf;

use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use nimbus_crypto::{file_key, TransferCipher, FILE_KEY_LEN};
use nimbus_types::{FileFingerprint, NodeHandle};
use rand::RngCore;

use crate::chunk::chunkceil;
use crate::chunkmac::ChunkMacMap;
use crate::raid::RAIDPARTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Get,
    Put,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Active,
    Retrying,
    Paused,
    Completed,
    Failed,
}

/// A client-side file attached to a transfer: the sink of a download or
/// the source registration of an upload. Folder attachments carry
/// `size = -1` and no content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFile {
    pub size: i64,
    pub fsid: u64,
    pub parent_dbid: u32,
    pub node_handle: NodeHandle,
    pub localname: String,
    pub crc: [u8; 16],
    pub mtime: u64,
    pub syncable: bool,
    pub shortname: Option<String>,
}

/// New-style upload token length (trailing tag byte = 1).
pub const UPLOAD_TOKEN_LEN: usize = 36;
/// Legacy token length after base64 decoding.
pub const LEGACY_UPLOAD_TOKEN_LEN: usize = 27;

/// Opaque credential returned by the storage server when the final upload
/// connection completes; required to register the file node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadToken {
    bytes: [u8; UPLOAD_TOKEN_LEN],
    len: usize,
}

impl UploadToken {
    /// Classify a storage-server response body as an upload token.
    /// Anything else (typically a numeric error code) yields `None`.
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() == UPLOAD_TOKEN_LEN && body[UPLOAD_TOKEN_LEN - 1] == 1 {
            let mut bytes = [0u8; UPLOAD_TOKEN_LEN];
            bytes.copy_from_slice(body);
            return Some(Self {
                bytes,
                len: UPLOAD_TOKEN_LEN,
            });
        }
        // Legacy servers answer with a base64 token decoding to 27 bytes.
        let text = std::str::from_utf8(body).ok()?;
        let decoded = BASE64_URL_SAFE_NO_PAD.decode(text).ok()?;
        Self::from_raw(&decoded)
    }

    /// Rebuild a token from raw stored bytes (cache records).
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        if raw.len() != UPLOAD_TOKEN_LEN && raw.len() != LEGACY_UPLOAD_TOKEN_LEN {
            return None;
        }
        let mut bytes = [0u8; UPLOAD_TOKEN_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self {
            bytes,
            len: raw.len(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

pub struct Transfer {
    pub fingerprint: FileFingerprint,
    pub direction: Direction,
    pub size: i64,
    pub transferkey: [u8; 16],
    /// 64-bit counter-mode IV, combined with the byte offset to derive the
    /// CTR counter for any position in the file.
    pub ctriv: u64,
    /// Expected mac-of-macs for downloads; computed and stored for uploads.
    pub metamac: i64,
    /// mac-of-macs over the chunks downloaded so far, once computed.
    pub currentmetamac: Option<i64>,
    /// Next byte to schedule.
    pub pos: i64,
    /// Bytes durably written (downloads) or acknowledged (uploads).
    pub progresscompleted: i64,
    /// Largest offset up to which every prior chunk is finished.
    pub progresscontiguous: i64,
    pub chunkmacs: ChunkMacMap,
    pub ultoken: Option<UploadToken>,
    /// Final obfuscated file key, set when a PUT completes.
    pub filekey: Option<[u8; FILE_KEY_LEN]>,
    pub files: Vec<ClientFile>,
    pub localfilename: PathBuf,
    /// Short-lived storage URLs: six for RAID downloads, one otherwise.
    pub temp_urls: Vec<String>,
    pub slot: Option<usize>,
    pub state: TransferState,
    pub failcount: u32,
}

impl Transfer {
    pub fn new_download(
        size: i64,
        transferkey: [u8; 16],
        ctriv: u64,
        metamac: i64,
        localfilename: PathBuf,
        fingerprint: FileFingerprint,
    ) -> Self {
        Self::from_parts(
            Direction::Get,
            size,
            transferkey,
            ctriv,
            metamac,
            localfilename,
            fingerprint.mtime,
            fingerprint.crc,
        )
    }

    /// A fresh upload draws its key material from the system RNG; the
    /// metamac is only known once every chunk MAC is in.
    pub fn new_upload(size: i64, localfilename: PathBuf, fingerprint: FileFingerprint) -> Self {
        let mut rng = rand::thread_rng();
        let mut transferkey = [0u8; 16];
        rng.fill_bytes(&mut transferkey);
        let ctriv = rng.next_u64();
        Self::from_parts(
            Direction::Put,
            size,
            transferkey,
            ctriv,
            0,
            localfilename,
            fingerprint.mtime,
            fingerprint.crc,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        direction: Direction,
        size: i64,
        transferkey: [u8; 16],
        ctriv: u64,
        metamac: i64,
        localfilename: PathBuf,
        fp_mtime: i64,
        fp_crc: [u8; 16],
    ) -> Self {
        Self {
            fingerprint: FileFingerprint::new(size, fp_mtime, fp_crc),
            direction,
            size,
            transferkey,
            ctriv,
            metamac,
            currentmetamac: None,
            pos: 0,
            progresscompleted: 0,
            progresscontiguous: 0,
            chunkmacs: ChunkMacMap::new(),
            ultoken: None,
            filekey: None,
            files: Vec::new(),
            localfilename,
            temp_urls: Vec::new(),
            slot: None,
            state: TransferState::Queued,
            failcount: 0,
        }
    }

    /// Cache-table key: fingerprint plus direction.
    pub fn cache_key(&self) -> String {
        let dir = match self.direction {
            Direction::Get => 'g',
            Direction::Put => 'p',
        };
        let mut key = String::with_capacity(64);
        key.push(dir);
        key.push('-');
        for b in self.fingerprint.crc {
            key.push_str(&format!("{b:02x}"));
        }
        key.push_str(&format!("-{}-{}", self.size, self.fingerprint.mtime));
        key
    }

    pub fn cipher(&self) -> TransferCipher {
        TransferCipher::new(&self.transferkey)
    }

    pub fn is_raid(&self) -> bool {
        self.temp_urls.len() == RAIDPARTS
    }

    /// Advance the contiguous-progress frontier over finished chunks.
    ///
    /// Relies on chunk MACs being merged in write order: an entry ahead of
    /// an unfinished predecessor simply waits, it is never skipped.
    pub fn update_contiguous_progress(&mut self) {
        while self.progresscontiguous < self.size {
            if !self.chunkmacs.finished_at(self.progresscontiguous) {
                break;
            }
            self.progresscontiguous = chunkceil(self.progresscontiguous, self.size);
        }
    }

    /// First byte not yet proven durable: the contiguous-progress
    /// frontier, plus the MACed prefix of a partially written chunk
    /// sitting right at it. Scheduling resumes here after a restart.
    pub fn resume_pos(&self) -> i64 {
        match self.chunkmacs.get(self.progresscontiguous) {
            Some(e) if !e.finished => self.progresscontiguous + e.offset,
            _ => self.progresscontiguous,
        }
    }

    /// Derive and store the final file key once the upload token is in:
    /// transferkey ‖ ctriv ‖ mac-of-macs, obfuscated.
    pub fn finalize_file_key(&mut self) -> [u8; FILE_KEY_LEN] {
        let mac = self.chunkmacs.macsmac(&self.cipher());
        self.metamac = mac;
        let key = file_key(&self.transferkey, self.ctriv, mac);
        self.filekey = Some(key);
        key
    }
}
