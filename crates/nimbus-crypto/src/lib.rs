//! Transfer payload cipher.
//!
//! File bodies travel as AES-128 CTR ciphertext. Integrity is a two-level
//! scheme: every chunk carries a CBC-MAC over its plaintext, and the file-wide
//! MAC ("mac-of-macs") is an AES fold of the per-chunk MACs, condensed to
//! 64 bits. The same key material drives all three operations, so one
//! [`TransferCipher`] instance per transfer suffices.
//!
//! Chunk MACs are computed incrementally: a piece of a chunk updates the
//! stored 16-byte chain state, so MAC computation can resume mid-chunk after
//! a partial write or a process restart.

use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek};

/// AES block size; all MAC arithmetic is in units of this.
pub const BLOCK_LEN: usize = 16;

/// Transfer key length (AES-128).
pub const KEY_LEN: usize = 16;

/// Full file key as registered with the metadata service:
/// `key ‖ ctriv ‖ condensed mac`, XOR-obfuscated.
pub const FILE_KEY_LEN: usize = 32;

type Ctr128 = ctr::Ctr128BE<Aes128>;

/// Symmetric cipher bound to one transfer's 16-byte key.
#[derive(Clone)]
pub struct TransferCipher {
    key: [u8; KEY_LEN],
    aes: Aes128,
}

impl TransferCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            key: *key,
            aes: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Apply the CTR keystream to `buf`, which starts at absolute file
    /// offset `pos`. Encryption and decryption are the same operation.
    ///
    /// The counter block is `ctriv (little-endian) ‖ 0u64`, advanced
    /// big-endian across the whole block; `pos` need not be block-aligned.
    pub fn ctr_crypt(&self, buf: &mut [u8], pos: u64, ctriv: u64) {
        if buf.is_empty() {
            return;
        }
        let mut iv = [0u8; BLOCK_LEN];
        iv[..8].copy_from_slice(&ctriv.to_le_bytes());
        let mut ctr = Ctr128::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&iv),
        );
        ctr.seek(pos);
        ctr.apply_keystream(buf);
    }

    /// Fresh chunk-MAC chain state: the CBC IV is `ctriv ‖ ctriv`.
    pub fn mac_init(&self, ctriv: u64) -> [u8; BLOCK_LEN] {
        let mut state = [0u8; BLOCK_LEN];
        state[..8].copy_from_slice(&ctriv.to_le_bytes());
        state[8..].copy_from_slice(&ctriv.to_le_bytes());
        state
    }

    /// Advance a chunk-MAC chain over `data` plaintext: for each block,
    /// XOR into the state and encrypt the state.
    ///
    /// A trailing partial block is zero-padded, so it is only valid for
    /// the final update of a chunk (chunks end block-aligned except at
    /// end of file).
    pub fn mac_update(&self, state: &mut [u8; BLOCK_LEN], data: &[u8]) {
        let whole = data.len() - data.len() % BLOCK_LEN;
        for block in data[..whole].chunks_exact(BLOCK_LEN) {
            xor_into(state, block);
            self.aes.encrypt_block(GenericArray::from_mut_slice(state));
        }
        let rest = &data[whole..];
        if !rest.is_empty() {
            let mut padded = [0u8; BLOCK_LEN];
            padded[..rest.len()].copy_from_slice(rest);
            xor_into(state, &padded);
            self.aes.encrypt_block(GenericArray::from_mut_slice(state));
        }
    }

    /// CBC-MAC over one whole chunk's plaintext.
    pub fn chunk_mac(&self, plaintext: &[u8], ctriv: u64) -> [u8; BLOCK_LEN] {
        let mut state = self.mac_init(ctriv);
        self.mac_update(&mut state, plaintext);
        state
    }

    /// One step of the mac-of-macs fold: XOR a chunk MAC into the
    /// accumulator, then encrypt the accumulator in place.
    pub fn fold_mac(&self, acc: &mut [u8; BLOCK_LEN], chunk_mac: &[u8; BLOCK_LEN]) {
        xor_block(acc, chunk_mac);
        self.aes.encrypt_block(GenericArray::from_mut_slice(acc));
    }
}

fn xor_into(dst: &mut [u8; BLOCK_LEN], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

/// XOR `src` into `dst`.
pub fn xor_block(dst: &mut [u8; BLOCK_LEN], src: &[u8; BLOCK_LEN]) {
    xor_into(dst, src);
}

/// Condense a 16-byte MAC accumulator to the 64-bit value stored in file
/// keys: word 0 ^= word 1, word 1 = word 2 ^ word 3, read little-endian.
pub fn condense_mac(mac: &[u8; BLOCK_LEN]) -> i64 {
    let mut m = *mac;
    for i in 0..4 {
        m[i] ^= m[i + 4];
        m[i + 4] = m[i + 8] ^ m[i + 12];
    }
    i64::from_le_bytes(m[..8].try_into().expect("8 bytes"))
}

/// Assemble and obfuscate the 32-byte file key sent to the cloud:
/// `[transferkey][ctriv][mac]` with the second half XORed by the first.
pub fn file_key(transferkey: &[u8; KEY_LEN], ctriv: u64, mac: i64) -> [u8; FILE_KEY_LEN] {
    let mut key = [0u8; FILE_KEY_LEN];
    key[..KEY_LEN].copy_from_slice(transferkey);
    key[16..24].copy_from_slice(&ctriv.to_le_bytes());
    key[24..32].copy_from_slice(&mac.to_le_bytes());
    for i in 0..KEY_LEN {
        key[KEY_LEN + i] ^= key[i];
    }
    key
}

/// Invert [`file_key`]: recover `(transferkey, ctriv, mac)`.
pub fn split_file_key(key: &[u8; FILE_KEY_LEN]) -> ([u8; KEY_LEN], u64, i64) {
    let mut k = *key;
    for i in 0..KEY_LEN {
        k[KEY_LEN + i] ^= k[i];
    }
    let transferkey: [u8; KEY_LEN] = k[..KEY_LEN].try_into().expect("16 bytes");
    let ctriv = u64::from_le_bytes(k[16..24].try_into().expect("8 bytes"));
    let mac = i64::from_le_bytes(k[24..32].try_into().expect("8 bytes"));
    (transferkey, ctriv, mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TransferCipher {
        TransferCipher::new(&[0u8; KEY_LEN])
    }

    #[test]
    fn ctr_round_trip_at_offsets() {
        let c = TransferCipher::new(b"0123456789abcdef");
        let plain: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        for &pos in &[0u64, 1, 15, 16, 17, 131072, 131072 + 5] {
            let mut buf = plain.clone();
            c.ctr_crypt(&mut buf, pos, 0x1122_3344_5566_7788);
            assert_ne!(buf, plain);
            c.ctr_crypt(&mut buf, pos, 0x1122_3344_5566_7788);
            assert_eq!(buf, plain);
        }
    }

    #[test]
    fn ctr_piecewise_matches_whole() {
        let c = cipher();
        let mut whole = vec![0xAAu8; 4096];
        c.ctr_crypt(&mut whole, 0, 7);

        let mut first = vec![0xAAu8; 1000];
        let mut second = vec![0xAAu8; 3096];
        c.ctr_crypt(&mut first, 0, 7);
        c.ctr_crypt(&mut second, 1000, 7);
        first.extend_from_slice(&second);
        assert_eq!(first, whole);
    }

    #[test]
    fn mac_incremental_matches_one_shot() {
        let c = cipher();
        let data: Vec<u8> = (0..480u32).map(|i| i as u8).collect();
        let one_shot = c.chunk_mac(&data, 99);

        let mut state = c.mac_init(99);
        c.mac_update(&mut state, &data[..160]);
        c.mac_update(&mut state, &data[160..320]);
        c.mac_update(&mut state, &data[320..]);
        assert_eq!(state, one_shot);
    }

    #[test]
    fn chunk_mac_pads_partial_block() {
        let c = cipher();
        // A 1-byte chunk MACs like the same byte zero-padded to one block.
        let mac_short = c.chunk_mac(&[0x42], 3);
        let mut padded = [0u8; BLOCK_LEN];
        padded[0] = 0x42;
        let mac_padded = c.chunk_mac(&padded, 3);
        assert_eq!(mac_short, mac_padded);
    }

    #[test]
    fn chunk_mac_depends_on_iv() {
        let c = cipher();
        let data = [7u8; 64];
        assert_ne!(c.chunk_mac(&data, 1), c.chunk_mac(&data, 2));
    }

    #[test]
    fn condense_zero_is_zero() {
        assert_eq!(condense_mac(&[0u8; BLOCK_LEN]), 0);
    }

    #[test]
    fn condense_mixes_all_words() {
        let mut mac = [0u8; BLOCK_LEN];
        mac[12] = 0x80; // only the last word set
        assert_ne!(condense_mac(&mac), 0);
    }

    #[test]
    fn file_key_round_trip() {
        let tk = *b"fedcba9876543210";
        let key = file_key(&tk, 0xABCD, -12345);
        let (tk2, iv2, mac2) = split_file_key(&key);
        assert_eq!(tk2, tk);
        assert_eq!(iv2, 0xABCD);
        assert_eq!(mac2, -12345);
    }

    #[test]
    fn file_key_second_half_is_obfuscated() {
        let tk = [0x5Au8; KEY_LEN];
        let key = file_key(&tk, 0, 0);
        // With ctriv = mac = 0 the obfuscated half equals the key itself.
        assert_eq!(&key[16..], &tk);
    }

    #[test]
    fn fold_is_order_sensitive() {
        let c = cipher();
        let a = [1u8; BLOCK_LEN];
        let b = [2u8; BLOCK_LEN];

        let mut acc1 = [0u8; BLOCK_LEN];
        c.fold_mac(&mut acc1, &a);
        c.fold_mac(&mut acc1, &b);

        let mut acc2 = [0u8; BLOCK_LEN];
        c.fold_mac(&mut acc2, &b);
        c.fold_mac(&mut acc2, &a);

        assert_ne!(acc1, acc2);
    }
}
