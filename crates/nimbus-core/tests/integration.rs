//! End-to-end transfer scenarios against mock collaborators.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nimbus_core::chunk::chunkceil;
use nimbus_core::chunkmac::{ChunkMac, ChunkMacMap};
use nimbus_core::config::ClientConfig;
use nimbus_core::context::SchedulerContext;
use nimbus_core::engine::TransferEngine;
use nimbus_core::testing::{
    encode_raid_parts, parse_range_suffix, MemFs, MockDispatcher, MockReply, RecordingListener,
    SharedCache,
};
use nimbus_core::transfer::{Transfer, TransferState};
use nimbus_crypto::{split_file_key, TransferCipher};
use nimbus_types::FileFingerprint;

fn test_pattern(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i * 131 % 251) as u8).collect()
}

fn encrypt(plain: &[u8], key: &[u8; 16], ctriv: u64) -> Vec<u8> {
    let mut data = plain.to_vec();
    TransferCipher::new(key).ctr_crypt(&mut data, 0, ctriv);
    data
}

/// The file-wide mac-of-macs computed directly from plaintext, the way
/// an uploader would.
fn metamac_of(plain: &[u8], key: &[u8; 16], ctriv: u64) -> i64 {
    chunk_mac_map(plain, key, ctriv).macsmac(&TransferCipher::new(key))
}

fn chunk_mac_map(plain: &[u8], key: &[u8; 16], ctriv: u64) -> ChunkMacMap {
    let cipher = TransferCipher::new(key);
    let size = plain.len() as i64;
    let mut map = ChunkMacMap::new();
    let mut pos = 0;
    while pos < size {
        let end = chunkceil(pos, size);
        map.insert(
            pos,
            ChunkMac {
                mac: cipher.chunk_mac(&plain[pos as usize..end as usize], ctriv),
                offset: end - pos,
                finished: true,
            },
        );
        pos = end;
    }
    map
}

struct Harness {
    engine: TransferEngine,
    dispatcher: Arc<MockDispatcher>,
    fs: MemFs,
    cache: SharedCache,
    listener: RecordingListener,
}

fn harness_with(
    config: ClientConfig,
    handler: nimbus_core::testing::MockHandler,
    fs: MemFs,
    cache: SharedCache,
) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dispatcher = MockDispatcher::new(handler);
    let listener = RecordingListener::new();
    let ctx = SchedulerContext::new(
        config,
        dispatcher.clone(),
        Box::new(cache.clone()),
        Box::new(fs.clone()),
        Box::new(listener.clone()),
    );
    Harness {
        engine: TransferEngine::new(ctx),
        dispatcher,
        fs,
        cache,
        listener,
    }
}

fn harness(config: ClientConfig, handler: nimbus_core::testing::MockHandler) -> Harness {
    harness_with(config, handler, MemFs::new(), SharedCache::new())
}

/// Tick until the transfer leaves the active states (worker threads may
/// need real time for crypto, hence the sleep).
fn run_to_settled(h: &mut Harness, idx: usize, start: Instant) -> TransferState {
    for tick in 0..500 {
        let now = start + Duration::from_millis(tick * 10);
        h.engine.tick(now);
        let state = h.engine.transfer(idx).unwrap().state;
        if matches!(
            state,
            TransferState::Completed | TransferState::Failed | TransferState::Paused
        ) {
            return state;
        }
        if state == TransferState::Retrying {
            return state;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    h.engine.transfer(idx).unwrap().state
}

fn serve_ciphertext(wire: Arc<Vec<u8>>) -> nimbus_core::testing::MockHandler {
    Box::new(move |url, _| {
        let (a, b) = parse_range_suffix(url).expect("ranged url");
        MockReply::Ok {
            status: 200,
            body: wire[a..b].to_vec(),
        }
    })
}

// ---------------------------------------------------------------------------
// Downloads
// ---------------------------------------------------------------------------

#[test]
fn small_download_single_connection() {
    let key = [0u8; 16];
    let ctriv = 0;
    let plain = vec![0xAAu8; 65536];
    let wire = Arc::new(encrypt(&plain, &key, ctriv));
    let metamac = metamac_of(&plain, &key, ctriv);

    let mut h = harness(ClientConfig::default(), serve_ciphertext(wire));
    let fp = FileFingerprint::new(65536, 1, [1u8; 16]);
    let t = Transfer::new_download(65536, key, ctriv, metamac, PathBuf::from("/dl/small"), fp);
    let idx = h.engine.queue(t);
    h.engine
        .set_temp_urls(idx, vec!["https://host/dl/abc".into()]);

    let state = run_to_settled(&mut h, idx, Instant::now());
    assert_eq!(state, TransferState::Completed);
    assert_eq!(h.fs.read("/dl/small").unwrap(), plain);
    let t = h.engine.transfer(idx).unwrap();
    assert_eq!(t.progresscompleted, 65536);
    // A sub-chunk file is fetched over exactly one connection/request.
    assert_eq!(h.dispatcher.requests().len(), 1);
    assert!(h.listener.events().contains(&"complete".to_string()));
}

#[test]
fn multi_connection_download_with_out_of_order_writes() {
    let key = *b"abcdefghijklmnop";
    let ctriv = 0x0102_0304;
    let plain = test_pattern(1 << 20);
    let wire = Arc::new(encrypt(&plain, &key, ctriv));
    let metamac = metamac_of(&plain, &key, ctriv);

    let config = ClientConfig {
        max_request_size: Some(131072),
        ..ClientConfig::default()
    };
    let mut h = harness(config, serve_ciphertext(wire));
    let fp = FileFingerprint::new(1 << 20, 2, [2u8; 16]);
    let t = Transfer::new_download(
        1 << 20,
        key,
        ctriv,
        metamac,
        PathBuf::from("/dl/big"),
        fp,
    );
    let idx = h.engine.queue(t);
    h.engine
        .set_temp_urls(idx, vec!["https://host/dl/big".into()]);

    let state = run_to_settled(&mut h, idx, Instant::now());
    assert_eq!(state, TransferState::Completed);
    assert_eq!(h.fs.read("/dl/big").unwrap(), plain);
    // Four chunk-aligned ranges over the configured four connections.
    assert_eq!(h.dispatcher.requests().len(), 4);
}

#[test]
fn download_mac_mismatch_fails_with_key_error() {
    let key = [3u8; 16];
    let ctriv = 9;
    let plain = test_pattern(200_000);
    let wire = Arc::new(encrypt(&plain, &key, ctriv));

    let mut h = harness(ClientConfig::default(), serve_ciphertext(wire));
    let fp = FileFingerprint::new(200_000, 3, [3u8; 16]);
    // Wrong expected MAC.
    let t = Transfer::new_download(200_000, key, ctriv, 0x1234, PathBuf::from("/dl/bad"), fp);
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, vec!["https://host/dl/x".into()]);

    let state = run_to_settled(&mut h, idx, Instant::now());
    assert_eq!(state, TransferState::Failed);
    // chunkmacs are cleared so a restart re-downloads from scratch.
    assert!(h.engine.transfer(idx).unwrap().chunkmacs.is_empty());
    assert!(h
        .listener
        .events()
        .iter()
        .any(|e| e.starts_with("failed:")));
}

#[test]
fn download_recovers_legacy_mac_with_missing_late_entry() {
    let key = [4u8; 16];
    let ctriv = 77;
    let plain = test_pattern(500_000); // three chunks
    let wire = Arc::new(encrypt(&plain, &key, ctriv));

    // The cloud recorded a mac-of-macs missing its second-to-last entry.
    let macs = chunk_mac_map(&plain, &key, ctriv);
    let n = macs.len();
    assert_eq!(n, 3);
    let gapped = macs.macsmac_gaps(&TransferCipher::new(&key), n - 2, n - 1, n, n);
    let full = macs.macsmac(&TransferCipher::new(&key));
    assert_ne!(gapped, full);

    let mut h = harness(ClientConfig::default(), serve_ciphertext(wire));
    let fp = FileFingerprint::new(500_000, 4, [4u8; 16]);
    let t = Transfer::new_download(500_000, key, ctriv, gapped, PathBuf::from("/dl/gap"), fp);
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, vec!["https://host/dl/g".into()]);

    let state = run_to_settled(&mut h, idx, Instant::now());
    assert_eq!(state, TransferState::Completed);
    assert_eq!(h.fs.read("/dl/gap").unwrap(), plain);
    // The recovered transfer adopted the full MAC.
    assert_eq!(h.engine.transfer(idx).unwrap().metamac, full);
}

#[test]
fn file_one_byte_under_chunk_uses_one_connection() {
    let key = [5u8; 16];
    let plain = test_pattern(131071);
    let wire = Arc::new(encrypt(&plain, &key, 5));
    let metamac = metamac_of(&plain, &key, 5);

    let mut h = harness(ClientConfig::default(), serve_ciphertext(wire));
    let fp = FileFingerprint::new(131071, 5, [5u8; 16]);
    let t = Transfer::new_download(131071, key, 5, metamac, PathBuf::from("/dl/edge"), fp);
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, vec!["https://host/dl/e".into()]);

    assert_eq!(
        run_to_settled(&mut h, idx, Instant::now()),
        TransferState::Completed
    );
    assert_eq!(h.dispatcher.requests().len(), 1);
    assert_eq!(h.fs.read("/dl/edge").unwrap(), plain);
}

// ---------------------------------------------------------------------------
// RAID downloads
// ---------------------------------------------------------------------------

fn raid_urls() -> Vec<String> {
    (0..6).map(|p| format!("https://host/part{p}")).collect()
}

fn part_index(url: &str) -> usize {
    (0..6)
        .find(|p| url.contains(&format!("part{p}")))
        .expect("part url")
}

#[test]
fn raid_download_reassembles_and_verifies() {
    let key = *b"ponmlkjihgfedcba";
    let ctriv = 0xFEED;
    let plain = test_pattern(400_000);
    let wire = encrypt(&plain, &key, ctriv);
    let metamac = metamac_of(&plain, &key, ctriv);
    let parts = Arc::new(encode_raid_parts(&wire));

    let parts2 = Arc::clone(&parts);
    let mut h = harness(
        ClientConfig::default(),
        Box::new(move |url, _| {
            let p = part_index(url);
            let (a, b) = parse_range_suffix(url).unwrap();
            MockReply::Ok {
                status: 200,
                body: parts2[p][a..b].to_vec(),
            }
        }),
    );
    let fp = FileFingerprint::new(400_000, 6, [6u8; 16]);
    let t = Transfer::new_download(400_000, key, ctriv, metamac, PathBuf::from("/dl/raid"), fp);
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, raid_urls());

    let state = run_to_settled(&mut h, idx, Instant::now());
    assert_eq!(state, TransferState::Completed);
    assert_eq!(h.fs.read("/dl/raid").unwrap(), plain);
    // All six parts were fetched.
    let log = h.dispatcher.requests();
    for p in 0..6 {
        assert!(log.iter().any(|u| u.contains(&format!("part{p}"))));
    }
}

#[test]
fn raid_download_survives_one_404_part() {
    let key = [7u8; 16];
    let ctriv = 0xBEE;
    let plain = test_pattern(300_000);
    let wire = encrypt(&plain, &key, ctriv);
    let metamac = metamac_of(&plain, &key, ctriv);
    let parts = Arc::new(encode_raid_parts(&wire));

    let parts2 = Arc::clone(&parts);
    let mut h = harness(
        ClientConfig::default(),
        Box::new(move |url, _| {
            let p = part_index(url);
            if p == 2 {
                return MockReply::Fail {
                    status: 404,
                    content_type: String::new(),
                    retry_after: None,
                };
            }
            let (a, b) = parse_range_suffix(url).unwrap();
            MockReply::Ok {
                status: 200,
                body: parts2[p][a..b].to_vec(),
            }
        }),
    );
    let fp = FileFingerprint::new(300_000, 7, [7u8; 16]);
    let t = Transfer::new_download(300_000, key, ctriv, metamac, PathBuf::from("/dl/r404"), fp);
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, raid_urls());

    let state = run_to_settled(&mut h, idx, Instant::now());
    assert_eq!(state, TransferState::Completed);
    assert_eq!(h.fs.read("/dl/r404").unwrap(), plain);
}

#[test]
fn raid_download_aborts_when_two_parts_fail() {
    let plain = test_pattern(300_000);
    let key = [8u8; 16];
    let wire = encrypt(&plain, &key, 1);
    let parts = Arc::new(encode_raid_parts(&wire));

    let parts2 = Arc::clone(&parts);
    let mut h = harness(
        ClientConfig::default(),
        Box::new(move |url, _| {
            let p = part_index(url);
            if p == 1 || p == 4 {
                return MockReply::Fail {
                    status: 404,
                    content_type: String::new(),
                    retry_after: None,
                };
            }
            let (a, b) = parse_range_suffix(url).unwrap();
            MockReply::Ok {
                status: 200,
                body: parts2[p][a..b].to_vec(),
            }
        }),
    );
    let fp = FileFingerprint::new(300_000, 8, [8u8; 16]);
    let t = Transfer::new_download(300_000, key, 1, 0, PathBuf::from("/dl/r2fail"), fp);
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, raid_urls());

    let state = run_to_settled(&mut h, idx, Instant::now());
    // EAGAIN: the slot is released and the transfer waits for a retry.
    assert_eq!(state, TransferState::Retrying);
    assert!(h.engine.transfer(idx).unwrap().failcount > 0);
}

#[test]
fn raid_download_completes_despite_silent_part() {
    let key = [9u8; 16];
    let ctriv = 42;
    let plain = test_pattern(400_000);
    let wire = encrypt(&plain, &key, ctriv);
    let metamac = metamac_of(&plain, &key, ctriv);
    let parts = Arc::new(encode_raid_parts(&wire));

    let parts2 = Arc::clone(&parts);
    let mut h = harness(
        ClientConfig::default(),
        Box::new(move |url, _| {
            let p = part_index(url);
            if p == 4 {
                // This part never sends a byte.
                return MockReply::Stall;
            }
            let (a, b) = parse_range_suffix(url).unwrap();
            MockReply::Ok {
                status: 200,
                body: parts2[p][a..b].to_vec(),
            }
        }),
    );
    let fp = FileFingerprint::new(400_000, 9, [9u8; 16]);
    let t = Transfer::new_download(400_000, key, ctriv, metamac, PathBuf::from("/dl/slow"), fp);
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, raid_urls());

    let state = run_to_settled(&mut h, idx, Instant::now());
    assert_eq!(state, TransferState::Completed);
    assert_eq!(h.fs.read("/dl/slow").unwrap(), plain);
}

// ---------------------------------------------------------------------------
// Uploads
// ---------------------------------------------------------------------------

type UploadStore = Arc<Mutex<std::collections::HashMap<usize, Vec<u8>>>>;

fn upload_pos(url: &str) -> usize {
    url.rsplit('/').next().unwrap().parse().unwrap()
}

/// Upload handler: stores chunk bodies; acks non-final chunks with an
/// empty body and answers the final one (by byte count) with the token.
fn upload_handler(
    store: UploadStore,
    total: usize,
    token: [u8; 36],
    stall_acks: bool,
) -> nimbus_core::testing::MockHandler {
    Box::new(move |url, body| {
        let pos = upload_pos(url);
        let body = body.unwrap_or_default().to_vec();
        let mut st = store.lock().unwrap();
        st.insert(pos, body);
        let received: usize = st.values().map(Vec::len).sum();
        if received >= total {
            MockReply::Ok {
                status: 200,
                body: token.to_vec(),
            }
        } else if stall_acks {
            MockReply::Stall
        } else {
            MockReply::Ok {
                status: 200,
                body: Vec::new(),
            }
        }
    })
}

fn upload_token() -> [u8; 36] {
    let mut token = [0x5Au8; 36];
    token[35] = 1;
    token
}

#[test]
fn upload_completes_and_registers_correct_file_key() {
    let plain = test_pattern(1 << 20);
    let store: UploadStore = Arc::default();
    let config = ClientConfig {
        max_request_size: Some(131072),
        ..ClientConfig::default()
    };
    let mut h = harness(
        config,
        upload_handler(Arc::clone(&store), 1 << 20, upload_token(), false),
    );
    h.fs.insert("/ul/big", plain.clone());

    let fp = FileFingerprint::new(1 << 20, 10, [10u8; 16]);
    let t = Transfer::new_upload(1 << 20, PathBuf::from("/ul/big"), fp);
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, vec!["https://host/ul/abc".into()]);

    let state = run_to_settled(&mut h, idx, Instant::now());
    assert_eq!(state, TransferState::Completed);

    let t = h.engine.transfer(idx).unwrap();
    assert_eq!(t.progresscompleted, 1 << 20);
    assert!(t.ultoken.is_some());

    // Server-side ciphertext decrypts back to the plaintext.
    let st = store.lock().unwrap();
    let mut wire = Vec::new();
    let mut keys: Vec<usize> = st.keys().copied().collect();
    keys.sort_unstable();
    for k in keys {
        wire.extend_from_slice(&st[&k]);
    }
    let mut round = wire.clone();
    TransferCipher::new(&t.transferkey).ctr_crypt(&mut round, 0, t.ctriv);
    assert_eq!(round, plain);

    // The registered file key folds to the plaintext's mac-of-macs.
    let (k, iv, mac) = split_file_key(&t.filekey.unwrap());
    assert_eq!(k, t.transferkey);
    assert_eq!(iv, t.ctriv);
    assert_eq!(mac, metamac_of(&plain, &t.transferkey, t.ctriv));
}

#[test]
fn upload_token_before_sibling_acks_folds_their_macs_in() {
    // The final connection returns the token while the other three acks
    // are still outstanding; their chunk MACs must still reach the key.
    let plain = test_pattern(1 << 20);
    let store: UploadStore = Arc::default();
    let config = ClientConfig {
        max_request_size: Some(131072),
        ..ClientConfig::default()
    };
    let mut h = harness(
        config,
        upload_handler(Arc::clone(&store), 1 << 20, upload_token(), true),
    );
    h.fs.insert("/ul/late", plain.clone());

    let fp = FileFingerprint::new(1 << 20, 11, [11u8; 16]);
    let t = Transfer::new_upload(1 << 20, PathBuf::from("/ul/late"), fp);
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, vec!["https://host/ul/late".into()]);

    let state = run_to_settled(&mut h, idx, Instant::now());
    assert_eq!(state, TransferState::Completed);

    let t = h.engine.transfer(idx).unwrap();
    assert_eq!(t.progresscompleted, 1 << 20);
    let (_, _, mac) = split_file_key(&t.filekey.unwrap());
    assert_eq!(mac, metamac_of(&plain, &t.transferkey, t.ctriv));
}

#[test]
fn zero_byte_upload_completes_with_zero_mac() {
    let store: UploadStore = Arc::default();
    let mut h = harness(
        ClientConfig::default(),
        upload_handler(Arc::clone(&store), 0, upload_token(), false),
    );
    h.fs.insert("/ul/empty", Vec::new());

    let fp = FileFingerprint::new(0, 12, [12u8; 16]);
    let t = Transfer::new_upload(0, PathBuf::from("/ul/empty"), fp);
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, vec!["https://host/ul/zero".into()]);

    let state = run_to_settled(&mut h, idx, Instant::now());
    assert_eq!(state, TransferState::Completed);

    let t = h.engine.transfer(idx).unwrap();
    assert_eq!(t.progresscompleted, 0);
    assert_eq!(t.metamac, 0);
    assert!(t.ultoken.is_some());
    // Exactly one zero-length PUT.
    assert_eq!(h.dispatcher.requests().len(), 1);
    assert_eq!(store.lock().unwrap().get(&0).map(Vec::len), Some(0));
}

// ---------------------------------------------------------------------------
// Quota, timeout, resume
// ---------------------------------------------------------------------------

#[test]
fn overquota_pauses_then_resumes() {
    let key = [13u8; 16];
    let plain = test_pattern(100_000);
    let wire = Arc::new(encrypt(&plain, &key, 13));
    let metamac = metamac_of(&plain, &key, 13);

    let over = Arc::new(AtomicBool::new(true));
    let over2 = Arc::clone(&over);
    let wire2 = Arc::clone(&wire);
    let mut h = harness(
        ClientConfig::default(),
        Box::new(move |url, _| {
            if over2.load(Ordering::SeqCst) {
                return MockReply::Fail {
                    status: 509,
                    content_type: String::new(),
                    retry_after: Some(30),
                };
            }
            let (a, b) = parse_range_suffix(url).unwrap();
            MockReply::Ok {
                status: 200,
                body: wire2[a..b].to_vec(),
            }
        }),
    );
    let fp = FileFingerprint::new(100_000, 13, [13u8; 16]);
    let t = Transfer::new_download(100_000, key, 13, metamac, PathBuf::from("/dl/quota"), fp);
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, vec!["https://host/dl/q".into()]);

    let t0 = Instant::now();
    let state = run_to_settled(&mut h, idx, t0);
    assert_eq!(state, TransferState::Paused);
    let requests_while_paused = h.dispatcher.requests().len();

    // Before the server-supplied wait elapses, nothing is retried.
    h.engine.tick(t0 + Duration::from_secs(20));
    assert_eq!(h.dispatcher.requests().len(), requests_while_paused);
    assert_eq!(h.engine.active_slots(), 0);

    // After the wait, the transfer resumes by itself and completes.
    over.store(false, Ordering::SeqCst);
    let state = run_to_settled(&mut h, idx, t0 + Duration::from_secs(40));
    assert_eq!(state, TransferState::Completed);
    assert_eq!(h.fs.read("/dl/quota").unwrap(), plain);
}

#[test]
fn stalled_download_toggles_alternative_port() {
    let key = [14u8; 16];
    let plain = test_pattern(100_000);
    let wire = Arc::new(encrypt(&plain, &key, 14));
    let metamac = metamac_of(&plain, &key, 14);

    let wire2 = Arc::clone(&wire);
    let config = ClientConfig {
        auto_down_port: true,
        ..ClientConfig::default()
    };
    let mut h = harness(
        config,
        Box::new(move |url, _| {
            if url.contains(":8080") {
                let (a, b) = parse_range_suffix(url).unwrap();
                MockReply::Ok {
                    status: 200,
                    body: wire2[a..b].to_vec(),
                }
            } else {
                MockReply::Stall
            }
        }),
    );
    let fp = FileFingerprint::new(100_000, 14, [14u8; 16]);
    let t = Transfer::new_download(100_000, key, 14, metamac, PathBuf::from("/dl/alt"), fp);
    let idx = h.engine.queue(t);
    h.engine
        .set_temp_urls(idx, vec!["http://host/dl/alt".into()]);

    let t0 = Instant::now();
    h.engine.tick(t0); // activates + posts to the primary port
    h.engine.tick(t0 + Duration::from_secs(61)); // timeout: toggle + re-prepare

    let state = run_to_settled(&mut h, idx, t0 + Duration::from_secs(62));
    assert_eq!(state, TransferState::Completed);
    assert_eq!(h.fs.read("/dl/alt").unwrap(), plain);

    let log = h.dispatcher.requests();
    assert!(log.iter().any(|u| !u.contains(":8080")));
    assert!(log.iter().any(|u| u.contains(":8080")));
}

#[test]
fn interrupted_download_resumes_from_cache_record() {
    let key = [15u8; 16];
    let ctriv = 0xCAFE;
    let size = 1_000_000usize;
    let plain = test_pattern(size);
    let wire = Arc::new(encrypt(&plain, &key, ctriv));
    let metamac = metamac_of(&plain, &key, ctriv);

    // Phase 1: the first two chunks land; the third stalls mid-body.
    let wire2 = Arc::clone(&wire);
    let config = ClientConfig {
        max_request_size: Some(131072),
        connections_per_transfer: 1,
        ..ClientConfig::default()
    };
    let mut h = harness(
        config.clone(),
        Box::new(move |url, _| {
            let (a, b) = parse_range_suffix(url).unwrap();
            if a >= 393216 {
                MockReply::StallAfter {
                    body: wire2[a..b].to_vec(),
                    deliver: 131072,
                }
            } else {
                MockReply::Ok {
                    status: 200,
                    body: wire2[a..b].to_vec(),
                }
            }
        }),
    );
    let fp = FileFingerprint::new(size as i64, 15, [15u8; 16]);
    let t = Transfer::new_download(
        size as i64,
        key,
        ctriv,
        metamac,
        PathBuf::from("/dl/resume"),
        fp,
    );
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, vec!["https://host/dl/r".into()]);

    let t0 = Instant::now();
    for tick in 0..120 {
        h.engine.tick(t0 + Duration::from_millis(tick * 10));
        std::thread::sleep(Duration::from_millis(1));
    }
    // Simulated crash: flush and persist what arrived.
    h.engine.shutdown();

    let t = h.engine.transfer(idx).unwrap();
    assert_eq!(
        t.progresscompleted, 524288,
        "two chunks plus the salvaged partial third"
    );
    let record = h.cache.snapshot(&t.cache_key()).expect("cached record");

    // Phase 2: a fresh engine over the same disk and cache finishes the
    // file.
    let wire3 = Arc::clone(&wire);
    let mut h2 = harness_with(
        config,
        serve_ciphertext(wire3),
        h.fs.clone(),
        h.cache.clone(),
    );

    let idx2 = h2.engine.restore(&record).unwrap();
    {
        let t = h2.engine.transfer(idx2).unwrap();
        assert_eq!(t.progresscompleted, 524288);
    }
    h2.engine
        .set_temp_urls(idx2, vec!["https://host/dl/r".into()]);

    let state = run_to_settled(&mut h2, idx2, Instant::now());
    assert_eq!(state, TransferState::Completed);
    assert_eq!(h2.fs.read("/dl/resume").unwrap(), plain);

    // Only the missing byte range was re-requested.
    let first = h2.dispatcher.requests()[0].clone();
    let (a, _) = parse_range_suffix(&first).unwrap();
    assert_eq!(a, 524288);
}

#[test]
fn download_to_real_filesystem_with_dir_cache() {
    use nimbus_core::cache::DirCache;
    use nimbus_core::fs::StdFsAccess;

    let key = [17u8; 16];
    let plain = test_pattern(100_000);
    let wire = Arc::new(encrypt(&plain, &key, 17));
    let metamac = metamac_of(&plain, &key, 17);

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out.bin");
    let cache = DirCache::new(dir.path().join("cache")).unwrap();

    let dispatcher = MockDispatcher::new(serve_ciphertext(wire));
    let listener = RecordingListener::new();
    let ctx = SchedulerContext::new(
        ClientConfig::default(),
        dispatcher.clone(),
        Box::new(cache),
        Box::new(StdFsAccess),
        Box::new(listener.clone()),
    );
    let mut engine = TransferEngine::new(ctx);

    let fp = FileFingerprint::new(100_000, 17, [17u8; 16]);
    let t = Transfer::new_download(100_000, key, 17, metamac, target.clone(), fp);
    let idx = engine.queue(t);
    engine.set_temp_urls(idx, vec!["https://host/dl/disk".into()]);

    let start = Instant::now();
    for tick in 0..500 {
        engine.tick(start + Duration::from_millis(tick * 10));
        if engine.transfer(idx).unwrap().state == TransferState::Completed {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(engine.transfer(idx).unwrap().state, TransferState::Completed);
    assert_eq!(std::fs::read(&target).unwrap(), plain);
}

#[test]
fn write_failure_with_retry_eventually_succeeds() {
    let key = [16u8; 16];
    let plain = test_pattern(100_000);
    let wire = Arc::new(encrypt(&plain, &key, 16));
    let metamac = metamac_of(&plain, &key, 16);

    let mut h = harness(ClientConfig::default(), serve_ciphertext(wire));
    h.fs.inject_write_failures(2);

    let fp = FileFingerprint::new(100_000, 16, [16u8; 16]);
    let t = Transfer::new_download(100_000, key, 16, metamac, PathBuf::from("/dl/wr"), fp);
    let idx = h.engine.queue(t);
    h.engine.set_temp_urls(idx, vec!["https://host/dl/w".into()]);

    let state = run_to_settled(&mut h, idx, Instant::now());
    assert_eq!(state, TransferState::Completed);
    assert_eq!(h.fs.read("/dl/wr").unwrap(), plain);
}
