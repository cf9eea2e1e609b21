// Integration tests for the burrow transfer stack. These run the real
// sender and receiver protocol loops against each other over an
// in-memory message pipe, with the resume store and progress sinks in
// the loop.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use burrow::config::{ReceiveFilesArg, SendFilesArg};
use burrow::cryptography;
use burrow::error::Error;
use burrow::progress::NoopSink;
use burrow::store::{MemoryStore, RecvStore};
use burrow::stream::Conduit;
use burrow::transfer::{
    self, recv_json, send_json, FileMetaReq, FileMetaRsp, SendFilesMeta, SendFilesMetaRsp,
};
use burrow::wordlist;

// ============================================================================
// In-memory conduit with data channel message semantics
// ============================================================================

struct ChanConduit {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

fn conduit_pair() -> (ChanConduit, ChanConduit) {
    let (tx_a, rx_b) = mpsc::channel(64);
    let (tx_b, rx_a) = mpsc::channel(64);
    (
        ChanConduit { tx: tx_a, rx: rx_a },
        ChanConduit { tx: tx_b, rx: rx_b },
    )
}

impl Conduit for ChanConduit {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.recv().await {
            Some(msg) => {
                assert!(msg.len() <= buf.len(), "message larger than read buffer");
                buf[..msg.len()].copy_from_slice(&msg);
                Ok(msg.len())
            }
            // All senders gone: clean end of stream.
            None => Ok(0),
        }
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.tx
            .send(buf.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }
}

/// Counts bytes pushed into the wrapped conduit, so tests can check how
/// much of a file was actually retransmitted.
struct CountingConduit {
    inner: ChanConduit,
    sent: Arc<AtomicU64>,
}

impl Conduit for CountingConduit {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf).await
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.sent.fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.inner.send_all(buf).await
    }
}

// ============================================================================
// Test fixtures
// ============================================================================

struct TestDirs {
    base: PathBuf,
    src: PathBuf,
    dst: PathBuf,
}

impl TestDirs {
    fn new(name: &str) -> Self {
        let base = std::env::temp_dir().join(format!("burrow_{}_{}", name, std::process::id()));
        let src = base.join("src");
        let dst = base.join("dst");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dst).unwrap();
        Self { base, src, dst }
    }

    fn source_file(&self, name: &str, contents: &[u8]) -> String {
        let path = self.src.join(name);
        std::fs::write(&path, contents).unwrap();
        path.to_str().unwrap().to_string()
    }
}

impl Drop for TestDirs {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.base);
    }
}

/// A deterministic but non-trivial byte pattern.
fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64).wrapping_mul(2654435761).to_le_bytes()[0] ^ (i >> 10) as u8)
        .collect()
}

/// Drive a full sender/receiver exchange over an in-memory pipe,
/// returning both outcomes and the sender's wire byte count.
async fn run_transfer(
    send_arg: &SendFilesArg,
    recv_arg: &ReceiveFilesArg,
    store: &MemoryStore,
) -> (
    Result<(), Error>,
    Result<(), Error>,
    u64,
) {
    let (a, b) = conduit_pair();
    let sent = Arc::new(AtomicU64::new(0));

    let send_fut = {
        let sent = Arc::clone(&sent);
        async move {
            let mut c = CountingConduit { inner: a, sent };
            let mut pb = NoopSink;
            transfer::send_files_by_wormhole(&mut c, send_arg, &mut pb).await
            // c drops here, which reads as EOF on the receiver.
        }
    };
    let recv_fut = async move {
        let mut c = b;
        let mut pb = NoopSink;
        transfer::receive_by_wormhole(&mut c, recv_arg, store, &mut pb).await
    };

    let (send_result, recv_result) = tokio::join!(send_fut, recv_fut);
    (send_result, recv_result, sent.load(Ordering::Relaxed))
}

fn send_arg_for(files: Vec<String>) -> SendFilesArg {
    let mut arg = SendFilesArg {
        files,
        ..Default::default()
    };
    arg.base.whoami = "integration-test".into();
    arg
}

fn recv_arg_for(dirs: &TestDirs) -> ReceiveFilesArg {
    let mut arg = ReceiveFilesArg::default();
    arg.dir = dirs.dst.to_str().unwrap().to_string();
    arg.data_source_name = String::new();
    arg
}

// ============================================================================
// End-to-End Transfer Tests
// ============================================================================

#[tokio::test]
async fn test_happy_path_single_file() {
    let dirs = TestDirs::new("happy");
    let contents = pattern(1 << 20);
    let src = dirs.source_file("blob.bin", &contents);

    let send_arg = send_arg_for(vec![src]);
    let recv_arg = recv_arg_for(&dirs);
    let store = MemoryStore::new();

    let (sent_result, recv_result, _) = run_transfer(&send_arg, &recv_arg, &store).await;
    sent_result.unwrap();
    recv_result.unwrap();

    let received = std::fs::read(dirs.dst.join("blob.bin")).unwrap();
    assert_eq!(received, contents);

    // The store row ends at the full size.
    let hash = xxhash_rust::xxh64::xxh64(&contents, 0).to_string();
    let record = store.get(&hash).await.unwrap().unwrap();
    assert_eq!(record.pos, 1 << 20);
    assert_eq!(record.size, 1 << 20);
}

#[tokio::test]
async fn test_resume_sends_only_the_tail() {
    let dirs = TestDirs::new("resume");
    let contents = pattern(1 << 20);
    let src = dirs.source_file("movie.bin", &contents);

    // The receiver already has a matching first 500 KiB.
    let have = 500 << 10;
    std::fs::write(dirs.dst.join("movie.bin"), &contents[..have]).unwrap();

    let send_arg = send_arg_for(vec![src]);
    let recv_arg = recv_arg_for(&dirs);
    let store = MemoryStore::new();

    let (sent_result, recv_result, wire_bytes) = run_transfer(&send_arg, &recv_arg, &store).await;
    sent_result.unwrap();
    recv_result.unwrap();

    let received = std::fs::read(dirs.dst.join("movie.bin")).unwrap();
    assert_eq!(received, contents);

    // Body bytes on the wire are exactly the missing tail, plus a few
    // small JSON frames.
    let tail = (1 << 20) - have as u64;
    assert!(wire_bytes >= tail, "sent {} < tail {}", wire_bytes, tail);
    assert!(
        wire_bytes < tail + 4096,
        "sent {} suggests a full retransmit",
        wire_bytes
    );

    let hash = xxhash_rust::xxh64::xxh64(&contents, 0).to_string();
    assert_eq!(store.get(&hash).await.unwrap().unwrap().pos, 1 << 20);
}

#[tokio::test]
async fn test_resume_with_corrupt_prefix_restarts() {
    let dirs = TestDirs::new("corrupt");
    let contents = pattern(1 << 20);
    let src = dirs.source_file("data.bin", &contents);

    // Same length prefix, different bytes: the sender must not trust it.
    let mut garbage = contents[..500 << 10].to_vec();
    garbage[12345] ^= 0xff;
    std::fs::write(dirs.dst.join("data.bin"), &garbage).unwrap();

    let send_arg = send_arg_for(vec![src]);
    let recv_arg = recv_arg_for(&dirs);
    let store = MemoryStore::new();

    let (sent_result, recv_result, wire_bytes) = run_transfer(&send_arg, &recv_arg, &store).await;
    sent_result.unwrap();
    recv_result.unwrap();

    assert_eq!(std::fs::read(dirs.dst.join("data.bin")).unwrap(), contents);
    assert!(
        wire_bytes >= 1 << 20,
        "sent {} but a corrupt prefix requires a full retransmit",
        wire_bytes
    );
}

#[tokio::test]
async fn test_zero_size_file() {
    let dirs = TestDirs::new("empty");
    let src = dirs.source_file("empty.txt", b"");

    let send_arg = send_arg_for(vec![src]);
    let recv_arg = recv_arg_for(&dirs);
    let store = MemoryStore::new();

    let (sent_result, recv_result, _) = run_transfer(&send_arg, &recv_arg, &store).await;
    sent_result.unwrap();
    recv_result.unwrap();

    let out = dirs.dst.join("empty.txt");
    assert!(out.exists());
    assert_eq!(std::fs::metadata(&out).unwrap().len(), 0);
}

#[tokio::test]
async fn test_mixed_batch_retransmits_only_missing_regions() {
    let dirs = TestDirs::new("mixed");
    let complete = pattern(64 << 10);
    let partial = pattern(256 << 10);
    let missing = pattern(128 << 10);

    let src_complete = dirs.source_file("complete.bin", &complete);
    let src_partial = dirs.source_file("partial.bin", &partial);
    let src_missing = dirs.source_file("missing.bin", &missing);

    // complete.bin is already fully there, partial.bin half there,
    // missing.bin absent.
    std::fs::write(dirs.dst.join("complete.bin"), &complete).unwrap();
    std::fs::write(dirs.dst.join("partial.bin"), &partial[..128 << 10]).unwrap();

    let send_arg = send_arg_for(vec![src_complete, src_partial, src_missing]);
    let recv_arg = recv_arg_for(&dirs);
    let store = MemoryStore::new();

    let (sent_result, recv_result, wire_bytes) = run_transfer(&send_arg, &recv_arg, &store).await;
    sent_result.unwrap();
    recv_result.unwrap();

    assert_eq!(std::fs::read(dirs.dst.join("complete.bin")).unwrap(), complete);
    assert_eq!(std::fs::read(dirs.dst.join("partial.bin")).unwrap(), partial);
    assert_eq!(std::fs::read(dirs.dst.join("missing.bin")).unwrap(), missing);

    // Expected body bytes: half of partial.bin plus all of missing.bin.
    let expected: u64 = (128 << 10) + (128 << 10);
    assert!(wire_bytes >= expected);
    assert!(
        wire_bytes < expected + 8192,
        "sent {} but only {} bytes were missing",
        wire_bytes,
        expected
    );
}

#[tokio::test]
async fn test_unsafe_names_are_refused_but_drained() {
    let dirs = TestDirs::new("unsafe");
    let store = MemoryStore::new();
    let recv_arg = recv_arg_for(&dirs);

    let (mut evil, b) = conduit_pair();

    // A handcrafted sender offering a name that resolves to nothing
    // safe, followed by a well-formed body.
    let evil_fut = async move {
        let meta = SendFilesMeta {
            whoami: "mallory".into(),
            files: vec![FileMetaReq {
                clean_name: "..".into(),
                full_name: "..".into(),
                size: 10,
                hash: "1234".into(),
            }],
            ..Default::default()
        };
        send_json(&mut evil, &meta).await.unwrap();

        let rsp: SendFilesMetaRsp = recv_json(&mut evil).await.unwrap().unwrap();
        assert_eq!(rsp.files.len(), 1);
        assert_eq!(rsp.files[0].pos, 0);
        assert_eq!(rsp.files[0].recv_full_name, "");

        let file: FileMetaRsp = rsp.files[0].clone();
        send_json(&mut evil, &file).await.unwrap();
        evil.send_all(&[0u8; 10]).await.unwrap();
    };

    let recv_fut = async move {
        let mut c = b;
        let mut pb = NoopSink;
        transfer::receive_by_wormhole(&mut c, &recv_arg, &store, &mut pb).await
    };

    let (_, recv_result) = tokio::join!(evil_fut, recv_fut);
    match recv_result {
        Err(Error::ReceiveFile(name, _)) => assert_eq!(name, ".."),
        other => panic!("expected ReceiveFile error, got {:?}", other),
    }

    // Nothing was written anywhere.
    assert_eq!(std::fs::read_dir(&dirs.dst).unwrap().count(), 0);
    assert!(!dirs.base.join("evil").exists());
}

#[tokio::test]
async fn test_failed_file_does_not_sink_the_batch() {
    let dirs = TestDirs::new("continue");
    let good = pattern(32 << 10);
    let store = MemoryStore::new();
    let recv_arg = recv_arg_for(&dirs);

    let (mut sender, b) = conduit_pair();

    let good_clone = good.clone();
    let sender_fut = async move {
        let meta = SendFilesMeta {
            whoami: "test".into(),
            files: vec![
                FileMetaReq {
                    clean_name: "..".into(),
                    full_name: "..".into(),
                    size: 10,
                    hash: "1".into(),
                },
                FileMetaReq {
                    clean_name: "good.bin".into(),
                    full_name: "good.bin".into(),
                    size: good_clone.len() as u64,
                    hash: xxhash_rust::xxh64::xxh64(&good_clone, 0).to_string(),
                },
            ],
            ..Default::default()
        };
        send_json(&mut sender, &meta).await.unwrap();
        let rsp: SendFilesMetaRsp = recv_json(&mut sender).await.unwrap().unwrap();

        // Bad file first: announced, then streamed.
        send_json(&mut sender, &rsp.files[0]).await.unwrap();
        sender.send_all(&[0u8; 10]).await.unwrap();

        // The good file follows and must land intact.
        send_json(&mut sender, &rsp.files[1]).await.unwrap();
        for chunk in good_clone.chunks(32 << 10) {
            sender.send_all(chunk).await.unwrap();
        }
    };

    let recv_fut = async move {
        let mut c = b;
        let mut pb = NoopSink;
        transfer::receive_by_wormhole(&mut c, &recv_arg, &store, &mut pb).await
    };

    let (_, recv_result) = tokio::join!(sender_fut, recv_fut);
    assert!(matches!(recv_result, Err(Error::ReceiveFile(..))));
    assert_eq!(std::fs::read(dirs.dst.join("good.bin")).unwrap(), good);
}

// ============================================================================
// Code and Key Exchange Tests
// ============================================================================

#[test]
fn test_code_roundtrip_with_generated_passwords() {
    use rand::RngCore;

    for length in [1usize, 2, 4, 8] {
        let mut pass = vec![0u8; length];
        rand::thread_rng().fill_bytes(&mut pass);
        let slot = (length * 31337) % (1 << 21);

        let code = wordlist::encode(slot, &pass);
        let (got_slot, got_pass) = wordlist::decode(&code).expect("roundtrip");
        assert_eq!(got_slot, slot);
        assert_eq!(got_pass, pass);
    }
}

#[test]
fn test_bad_codes_classify_as_permanent() {
    for code in ["", "zebra-zebra-zebra", "aardvark", "bison aardvark"] {
        assert_eq!(wordlist::decode(code), None, "code {:?}", code);
    }
    assert!(Error::BadCode.is_permanent());
    assert!(Error::BadVersion.is_permanent());
    assert!(!Error::BadKey.is_permanent());
    assert!(!Error::PeerHungUp.is_permanent());
}

#[test]
fn test_session_keys_encrypt_signalling_both_ways() {
    use spake2::{Ed25519Group, Identity, Password, Spake2};

    let pass = b"\x9a\x3f";
    let id = Identity::new(b"");
    let (sa, msg_a) = Spake2::<Ed25519Group>::start_a(&Password::new(pass), &id, &id);
    let (sb, msg_b) = Spake2::<Ed25519Group>::start_b(&Password::new(pass), &id, &id);

    let key_a = cryptography::derive_session_key(&sa.finish(&msg_b).unwrap());
    let key_b = cryptography::derive_session_key(&sb.finish(&msg_a).unwrap());
    assert_eq!(key_a, key_b);

    // Offer goes one way, answer the other, both under the same key.
    let offer = br#"{"type":"offer","sdp":"v=0..."}"#;
    let sealed = cryptography::seal(&key_a, offer);
    assert_eq!(cryptography::open(&key_b, &sealed).unwrap(), offer);

    let answer = br#"{"type":"answer","sdp":"v=0..."}"#;
    let sealed = cryptography::seal(&key_b, answer);
    assert_eq!(cryptography::open(&key_a, &sealed).unwrap(), answer);
}

#[test]
fn test_wrong_password_fails_on_first_frame() {
    use spake2::{Ed25519Group, Identity, Password, Spake2};

    let id = Identity::new(b"");
    let (sa, msg_a) = Spake2::<Ed25519Group>::start_a(&Password::new(b"\x01\x02"), &id, &id);
    let (sb, msg_b) = Spake2::<Ed25519Group>::start_b(&Password::new(b"\x01\x03"), &id, &id);

    // The exchange itself completes; the mismatch only shows when the
    // first sealed frame fails to open on the peer.
    let key_a = cryptography::derive_session_key(&sa.finish(&msg_b).unwrap());
    let key_b = cryptography::derive_session_key(&sb.finish(&msg_a).unwrap());
    assert_ne!(key_a, key_b);

    let sealed = cryptography::seal(&key_a, b"{}");
    assert!(matches!(
        cryptography::open(&key_b, &sealed),
        Err(Error::BadKey)
    ));
}

// ============================================================================
// Resume Store Integration
// ============================================================================

#[tokio::test]
async fn test_lookup_reports_disk_truth_over_store_row() {
    let dirs = TestDirs::new("lookup");
    let contents = pattern(64 << 10);
    let store = MemoryStore::new();

    let file = FileMetaReq {
        clean_name: "t.bin".into(),
        full_name: "t.bin".into(),
        size: contents.len() as u64,
        hash: "777".into(),
    };
    let meta = SendFilesMeta {
        files: vec![file.clone()],
        ..Default::default()
    };

    // First lookup: nothing on disk, row created at zero.
    let rsp = transfer::lookup_file_pos(&store, &dirs.dst, &file, &meta)
        .await
        .unwrap();
    assert_eq!(rsp.pos, 0);
    assert_eq!(rsp.pos_hash, "");
    assert_eq!(
        rsp.recv_full_name,
        dirs.dst.join("t.bin").to_str().unwrap()
    );

    // Bytes appear on disk behind the store's back; the disk wins and
    // the row is refreshed.
    std::fs::write(dirs.dst.join("t.bin"), &contents[..32 << 10]).unwrap();
    let rsp = transfer::lookup_file_pos(&store, &dirs.dst, &file, &meta)
        .await
        .unwrap();
    assert_eq!(rsp.pos, (32 << 10) as u64);
    assert_eq!(
        rsp.pos_hash,
        xxhash_rust::xxh64::xxh64(&contents[..32 << 10], 0).to_string()
    );
    assert_eq!(store.get("777").await.unwrap().unwrap().pos, (32 << 10) as u64);
}

#[tokio::test]
async fn test_sqlite_store_survives_between_sessions() {
    let dirs = TestDirs::new("sqlite");
    let db_path = dirs.base.join("resume.db");
    let dsn = db_path.to_str().unwrap();

    let file = FileMetaReq {
        clean_name: "x.bin".into(),
        full_name: "x.bin".into(),
        size: 1000,
        hash: "424242".into(),
    };
    let meta = SendFilesMeta::default();

    {
        let store = burrow::store::SqliteStore::open(dsn).await.unwrap();
        store
            .insert_or_load(&file, Path::new("out"), &meta)
            .await
            .unwrap();
        store.update_position("424242", 640, "3s").await.unwrap();
        store.close().await;
    }

    let store = burrow::store::SqliteStore::open(dsn).await.unwrap();
    let record = store.get("424242").await.unwrap().unwrap();
    assert_eq!(record.pos, 640);
    assert_eq!(record.size, 1000);
    assert_eq!(record.cost, "3s");
    store.close().await;
}
