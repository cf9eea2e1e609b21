//! The file transfer protocol spoken over the open data channel.
//!
//! Framing rides on the channel's message boundaries: every protocol
//! frame is one JSON object in one message, and file bodies are streamed
//! as raw 32 KiB messages in between. The sequence is a metadata offer,
//! a per-file resume response, then one metadata frame plus body per
//! file, ending with a clean EOF.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::Xxh64;

use crate::config::{Dur, ReceiveFilesArg, SendFilesArg};
use crate::error::{Error, Result};
use crate::progress::ProgressSink;
use crate::store::RecvStore;
use crate::stream::Conduit;
use crate::{JSON_FRAME_MAX, MSG_CHUNK_SIZE};

/// Persist the receive position whenever this many unsaved bytes pile up.
const SAVE_POS_INTERVAL: u64 = 10240;

/// A file the sender offers, identified by the xxh64 of its full
/// contents rendered as decimal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileMetaReq {
    pub clean_name: String,
    pub full_name: String,
    pub size: u64,
    pub hash: String,
}

/// The receiver's answer for one offered file: how much of it already
/// exists locally and the hash of that prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileMetaRsp {
    #[serde(flatten)]
    pub file: FileMetaReq,
    pub pos: u64,
    pub pos_hash: String,
    pub recv_full_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendFilesMeta {
    pub whoami: String,
    pub hostname: String,
    pub ips: String,
    pub files: Vec<FileMetaReq>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendFilesMetaRsp {
    pub files: Vec<FileMetaRsp>,
}

/// Send one JSON frame.
pub async fn send_json<C: Conduit, T: Serialize>(c: &mut C, v: &T) -> Result<()> {
    let json = serde_json::to_vec(v)?;
    c.send_all(&json).await.map_err(map_io)
}

/// Receive one JSON frame, or `None` on a clean end of stream.
pub async fn recv_json<T: DeserializeOwned, C: Conduit>(c: &mut C) -> Result<Option<T>> {
    let mut buf = vec![0u8; JSON_FRAME_MAX];
    let n = c.recv(&mut buf).await.map_err(map_io)?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&buf[..n])?))
}

/// Offer every file, learn what the receiver already has, then stream
/// the missing regions.
pub async fn send_files_by_wormhole<C: Conduit>(
    c: &mut C,
    arg: &SendFilesArg,
    pb: &mut dyn ProgressSink,
) -> Result<()> {
    let meta = create_send_files_meta(&arg.base.whoami, &arg.files)?;
    send_json(c, &meta).await?;
    log::debug!("sent meta for {} files", meta.files.len());

    let rsp: SendFilesMetaRsp = recv_json(c)
        .await?
        .ok_or_else(|| Error::Protocol("peer closed before answering the file meta".into()))?;
    if rsp.files.len() != meta.files.len() {
        return Err(Error::Protocol(format!(
            "meta response has {} entries for {} files",
            rsp.files.len(),
            meta.files.len()
        )));
    }

    for file in rsp.files {
        send_file(c, file, pb).await?;
    }
    Ok(())
}

async fn send_file<C: Conduit>(
    c: &mut C,
    mut file: FileMetaRsp,
    pb: &mut dyn ProgressSink,
) -> Result<()> {
    // Only trust the receiver's position if our own prefix hashes the
    // same way; otherwise retransmit from the start. An empty posHash
    // means the receiver has no usable prefix at all.
    if file.pos > 0 {
        let (n, prefix_hash) = hash_prefix(Path::new(&file.file.full_name), Some(file.pos))?;
        if file.pos_hash.is_empty() || n != file.pos || prefix_hash != file.pos_hash {
            log::info!(
                "resume position of {} does not verify, retransmitting from start",
                file.file.clean_name
            );
            file.pos = 0;
            file.pos_hash.clear();
        }
    }
    send_json(c, &file).await?;

    pb.start(&file.file.clean_name, file.file.size);
    pb.add(file.pos);
    if file.pos >= file.file.size {
        pb.finish();
        return Ok(());
    }

    log::info!("sending {}...", file.file.full_name);
    let mut f = File::open(&file.file.full_name)?;
    if file.pos > 0 {
        f.seek(SeekFrom::Start(file.pos))?;
    }

    let mut remaining = file.file.size - file.pos;
    let mut buf = vec![0u8; MSG_CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(MSG_CHUNK_SIZE as u64) as usize;
        let n = f.read(&mut buf[..want])?;
        if n == 0 {
            return Err(Error::Protocol(format!(
                "EOF before sending all bytes: ({}/{})",
                file.file.size - remaining,
                file.file.size
            )));
        }
        c.send_all(&buf[..n]).await.map_err(map_io)?;
        pb.add(n as u64);
        remaining -= n as u64;
    }
    pb.finish();

    log::info!("send file {} done", file.file.clean_name);
    Ok(())
}

/// Receive everything the peer offers, resuming files we already have a
/// verified prefix of. Files that cannot be opened are skipped without
/// losing the rest of the batch.
pub async fn receive_by_wormhole<C: Conduit, S: RecvStore>(
    c: &mut C,
    arg: &ReceiveFilesArg,
    store: &S,
    pb: &mut dyn ProgressSink,
) -> Result<()> {
    let meta: SendFilesMeta = recv_json(c)
        .await?
        .ok_or_else(|| Error::Protocol("peer closed before sending the file meta".into()))?;
    log::info!(
        "receiving {} files from {}@{}",
        meta.files.len(),
        meta.whoami,
        meta.hostname
    );

    let mut rsps = Vec::with_capacity(meta.files.len());
    for file in &meta.files {
        rsps.push(lookup_file_pos(store, Path::new(&arg.dir), file, &meta).await?);
    }
    send_json(c, &SendFilesMetaRsp { files: rsps }).await?;

    let mut first_failure: Option<Error> = None;
    loop {
        let file: FileMetaRsp = match recv_json(c).await? {
            Some(file) => file,
            // Clean EOF between frames is the end of the transfer.
            None => return first_failure.map_or(Ok(()), Err),
        };

        match receive_file(c, &file, store, pb).await {
            Ok(()) => {}
            Err(e @ Error::ReceiveFile(..)) => {
                log::error!("{}", e);
                first_failure.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Work out the resume answer for one offered file.
///
/// The store row remembers what we had, but the file on disk is the
/// truth: its current length and content hash are reported, and the row
/// is refreshed if they drifted apart.
pub async fn lookup_file_pos<S: RecvStore>(
    store: &S,
    dir: &Path,
    file: &FileMetaReq,
    meta: &SendFilesMeta,
) -> Result<FileMetaRsp> {
    let mut rsp = FileMetaRsp {
        file: file.clone(),
        ..Default::default()
    };

    let Some(clean) = sanitize_name(&file.clean_name) else {
        // Leave recv_full_name empty; the body of this file will be
        // drained and the file reported as failed.
        log::warn!("refusing unsafe file name {:?}", file.clean_name);
        return Ok(rsp);
    };
    let mut safe = file.clone();
    safe.clean_name = clean;

    let record = store.insert_or_load(&safe, dir, meta).await?;
    rsp.recv_full_name = record.full.clone();

    match hash_prefix(Path::new(&record.full), None) {
        Ok((n, prefix_hash)) => {
            rsp.pos = n;
            rsp.pos_hash = prefix_hash;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if rsp.pos != record.pos {
        if let Err(e) = store.update_position(&file.hash, rsp.pos, &record.cost).await {
            log::warn!("refresh resume position failed: {}", e);
        }
    }
    Ok(rsp)
}

async fn receive_file<C: Conduit, S: RecvStore>(
    c: &mut C,
    file: &FileMetaRsp,
    store: &S,
    pb: &mut dyn ProgressSink,
) -> Result<()> {
    let remaining = file.file.size.saturating_sub(file.pos);

    let opened = if file.recv_full_name.is_empty() {
        Err(io::Error::new(io::ErrorKind::InvalidInput, "unsafe file name"))
    } else {
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(&file.recv_full_name)
    };
    let mut f = match opened {
        Ok(f) => f,
        Err(e) => {
            // The sender streams the body regardless; swallow it so the
            // remaining files stay in sync.
            drain(c, remaining).await?;
            return Err(Error::ReceiveFile(file.file.clean_name.clone(), e.to_string()));
        }
    };

    pb.start(&file.recv_full_name, file.file.size);
    pb.add(file.pos);
    if file.pos >= file.file.size {
        pb.finish();
        return Ok(());
    }
    if file.pos > 0 {
        f.seek(SeekFrom::Start(file.pos))?;
    }

    log::info!("receiving {}...", file.recv_full_name);
    let mut saver = PosSaver::new(&file.file.hash, file.pos);
    let mut buf = vec![0u8; MSG_CHUNK_SIZE * 2];
    let mut left = remaining;
    while left > 0 {
        let n = c.recv(&mut buf).await.map_err(map_io)?;
        if n == 0 {
            return Err(Error::Protocol(format!(
                "EOF before receiving all bytes: ({}/{})",
                remaining - left,
                remaining
            )));
        }
        if n as u64 > left {
            return Err(Error::Protocol(
                "peer sent more bytes than announced".into(),
            ));
        }
        f.write_all(&buf[..n])?;
        pb.add(n as u64);
        saver.add(store, n as u64).await;
        left -= n as u64;
    }
    f.flush()?;
    saver.finish(store).await;
    pb.finish();

    match hash_prefix(Path::new(&file.recv_full_name), None) {
        Ok((_, full_hash)) if full_hash == file.file.hash => {
            log::debug!("checked received file {} hash {}", file.recv_full_name, full_hash);
        }
        Ok((_, full_hash)) => {
            log::warn!(
                "received file {} hashes to {} instead of {}",
                file.recv_full_name,
                full_hash,
                file.file.hash
            );
        }
        Err(e) => log::warn!("cannot check received file {}: {}", file.recv_full_name, e),
    }
    Ok(())
}

/// Read and discard an announced file body.
async fn drain<C: Conduit>(c: &mut C, mut left: u64) -> Result<()> {
    let mut buf = vec![0u8; MSG_CHUNK_SIZE * 2];
    while left > 0 {
        let n = c.recv(&mut buf).await.map_err(map_io)?;
        if n == 0 {
            return Err(Error::Protocol("EOF while skipping a file body".into()));
        }
        left = left.saturating_sub(n as u64);
    }
    Ok(())
}

/// Accumulates received bytes and persists the position to the resume
/// store roughly every `SAVE_POS_INTERVAL` bytes, and once at the end.
struct PosSaver {
    hash: String,
    pos: u64,
    unsaved: u64,
    start: Instant,
}

impl PosSaver {
    fn new(hash: &str, pos: u64) -> Self {
        Self {
            hash: hash.to_string(),
            pos,
            unsaved: 0,
            start: Instant::now(),
        }
    }

    async fn add<S: RecvStore>(&mut self, store: &S, n: u64) {
        self.unsaved += n;
        if self.unsaved > SAVE_POS_INTERVAL {
            self.save(store).await;
        }
    }

    async fn finish<S: RecvStore>(&mut self, store: &S) {
        if self.unsaved > 0 {
            self.save(store).await;
        }
    }

    async fn save<S: RecvStore>(&mut self, store: &S) {
        self.pos += self.unsaved;
        self.unsaved = 0;
        let cost = Dur(self.start.elapsed()).to_string();
        if let Err(e) = store.update_position(&self.hash, self.pos, &cost).await {
            log::warn!("persist resume position failed: {}", e);
        }
    }
}

/// Build the metadata offer for a list of local files.
pub fn create_send_files_meta(whoami: &str, files: &[String]) -> Result<SendFilesMeta> {
    let mut meta = SendFilesMeta {
        whoami: whoami.to_string(),
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default(),
        ips: main_ip().unwrap_or_default(),
        ..Default::default()
    };
    for file in files {
        meta.files.push(create_file_meta_req(file)?);
    }
    Ok(meta)
}

/// Stat and hash one local file for the metadata offer.
pub fn create_file_meta_req(filename: &str) -> Result<FileMetaReq> {
    let path = Path::new(filename);
    let size = path.metadata()?.len();
    let (_, hash) = hash_prefix(path, None)?;

    let clean_name = sanitize_name(filename)
        .ok_or_else(|| Error::Config(format!("cannot derive a file name from {:?}", filename)))?;
    Ok(FileMetaReq {
        clean_name,
        full_name: filename.to_string(),
        size,
        hash,
    })
}

/// Reduce a sender-supplied name to a safe basename. Anything that
/// could climb out of the output directory is rejected.
pub fn sanitize_name(name: &str) -> Option<String> {
    let name = name.replace('\\', "/");
    let base = Path::new(&name).file_name()?.to_str()?;
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

/// xxh64 the first `limit` bytes of a file (all of it for `None`),
/// returning how many bytes were hashed and the decimal digest.
pub fn hash_prefix(path: &Path, limit: Option<u64>) -> io::Result<(u64, String)> {
    let mut f = File::open(path)?;
    let mut hasher = Xxh64::new(0);
    let mut buf = vec![0u8; MSG_CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let want = match limit {
            Some(limit) if limit - total < buf.len() as u64 => (limit - total) as usize,
            _ => buf.len(),
        };
        if want == 0 {
            break;
        }
        let n = f.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hasher.digest().to_string()))
}

/// The local address a default route would use, for the metadata offer.
fn main_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

fn map_io(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::TimedOut {
        Error::RwTimeout
    } else {
        Error::Io(e)
    }
}
