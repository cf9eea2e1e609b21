//! Bounded retries around the whole bring-up and transfer sequence.
//!
//! One attempt is: decode or generate the code, dial the signalling
//! server, run the handshake, move the files, tear down. Transient
//! failures anywhere in that chain burn one attempt; errors rooted in
//! user input abort immediately because no retry can fix them.

use std::sync::OnceLock;

use rand::RngCore;

use crate::config::{BaseArg, ReceiveFilesArg, SendFilesArg};
use crate::error::{Error, Result};
use crate::progress::{self, ProgressSink};
use crate::store::{MemoryStore, StoreManager};
use crate::stream::TimeoutConduit;
use crate::transfer;
use crate::wordlist;
use crate::wormhole::Wormhole;

fn store_manager() -> &'static StoreManager {
    static MANAGER: OnceLock<StoreManager> = OnceLock::new();
    MANAGER.get_or_init(StoreManager::new)
}

/// Dial and establish one wormhole from the session configuration.
///
/// With an empty code a fresh password is generated and the server
/// assigns the slot; otherwise both come out of the wordlist decode.
pub async fn connect(arg: &BaseArg) -> Result<Wormhole> {
    let (slot, pass) = if arg.code.is_empty() {
        let mut pass = vec![0u8; arg.secret_length];
        rand::thread_rng().fill_bytes(&mut pass);
        (String::new(), pass)
    } else {
        let (slot, pass) = wordlist::decode(&arg.code).ok_or(Error::BadCode)?;
        (slot.to_string(), pass)
    };

    let sigserv = if arg.sigserv.is_empty() {
        crate::DEFAULT_SIGSERV
    } else {
        &arg.sigserv
    };

    let c = Wormhole::setup(&slot, &pass, sigserv, &arg.bearer, arg.timeouts).await?;
    log::info!("connected: {}", if c.is_relay() { "relay" } else { "direct" });
    Ok(c)
}

/// Send with retries. On success the server-allocated code is left in
/// `arg.base.code` so callers can show or reuse it.
pub async fn send_files_retry(arg: &mut SendFilesArg) -> Result<()> {
    arg.validate()?;
    let mut pb = progress::create_sink(
        arg.base.progress,
        &arg.base.result_file,
        arg.base.result_interval.get(),
    );

    let retry_times = arg.base.retry_times.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match send_files_once(arg, pb.as_mut()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_permanent() || attempt >= retry_times => {
                pb.set_error(&e.to_string());
                return Err(e);
            }
            Err(e) => log::warn!("send failed: {} (attempt {}/{})", e, attempt, retry_times),
        }
    }
}

async fn send_files_once(arg: &mut SendFilesArg, pb: &mut dyn ProgressSink) -> Result<()> {
    let c = connect(&arg.base).await?;
    // Keep the assigned code so the next attempt dials the same slot
    // instead of allocating a new one.
    arg.base.code = c.code.clone();
    pb.set_code(&c.code);

    let mut stream = TimeoutConduit::new(c.stream(), arg.base.timeouts.rw_timeout.get());
    let result = transfer::send_files_by_wormhole(&mut stream, arg, pb).await;
    c.close().await;
    result
}

/// Receive with retries; same code reuse as the send side.
pub async fn receive_files_retry(arg: &mut ReceiveFilesArg) -> Result<()> {
    arg.validate()?;
    let mut pb = progress::create_sink(
        arg.base.progress,
        &arg.base.result_file,
        arg.base.result_interval.get(),
    );

    let retry_times = arg.base.retry_times.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match receive_files_once(arg, pb.as_mut()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_permanent() || attempt >= retry_times => {
                pb.set_error(&e.to_string());
                return Err(e);
            }
            Err(e) => log::warn!("receive failed: {} (attempt {}/{})", e, attempt, retry_times),
        }
    }
}

async fn receive_files_once(arg: &mut ReceiveFilesArg, pb: &mut dyn ProgressSink) -> Result<()> {
    let c = connect(&arg.base).await?;
    arg.base.code = c.code.clone();
    pb.set_code(&c.code);

    let mut stream = TimeoutConduit::new(c.stream(), arg.base.timeouts.rw_timeout.get());
    let result = if arg.data_source_name.is_empty() {
        // No database configured: remember nothing across runs and let
        // the on-disk files drive resume decisions.
        let store = MemoryStore::new();
        transfer::receive_by_wormhole(&mut stream, arg, &store, pb).await
    } else {
        let store = store_manager().get(&arg.data_source_name).await?;
        let result = transfer::receive_by_wormhole(&mut stream, arg, &store, pb).await;
        store_manager().release(&arg.data_source_name).await;
        result
    };
    c.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    // The retry loop's classification is what keeps a mistyped code from
    // burning ten dials; these cover the decode path feeding it.

    #[tokio::test]
    async fn test_bad_code_is_permanent() {
        let mut arg = SendFilesArg::default();
        let file = std::env::temp_dir().join(format!("retry_send_{}.bin", std::process::id()));
        std::fs::write(&file, b"x").unwrap();
        arg.files = vec![file.to_str().unwrap().to_string()];
        arg.base.code = "not-a-real-code".into();
        arg.base.retry_times = 10;

        // Fails in connect() before any websocket is opened, exactly once.
        let err = send_files_retry(&mut arg).await.unwrap_err();
        assert!(matches!(err, Error::BadCode));

        let _ = std::fs::remove_file(&file);
    }

    #[tokio::test]
    async fn test_invalid_config_is_permanent() {
        let mut arg = ReceiveFilesArg::default();
        arg.dir = "/definitely/not/a/directory".into();
        let err = receive_files_retry(&mut arg).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
