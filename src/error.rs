use thiserror::Error;

/// Errors surfaced by the signalling, bring-up and transfer layers.
///
/// The retry loop cares about exactly one property: whether an error can
/// be fixed by dialing again. Everything derived from user input cannot.
#[derive(Debug, Error)]
pub enum Error {
    /// The wormhole code did not decode to a slot and password.
    #[error("bad code")]
    BadCode,

    /// The signalling server runs an incompatible protocol version.
    #[error("bad version, please upgrade this client")]
    BadVersion,

    /// The peer on the same slot used a different password.
    #[error("bad key")]
    BadKey,

    /// Signalling or data channel bring-up timed out.
    #[error("timed out")]
    TimedOut,

    /// A read or write on the data channel exceeded the configured deadline.
    #[error("read/write timeout on data channel")]
    RwTimeout,

    /// The signalling server could not allocate a slot.
    #[error("no more slots available")]
    NoMoreSlots,

    /// The requested slot is not valid.
    #[error("no such slot")]
    NoSuchSlot,

    /// The peer closed its signalling connection before bring-up finished.
    #[error("peer hung up")]
    PeerHungUp,

    /// The signalling channel was closed with an unexpected status.
    #[error("signalling channel closed with status {0}")]
    Closed(u16),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Receiving a single file failed; the transfer loop may continue
    /// with the remaining files.
    #[error("receive file {0} failed: {1}")]
    ReceiveFile(String, String),

    #[error("pake exchange failed: {0}")]
    Pake(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl Error {
    /// Permanent errors are caused by user input and will fail the same
    /// way on every attempt; the retry loop returns them immediately.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::BadCode | Error::BadVersion | Error::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_errors_are_permanent() {
        assert!(Error::BadCode.is_permanent());
        assert!(Error::BadVersion.is_permanent());
        assert!(Error::Config("no files".into()).is_permanent());
    }

    #[test]
    fn test_network_errors_are_retryable() {
        assert!(!Error::BadKey.is_permanent());
        assert!(!Error::TimedOut.is_permanent());
        assert!(!Error::PeerHungUp.is_permanent());
        assert!(!Error::RwTimeout.is_permanent());
        assert!(!Error::Closed(4001).is_permanent());
    }
}
