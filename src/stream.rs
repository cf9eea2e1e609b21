//! Byte stream over the detached WebRTC data channel.
//!
//! The underlying channel's write is fire-and-forget: it queues without
//! blocking, so a fast sender can balloon the SCTP buffer. Writers park
//! until the buffered amount drops below the low threshold, which the
//! channel signals through `on_buffered_amount_low`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use webrtc::data::data_channel::DataChannel;
use webrtc::data_channel::RTCDataChannel;

use crate::BUFFERED_AMOUNT_LOW_THRESHOLD;

/// A bidirectional, message-preserving byte stream used by the transfer
/// protocol. Implemented by the wormhole's data channel and by in-memory
/// pipes in tests.
#[allow(async_fn_in_trait)]
pub trait Conduit {
    /// Receive one message into `buf`, returning its length. Returns
    /// `Ok(0)` when the peer has closed the stream cleanly.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send `buf` as one message.
    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// The open data channel of a wormhole, detached into a raw stream.
pub struct WormholeStream {
    raw: Arc<DataChannel>,
    channel: Arc<RTCDataChannel>,
    flushed: Arc<Notify>,
}

impl WormholeStream {
    pub(crate) fn new(
        raw: Arc<DataChannel>,
        channel: Arc<RTCDataChannel>,
        flushed: Arc<Notify>,
    ) -> Self {
        Self {
            raw,
            channel,
            flushed,
        }
    }

    /// Read one message from the channel. A closed stream reads as EOF.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.raw.read(buf).await {
            Ok(n) => Ok(n),
            Err(webrtc::data::Error::ErrStreamClosed) => Ok(0),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }

    /// Write one message, parking while the channel buffer is above the
    /// low threshold.
    pub async fn send_all(&self, buf: &[u8]) -> io::Result<()> {
        while self.channel.buffered_amount().await > BUFFERED_AMOUNT_LOW_THRESHOLD {
            self.flushed.notified().await;
        }
        self.raw
            .write(&Bytes::copy_from_slice(buf))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(())
    }
}

impl Conduit for WormholeStream {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        WormholeStream::recv(self, buf).await
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        WormholeStream::send_all(self, buf).await
    }
}

impl Conduit for &WormholeStream {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        WormholeStream::recv(self, buf).await
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        WormholeStream::send_all(self, buf).await
    }
}

/// Bounds every read and write on the wrapped conduit by a deadline,
/// surfacing `TimedOut` without otherwise disturbing the stream. A zero
/// timeout disables the bound.
pub struct TimeoutConduit<C> {
    inner: C,
    timeout: Duration,
}

impl<C: Conduit> TimeoutConduit<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<C: Conduit> Conduit for TimeoutConduit<C> {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.timeout.is_zero() {
            return self.inner.recv(buf).await;
        }
        match tokio::time::timeout(self.timeout, self.inner.recv(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "timeout occurred")),
        }
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.timeout.is_zero() {
            return self.inner.send_all(buf).await;
        }
        match tokio::time::timeout(self.timeout, self.inner.send_all(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "timeout occurred")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A conduit that answers after a fixed delay, for exercising the
    /// timeout wrapper.
    struct SlowConduit {
        delay: Duration,
    }

    impl Conduit for SlowConduit {
        async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            tokio::time::sleep(self.delay).await;
            buf[0] = 42;
            Ok(1)
        }

        async fn send_all(&mut self, _buf: &[u8]) -> io::Result<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_conduit_passes_fast_io() {
        let mut c = TimeoutConduit::new(
            SlowConduit {
                delay: Duration::from_millis(10),
            },
            Duration::from_secs(1),
        );
        let mut buf = [0u8; 4];
        assert_eq!(c.recv(&mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], 42);
        c.send_all(b"ok").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_conduit_surfaces_timeouts() {
        let mut c = TimeoutConduit::new(
            SlowConduit {
                delay: Duration::from_secs(60),
            },
            Duration::from_secs(1),
        );
        let mut buf = [0u8; 4];
        let err = c.recv(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let err = c.send_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_disables_the_bound() {
        let mut c = TimeoutConduit::new(
            SlowConduit {
                delay: Duration::from_secs(3600),
            },
            Duration::ZERO,
        );
        let mut buf = [0u8; 4];
        assert_eq!(c.recv(&mut buf).await.unwrap(), 1);
    }
}
