//! WebRTC connection bring-up over the signalling channel.
//!
//! WebRTC secures its data with DTLS, but the key exchange relies on
//! both endpoints learning each other's certificate fingerprints through
//! some trusted channel. This module removes the signalling server from
//! the trust model: the offer, answer and ICE candidates are themselves
//! authenticated and encrypted under the PAKE-derived session key, so
//! the server only ever relays opaque frames.
//!
//! Rough sketch of the handshake:
//!
//! ```text
//! Peer               Signalling Server                Peer
//! ----open------------------> |
//! <---new slot, ICE servers-- |
//!                             | <------------------open----
//!                             | -------------ICE servers-->
//! <---------------------------|--------------pake msg A----
//! ----pake msg B--------------|--------------------------->
//! ----sealed(offer)-----------|--------------------------->
//! <---------------------------|----------sealed(answer)----
//! ----sealed(candidates...)---|--------------------------->
//! <---------------------------|---sealed(candidates...)----
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data::data_channel::DataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::candidate::CandidateType;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::config::Timeouts;
use crate::cryptography::{self, Key};
use crate::error::{Error, Result};
use crate::signalling::{close, IceServer, Signalling};
use crate::stream::WormholeStream;
use crate::wordlist;
use crate::BUFFERED_AMOUNT_LOW_THRESHOLD;

/// Deadline for the data channel to open once SDP and candidates are
/// flowing.
const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// An established peer-to-peer connection with an open data channel.
///
/// The wormhole owns the peer connection, which owns the data channel;
/// callbacks talk back through channels and notifies rather than holding
/// references the other way.
pub struct Wormhole {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    raw: Arc<DataChannel>,
    stream: WormholeStream,
    relay: bool,

    /// The code the other side needs to dial us, in wordlist form.
    pub code: String,
    pub timeouts: Timeouts,
}

impl Wormhole {
    /// Dial the signalling server, run the PAKE and SDP exchange, and
    /// wait for the data channel to open.
    ///
    /// An empty `slot` allocates a new one; the server-assigned slot is
    /// reflected in `code`. Which side of the handshake we take depends
    /// entirely on whether a peer was already waiting on the slot.
    pub async fn setup(
        slot: &str,
        pass: &[u8],
        sigserv: &str,
        bearer: &str,
        timeouts: Timeouts,
    ) -> Result<Wormhole> {
        let mut pending = init_peer_connection(slot, pass, sigserv, bearer, &timeouts).await?;

        let key = if pending.exists {
            join_wormhole(&mut pending, pass).await?
        } else {
            new_wormhole(&mut pending, pass).await?
        };

        wait_data_channel_open(pending, key, timeouts).await
    }

    /// The byte stream carried by the data channel.
    pub fn stream(&self) -> &WormholeStream {
        &self.stream
    }

    /// Whether the nominated candidate pair goes via a TURN relay.
    pub fn is_relay(&self) -> bool {
        self.relay
    }

    /// Flush the data channel buffers, then tear down the connection.
    pub async fn close(self) {
        log::debug!("wormhole is closing");

        // The buffered-amount-low event does not fire reliably after the
        // last write, so poll until drained or the deadline passes.
        let start = Instant::now();
        while self.channel.buffered_amount().await > 0
            && start.elapsed() < self.timeouts.close_timeout.get()
        {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if let Err(e) = self.pc.close().await {
            log::debug!("closing peer connection: {}", e);
        }
        if let Err(e) = self.channel.close().await {
            log::debug!("closing data channel: {}", e);
        }
        if let Err(e) = self.raw.close().await {
            log::debug!("closing stream: {}", e);
        }
    }
}

/// Connection state while signalling is still in progress.
struct Pending {
    ws: Signalling,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    opened_rx: mpsc::Receiver<Arc<DataChannel>>,
    error_rx: mpsc::Receiver<webrtc::Error>,
    flushed: Arc<Notify>,
    exists: bool,
    code: String,
}

async fn init_peer_connection(
    slot: &str,
    pass: &[u8],
    sigserv: &str,
    bearer: &str,
    timeouts: &Timeouts,
) -> Result<Pending> {
    let mut ws = Signalling::dial(sigserv, slot, bearer).await?;

    // The first frame the server sends carries the assigned slot and the
    // ICE servers to use.
    let init = ws.read_init().await?;
    log::debug!(
        "connected to signalling server, got {} slot: {}",
        if init.exists { "existing" } else { "new" },
        init.slot
    );

    let slot_num: usize = init
        .slot
        .parse()
        .map_err(|_| Error::Protocol(format!("got invalid slot {:?} from signalling server", init.slot)))?;
    let code = wordlist::encode(slot_num, pass);
    log::info!("wormhole code: {}", code);

    let (pc, channel, opened_rx, error_rx, flushed) =
        new_peer_connection(init.ice_servers, timeouts).await?;

    Ok(Pending {
        ws,
        pc,
        channel,
        opened_rx,
        error_rx,
        flushed,
        exists: init.exists,
        code,
    })
}

#[allow(clippy::type_complexity)]
async fn new_peer_connection(
    ice: Vec<IceServer>,
    timeouts: &Timeouts,
) -> Result<(
    Arc<RTCPeerConnection>,
    Arc<RTCDataChannel>,
    mpsc::Receiver<Arc<DataChannel>>,
    mpsc::Receiver<webrtc::Error>,
    Arc<Notify>,
)> {
    // Detach() on the data channel requires opting in on the setting
    // engine before the API is built.
    let mut se = SettingEngine::default();
    se.set_ice_timeouts(
        Some(timeouts.disconnected_timeout.get()),
        Some(timeouts.failed_timeout.get()),
        Some(timeouts.keep_alive_interval.get()),
    );
    se.detach_data_channels();
    let api = APIBuilder::new().with_setting_engine(se).build();

    let config = RTCConfiguration {
        ice_servers: ice
            .into_iter()
            .map(|s| RTCIceServer {
                urls: s.urls,
                username: s.username,
                credential: s.credential,
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };
    let pc = Arc::new(api.new_peer_connection(config).await?);

    pc.on_peer_connection_state_change(Box::new(|state| {
        log::debug!("peer connection state changed: {}", state);
        Box::pin(async {})
    }));

    // Both sides pre-create the same negotiated channel, so no in-band
    // channel negotiation happens after the SDP exchange.
    let channel = pc
        .create_data_channel(
            "data",
            Some(RTCDataChannelInit {
                negotiated: Some(0),
                ..Default::default()
            }),
        )
        .await?;

    let (opened_tx, opened_rx) = mpsc::channel(1);
    let (error_tx, error_rx) = mpsc::channel(1);
    let flushed = Arc::new(Notify::new());

    {
        let channel2 = Arc::clone(&channel);
        let error_tx2 = error_tx.clone();
        channel.on_open(Box::new(move || {
            let channel = Arc::clone(&channel2);
            let opened_tx = opened_tx.clone();
            let error_tx = error_tx2.clone();
            Box::pin(async move {
                match channel.detach().await {
                    Ok(raw) => {
                        let _ = opened_tx.send(raw).await;
                    }
                    Err(e) => {
                        let _ = error_tx.send(e).await;
                    }
                }
            })
        }));
    }

    channel.on_error(Box::new(move |e| {
        let error_tx = error_tx.clone();
        Box::pin(async move {
            let _ = error_tx.send(e).await;
        })
    }));

    {
        let flushed2 = Arc::clone(&flushed);
        channel
            .on_buffered_amount_low(Box::new(move || {
                let flushed = Arc::clone(&flushed2);
                Box::pin(async move {
                    flushed.notify_one();
                })
            }))
            .await;
    }
    channel
        .set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
        .await;

    Ok((pc, channel, opened_rx, error_rx, flushed))
}

/// Run the originator's side of the handshake: we were first on the
/// slot, so we answer the PAKE and make the offer.
async fn new_wormhole(p: &mut Pending, pass: &[u8]) -> Result<Key> {
    let key = cryptography::exchange_key_originator(&mut p.ws, pass).await?;
    on_ice_candidate(p, &key);
    send_offer(p, &key).await?;
    recv_answer(p, &key).await?;
    Ok(key)
}

/// Run the joiner's side of the handshake: a peer is already waiting,
/// so we start the PAKE and answer its offer.
async fn join_wormhole(p: &mut Pending, pass: &[u8]) -> Result<Key> {
    let key = cryptography::exchange_key_joiner(&mut p.ws, pass).await?;
    on_ice_candidate(p, &key);
    recv_offer(p, &key).await?;
    send_answer(p, &key).await?;
    Ok(key)
}

/// Ship every local candidate to the peer as it is gathered. Candidates
/// start flowing right after the local description is set; the writer
/// task serializes them with the offer or answer.
fn on_ice_candidate(p: &Pending, key: &Key) {
    let sender = p.ws.sender();
    let key = *key;
    p.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sender = sender.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };

            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    log::debug!("cannot marshal local candidate: {}", e);
                    return;
                }
            };
            log::debug!("sent local candidate: {}", init.candidate);

            let json = match serde_json::to_vec(&init) {
                Ok(json) => json,
                Err(e) => {
                    log::debug!("cannot encode local candidate: {}", e);
                    return;
                }
            };
            if let Err(e) = sender.write_frame(&cryptography::seal(&key, &json)).await {
                log::debug!("cannot send local candidate: {}", e);
            }
        })
    }));
}

async fn send_offer(p: &Pending, key: &Key) -> Result<()> {
    let offer = p.pc.create_offer(None).await?;
    cryptography::write_enc_json(&p.ws, key, &offer).await?;
    p.pc.set_local_description(offer).await?;
    log::debug!("sent offer");
    Ok(())
}

async fn recv_offer(p: &mut Pending, key: &Key) -> Result<()> {
    let offer: RTCSessionDescription = read_sdp(p, key).await?;
    p.pc.set_remote_description(offer).await?;
    log::debug!("got offer");
    Ok(())
}

async fn send_answer(p: &Pending, key: &Key) -> Result<()> {
    let answer = p.pc.create_answer(None).await?;
    cryptography::write_enc_json(&p.ws, key, &answer).await?;
    p.pc.set_local_description(answer).await?;
    log::debug!("sent answer");
    Ok(())
}

async fn recv_answer(p: &mut Pending, key: &Key) -> Result<()> {
    let answer: RTCSessionDescription = read_sdp(p, key).await?;
    p.pc.set_remote_description(answer).await?;
    log::debug!("got answer");
    Ok(())
}

async fn read_sdp(p: &mut Pending, key: &Key) -> Result<RTCSessionDescription> {
    match cryptography::read_enc_json(&mut p.ws, key).await {
        Ok(sdp) => Ok(sdp),
        Err(Error::BadKey) => {
            // Close with the right status so the other side knows to
            // quit immediately.
            p.ws.close(close::BAD_KEY, "bad key").await;
            Err(Error::BadKey)
        }
        Err(e) => Err(e),
    }
}

async fn wait_data_channel_open(pending: Pending, key: Key, timeouts: Timeouts) -> Result<Wormhole> {
    let Pending {
        ws,
        pc,
        channel,
        mut opened_rx,
        mut error_rx,
        flushed,
        code,
        ..
    } = pending;

    let sender = ws.sender();
    tokio::spawn(handle_remote_candidates(ws, Arc::clone(&pc), key));

    tokio::select! {
        raw = opened_rx.recv() => {
            let raw = raw.ok_or_else(|| Error::Protocol("data channel dropped before opening".into()))?;
            let relay = is_relay(&pc).await;
            let status = if relay {
                close::WEBRTC_SUCCESS_RELAY
            } else {
                close::WEBRTC_SUCCESS_DIRECT
            };
            sender.close(status, "").await;
            log::debug!("webrtc connection succeeded (relay: {}), closing signalling channel", relay);

            let stream = WormholeStream::new(Arc::clone(&raw), Arc::clone(&channel), flushed);
            Ok(Wormhole { pc, channel, raw, stream, relay, code, timeouts })
        }
        err = error_rx.recv() => {
            sender.close(close::WEBRTC_FAILED, "").await;
            match err {
                Some(e) => {
                    log::debug!("data channel failed to open: {}", e);
                    Err(e.into())
                }
                None => Err(Error::Protocol("data channel dropped before opening".into())),
            }
        }
        _ = tokio::time::sleep(OPEN_TIMEOUT) => {
            sender.close(close::WEBRTC_FAILED, "timed out").await;
            log::debug!("data channel did not open within {:?}", OPEN_TIMEOUT);
            Err(Error::TimedOut)
        }
    }
}

/// Feed remote candidates into the peer connection as they trickle in.
/// We close the websocket once the channel opens, so this runs until the
/// read fails.
async fn handle_remote_candidates(mut ws: Signalling, pc: Arc<RTCPeerConnection>, key: Key) {
    loop {
        let candidate: RTCIceCandidateInit = match cryptography::read_enc_json(&mut ws, &key).await {
            Ok(candidate) => candidate,
            Err(e) => {
                log::debug!("stopped reading remote candidates: {}", e);
                return;
            }
        };
        log::debug!("recv remote candidate: {}", candidate.candidate);

        if let Err(e) = pc.add_ice_candidate(candidate).await {
            log::debug!("cannot add candidate: {}", e);
            return;
        }
    }
}

/// Whether the nominated candidate pair involves a relayed candidate on
/// either end.
async fn is_relay(pc: &RTCPeerConnection) -> bool {
    let stats = pc.get_stats().await;
    for report in stats.reports.values() {
        let StatsReportType::CandidatePair(pair) = report else {
            continue;
        };
        if !pair.nominated {
            continue;
        }
        for id in [&pair.local_candidate_id, &pair.remote_candidate_id] {
            match stats.reports.get(id) {
                Some(StatsReportType::LocalCandidate(c))
                | Some(StatsReportType::RemoteCandidate(c)) => {
                    if c.candidate_type == CandidateType::Relay {
                        return true;
                    }
                }
                _ => {}
            }
        }
    }
    false
}
