//! The rendezvous and relay server.
//!
//! Two peers meet on a numeric slot; the first parks in the slot's
//! rendezvous cell, the second completes the pairing, and from then on
//! the server blindly copies frames between the two sockets. Payloads
//! are opaque after the init message, so the server has nothing worth
//! stealing: authenticity comes from the clients' PAKE, not from here.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::signalling::{close, IceServer, InitMsg, PROTOCOL};

/// Header value that turns a GET into an out-of-band slot reservation.
const RESERVE_SLOT_KEY: &str = "reserve_slot_key";

/// Header carrying the reservation request.
const RESERVE_HEADER: &str = "GoWormhole";

const DEFAULT_STUN_PORT: u16 = 3478;
const DEFAULT_TURN_PORT: u16 = 3478;

type PeerTx = mpsc::Sender<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMode {
    None,
    Peer1,
    Peer2,
}

/// A rendezvous slot. The cell is where peer-1 parks its write handle
/// and the channel peer-2 answers on; it lives outside the registry
/// lock, which is only ever held across the mode transition itself.
pub struct SlotItem {
    pub slot_key: String,
    cell: StdMutex<Option<Rendezvous>>,
}

struct Rendezvous {
    peer1: PeerTx,
    reply: oneshot::Sender<PeerTx>,
}

struct SlotEntry {
    item: Arc<SlotItem>,
    mode: SlotMode,
}

/// The process-wide map of busy slots, injected into every connection
/// handler.
pub struct Slots {
    m: RwLock<HashMap<String, SlotEntry>>,
    metrics: Arc<Metrics>,
}

impl Slots {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            m: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Allocate a free slot in state `None`, for the out-of-band HTTP
    /// reservation hook. The slot waits there until a peer dials it.
    pub fn reserve(&self) -> Result<Arc<SlotItem>> {
        let mut m = self.m.write().expect("slot registry lock");
        let Some(slot_key) = free_slot(&m) else {
            self.metrics.rendezvous("nomoreslots");
            return Err(Error::NoMoreSlots);
        };

        let item = Arc::new(SlotItem {
            slot_key: slot_key.clone(),
            cell: StdMutex::new(None),
        });
        m.insert(
            slot_key,
            SlotEntry {
                item: Arc::clone(&item),
                mode: SlotMode::None,
            },
        );
        self.metrics.busy_slots.set(m.len() as i64);
        Ok(item)
    }

    /// Attach a connection to a slot, advancing its lifecycle:
    /// absent or `None` becomes `Peer1`; `Peer1` becomes `Peer2` and the
    /// slot leaves the registry, because the pairing is complete.
    pub fn setup(&self, slot_key: &str) -> Result<(Arc<SlotItem>, SlotMode)> {
        let mut m = self.m.write().expect("slot registry lock");

        if let Some(entry) = m.get_mut(slot_key) {
            match entry.mode {
                SlotMode::None => {
                    entry.mode = SlotMode::Peer1;
                    return Ok((Arc::clone(&entry.item), SlotMode::Peer1));
                }
                SlotMode::Peer1 => {
                    entry.mode = SlotMode::Peer2;
                    let item = Arc::clone(&entry.item);
                    m.remove(slot_key);
                    self.metrics.busy_slots.set(m.len() as i64);
                    return Ok((item, SlotMode::Peer2));
                }
                SlotMode::Peer2 => {
                    return Ok((Arc::clone(&entry.item), SlotMode::Peer2));
                }
            }
        }

        let slot_key = if slot_key.is_empty() {
            match free_slot(&m) {
                Some(key) => key,
                None => {
                    self.metrics.rendezvous("nomoreslots");
                    return Err(Error::NoMoreSlots);
                }
            }
        } else {
            slot_key.to_string()
        };

        let item = Arc::new(SlotItem {
            slot_key: slot_key.clone(),
            cell: StdMutex::new(None),
        });
        m.insert(
            slot_key,
            SlotEntry {
                item: Arc::clone(&item),
                mode: SlotMode::Peer1,
            },
        );
        self.metrics.busy_slots.set(m.len() as i64);
        self.metrics.rendezvous("nosuchslot");
        Ok((item, SlotMode::Peer1))
    }

    pub fn delete(&self, slot_key: &str) {
        let mut m = self.m.write().expect("slot registry lock");
        m.remove(slot_key);
        self.metrics.busy_slots.set(m.len() as i64);
    }

    pub fn len(&self) -> usize {
        self.m.read().expect("slot registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Find an available numeric slot, favouring smaller numbers so codes
/// stay short. Assuming varint encoding: first try for one byte (7
/// bits), then two (11), three (16), four (21).
fn free_slot(m: &HashMap<String, SlotEntry>) -> Option<String> {
    const TRIES: [(usize, u32); 4] = [(64, 7), (1024, 11), (2048, 16), (2048, 21)];

    let mut rng = rand::thread_rng();
    for (tries, bits) in TRIES {
        for _ in 0..tries {
            let s = rng.gen_range(0..1usize << bits).to_string();
            if !m.contains_key(&s) {
                return Some(s);
            }
        }
    }
    None
}

/// Counters for the metrics endpoint, registered on an explicit
/// registry rather than the process default.
pub struct Metrics {
    pub registry: Registry,
    pub rendezvous_attempts: IntCounterVec,
    pub webrtc_attempts: IntCounterVec,
    pub protocol_errors: IntCounterVec,
    pub busy_slots: IntGauge,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();
        let rendezvous_attempts = IntCounterVec::new(
            Opts::new(
                "rendezvous_attempts",
                "Number of attempts to rendezvous using the signalling server.",
            )
            .namespace("burrow"),
            &["result"],
        )
        .expect("metric definition");
        let webrtc_attempts = IntCounterVec::new(
            Opts::new(
                "webrtc_attempts",
                "Number of reported ICE results sliced by ICE method used.",
            )
            .namespace("burrow"),
            &["result", "method"],
        )
        .expect("metric definition");
        let protocol_errors = IntCounterVec::new(
            Opts::new("protocol_errors", "Number of bad requests to the signalling server.")
                .namespace("burrow"),
            &["kind"],
        )
        .expect("metric definition");
        let busy_slots = IntGauge::new("burrow_busy_slots", "Number of currently busy slots.")
            .expect("metric definition");

        for c in [&rendezvous_attempts, &webrtc_attempts, &protocol_errors] {
            registry
                .register(Box::new(c.clone()))
                .expect("metric registration");
        }
        registry
            .register(Box::new(busy_slots.clone()))
            .expect("metric registration");

        Arc::new(Self {
            registry,
            rendezvous_attempts,
            webrtc_attempts,
            protocol_errors,
            busy_slots,
        })
    }

    fn rendezvous(&self, result: &str) {
        self.rendezvous_attempts.with_label_values(&[result]).inc();
    }

    fn ice(&self, result: &str, method: &str) {
        self.webrtc_attempts
            .with_label_values(&[result, method])
            .inc();
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bearer token required on every request; empty disables auth.
    pub bearer: String,
    /// Maximum time a client may hold a slot waiting for its peer.
    pub slot_timeout: Duration,
    pub stun_servers: Vec<String>,
    pub turn_server: String,
    /// "user:password" for the TURN server.
    pub turn_user: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bearer: String::new(),
            slot_timeout: Duration::from_secs(12 * 3600),
            stun_servers: vec!["stun2.l.google.com:19302".into()],
            turn_server: String::new(),
            turn_user: String::new(),
        }
    }
}

#[derive(Clone)]
pub struct RelayState(Arc<RelayInner>);

struct RelayInner {
    slots: Slots,
    metrics: Arc<Metrics>,
    config: RelayConfig,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let metrics = Metrics::new();
        Self(Arc::new(RelayInner {
            slots: Slots::new(Arc::clone(&metrics)),
            metrics,
            config,
        }))
    }

    pub fn slots(&self) -> &Slots {
        &self.0.slots
    }

    pub fn metrics(&self) -> &Metrics {
        &self.0.metrics
    }

    /// The ICE servers advertised in every init message: the configured
    /// TURN relay first, then the STUN servers.
    fn ice_servers(&self) -> Vec<IceServer> {
        let config = &self.0.config;
        let mut servers = Vec::new();

        if !config.turn_server.is_empty() {
            let (username, credential) = config
                .turn_user
                .split_once(':')
                .unwrap_or((config.turn_user.as_str(), ""));
            servers.push(IceServer {
                urls: vec![prefix("turn:", &append_port(&config.turn_server, DEFAULT_TURN_PORT))],
                username: username.to_string(),
                credential: credential.to_string(),
            });
        }
        for stun in &config.stun_servers {
            if !stun.is_empty() {
                servers.push(IceServer {
                    urls: vec![prefix("stun:", &append_port(stun, DEFAULT_STUN_PORT))],
                    ..Default::default()
                });
            }
        }
        servers
    }
}

fn prefix(prefix: &str, addr: &str) -> String {
    if addr.starts_with(prefix) {
        addr.to_string()
    } else {
        format!("{}{}", prefix, addr)
    }
}

fn append_port(addr: &str, port: u16) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:{}", addr, port)
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/", get(root_handler))
        .route("/:slot", get(slot_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<RelayState>) -> Response {
    let mut buf = Vec::new();
    if TextEncoder::new()
        .encode(&state.metrics().registry.gather(), &mut buf)
        .is_err()
    {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}

async fn root_handler(
    State(state): State<RelayState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    handle(state, String::new(), headers, ws).await
}

async fn slot_handler(
    Path(slot): Path<String>,
    State(state): State<RelayState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    handle(state, slot, headers, ws).await
}

async fn handle(
    state: RelayState,
    slot_key: String,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let bearer = &state.0.config.bearer;
    if !bearer.is_empty() {
        let expected = format!("Bearer {}", bearer);
        if headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case(&expected))
            != Some(true)
        {
            return (StatusCode::UNAUTHORIZED, "Not Authorized").into_response();
        }
    }

    if headers
        .get(RESERVE_HEADER)
        .and_then(|v| v.to_str().ok())
        == Some(RESERVE_SLOT_KEY)
    {
        return reserve_slot(&state).into_response();
    }

    match ws {
        Some(upgrade) => upgrade
            .protocols([PROTOCOL])
            .on_upgrade(move |socket| relay_peer(state, slot_key, socket)),
        None => (StatusCode::OK, "burrow signalling server\n").into_response(),
    }
}

#[derive(Serialize)]
struct ReserveSlotResult {
    error: String,
    key: String,
}

/// Pre-create a slot without engaging in the handshake, so a third
/// party can mint a code up front. The slot sits in state `None` until
/// a peer dials it.
fn reserve_slot(state: &RelayState) -> Json<ReserveSlotResult> {
    match state.slots().reserve() {
        Ok(item) => Json(ReserveSlotResult {
            error: String::new(),
            key: item.slot_key.clone(),
        }),
        Err(e) => Json(ReserveSlotResult {
            error: e.to_string(),
            key: String::new(),
        }),
    }
}

/// One connected peer: pair on the slot, then relay frames until either
/// side goes away.
async fn relay_peer(state: RelayState, slot_key: String, socket: WebSocket) {
    // Make sure we negotiated the right protocol, since "blank" is also
    // a default one.
    if socket.protocol().is_none() {
        state.metrics().protocol_errors.with_label_values(&["wrongversion"]).inc();
        let mut socket = socket;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close::WRONG_PROTO,
                reason: Cow::Borrowed("wrong protocol, please upgrade client"),
            })))
            .await;
        return;
    }

    let (sink, mut reader) = socket.split();
    let (my_tx, my_rx) = mpsc::channel::<Message>(16);
    tokio::spawn(write_loop(sink, my_rx));

    let (item, mode) = match state.slots().setup(&slot_key) {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("setup slot {:?} failed: {}", slot_key, e);
            let code = match e {
                Error::NoMoreSlots => close::NO_MORE_SLOTS,
                _ => close::NO_SUCH_SLOT,
            };
            send_close(&my_tx, code, &e.to_string()).await;
            return;
        }
    };

    let init = InitMsg {
        exists: mode == SlotMode::Peer2,
        slot: item.slot_key.clone(),
        ice_servers: state.ice_servers(),
    };
    let init_json = match serde_json::to_string(&init) {
        Ok(json) => json,
        Err(e) => {
            log::error!("encode init message: {}", e);
            state.slots().delete(&item.slot_key);
            return;
        }
    };
    if my_tx.send(Message::Text(init_json)).await.is_err() {
        state.slots().delete(&item.slot_key);
        return;
    }
    log::debug!("slot: {} mode: {:?}", item.slot_key, mode);

    let peer_tx = match mode {
        SlotMode::Peer1 | SlotMode::None => {
            match wait_pair(&state, &item, my_tx.clone()).await {
                Some(tx) => tx,
                None => {
                    state.slots().delete(&item.slot_key);
                    state.metrics().rendezvous("timeout");
                    send_close(&my_tx, close::SLOT_TIMED_OUT, "timed out").await;
                    return;
                }
            }
        }
        SlotMode::Peer2 => {
            let rendezvous = item.cell.lock().expect("rendezvous cell lock").take();
            match rendezvous {
                Some(r) => {
                    let _ = r.reply.send(my_tx.clone());
                    state.metrics().rendezvous("success");
                    r.peer1
                }
                None => {
                    // Peer-1 gave up in the instant between our setup()
                    // and now.
                    send_close(&my_tx, close::SLOT_TIMED_OUT, "timed out").await;
                    return;
                }
            }
        }
    };

    relay_frames(&state, &mut reader, &peer_tx).await;
}

/// Park in the rendezvous cell until peer-2 arrives, pinging our own
/// socket every 30 seconds so intermediaries keep it open.
async fn wait_pair(state: &RelayState, item: &SlotItem, my_tx: PeerTx) -> Option<PeerTx> {
    let (reply_tx, mut reply_rx) = oneshot::channel();
    *item.cell.lock().expect("rendezvous cell lock") = Some(Rendezvous {
        peer1: my_tx.clone(),
        reply: reply_tx,
    });

    let deadline = tokio::time::sleep(state.0.config.slot_timeout);
    tokio::pin!(deadline);
    let mut ping = tokio::time::interval(Duration::from_secs(30));
    ping.tick().await;

    loop {
        tokio::select! {
            reply = &mut reply_rx => {
                return match reply {
                    Ok(peer_tx) => {
                        state.metrics().rendezvous("success");
                        Some(peer_tx)
                    }
                    Err(_) => None,
                };
            }
            _ = ping.tick() => {
                let _ = my_tx.send(Message::Ping(Vec::new())).await;
            }
            _ = &mut deadline => {
                item.cell.lock().expect("rendezvous cell lock").take();
                return None;
            }
        }
    }
}

/// Copy frames from our socket to the peer until our side closes, then
/// translate the close status into counters and let the peer know.
async fn relay_frames(state: &RelayState, reader: &mut SplitStream<WebSocket>, peer: &PeerTx) {
    let metrics = state.metrics();
    loop {
        match reader.next().await {
            Some(Ok(Message::Close(frame))) => {
                let code = frame.map(|f| f.code).unwrap_or(1005);
                match code {
                    close::BAD_KEY => {
                        metrics.ice("fail", "badkey");
                        // Fail the other side fast instead of letting it
                        // wait out its timeouts.
                        send_close(peer, close::BAD_KEY, "bad key").await;
                    }
                    close::WEBRTC_FAILED => metrics.ice("fail", "unknown"),
                    close::WEBRTC_SUCCESS => metrics.ice("success", "unknown"),
                    close::WEBRTC_SUCCESS_DIRECT => metrics.ice("success", "direct"),
                    close::WEBRTC_SUCCESS_RELAY => metrics.ice("success", "relay"),
                    _ => {
                        metrics.ice("unknown", "unknown");
                        send_close(peer, close::PEER_HUNG_UP, "peer hung up").await;
                    }
                }
                return;
            }
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                if peer.send(msg).await.is_err() {
                    return;
                }
            }
            Some(Ok(_)) => {} // pings and pongs are answered for us
            Some(Err(e)) => {
                log::debug!("read error: {}", e);
                metrics.ice("unknown", "unknown");
                send_close(peer, close::PEER_HUNG_UP, "peer hung up").await;
                return;
            }
            None => {
                metrics.ice("unknown", "unknown");
                send_close(peer, close::PEER_HUNG_UP, "peer hung up").await;
                return;
            }
        }
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() || closing {
            return;
        }
    }
}

async fn send_close(tx: &PeerTx, code: u16, reason: &str) {
    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_slots() -> (Slots, Arc<Metrics>) {
        let metrics = Metrics::new();
        (Slots::new(Arc::clone(&metrics)), metrics)
    }

    #[test]
    fn test_slot_lifecycle() {
        let (slots, metrics) = new_slots();

        let item = slots.reserve().unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(metrics.busy_slots.get(), 1);

        // First peer attaches to the reserved slot.
        let (p1, mode) = slots.setup(&item.slot_key).unwrap();
        assert_eq!(mode, SlotMode::Peer1);
        assert_eq!(p1.slot_key, item.slot_key);
        assert_eq!(slots.len(), 1);

        // Second peer completes the pairing and the slot is gone.
        let (p2, mode) = slots.setup(&item.slot_key).unwrap();
        assert_eq!(mode, SlotMode::Peer2);
        assert!(Arc::ptr_eq(&p1, &p2));
        assert_eq!(slots.len(), 0);
        assert_eq!(metrics.busy_slots.get(), 0);
    }

    #[test]
    fn test_setup_creates_missing_slot_as_peer1() {
        let (slots, _metrics) = new_slots();
        let (item, mode) = slots.setup("12345").unwrap();
        assert_eq!(mode, SlotMode::Peer1);
        assert_eq!(item.slot_key, "12345");
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn test_setup_with_empty_key_allocates() {
        let (slots, _metrics) = new_slots();
        let (item, mode) = slots.setup("").unwrap();
        assert_eq!(mode, SlotMode::Peer1);
        let n: usize = item.slot_key.parse().unwrap();
        assert!(n < 1 << 21);
    }

    #[test]
    fn test_delete_is_unconditional() {
        let (slots, metrics) = new_slots();
        slots.setup("7").unwrap();
        slots.delete("7");
        slots.delete("7");
        assert!(slots.is_empty());
        assert_eq!(metrics.busy_slots.get(), 0);
    }

    #[test]
    fn test_reserved_slots_are_distinct() {
        let (slots, _metrics) = new_slots();
        let a = slots.reserve().unwrap();
        let b = slots.reserve().unwrap();
        assert_ne!(a.slot_key, b.slot_key);
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn test_ice_server_list() {
        let state = RelayState::new(RelayConfig {
            turn_server: "turn.example.org".into(),
            turn_user: "alice:s3cret".into(),
            stun_servers: vec!["stun.example.org:3478".into()],
            ..Default::default()
        });
        let servers = state.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["turn:turn.example.org:3478"]);
        assert_eq!(servers[0].username, "alice");
        assert_eq!(servers[0].credential, "s3cret");
        assert_eq!(servers[1].urls, vec!["stun:stun.example.org:3478"]);
        assert!(servers[1].username.is_empty());
    }

    #[test]
    fn test_append_port() {
        assert_eq!(append_port("host", 3478), "host:3478");
        assert_eq!(append_port("host:19302", 3478), "host:19302");
    }
}
