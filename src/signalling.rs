//! Client side of the signalling protocol.
//!
//! The signalling server pairs two peers on a slot and blindly relays
//! frames between them. Everything after the server's initial JSON
//! message is an opaque base64-url text frame; the server never sees
//! plaintext signalling payloads.

use std::borrow::Cow;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};

/// Identifier for the current signalling scheme, negotiated as the
/// WebSocket subprotocol. It's intended to help clients print a
/// friendlier message urging them to upgrade if the server has a
/// different version.
pub const PROTOCOL: &str = "4";

/// WebSocket close statuses used by the signalling protocol (4000+).
pub mod close {
    /// The slot is not valid.
    pub const NO_SUCH_SLOT: u16 = 4000;
    /// The slot timed out before the second peer arrived.
    pub const SLOT_TIMED_OUT: u16 = 4001;
    /// The server cannot allocate any new slots at the time.
    pub const NO_MORE_SLOTS: u16 = 4002;
    /// The server runs a different version of the signalling protocol.
    pub const WRONG_PROTO: u16 = 4003;
    /// The peer has closed its connection.
    pub const PEER_HUNG_UP: u16 = 4004;
    /// The peer has closed its connection because the key it derived is bad.
    pub const BAD_KEY: u16 = 4005;
    /// A WebRTC connection was successful.
    pub const WEBRTC_SUCCESS: u16 = 4006;
    /// A WebRTC connection was successful and we know it's peer-to-peer.
    pub const WEBRTC_SUCCESS_DIRECT: u16 = 4007;
    /// A WebRTC connection was successful and we know it's via a relay.
    pub const WEBRTC_SUCCESS_RELAY: u16 = 4008;
    /// We couldn't establish a WebRTC connection.
    pub const WEBRTC_FAILED: u16 = 4009;
}

/// An ICE server entry handed to clients in the init message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

/// The first frame the server sends on every connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitMsg {
    /// Whether a peer was already waiting on the slot. The second peer
    /// to arrive takes the joiner's side of the PAKE.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exists: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub slot: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ice_servers: Vec<IceServer>,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A signalling connection with reads on the caller's task and writes
/// serialized through a single writer task, so ICE candidate callbacks
/// can write concurrently with the offer/answer exchange.
pub struct Signalling {
    reader: SplitStream<WsStream>,
    tx: mpsc::Sender<Message>,
}

/// A cloneable write handle onto a signalling connection. All writes
/// from all handles funnel through the one writer task, so frames are
/// serialized no matter which task produced them.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Message>,
}

impl FrameSender {
    pub async fn write_frame(&self, p: &[u8]) -> Result<()> {
        self.tx
            .send(Message::Text(URL_SAFE.encode(p)))
            .await
            .map_err(|_| Error::WebSocket(tokio_tungstenite::tungstenite::Error::ConnectionClosed))
    }

    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .tx
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Owned(reason.to_string()),
            })))
            .await;
    }
}

impl Signalling {
    /// A write handle that can outlive borrows of the connection, for
    /// use inside ICE candidate callbacks.
    pub fn sender(&self) -> FrameSender {
        FrameSender {
            tx: self.tx.clone(),
        }
    }

    /// Dial the signalling server and join (or allocate) a slot.
    ///
    /// `http`/`ws` schemes map to `ws`, everything else to `wss`. An
    /// empty slot asks the server to allocate a fresh one.
    pub async fn dial(sigserv: &str, slot: &str, bearer: &str) -> Result<Self> {
        let url = websocket_url(sigserv, slot);
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Config(format!("bad signalling url: {}", e)))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, PROTOCOL.parse().expect("static header"));
        if !bearer.is_empty() {
            let value = format!("Bearer {}", bearer)
                .parse()
                .map_err(|_| Error::Config("bearer token is not a valid header".into()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _) = connect_async(request).await?;
        let (mut sink, reader) = ws.split();

        let (tx, mut rx) = mpsc::channel::<Message>(16);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        Ok(Self { reader, tx })
    }

    /// Read the init message. The server sends it exactly once, as the
    /// first frame, as plain JSON.
    pub async fn read_init(&mut self) -> Result<InitMsg> {
        match self.next_message().await? {
            Message::Text(text) => Ok(serde_json::from_str(&text)?),
            other => Err(Error::Protocol(format!(
                "expected init message, got {:?}",
                other
            ))),
        }
    }

    /// Read one signalling frame and undo its base64-url armor.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        match self.next_message().await? {
            Message::Text(text) => URL_SAFE
                .decode(text.trim())
                .map_err(|e| Error::Protocol(format!("bad frame encoding: {}", e))),
            other => Err(Error::Protocol(format!("expected text frame, got {:?}", other))),
        }
    }

    /// Armor bytes as base64-url and send them as one text frame.
    pub async fn write_frame(&self, p: &[u8]) -> Result<()> {
        self.send(Message::Text(URL_SAFE.encode(p))).await
    }

    /// Close the connection with one of the protocol status codes. The
    /// code is how the other peer (and the server's counters) learn the
    /// outcome of the session.
    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Owned(reason.to_string()),
            })))
            .await;
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| Error::WebSocket(tokio_tungstenite::tungstenite::Error::ConnectionClosed))
    }

    async fn next_message(&mut self) -> Result<Message> {
        loop {
            match self.reader.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => return Err(close_error(frame)),
                Some(Ok(msg)) => return Ok(msg),
                Some(Err(e)) => return Err(e.into()),
                None => return Err(Error::Closed(1006)),
            }
        }
    }
}

/// Translate a close frame from the server or the peer into the error
/// the caller should see.
fn close_error(frame: Option<CloseFrame>) -> Error {
    let code = match frame {
        Some(f) => u16::from(f.code),
        None => return Error::Closed(1005),
    };
    match code {
        close::WRONG_PROTO => Error::BadVersion,
        close::BAD_KEY => Error::BadKey,
        close::SLOT_TIMED_OUT => Error::TimedOut,
        close::NO_MORE_SLOTS => Error::NoMoreSlots,
        close::NO_SUCH_SLOT => Error::NoSuchSlot,
        close::PEER_HUNG_UP => Error::PeerHungUp,
        other => Error::Closed(other),
    }
}

fn websocket_url(sigserv: &str, slot: &str) -> String {
    let (scheme, rest) = sigserv
        .split_once("://")
        .unwrap_or(("http", sigserv));
    let scheme = match scheme {
        "http" | "ws" => "ws",
        _ => "wss",
    };
    let rest = rest.trim_end_matches('/');
    format!("{}://{}/{}", scheme, rest, slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_scheme_mapping() {
        assert_eq!(websocket_url("http://sig.example", ""), "ws://sig.example/");
        assert_eq!(
            websocket_url("https://sig.example", "42"),
            "wss://sig.example/42"
        );
        assert_eq!(websocket_url("ws://sig.example/", "7"), "ws://sig.example/7");
        assert_eq!(websocket_url("sig.example", "7"), "ws://sig.example/7");
    }

    #[test]
    fn test_init_msg_wire_names() {
        let init: InitMsg =
            serde_json::from_str(r#"{"exists":true,"slot":"57","iceServers":[{"urls":["stun:stun.example:3478"]}]}"#)
                .unwrap();
        assert!(init.exists);
        assert_eq!(init.slot, "57");
        assert_eq!(init.ice_servers.len(), 1);

        // Absent fields take their defaults, matching the omitempty
        // encoding on the wire.
        let init: InitMsg = serde_json::from_str(r#"{"slot":"3"}"#).unwrap();
        assert!(!init.exists);
        assert!(init.ice_servers.is_empty());
    }

    #[test]
    fn test_close_error_mapping() {
        let frame = |code: u16| {
            Some(CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Borrowed(""),
            })
        };
        assert!(matches!(close_error(frame(close::WRONG_PROTO)), Error::BadVersion));
        assert!(matches!(close_error(frame(close::BAD_KEY)), Error::BadKey));
        assert!(matches!(close_error(frame(close::SLOT_TIMED_OUT)), Error::TimedOut));
        assert!(matches!(close_error(frame(close::PEER_HUNG_UP)), Error::PeerHungUp));
        assert!(matches!(close_error(frame(4999)), Error::Closed(4999)));
        assert!(matches!(close_error(None), Error::Closed(1005)));
    }
}
