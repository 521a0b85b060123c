//! HTTP/WebSocket surface: `/ws/produce/{stream_key}` accepts the agent's
//! uplink, `/ws/consume/{stream_key}` serves viewers. One JSON envelope
//! shape is used for producer control frames; everything else is treated
//! as an opaque binary media chunk.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::room::RoomManager;

#[derive(Clone)]
pub struct AppState {
    pub rooms: RoomManager,
}

/// Envelope a producer may send instead of a raw binary frame. `data` is
/// base64 when `kind` is "init" or "data"; absent for "ping".
#[derive(Deserialize)]
struct ProducerFrame {
    #[serde(rename = "type")]
    kind: String,
    data: Option<String>,
}

#[derive(Serialize)]
struct PongFrame {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct RoomStatus {
    stream_key: String,
    consumer_count: usize,
    bytes_sent: u64,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/produce/{stream_key}", get(handle_produce))
        .route("/ws/consume/{stream_key}", get(handle_consume))
        .route("/status", get(list_rooms))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomStatus>> {
    let statuses = state
        .rooms
        .room_keys()
        .into_iter()
        .filter_map(|key| {
            let room = state.rooms.get(&key)?;
            let (bytes_sent, consumer_count, _) = room.stats();
            Some(RoomStatus {
                stream_key: key,
                consumer_count,
                bytes_sent,
            })
        })
        .collect();
    Json(statuses)
}

async fn handle_produce(
    ws: WebSocketUpgrade,
    Path(stream_key): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| produce_loop(socket, stream_key, state))
}

async fn produce_loop(socket: WebSocket, stream_key: String, state: AppState) {
    let room = state.rooms.get_or_create(&stream_key);
    let (generation, mut displaced) = room.register_producer();
    info!(stream_key, generation, "producer connected");

    let (mut sink, mut stream) = socket.split();
    let mut saw_first_payload = false;

    loop {
        tokio::select! {
            _ = &mut displaced => {
                info!(stream_key, generation, "producer displaced by a newer connection");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    info!(stream_key, generation, "producer socket closed");
                    break;
                };
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(stream_key, error = %e, "producer socket error");
                        break;
                    }
                };
                match msg {
                    Message::Binary(payload) => {
                        let is_init = !saw_first_payload;
                        saw_first_payload = true;
                        room.broadcast(payload, is_init);
                    }
                    Message::Text(text) => {
                        if let Some(reply) = handle_producer_text(&room, &text, &mut saw_first_payload) {
                            let _ = sink.send(Message::Text(reply.into())).await;
                        }
                    }
                    Message::Close(_) => {
                        info!(stream_key, generation, "producer sent close frame");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    room.clear_producer_if_current(generation);
}

/// Returns a JSON reply to send back to the producer, if the frame calls
/// for one (currently only "ping").
fn handle_producer_text(
    room: &crate::room::Room,
    text: &str,
    saw_first_payload: &mut bool,
) -> Option<String> {
    let frame: ProducerFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "dropping malformed producer text frame");
            return None;
        }
    };

    match frame.kind.as_str() {
        "ping" => serde_json::to_string(&PongFrame { kind: "pong" }).ok(),
        "init" | "data" => {
            let Some(encoded) = frame.data else {
                warn!(kind = %frame.kind, "producer frame missing data field");
                return None;
            };
            let Ok(raw) = BASE64.decode(encoded) else {
                warn!("producer sent invalid base64 payload");
                return None;
            };
            let is_init = frame.kind == "init" || !*saw_first_payload;
            *saw_first_payload = true;
            room.broadcast(Bytes::from(raw), is_init);
            None
        }
        other => {
            warn!(kind = other, "unrecognized producer frame type");
            None
        }
    }
}

async fn handle_consume(
    ws: WebSocketUpgrade,
    Path(stream_key): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| consume_loop(socket, stream_key, state))
}

async fn consume_loop(socket: WebSocket, stream_key: String, state: AppState) {
    let room = state.rooms.get_or_create(&stream_key);
    let mut rx = room.join();
    info!(stream_key, "consumer joined");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Consumers are read-only; ignore anything else they send.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!(stream_key, "consumer disconnected");
}

pub fn local_addr(bind: &str, port: u16) -> Result<SocketAddr, std::net::AddrParseError> {
    format!("{bind}:{port}").parse()
}
