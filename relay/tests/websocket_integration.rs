//! End-to-end check over real sockets: a producer client pushes an init
//! segment and a frame, a consumer that joins afterwards must still see
//! the init segment before the next live frame (spec §4.5/§8).

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as ClientMessage;

use relay::{build_router, AppState, RoomManager};

async fn spawn_server() -> SocketAddr {
    let state = AppState {
        rooms: RoomManager::new(),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn late_consumer_gets_init_then_live_frame_over_real_sockets() {
    let addr = spawn_server().await;
    let base = format!("ws://{addr}");

    let (mut producer, _) = tokio_tungstenite::connect_async(format!("{base}/ws/produce/camA"))
        .await
        .expect("producer connects");

    producer
        .send(ClientMessage::Binary(b"INIT-SEGMENT".to_vec().into()))
        .await
        .unwrap();

    // Give the server a moment to cache the init segment before anyone joins.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let (mut consumer, _) = tokio_tungstenite::connect_async(format!("{base}/ws/consume/camA"))
        .await
        .expect("consumer connects");

    producer
        .send(ClientMessage::Binary(b"FRAME-1".to_vec().into()))
        .await
        .unwrap();

    let first = consumer.next().await.unwrap().unwrap();
    let second = consumer.next().await.unwrap().unwrap();

    assert_eq!(first.into_data(), b"INIT-SEGMENT".to_vec());
    assert_eq!(second.into_data(), b"FRAME-1".to_vec());
}

#[tokio::test]
async fn producer_ping_gets_pong_over_real_socket() {
    let addr = spawn_server().await;
    let base = format!("ws://{addr}");

    let (mut producer, _) = tokio_tungstenite::connect_async(format!("{base}/ws/produce/camB"))
        .await
        .expect("producer connects");

    producer
        .send(ClientMessage::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();

    let reply = producer.next().await.unwrap().unwrap();
    assert_eq!(reply.into_text().unwrap(), r#"{"type":"pong"}"#);
}
