//! WebSocket event feed with per-pool subscriptions.

#![allow(clippy::panic, clippy::indexing_slicing)]

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use common::{API_KEY, pool, pool_id, serve};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr) -> Socket {
    let Ok((socket, _)) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await else {
        panic!("ws handshake should succeed");
    };
    socket
}

async fn send_command(socket: &mut Socket, id: &str, payload: Value) {
    let msg = json!({
        "id": id,
        "type": "command",
        "timestamp": chrono::Utc::now(),
        "payload": payload,
    });
    let Ok(()) = socket.send(Message::text(msg.to_string())).await else {
        panic!("send should succeed");
    };
}

/// Next JSON text frame, failing after two seconds.
async fn next_json(socket: &mut Socket) -> Value {
    let Ok(Some(Ok(msg))) = tokio::time::timeout(Duration::from_secs(2), socket.next()).await
    else {
        panic!("expected a ws frame");
    };
    let Ok(text) = msg.to_text() else {
        panic!("expected a text frame");
    };
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        panic!("expected json, got {text}");
    };
    value
}

#[tokio::test]
async fn subscribed_pool_events_are_streamed() {
    let (addr, service, _) = serve(vec![pool("a", 64, 1, |_| {}), pool("b", 64, 1, |_| {})]).await;
    let mut socket = connect(addr).await;

    send_command(&mut socket, "s1", json!({ "command": "subscribe", "pool_ids": ["a"] })).await;
    let response = next_json(&mut socket).await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["id"], "s1");
    assert_eq!(response["payload"]["subscribed"], json!(["a"]));

    // Pool b is not subscribed, so its events must not arrive first.
    let Ok(_) = service.reserve(&pool_id("b"), 1, Some(API_KEY), None).await else {
        panic!("reserve should succeed");
    };
    let Ok(refs) = service.reserve(&pool_id("a"), 1, Some(API_KEY), None).await else {
        panic!("reserve should succeed");
    };

    let mut saw_reservation = false;
    for _ in 0..16 {
        let event = next_json(&mut socket).await;
        assert_eq!(event["type"], "event");
        assert_eq!(event["payload"]["pool_id"], "a");
        if event["payload"]["event_type"] == "indices_reserved" {
            assert_eq!(event["payload"]["list_uri"], refs[0].uri.as_str());
            saw_reservation = true;
            break;
        }
    }
    assert!(saw_reservation);
}

#[tokio::test]
async fn commands_are_validated_and_answered() {
    let (addr, _, _) = serve(vec![pool("a", 64, 1, |_| {})]).await;
    let mut socket = connect(addr).await;

    let Ok(()) = socket.send(Message::text("not json")).await else {
        panic!("send should succeed");
    };
    let error = next_json(&mut socket).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["code"], 400);

    send_command(&mut socket, "x", json!({ "command": "swap" })).await;
    let error = next_json(&mut socket).await;
    assert_eq!(error["payload"]["code"], 404);

    send_command(&mut socket, "g1", json!({ "command": "get_state", "pool_id": "a" })).await;
    let state = next_json(&mut socket).await;
    assert_eq!(state["type"], "response");
    assert_eq!(state["payload"]["state"], "needs_list");

    send_command(&mut socket, "g2", json!({ "command": "get_state", "pool_id": "zzz" })).await;
    let missing = next_json(&mut socket).await;
    assert_eq!(missing["type"], "error");
    assert_eq!(missing["payload"]["code"], 400);

    send_command(
        &mut socket,
        "u1",
        json!({ "command": "unsubscribe", "pool_ids": ["a", "*"] }),
    )
    .await;
    let response = next_json(&mut socket).await;
    assert_eq!(response["payload"]["remaining_count"], 0);
    assert_eq!(response["payload"]["wildcard"], false);
}
