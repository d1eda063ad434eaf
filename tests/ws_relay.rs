use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sunny::fleet::FleetStore;
use sunny::protocol::{CommandSchema, Envelope, EVENT_BOAT_DATA};
use sunny::dispatcher::CommandDispatcher;
use sunny::relay::{ConnectionManager, ConnectionState, EndpointConnector};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Accepts one WebSocket client, sends `greeting`, and forwards every text
/// frame it receives. A close frame from the client is reported as
/// `{"closed": true}`.
async fn relay(greeting: Vec<Value>) -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        for frame in greeting {
            socket.send(Message::Text(frame.to_string())).await.unwrap();
        }
        while let Some(Ok(message)) = socket.next().await {
            match message {
                Message::Text(text) => {
                    let _ = tx.send(serde_json::from_str(&text).unwrap());
                }
                Message::Close(_) => {
                    let _ = tx.send(json!({"closed": true}));
                    break;
                }
                _ => {}
            }
        }
    });

    (format!("ws://{}", addr), rx)
}

#[tokio::test]
async fn websocket_relay_round_trip() {
    let (endpoint, mut received) = relay(vec![
        json!({"event": EVENT_BOAT_DATA, "data": {"boat_id": "B1", "data": {"latitude": 37.86}}}),
        json!("not an envelope"),
    ])
    .await;

    let manager = ConnectionManager::new(EndpointConnector::shared("sunny-test"));
    let fleet = Arc::new(FleetStore::new());
    manager.register(&fleet);
    let dispatcher = Arc::new(CommandDispatcher::new(
        manager.clone(),
        CommandSchema::Verbose,
        Duration::from_millis(500),
    ));
    manager.register(&dispatcher);

    manager.connect(&endpoint).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while fleet.get("B1").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(dispatcher.end_manual_control("B1"));
    let frame = tokio::time::timeout(Duration::from_secs(2), received.recv())
        .await
        .unwrap()
        .unwrap();
    let envelope: Envelope = serde_json::from_value(frame).unwrap();
    assert_eq!(envelope.event, "gui_data");
    assert_eq!(envelope.data["boat_id"], json!("B1"));
    assert_eq!(envelope.data["throttle"], json!(0.0));
    assert_eq!(envelope.data["command_mode"], json!("manual"));

    manager.disconnect();
    assert_eq!(manager.status().state, ConnectionState::Disconnected);
    assert!(fleet.is_empty());

    let goodbye = tokio::time::timeout(Duration::from_secs(2), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(goodbye, json!({"closed": true}));
}

#[tokio::test]
async fn refused_websocket_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let manager = ConnectionManager::new(EndpointConnector::shared("sunny-test"));
    assert!(manager.connect(&endpoint).await.is_err());
    assert_eq!(manager.status().state, ConnectionState::Disconnected);
}
