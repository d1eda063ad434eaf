use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sunny::config::EndpointConfig;
use sunny::console::{Console, ConsoleSettings, OperatorCommand, Reply};
use sunny::protocol::{CommandSchema, EVENT_BOAT_DATA, EVENT_BOAT_LOCATIONS, EVENT_GUI_DATA};
use sunny::recording::{ExportFormat, FileExporter, SessionScope};
use sunny::relay::{MemoryConnector, MemoryRelay};
use tokio::sync::mpsc::UnboundedReceiver;

fn console(dir: &std::path::Path) -> (Console, UnboundedReceiver<MemoryRelay>) {
    let (connector, relays) = MemoryConnector::new();
    let settings = ConsoleSettings {
        endpoints: vec![EndpointConfig {
            label: "Local".to_string(),
            value: "mem://local".to_string(),
        }],
        schema: CommandSchema::Compact,
        period: Duration::from_millis(500),
        record_on_connect: false,
    };
    let exporter = FileExporter::new(dir, ExportFormat::Json);
    (
        Console::new(Arc::new(connector), Arc::new(exporter), settings),
        relays,
    )
}

async fn wait_for_vehicles(console: &Console, count: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while console.fleet.len() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("fleet did not settle");
}

#[tokio::test]
async fn telemetry_goal_and_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let (console, mut relays) = console(dir.path());

    console.connect("mem://local").await.unwrap();
    let mut relay = relays.recv().await.unwrap();
    relay
        .push(
            EVENT_BOAT_DATA,
            json!({"boat_id": "B1", "data": {"latitude": 37.86, "longitude": -122.31}}),
        )
        .unwrap();
    wait_for_vehicles(&console, 1).await;

    let snapshot = console.fleet.snapshot().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, "B1");
    assert_eq!(snapshot[0].position(), Some((37.86, -122.31)));

    assert!(console.dispatcher.send_goal("B1", 37.87, -122.32));
    let sent = relay.recv().await.unwrap();
    assert_eq!(sent.event, EVENT_GUI_DATA);
    assert_eq!(sent.data["id"], json!("B1"));
    assert_eq!(sent.data["tlat"], json!(37.87));
    assert_eq!(sent.data["tlng"], json!(-122.32));
    assert!(relay.drain().is_empty());

    console.connection.disconnect();
    assert!(console.fleet.snapshot().unwrap().is_empty());
    assert!(!console.dispatcher.send_goal("B1", 37.87, -122.32));
}

#[tokio::test]
async fn malformed_telemetry_leaves_other_vehicles_alone() {
    let dir = tempfile::tempdir().unwrap();
    let (console, mut relays) = console(dir.path());
    console.connect("mem://local").await.unwrap();
    let relay = relays.recv().await.unwrap();

    relay
        .push(EVENT_BOAT_DATA, json!({"boat_id": "B1", "data": {"temperature": 18}}))
        .unwrap();
    relay.push(EVENT_BOAT_DATA, json!("garbage")).unwrap();
    relay
        .push(EVENT_BOAT_DATA, json!({"data": {"temperature": 99}}))
        .unwrap();
    relay
        .push(EVENT_BOAT_DATA, json!({"boat_id": "B2", "data": {"temperature": 20}}))
        .unwrap();
    wait_for_vehicles(&console, 2).await;

    assert_eq!(console.fleet.get("B1").unwrap().data["temperature"], json!(18));
    assert!(console.connection.is_connected());
}

#[tokio::test]
async fn recording_exports_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (console, mut relays) = console(dir.path());
    console.connect("mem://local").await.unwrap();
    let relay = relays.recv().await.unwrap();

    let reply = console
        .execute(OperatorCommand::parse("record start B1").unwrap())
        .await
        .unwrap();
    assert_eq!(reply, Reply::Text("Recording B1".to_string()));

    relay
        .push(
            EVENT_BOAT_LOCATIONS,
            json!([
                {"boat_id": "B1", "data": {"latitude": 1.0, "longitude": 2.0}},
                {"boat_id": "B2", "data": {"latitude": 3.0, "longitude": 4.0}}
            ]),
        )
        .unwrap();
    wait_for_vehicles(&console, 2).await;

    let scope = SessionScope::Vehicle("B1".to_string());
    let path = console.recorder.stop_session(&scope).unwrap().unwrap();
    assert!(path.starts_with(dir.path()));
    let records: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["boat_id"], json!("B1"));
    assert_eq!(records[0]["data"]["latitude"], json!(1.0));

    assert!(console.recorder.stop_session(&scope).unwrap().is_none());
}

#[tokio::test]
async fn shutdown_zeroes_held_controls_and_exports() {
    let dir = tempfile::tempdir().unwrap();
    let (console, mut relays) = console(dir.path());
    console.connect("mem://local").await.unwrap();
    let mut relay = relays.recv().await.unwrap();

    console.recorder.start_session(SessionScope::All);
    relay
        .push(EVENT_BOAT_DATA, json!({"boat_id": "B1", "data": {"speed": 1.5}}))
        .unwrap();
    wait_for_vehicles(&console, 1).await;
    console
        .execute(OperatorCommand::parse("manual B1 10 50").unwrap())
        .await
        .unwrap();

    let exported = console.shutdown();
    assert_eq!(exported.len(), 1);
    let sent = relay.drain();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data["th"], json!(0.0));
    assert!(!console.connection.is_connected());
}

#[tokio::test]
async fn unreachable_endpoint_stays_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let (connector, _relays) = MemoryConnector::new();
    connector.set_unreachable("mem://local");
    let console = Console::new(
        Arc::new(connector),
        Arc::new(FileExporter::new(dir.path(), ExportFormat::Json)),
        ConsoleSettings {
            endpoints: Vec::new(),
            schema: CommandSchema::Verbose,
            period: Duration::from_millis(500),
            record_on_connect: true,
        },
    );

    assert!(console.connect("mem://local").await.is_err());
    assert!(!console.connection.is_connected());
    assert!(!console.recorder.is_recording(&SessionScope::All));
    assert!(console
        .execute(OperatorCommand::Connect(None))
        .await
        .is_err());
}
