//! End-to-end scenarios: a registry-managed local processor driving a
//! satellite over the real TCP line protocol.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use switchgrid_core::model::{Controller, Pin, PinMode, PinValue, ProcessorConfig};
use switchgrid_registry::{CONTROLLER_KEY_PREFIX, MemoryPinDriver, Registry};
use switchgrid_store::{KeyValue, KvStore};

/// Reserve a port for the processor's event server.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Satellite that identifies as `client_id`, answers `TRUE` to every
/// command, and reports each received line on the returned channel.
async fn spawn_satellite(port: u16, client_id: u32) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(format!("{client_id}\n").as_bytes())
        .await
        .unwrap();
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {
                    let _ = tx.send(line.trim().to_string());
                    if reader.get_mut().write_all(b"TRUE\n").await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    rx
}

fn seed_controller(store: &KvStore, id: &str, port: u16, pins: Vec<Pin>) {
    let config = ProcessorConfig {
        host: "127.0.0.1".into(),
        port,
        api_key: String::new(),
        controller: Some(Controller {
            id: id.to_string(),
            name: "scenario".into(),
            description: String::new(),
            pins,
        }),
        version: 1,
    };
    store
        .set(&KeyValue::new(
            &format!("{CONTROLLER_KEY_PREFIX}{id}"),
            &serde_json::to_string(&config).unwrap(),
        ))
        .unwrap();
}

fn desired(id: &str, pin: u32, value: PinValue) -> Controller {
    let mut controller = Controller::shell(id);
    controller.pins.push(Pin { id: pin, mode: PinMode::Output, value });
    controller
}

#[tokio::test]
async fn test_update_forwards_set_to_satellite() {
    let store = Arc::new(KvStore::open_in_memory().unwrap());
    let port = free_port();
    seed_controller(
        &store,
        "c1",
        port,
        vec![Pin { id: 205, mode: PinMode::Output, value: PinValue::Low }],
    );
    let registry = Registry::new(store, Arc::new(MemoryPinDriver::new()));

    // First submit starts the processor's event server on the seeded port.
    registry.get_controller("c1").await.unwrap();
    let mut commands = spawn_satellite(port, 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let actual = registry
        .update_controller(desired("c1", 205, PinValue::High))
        .await
        .unwrap();

    assert_eq!(actual.pins[0].value, PinValue::High);
    // Pin 205 resolves to client 2, local pin 5.
    assert_eq!(commands.recv().await.unwrap(), "SET 5 1");
    registry.close().await;
}

#[tokio::test]
async fn test_disconnected_satellite_is_unreachable_with_bounded_latency() {
    let store = Arc::new(KvStore::open_in_memory().unwrap());
    let port = free_port();
    seed_controller(
        &store,
        "c1",
        port,
        vec![Pin { id: 205, mode: PinMode::Output, value: PinValue::High }],
    );
    let registry = Registry::new(store, Arc::new(MemoryPinDriver::new()));
    registry.get_controller("c1").await.unwrap();

    {
        // Connect, register, then hang up.
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"2\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let started = Instant::now();
    // The sync itself swallows the per-pin failure and keeps the old value.
    let actual = registry
        .update_controller(desired("c1", 205, PinValue::Low))
        .await
        .unwrap();
    assert_eq!(actual.pins[0].value, PinValue::High);
    // Bounded by attempts x (deadline + backoff); never an indefinite hang.
    assert!(started.elapsed() < Duration::from_secs(5));
    registry.close().await;
}

#[tokio::test]
async fn test_reconnect_gets_stored_state_pushed() {
    let store = Arc::new(KvStore::open_in_memory().unwrap());
    let port = free_port();
    seed_controller(
        &store,
        "c1",
        port,
        vec![Pin { id: 205, mode: PinMode::Output, value: PinValue::High }],
    );
    let registry = Registry::new(store, Arc::new(MemoryPinDriver::new()));
    registry.get_controller("c1").await.unwrap();

    let mut first = spawn_satellite(port, 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A reconnect handshake fires the connect callback, which re-drives the
    // stored controller state. The callback runs before the new socket is
    // registered, so the commands flow over the still-live prior connection.
    let _second = spawn_satellite(port, 2).await;
    let command = tokio::time::timeout(Duration::from_secs(2), first.recv())
        .await
        .expect("no re-sync within 2s")
        .unwrap();
    assert_eq!(command, "SET 5 1");
    registry.close().await;
}
