use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use consultd::cache::MemoryCache;
use consultd::clock::ManualClock;
use consultd::config::EngineConfig;
use consultd::engine::Engine;
use consultd::notify::{BroadcastBus, Outbox, PushHub};
use consultd::store::LocalStore;
use consultd::wire;

/// Monday 2026-03-02 00:00 UTC.
const NOW: i64 = 1_772_409_600_000;
const HOUR: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let hub = Arc::new(PushHub::new());
    let (outbox, _task) = Outbox::spawn(Arc::new(BroadcastBus::new()), hub.clone(), 64);
    let engine = Arc::new(Engine::new(
        Arc::new(LocalStore::in_memory()),
        Arc::new(MemoryCache::new()),
        outbox,
        Arc::new(ManualClock::new(NOW)),
        EngineConfig::default(),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let hub = hub.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, hub).await;
            });
        }
    });

    addr
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.framed.send(line.to_string()).await.unwrap();
        self.next_line(Duration::from_secs(2)).await.expect("no response")
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send_raw(&request.to_string()).await
    }

    async fn next_line(&mut self, timeout: Duration) -> Option<Value> {
        let line = tokio::time::timeout(timeout, self.framed.next())
            .await
            .ok()??
            .ok()?;
        Some(serde_json::from_str(&line).unwrap())
    }
}

fn ok_data(response: Value) -> Value {
    assert_eq!(response["ok"], true, "unexpected failure: {response}");
    response["data"].clone()
}

fn error_code(response: &Value) -> &str {
    assert_eq!(response["ok"], false, "unexpected success: {response}");
    response["error"]["code"].as_str().unwrap()
}

async fn nine_to_five(client: &mut Client, expert: Ulid) {
    ok_data(
        client
            .call(json!({
                "op": "set_working_hours",
                "expert_id": expert,
                "rules": [{"day_of_week": 1, "start_time": "09:00:00", "end_time": "17:00:00"}],
            }))
            .await,
    );
}

fn create(user: Ulid, expert: Ulid, start: i64) -> Value {
    json!({
        "op": "create_booking",
        "user_id": user,
        "expert_id": expert,
        "start": start,
        "duration_minutes": 60,
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_then_overlap_is_rejected() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let expert = Ulid::new();

    let booking = ok_data(client.call(create(Ulid::new(), expert, NOW + 10 * HOUR)).await);
    assert_eq!(booking["status"], "pending");
    assert_eq!(booking["expert_id"], expert.to_string());

    let response = client.call(create(Ulid::new(), expert, NOW + 10 * HOUR + HOUR / 2)).await;
    assert_eq!(error_code(&response), "expert_unavailable");
    assert_eq!(response["error"]["retryable"], false);

    // Back-to-back is fine.
    ok_data(client.call(create(Ulid::new(), expert, NOW + 11 * HOUR)).await);
}

#[tokio::test]
async fn slots_exclude_booked_time() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let expert = Ulid::new();
    nine_to_five(&mut client, expert).await;

    ok_data(client.call(create(Ulid::new(), expert, NOW + 10 * HOUR)).await);

    let slots = ok_data(
        client
            .call(json!({
                "op": "available_slots",
                "expert_id": expert,
                "from": "2026-03-02",
                "to": "2026-03-02",
                "slot_minutes": 60,
            }))
            .await,
    );
    let starts: Vec<i64> = slots
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["start"].as_i64().unwrap())
        .collect();
    assert_eq!(starts.len(), 7);
    assert_eq!(starts[0], NOW + 9 * HOUR);
    assert!(!starts.contains(&(NOW + 10 * HOUR)));
}

#[tokio::test]
async fn lifecycle_over_the_wire() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let (user, expert) = (Ulid::new(), Ulid::new());

    let booking = ok_data(client.call(create(user, expert, NOW + 30 * HOUR)).await);
    let id = booking["id"].as_str().unwrap().to_string();

    let response = client
        .call(json!({"op": "confirm_booking", "booking_id": id, "actor": user}))
        .await;
    assert_eq!(error_code(&response), "forbidden");

    let confirmed = ok_data(
        client
            .call(json!({
                "op": "confirm_booking",
                "booking_id": id,
                "actor": expert,
                "meeting_link": "https://meet.example/abc",
            }))
            .await,
    );
    assert_eq!(confirmed["status"], "confirmed");

    let cancelled = ok_data(
        client
            .call(json!({"op": "cancel_booking", "booking_id": id, "actor": user, "reason": "sick"}))
            .await,
    );
    assert_eq!(cancelled["status"], "cancelled");

    let response = client
        .call(json!({"op": "cancel_booking", "booking_id": id, "actor": user}))
        .await;
    assert_eq!(error_code(&response), "cancelled_cannot_cancel");

    let history = ok_data(client.call(json!({"op": "status_history", "booking_id": id})).await);
    let statuses: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["new_status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, ["pending", "confirmed", "cancelled"]);
}

#[tokio::test]
async fn malformed_requests_are_validation_errors() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let response = client.send_raw("{not json").await;
    assert_eq!(error_code(&response), "validation");

    let response = client.call(json!({"op": "get_booking", "booking_id": "nope"})).await;
    assert_eq!(error_code(&response), "validation");

    let response = client.call(json!({"op": "get_booking", "booking_id": Ulid::new()})).await;
    assert_eq!(error_code(&response), "not_found");

    // Connection is still usable after errors.
    let response = client.call(json!({"op": "launch_rockets"})).await;
    assert_eq!(error_code(&response), "validation");
}

#[tokio::test]
async fn subscriber_receives_push() {
    let addr = start_test_server().await;
    let (user, expert) = (Ulid::new(), Ulid::new());

    let mut expert_conn = Client::connect(addr).await;
    let ack = ok_data(expert_conn.call(json!({"op": "subscribe", "owner_id": expert})).await);
    assert_eq!(ack["owner_id"], expert.to_string());

    let mut user_conn = Client::connect(addr).await;
    ok_data(user_conn.call(create(user, expert, NOW + 14 * HOUR)).await);

    let push = expert_conn
        .next_line(Duration::from_secs(2))
        .await
        .expect("no push received");
    let message = push["push"].as_str().unwrap();
    assert!(message.starts_with("New booking request"), "{message}");

    // The booking user is not subscribed, so nothing reaches the user's connection.
    assert!(user_conn.next_line(Duration::from_millis(200)).await.is_none());
}
