use std::sync::Arc;
use std::time::Duration;

use devicelink::auth::JwtVerifier;
use devicelink::config::{Config, HubConfig};
use devicelink::daemon::{self, RunningServer};
use devicelink::directory::{DeviceRecord, MemoryDirectory};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const SECRET: &str = "e2e-secret";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Fixture {
    server: RunningServer,
    directory: Arc<MemoryDirectory>,
    user: Uuid,
    laptop: Uuid,
    phone: Uuid,
    stranger: Uuid,
    stranger_device: Uuid,
}

fn record(id: Uuid, user_id: Uuid, name: &str) -> DeviceRecord {
    DeviceRecord {
        id,
        user_id,
        device_id: format!("hw-{name}"),
        device_name: name.to_string(),
        device_type: "desktop".to_string(),
        has_camera: true,
        has_microphone: false,
        is_online: false,
    }
}

async fn start() -> Fixture {
    start_with(HubConfig::default()).await
}

async fn start_with(hub: HubConfig) -> Fixture {
    let (user, stranger) = (Uuid::new_v4(), Uuid::new_v4());
    let (laptop, phone, stranger_device) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let cfg = Config {
        listen_addr: "127.0.0.1:0".to_string(),
        jwt_secret: SECRET.to_string(),
        hub,
        ..Config::default()
    };
    let directory = Arc::new(MemoryDirectory::new([
        record(laptop, user, "laptop"),
        record(phone, user, "phone"),
        record(stranger_device, stranger, "other"),
    ]));
    let server = daemon::start_with_directory(&cfg, directory.clone())
        .await
        .unwrap();
    Fixture {
        server,
        directory,
        user,
        laptop,
        phone,
        stranger,
        stranger_device,
    }
}

fn ws_url(fx: &Fixture, user: Uuid, device: &str) -> String {
    let token = JwtVerifier::new(SECRET)
        .issue(user, chrono::Duration::minutes(5))
        .unwrap();
    format!(
        "ws://{}/ws?device_id={device}&token={token}",
        fx.server.bound_addr
    )
}

async fn connect(fx: &Fixture, user: Uuid, device: Uuid) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(ws_url(fx, user, &device.to_string()))
        .await
        .unwrap();
    ws
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn expect_silence(ws: &mut Ws) {
    let got = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(got.is_err(), "unexpected message: {got:?}");
}

async fn wait_closed(ws: &mut Ws) -> bool {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .is_ok()
}

async fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..60 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn directory_online(fx: &Fixture, device: Uuid) -> bool {
    fx.directory.get(device).map(|r| r.is_online).unwrap_or(false)
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn presence_and_offer_relay_between_sibling_devices() {
    let fx = start().await;

    let mut laptop = connect(&fx, fx.user, fx.laptop).await;
    let list = next_json(&mut laptop).await;
    assert_eq!(list["type"], "device:list");
    assert_eq!(list["payload"]["devices"].as_array().unwrap().len(), 1);

    let mut phone = connect(&fx, fx.user, fx.phone).await;
    let list = next_json(&mut phone).await;
    assert_eq!(list["type"], "device:list");
    assert_eq!(list["payload"]["devices"].as_array().unwrap().len(), 2);

    let online = next_json(&mut laptop).await;
    assert_eq!(online["type"], "device:online");
    assert_eq!(online["payload"]["device"]["id"], fx.phone.to_string());
    assert_eq!(online["payload"]["device"]["is_online"], true);

    // The claimed sender id is replaced with the real one.
    send_json(
        &mut laptop,
        json!({
            "type": "webrtc:offer",
            "payload": {
                "from_device_id": Uuid::new_v4(),
                "to_device_id": fx.phone,
                "sdp": "x"
            }
        }),
    )
    .await;
    let offer = next_json(&mut phone).await;
    assert_eq!(offer["type"], "webrtc:offer");
    assert_eq!(offer["payload"]["from_device_id"], fx.laptop.to_string());
    assert_eq!(offer["payload"]["sdp"], "x");

    send_json(
        &mut phone,
        json!({
            "type": "webrtc:candidate",
            "payload": {
                "to_device_id": fx.laptop,
                "candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host",
                "sdp_mline_index": 0,
                "sdp_mid": "0"
            }
        }),
    )
    .await;
    let candidate = next_json(&mut laptop).await;
    assert_eq!(candidate["type"], "webrtc:candidate");
    assert_eq!(candidate["payload"]["from_device_id"], fx.phone.to_string());

    phone.close(None).await.unwrap();
    let offline = next_json(&mut laptop).await;
    assert_eq!(offline["type"], "device:offline");
    assert_eq!(offline["payload"]["device_id"], fx.phone.to_string());

    fx.server.stop().await.unwrap();
}

#[tokio::test]
async fn ping_and_bad_messages_only_answer_the_sender() {
    let fx = start().await;
    let mut laptop = connect(&fx, fx.user, fx.laptop).await;
    next_json(&mut laptop).await;
    let mut phone = connect(&fx, fx.user, fx.phone).await;
    next_json(&mut phone).await;
    next_json(&mut laptop).await;

    send_json(&mut phone, json!({ "type": "ping" })).await;
    assert_eq!(next_json(&mut phone).await, json!({ "type": "pong" }));

    send_json(&mut phone, json!({ "type": "teleport", "payload": {} })).await;
    let err = next_json(&mut phone).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["payload"]["code"], "UNKNOWN_TYPE");

    phone.send(Message::Text("not json".into())).await.unwrap();
    let err = next_json(&mut phone).await;
    assert_eq!(err["payload"]["code"], "INVALID_MESSAGE");

    send_json(&mut phone, json!({ "type": "webrtc:offer", "payload": { "sdp": 7 } })).await;
    let err = next_json(&mut phone).await;
    assert_eq!(err["payload"]["code"], "INVALID_PAYLOAD");

    // Connection survived every error.
    send_json(&mut phone, json!({ "type": "ping" })).await;
    assert_eq!(next_json(&mut phone).await["type"], "pong");
    expect_silence(&mut laptop).await;

    fx.server.stop().await.unwrap();
}

#[tokio::test]
async fn reconnect_supersedes_without_offline_event() {
    let fx = start().await;
    let mut laptop = connect(&fx, fx.user, fx.laptop).await;
    next_json(&mut laptop).await;
    let mut phone = connect(&fx, fx.user, fx.phone).await;
    next_json(&mut phone).await;
    next_json(&mut laptop).await;

    let mut phone_again = connect(&fx, fx.user, fx.phone).await;
    assert_eq!(next_json(&mut phone_again).await["type"], "device:list");

    // The replaced socket is closed by the server.
    assert!(wait_closed(&mut phone).await);

    // Siblings only ever hear about the new instance coming online.
    let online = next_json(&mut laptop).await;
    assert_eq!(online["type"], "device:online");
    expect_silence(&mut laptop).await;
    assert_eq!(fx.server.hub.connection_count(), 2);

    fx.server.stop().await.unwrap();
}

#[tokio::test]
async fn upgrade_is_refused_for_foreign_or_unknown_devices() {
    let fx = start().await;

    let status_of = |err: tungstenite::Error| match err {
        tungstenite::Error::Http(resp) => resp.status().as_u16(),
        other => panic!("expected http error, got {other}"),
    };

    let err = tokio_tungstenite::connect_async(ws_url(&fx, fx.user, &fx.stranger_device.to_string()))
        .await
        .unwrap_err();
    assert_eq!(status_of(err), 403);

    let err = tokio_tungstenite::connect_async(ws_url(&fx, fx.stranger, "not-a-uuid"))
        .await
        .unwrap_err();
    assert_eq!(status_of(err), 400);

    let err = tokio_tungstenite::connect_async(ws_url(&fx, fx.user, &Uuid::new_v4().to_string()))
        .await
        .unwrap_err();
    assert_eq!(status_of(err), 404);

    let url = format!("ws://{}/ws?device_id={}", fx.server.bound_addr, fx.laptop);
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    assert_eq!(status_of(err), 401);

    assert_eq!(fx.server.hub.connection_count(), 0);
    fx.server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_closes_live_connections_and_marks_them_offline() {
    let fx = start().await;
    let mut laptop = connect(&fx, fx.user, fx.laptop).await;
    next_json(&mut laptop).await;
    assert!(wait_until(|| directory_online(&fx, fx.laptop)).await);

    let Fixture {
        server, directory, laptop: laptop_id, ..
    } = fx;
    server.stop().await.unwrap();

    assert!(wait_closed(&mut laptop).await);
    assert!(
        wait_until(|| !directory.get(laptop_id).map(|r| r.is_online).unwrap_or(true)).await,
        "device still online in the directory after stop"
    );
}

#[tokio::test]
async fn oversized_text_frame_closes_the_connection() {
    let fx = start_with(HubConfig {
        max_message_bytes: 1024,
        ..HubConfig::default()
    })
    .await;
    let mut laptop = connect(&fx, fx.user, fx.laptop).await;
    next_json(&mut laptop).await;

    let sdp = "a".repeat(4096);
    send_json(
        &mut laptop,
        json!({ "type": "webrtc:offer", "payload": { "to_device_id": fx.phone, "sdp": sdp } }),
    )
    .await;

    assert!(wait_closed(&mut laptop).await);
    assert!(wait_until(|| fx.server.hub.connection_count() == 0).await);
    assert!(wait_until(|| !directory_online(&fx, fx.laptop)).await);

    fx.server.stop().await.unwrap();
}
