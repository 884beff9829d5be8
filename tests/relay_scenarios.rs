//! End-to-end scenarios from the relay's testable-properties table (S1-S6),
//! driven against a real relay server and a scriptable fake bridge host
//! over actual HTTP and WebSocket connections.

mod common;

use std::time::{Duration, Instant};

use common::{spawn_relay, FakeBridge};
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn create_page(base: &str, session: &str, name: &str) -> (StatusCode, Value) {
    let resp = client()
        .post(format!("{base}/pages"))
        .header("X-DevBrowser-Session", session)
        .json(&json!({ "name": name, "url": "https://example.com" }))
        .send()
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.json::<Value>().await.unwrap();
    (status, body)
}

/// S1: detach-then-reattach of the same target yields the same targetId on
/// the next `POST /pages` for that name.
#[tokio::test]
async fn s1_reattach_preserves_target_id() {
    let relay = spawn_relay().await;
    let bridge = FakeBridge::connect(&relay).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, first) = create_page(&relay.http_base, "s", "p").await;
    assert_eq!(status, StatusCode::OK);
    let target_id = first["targetId"].as_str().unwrap().to_string();

    bridge.simulate_reattach(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, second) = create_page(&relay.http_base, "s", "p").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["targetId"].as_str().unwrap(), target_id);
}

/// S2: the same page name in two different sessions addresses two distinct
/// targets, each visible only to its own session's `GET /pages`.
#[tokio::test]
async fn s2_same_name_different_sessions_are_distinct() {
    let relay = spawn_relay().await;
    let _bridge = FakeBridge::connect(&relay).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (_, a) = create_page(&relay.http_base, "A", "x").await;
    let (_, b) = create_page(&relay.http_base, "B", "x").await;
    assert_ne!(a["targetId"], b["targetId"]);

    let pages_a = client()
        .get(format!("{}/pages", relay.http_base))
        .header("X-DevBrowser-Session", "A")
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(pages_a["pages"], json!(["x"]));

    let pages_b = client()
        .get(format!("{}/pages", relay.http_base))
        .header("X-DevBrowser-Session", "B")
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(pages_b["pages"], json!(["x"]));
}

/// S3: the 6th page in a session whose limit is 5 is rejected with 429 and
/// the word "limit" in the error message.
#[tokio::test]
async fn s3_tab_limit_returns_429() {
    let relay = spawn_relay().await;
    let _bridge = FakeBridge::connect(&relay).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    for i in 0..5 {
        let (status, _) = create_page(&relay.http_base, "Q", &format!("page-{i}")).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = create_page(&relay.http_base, "Q", "page-6").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("limit"));
}

/// S4: a colon in the page name is rejected with 400 and "colon" in the
/// message.
#[tokio::test]
async fn s4_colon_in_name_returns_400() {
    let relay = spawn_relay().await;
    let (status, body) = create_page(&relay.http_base, "s", "a:b").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("colon"));
}

/// S5: with no bridge host connected, `POST /pages` fails with 503.
#[tokio::test]
async fn s5_no_bridge_returns_503() {
    let relay = spawn_relay().await;
    let (status, _) = create_page(&relay.http_base, "s", "p").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

/// S6: the bridge host's `attachedToTarget` arrives 500 ms after the
/// `createTab` response; `POST /pages` still succeeds, driven by the
/// event-driven wait rather than any fixed sleep, and takes at least the
/// artificial delay to resolve.
#[tokio::test]
async fn s6_event_driven_wait_survives_delayed_attach() {
    let relay = spawn_relay().await;
    let bridge = FakeBridge::connect(&relay).await;
    bridge.set_attach_delay_ms(500);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    let (status, body) = create_page(&relay.http_base, "s", "p").await;
    let elapsed = start.elapsed();

    assert_eq!(status, StatusCode::OK);
    assert!(body["targetId"].as_str().is_some());
    assert!(elapsed >= Duration::from_millis(400));
}

/// Deleting an unknown page returns 404; deleting a known one removes it
/// from the session's listing.
#[tokio::test]
async fn delete_page_removes_it_from_listing() {
    let relay = spawn_relay().await;
    let _bridge = FakeBridge::connect(&relay).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    create_page(&relay.http_base, "s", "home").await;

    let resp = client()
        .delete(format!("{}/pages/home", relay.http_base))
        .header("X-DevBrowser-Session", "s")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let pages = client()
        .get(format!("{}/pages", relay.http_base))
        .header("X-DevBrowser-Session", "s")
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(pages["pages"], json!([]));

    let resp = client()
        .delete(format!("{}/pages/home", relay.http_base))
        .header("X-DevBrowser-Session", "s")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

/// A malformed client frame gets a JSON-RPC -32700 parse-error reply and
/// the socket is then closed (§7).
#[tokio::test]
async fn malformed_client_frame_gets_parse_error_and_closes() {
    let relay = spawn_relay().await;
    let (ws, _) = tokio_tungstenite::connect_async(format!("{}/client", relay.ws_base)).await.unwrap();
    let (mut write, mut read) = ws.split();

    write.send(WsMessage::Text("not json at all".into())).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("should receive a reply before timing out")
        .expect("stream should yield a frame")
        .unwrap();
    let WsMessage::Text(text) = reply else { panic!("expected a text frame") };
    let parsed: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["error"]["code"], -32700);

    // The socket is then closed server-side.
    let next = tokio::time::timeout(Duration::from_secs(2), read.next()).await.unwrap();
    assert!(matches!(next, Some(Ok(WsMessage::Close(_))) | None));
}

/// `GET /` reports extension connectivity truthfully across a connect.
#[tokio::test]
async fn root_reports_extension_connectivity() {
    let relay = spawn_relay().await;
    let before = client()
        .get(&relay.http_base)
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(before["extensionConnected"], false);

    let _bridge = FakeBridge::connect(&relay).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after = client()
        .get(&relay.http_base)
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(after["extensionConnected"], true);
}
