//! HTTP-level tests: visibility filtering and unread counts through the
//! full router, auth included.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use fleet_server::auth::{AuthKeys, Claims};
use fleet_server::http::{router, AppState};
use fleet_server::hub::Hub;
use fleet_server::store::users::{ROLE_ADMIN, ROLE_USER};
use fleet_server::store::{allocations, sms, users, Db};
use fleet_types::SmsReceivedDto;

struct TestApp {
    app: Router,
    db: Db,
    auth: AuthKeys,
}

async fn test_app() -> TestApp {
    let db = Db::connect_in_memory().await.unwrap();
    let hub = Arc::new(Hub::new(db.clone()));
    let auth = AuthKeys::new("test-secret", None, None);
    let state = AppState {
        db: db.clone(),
        hub,
        auth: auth.clone(),
    };
    TestApp {
        app: router(state),
        db,
        auth,
    }
}

impl TestApp {
    fn token(&self, user_id: i64, name: &str, role: &str) -> String {
        let claims = Claims {
            sub: user_id.to_string(),
            user_name: name.into(),
            role: role.into(),
            exp: Utc::now().timestamp() + 3600,
            iss: None,
            aud: None,
        };
        self.auth.issue(&claims).unwrap()
    }

    async fn get_json(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn post_json(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}

async fn seed_sms(db: &Db, device: &str, port: &str, minute: u32) -> i64 {
    let dto = SmsReceivedDto {
        device_id: device.into(),
        com_port: port.into(),
        sender_number: "+15551234567".into(),
        message_content: "body".into(),
        received_time: Utc.with_ymd_and_hms(2026, 1, 23, 14, minute, 0).unwrap(),
        sms_timestamp: None,
    };
    sms::insert(db, &dto, None).await.unwrap()
}

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let t = test_app().await;
    let request = Request::builder()
        .uri("/smsmessages")
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_healthz_is_public() {
    let t = test_app().await;
    let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_visibility_filter_end_to_end() {
    let t = test_app().await;

    // Alice holds (D1, [COM3, COM5]) and (D2, [COM7])
    let alice = users::insert(&t.db, "alice", ROLE_USER).await.unwrap();
    allocations::insert(&t.db, alice, "D1", &["COM3", "COM5"]).await.unwrap();
    allocations::insert(&t.db, alice, "D2", &["COM7"]).await.unwrap();

    seed_sms(&t.db, "D1", "COM3", 0).await;
    seed_sms(&t.db, "D1", "COM4", 1).await;
    seed_sms(&t.db, "D2", "COM7", 2).await;
    seed_sms(&t.db, "D3", "COM3", 3).await;

    let token = t.token(alice, "alice", ROLE_USER);
    let (status, body) = t.get_json("/smsmessages", &token).await;
    assert_eq!(status, StatusCode::OK);

    // port-based SMS visibility: COM4 is out despite the device matching;
    // (D3, COM3) is in because COM3 is allocated
    assert_eq!(body["totalCount"], 3);
    let ports: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["comPort"].as_str().unwrap())
        .collect();
    assert!(!ports.contains(&"COM4"));
    assert_eq!(body["pageNumber"], 1);

    // a user with no allocations sees an empty page, not an error
    let bob = users::insert(&t.db, "bob", ROLE_USER).await.unwrap();
    let bob_token = t.token(bob, "bob", ROLE_USER);
    let (status, body) = t.get_json("/smsmessages", &bob_token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalCount"], 0);
    assert_eq!(body["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let t = test_app().await;
    let user = users::insert(&t.db, "carol", ROLE_USER).await.unwrap();
    let token = t.token(user, "carol", ROLE_USER);

    let (status, _) = t.get_json("/smsmessages/admin/all", &token).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = users::insert(&t.db, "root", ROLE_ADMIN).await.unwrap();
    let admin_token = t.token(admin, "root", ROLE_ADMIN);
    let (status, _) = t.get_json("/smsmessages/admin/all", &admin_token).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unread_counts_and_mark_read_flow() {
    let t = test_app().await;

    let alice = users::insert(&t.db, "alice", ROLE_USER).await.unwrap();
    allocations::insert(&t.db, alice, "D1", &["COM3", "COM5"]).await.unwrap();
    let token = t.token(alice, "alice", ROLE_USER);

    // 5 visible messages: 3 on COM3, 2 on COM5
    let mut ids = Vec::new();
    for minute in 0..3 {
        ids.push(seed_sms(&t.db, "D1", "COM3", minute).await);
    }
    for minute in 3..5 {
        ids.push(seed_sms(&t.db, "D1", "COM5", minute).await);
    }
    // invisible noise
    seed_sms(&t.db, "D9", "COM9", 9).await;

    let (status, counts) = t.get_json("/message-read/unread-counts", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(counts["sms"], 5);
    assert_eq!(counts["hangup"], 0);

    // mark two read (one of them twice; idempotent)
    for source_id in [ids[0], ids[1], ids[1]] {
        let (status, _) = t
            .post_json(
                "/message-read/mark-read",
                &token,
                serde_json::json!({"messageType": "Sms", "sourceId": source_id}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (_, counts) = t.get_json("/message-read/unread-counts", &token).await;
    assert_eq!(counts["sms"], 3);

    // mark-all-read constrained to COM3 covers the third COM3 message;
    // unread is now exactly the COM5 messages
    let (status, _) = t
        .post_json(
            "/message-read/mark-all-read",
            &token,
            serde_json::json!({"messageType": "Sms", "comPort": "COM3"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, counts) = t.get_json("/message-read/unread-counts", &token).await;
    assert_eq!(counts["sms"], 2);

    // list pages carry isRead per row
    let (_, body) = t.get_json("/smsmessages?comPort=COM3", &token).await;
    for row in body["data"].as_array().unwrap() {
        assert_eq!(row["isRead"], true);
    }
    let (_, body) = t.get_json("/smsmessages?comPort=COM5", &token).await;
    for row in body["data"].as_array().unwrap() {
        assert_eq!(row["isRead"], false);
    }
}

#[tokio::test]
async fn test_snapshot_upsert_is_admin_only_and_rewrites_device() {
    let t = test_app().await;
    let user = users::insert(&t.db, "dave", ROLE_USER).await.unwrap();
    let admin = users::insert(&t.db, "root", ROLE_ADMIN).await.unwrap();

    let ports = serde_json::json!({"ports": [{
        "deviceId": "SOMETHING-ELSE",
        "portName": "COM3",
        "isAvailable": true,
        "isSmsModem": true,
        "baudRate": 115200,
        "modemInfo": null,
        "raw": null
    }]});

    let user_token = t.token(user, "dave", ROLE_USER);
    let (status, _) = t
        .post_json("/device/com-snapshot/D1", &user_token, ports.clone())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin_token = t.token(admin, "root", ROLE_ADMIN);
    let (status, snapshot) = t
        .post_json("/device/com-snapshot/D1", &admin_token, ports)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["ports"][0]["deviceId"], "D1");

    let (status, fetched) = t.get_json("/device/com-snapshot/D1", &admin_token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["ports"][0]["portName"], "COM3");

    let (status, _) = t.get_json("/device/com-snapshot/D9", &admin_token).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_scan_without_connected_agent_is_not_found() {
    let t = test_app().await;
    let admin = users::insert(&t.db, "root", ROLE_ADMIN).await.unwrap();
    let token = t.token(admin, "root", ROLE_ADMIN);

    let (status, body) = t
        .post_json("/device/scan-com-ports/ghost", &token, Value::Null)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["message"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn test_send_sms_validation() {
    let t = test_app().await;
    let admin = users::insert(&t.db, "root", ROLE_ADMIN).await.unwrap();
    let token = t.token(admin, "root", ROLE_ADMIN);

    let (status, body) = t
        .post_json(
            "/device/send-sms",
            &token,
            serde_json::json!({
                "deviceId": "D1", "comPort": "", "targetNumber": "+1", "messageContent": "hi"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("comPort"));
}
