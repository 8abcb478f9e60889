mod common;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hcloud_upload::routes::cors::CorsPolicy;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};

fn chunk_body(upload_id: &str, index: usize, total: usize, data: &[u8]) -> Value {
    json!({
        "uploadId": upload_id,
        "chunkIndex": index,
        "totalChunks": total,
        "chunkData": STANDARD.encode(data),
        "fileName": "clip.mp4",
        "mimeType": "video/mp4",
        "session": "token",
    })
}

async fn post(base: &str, path: &str, body: &Value) -> (StatusCode, Value) {
    let resp = reqwest::Client::new()
        .post(format!("{base}{path}"))
        .json(body)
        .send()
        .await
        .unwrap();
    let status = resp.status();
    (status, resp.json().await.unwrap())
}

async fn finalize(base: &str, upload_id: &str) -> (StatusCode, Value) {
    post(
        base,
        "/upload/finalize",
        &json!({"uploadId": upload_id, "session": "token"}),
    )
    .await
}

#[tokio::test]
async fn out_of_order_chunks_finalize_and_download() {
    let server = common::spawn().await;
    let base = &server.base_url;

    let (status, body) = post(base, "/upload/chunk", &chunk_body("u1", 2, 3, b"cc")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true, "received": 1, "total": 3, "progress": 33}));
    post(base, "/upload/chunk", &chunk_body("u1", 0, 3, b"aa")).await;
    // Duplicate is accepted without changing the count.
    let (_, body) = post(base, "/upload/chunk", &chunk_body("u1", 0, 3, b"zz")).await;
    assert_eq!(body["received"], 2);
    let (_, body) = post(base, "/upload/chunk", &chunk_body("u1", 1, 3, b"bb")).await;
    assert_eq!(body["received"], 3);
    assert_eq!(body["progress"], 100);

    let (status, body) = finalize(base, "u1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["fileName"], "clip.mp4");
    assert_eq!(body["fileSize"], 6);
    assert!(body["messageId"].as_i64().unwrap() > 0);
    let file_id = body["fileId"].as_str().unwrap().to_string();

    let doc = server.transport.document(&file_id).unwrap();
    assert_eq!(&doc.bytes[..], b"aabbcc");
    assert!(server.store.get("u1").is_none());

    let (status, body) = post(
        base,
        "/download",
        &json!({"session": "token", "fileId": file_id}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        STANDARD.decode(body["data"].as_str().unwrap()).unwrap(),
        b"aabbcc"
    );
    assert_eq!(body["fileName"], "clip.mp4");
    assert_eq!(body["mimeType"], "video/mp4");
}

#[tokio::test]
async fn missing_fields_are_bad_requests() {
    let server = common::spawn().await;
    let base = &server.base_url;

    let mut body = chunk_body("u1", 0, 1, b"a");
    body.as_object_mut().unwrap().remove("session");
    let (status, err) = post(base, "/upload/chunk", &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"].as_str().unwrap().contains("session"));

    let (status, _) = post(base, "/upload/finalize", &json!({"uploadId": "u1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let resp = reqwest::Client::new()
        .post(format!("{base}/upload/chunk"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let err: Value = resp.json().await.unwrap();
    assert!(err["error"].is_string());
}

#[tokio::test]
async fn oversized_body_is_payload_too_large() {
    let limit = 1024;
    let server = common::spawn_with(CorsPolicy::Any, limit).await;
    let body = chunk_body("u1", 0, 1, &vec![7u8; 2 * limit]);

    let (status, err) = post(&server.base_url, "/upload/chunk", &body).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(err["status"], 413);
    assert!(err["error"].as_str().unwrap().starts_with("Invalid request body"));
    assert!(server.store.get("u1").is_none());

    let (status, _) = post(&server.base_url, "/upload/chunk", &chunk_body("u1", 0, 1, b"ok")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn huge_total_chunks_is_rejected() {
    let server = common::spawn().await;
    let base = &server.base_url;

    for total in [1u64 << 40, u64::MAX] {
        let mut body = chunk_body("u1", 0, 1, b"a");
        body["totalChunks"] = json!(total);
        let (status, err) = post(base, "/upload/chunk", &body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(err["error"].as_str().unwrap().contains("totalChunks"));
    }
    assert_eq!(server.store.stats().active_sessions, 0);

    let (status, _) = post(base, "/upload/chunk", &chunk_body("u1", 0, 1, b"a")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn route_segment_ids_cannot_start_uploads() {
    let server = common::spawn().await;
    for id in ["chunk", "finalize"] {
        let (status, err) = post(&server.base_url, "/upload/chunk", &chunk_body(id, 0, 1, b"a")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(err["error"].as_str().unwrap().contains("reserved"));
    }
}

#[tokio::test]
async fn finalize_unknown_upload_is_session_not_found() {
    let server = common::spawn().await;
    let (status, body) = finalize(&server.base_url, "never-submitted").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn finalize_before_all_chunks_is_incomplete() {
    let server = common::spawn().await;
    let base = &server.base_url;
    post(base, "/upload/chunk", &chunk_body("u1", 0, 2, b"a")).await;

    let (status, body) = finalize(base, "u1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Not all chunks received: 1/2");
    assert!(server.store.get("u1").is_some());
}

#[tokio::test]
async fn empty_identity_is_expired_session_and_deletes_upload() {
    let server = common::spawn().await;
    let base = &server.base_url;
    server.transport.orphan("token");
    post(base, "/upload/chunk", &chunk_body("u1", 0, 1, b"a")).await;

    let (status, body) = finalize(base, "u1").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Session expired. Please re-authenticate.");

    let (status, body) = finalize(base, "u1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn transport_failure_is_500_and_finalize_can_be_retried() {
    let server = common::spawn().await;
    let base = &server.base_url;
    post(base, "/upload/chunk", &chunk_body("u1", 0, 1, b"a")).await;
    server.transport.fail_next_send("FLOOD_WAIT");

    let (status, body) = finalize(base, "u1").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("FLOOD_WAIT"));

    let (status, _) = finalize(base, "u1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(server.transport.documents().len(), 1);
}

#[tokio::test]
async fn status_and_cancel() {
    let server = common::spawn().await;
    let base = &server.base_url;
    let http = reqwest::Client::new();
    post(base, "/upload/chunk", &chunk_body("u1", 1, 4, b"abc")).await;

    let body: Value = http
        .get(format!("{base}/upload/status/u1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["uploadId"], "u1");
    assert_eq!(body["receivedChunks"], 1);
    assert_eq!(body["totalChunks"], 4);
    assert_eq!(body["totalSize"], 3);
    assert_eq!(body["progress"], 25);
    assert_eq!(body["state"], "accumulating");
    assert!(body.get("session").is_none());

    let resp = http.delete(format!("{base}/upload/u1")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"success": true, "message": "Upload cancelled"}));

    let resp = http.delete(format!("{base}/upload/u1")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = http
        .get(format!("{base}/upload/status/u1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn download_errors_map_to_statuses() {
    let server = common::spawn().await;
    let base = &server.base_url;

    let (status, _) = post(
        base,
        "/download",
        &json!({"session": "token", "fileId": "nope"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.transport.revoke("token");
    let (status, _) = post(
        base,
        "/download",
        &json!({"session": "token", "fileId": "nope"}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn preflight_and_wrong_methods() {
    let server = common::spawn().await;
    let base = &server.base_url;
    let http = reqwest::Client::new();

    for path in ["/upload/chunk", "/upload/finalize"] {
        let resp = http
            .request(Method::OPTIONS, format!("{base}{path}"))
            .header("Origin", "https://app.example")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
        assert!(
            resp.headers()["access-control-allow-methods"]
                .to_str()
                .unwrap()
                .contains("POST")
        );

        let resp = http.get(format!("{base}{path}")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");

        let resp = http.put(format!("{base}{path}")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}

#[tokio::test]
async fn restricted_cors_echoes_only_listed_origins() {
    let server =
        common::spawn_with_cors(CorsPolicy::parse("https://app.example")).await;
    let http = reqwest::Client::new();
    let url = format!("{}/upload/chunk", server.base_url);

    let resp = http
        .request(Method::OPTIONS, &url)
        .header("Origin", "https://app.example")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()["access-control-allow-origin"],
        "https://app.example"
    );
    assert_eq!(resp.headers()["vary"], "Origin");

    let resp = http
        .request(Method::OPTIONS, &url)
        .header("Origin", "https://other.example")
        .send()
        .await
        .unwrap();
    assert!(resp.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn health_and_stats() {
    let server = common::spawn().await;
    let base = &server.base_url;
    post(base, "/upload/chunk", &chunk_body("u1", 0, 2, b"abcd")).await;
    post(base, "/upload/chunk", &chunk_body("u2", 0, 2, b"ef")).await;

    let http = reqwest::Client::new();
    let health: Value = http
        .get(format!("{base}/healthz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert!(health["timestamp"].is_string());
    assert!(health["uptimeSecs"].is_u64());

    let stats: Value = http
        .get(format!("{base}/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["activeSessions"], 2);
    assert_eq!(stats["bufferedBytes"], 6);
}
