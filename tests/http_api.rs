//! HTTP surface tests, driven in-process with `tower::ServiceExt::oneshot`.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use rnsync::http::{router, AppState};
use rnsync::{ClientId, Permission, RecordService};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn app() -> Router {
    let service = Arc::new(RecordService::in_memory());
    service.seed_user("ann", "Ann Lee", Permission::EDIT).unwrap();
    let state = AppState::new(service, Duration::from_secs(30), Duration::from_secs(2));
    router(state, 4)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn client_id() -> String {
    ClientId::random().to_string()
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(&app(), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_record_lifecycle() {
    let app = app();
    let cid = client_id();

    let (status, body) = send(
        &app,
        "POST",
        "/rn_record",
        Some(json!({
            "issue_number": "1001",
            "title": "Crash",
            "client_id": cid,
            "username": "ann"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["operation"], "post");
    assert_eq!(body["issue_number"], "1001");

    let (status, body) = send(&app, "GET", "/rn_record/1001", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"issue_number": "1001", "title": "Crash"}));

    let (_, body) = send(
        &app,
        "POST",
        "/get_rn_record_by_issue_number",
        Some(json!({"issue_number": "1001"})),
    )
    .await;
    assert_eq!(body["title"], "Crash");

    let (_, body) = send(&app, "GET", "/rn_record_exists/1001", None).await;
    assert_eq!(body["exists"], true);

    let (status, _) = send(
        &app,
        "POST",
        "/rn_record",
        Some(json!({
            "issue_number": "1002",
            "title": "Crash",
            "client_id": cid,
            "username": "ann",
            "old_issue_number": "1001"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, "GET", "/get_all_rn_records", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["issue_number"], "1002");

    let uri = format!("/rn_record/1002?client_id={}&username=ann", cid);
    let (status, body) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let (_, body) = send(
        &app,
        "POST",
        "/rn_record_exists",
        Some(json!({"issue_number": "1002"})),
    )
    .await;
    assert_eq!(body["exists"], false);
}

#[tokio::test]
async fn test_error_statuses() {
    let app = app();
    let cid = client_id();

    let (status, body) = send(
        &app,
        "POST",
        "/rn_record",
        Some(json!({"title": "no key", "client_id": cid})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "MISSING_IDENTITY");

    let (status, body) = send(
        &app,
        "POST",
        "/rn_record",
        Some(json!({"issue_number": "1", "client_id": "not-a-uuid"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");

    let (status, body) = send(&app, "GET", "/rn_record/404", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    for key in ["1", "2"] {
        send(
            &app,
            "POST",
            "/rn_record",
            Some(json!({"issue_number": key, "client_id": cid})),
        )
        .await;
    }
    let (status, body) = send(
        &app,
        "POST",
        "/rn_record",
        Some(json!({"issue_number": "2", "old_issue_number": "1", "client_id": cid})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ALREADY_EXISTS");

    let (status, _) = send(&app, "DELETE", "/rn_record/1", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/rn_record")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_search_query() {
    let app = app();
    let cid = client_id();
    for (key, owner) in [("1", "ann"), ("2", "bob")] {
        send(
            &app,
            "POST",
            "/rn_record",
            Some(json!({"issue_number": key, "owner": owner, "client_id": cid})),
        )
        .await;
    }

    let (status, body) = send(&app, "GET", "/rn_records?q=%5Bowner%3Dbob%5D", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["issue_number"], "2");
}

#[tokio::test]
async fn test_table_endpoints() {
    let app = app();
    let rows = json!([
        {"0": {"text": "Feature"}, "1": {"text": "Owner"}},
        {"0": {"text": "Export"}, "1": {"text": "ann"}}
    ]);
    let merges = json!([{"row": 0, "col": 0, "row_span": 1, "col_span": 2}]);

    let (status, _) = send(
        &app,
        "POST",
        "/save_all",
        Some(json!({
            "table_name": "kpi",
            "data": rows,
            "merged_cells": merges,
            "client_id": client_id()
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, "POST", "/get_all", Some(json!({"table_name": "kpi"}))).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["table_data"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"]["merged_cells"].as_array().unwrap().len(), 1);

    let (_, body) = send(&app, "POST", "/get_table", Some(json!({"table_name": "kpi"}))).await;
    assert_eq!(body["data"][1]["0"]["text"], "Export");

    let (status, _) = send(
        &app,
        "POST",
        "/save_merged_cells",
        Some(json!({"table_name": "kpi", "merged_cells": []})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(
        &app,
        "POST",
        "/get_merged_cells",
        Some(json!({"table_name": "kpi"})),
    )
    .await;
    assert_eq!(body["data"], json!([]));

    let (status, _) = send(
        &app,
        "POST",
        "/save_table",
        Some(json!({"table_name": "kpi", "data": []})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, "POST", "/get_table", Some(json!({"table_name": "empty"}))).await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_unaddressable_merge_region_is_bad_request() {
    let app = app();
    let merges = json!([
        {"row": 0, "col": 0, "row_span": 1, "col_span": 1},
        {"row": u64::MAX, "col": 0, "row_span": 2, "col_span": 1}
    ]);

    let (status, body) = send(
        &app,
        "POST",
        "/save_merged_cells",
        Some(json!({"table_name": "kpi", "merged_cells": merges})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");

    let (status, _) = send(
        &app,
        "POST",
        "/save_all",
        Some(json!({"table_name": "kpi", "data": [], "merged_cells": merges})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(
        &app,
        "POST",
        "/get_merged_cells",
        Some(json!({"table_name": "kpi"})),
    )
    .await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_permissions() {
    let app = app();

    let (status, body) = send(&app, "GET", "/get_permissions?username=ann", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["permissions"], Permission::EDIT.0);

    let (_, body) = send(&app, "POST", "/get_permissions", Some(json!({"username": "ann"}))).await;
    assert_eq!(body["permissions"], Permission::EDIT.0);

    let (status, _) = send(&app, "GET", "/get_permissions?username=ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_subscription_long_poll() {
    let app = app();
    let own = client_id();

    let (status, body) = send(
        &app,
        "POST",
        "/subscriptions",
        Some(json!({"channels": ["rn_channel"], "client_id": own})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["subscription_id"].as_u64().unwrap();

    // own saves are filtered out, others arrive
    send(
        &app,
        "POST",
        "/rn_record",
        Some(json!({"issue_number": "1", "client_id": own})),
    )
    .await;
    send(
        &app,
        "POST",
        "/rn_record",
        Some(json!({"issue_number": "2", "client_id": client_id(), "username": "ann"})),
    )
    .await;

    let uri = format!("/subscriptions/{}/poll?timeout_ms=500", id);
    let (status, body) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["type"], "record_changed");
    assert_eq!(messages[0]["event"]["new_issue_number"], "2");
    assert_eq!(messages[0]["event"]["username"], "Ann Lee");

    let (status, body) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["messages"], json!([]));

    let (status, _) = send(&app, "DELETE", &format!("/subscriptions/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "SUBSCRIPTION_NOT_FOUND");
}

#[tokio::test]
async fn test_long_polls_are_limited_separately_from_records() {
    let service = Arc::new(RecordService::in_memory());
    let state = AppState::new(service, Duration::from_secs(30), Duration::from_secs(2))
        .with_max_polls(1);
    let app = router(state, 4);

    let mut ids = Vec::new();
    for _ in 0..2 {
        let (_, body) = send(&app, "POST", "/subscriptions", Some(json!({}))).await;
        ids.push(body["subscription_id"].as_u64().unwrap());
    }
    let first = format!("/subscriptions/{}/poll?timeout_ms=300", ids[0]);
    let second = format!("/subscriptions/{}/poll?timeout_ms=300", ids[1]);

    let started = std::time::Instant::now();
    let (a, b, records_elapsed) = tokio::join!(
        send(&app, "GET", &first, None),
        send(&app, "GET", &second, None),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let (status, _) = send(&app, "GET", "/rn_records", None).await;
            assert_eq!(status, StatusCode::OK);
            started.elapsed()
        }
    );

    assert_eq!(a.0, StatusCode::OK);
    assert_eq!(b.0, StatusCode::OK);
    // one poll at a time, while record reads do not queue behind them
    assert!(started.elapsed() >= Duration::from_millis(550));
    assert!(records_elapsed < Duration::from_millis(300));
}
