//! HTTP API integration tests, driven through the router with `oneshot`.

mod common;

use axum::http::StatusCode;
use common::{eventually, setup, Options};
use serde_json::{json, Value};
use signet_documents::NewDocument;
use signet_server::status_client::{StatusClient, StatusUpdateError};
use signet_types::{DocumentStatus, StatusUpdateRequest};
use std::time::Duration;
use uuid::Uuid;

async fn create_document(app: &common::TestApp, title: &str) -> Value {
    let (status, body) = app
        .request(
            "POST",
            "/documents",
            Some(json!({
                "title": title,
                "content": "Lease terms and conditions",
                "created_by": "alice@example.com",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    body
}

#[tokio::test]
async fn liveness_reports_alive() {
    let app = setup(Options::default());
    let (status, body) = app.request("GET", "/health/live", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
}

#[tokio::test]
async fn readiness_checks_database() {
    let app = setup(Options::default());
    let (status, body) = app.request("GET", "/health/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["total_connections"], 0);
}

#[tokio::test]
async fn document_create_get_and_content() {
    let app = setup(Options::default());
    let created = create_document(&app, "Lease agreement").await;
    assert_eq!(created["status"], "created");
    assert_eq!(created["version"], 1);
    assert_eq!(created["content_type"], "text/plain");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, fetched) = app.request("GET", &format!("/documents/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["title"], "Lease agreement");

    let (status, content) = app
        .request("GET", &format!("/documents/{id}/content"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content, Value::String("Lease terms and conditions".to_string()));
}

#[tokio::test]
async fn document_without_content_has_no_content_endpoint() {
    let app = setup(Options::default());
    let (status, created) = app
        .request(
            "POST",
            "/documents",
            Some(json!({ "title": "Draft", "created_by": "bob" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().unwrap();

    let (status, _) = app
        .request("GET", &format!("/documents/{id}/content"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn document_create_rejects_blank_fields() {
    let app = setup(Options::default());
    let (status, body) = app
        .request(
            "POST",
            "/documents",
            Some(json!({ "title": "   ", "created_by": "alice" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = app
        .request(
            "POST",
            "/documents",
            Some(json!({ "title": "Lease", "created_by": "" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let app = setup(Options::default());
    let (status, body) = app
        .request("GET", &format!("/documents/{}", Uuid::new_v4()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));

    let (status, _) = app.request("GET", "/documents/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_documents_filters_and_bounds_limit() {
    let app = setup(Options::default());
    create_document(&app, "First").await;
    let second = create_document(&app, "Second").await;
    let id = second["id"].as_str().unwrap();
    app.request(
        "POST",
        &format!("/internal/documents/{id}/status"),
        Some(json!({ "new_status": "sent" })),
    )
    .await;

    let (status, all) = app.request("GET", "/documents", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (_, sent) = app.request("GET", "/documents?status=sent", None).await;
    let sent = sent.as_array().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["id"], second["id"]);

    let (status, _) = app.request("GET", "/documents?limit=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app.request("GET", "/documents?limit=1001", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn patch_applies_and_checks_version() {
    let app = setup(Options::default());
    let created = create_document(&app, "Lease").await;
    let id = created["id"].as_str().unwrap();

    let (status, updated) = app
        .request(
            "PATCH",
            &format!("/documents/{id}"),
            Some(json!({ "title": "Lease v2", "expected_version": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["title"], "Lease v2");
    assert_eq!(updated["version"], 2);

    let (status, body) = app
        .request(
            "PATCH",
            &format!("/documents/{id}"),
            Some(json!({ "title": "Lease v3", "expected_version": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("version conflict"));
}

#[tokio::test]
async fn patch_rejects_forbidden_transition() {
    let app = setup(Options::default());
    let created = create_document(&app, "Lease").await;
    let id = created["id"].as_str().unwrap();

    let (status, _) = app
        .request(
            "PATCH",
            &format!("/documents/{id}"),
            Some(json!({ "status": "signed" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .request(
            "PATCH",
            &format!("/documents/{id}"),
            Some(json!({ "status": "sent" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn delete_returns_last_image() {
    let app = setup(Options::default());
    let created = create_document(&app, "Lease").await;
    let id = created["id"].as_str().unwrap();

    let (status, _) = app
        .request("DELETE", &format!("/documents/{id}?expected_version=7"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, deleted) = app
        .request("DELETE", &format!("/documents/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["title"], "Lease");

    let (status, _) = app.request("GET", &format!("/documents/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn internal_status_update_outcomes() {
    let app = setup(Options::default());
    let created = create_document(&app, "Lease").await;
    let id = created["id"].as_str().unwrap();
    let uri = format!("/internal/documents/{id}/status");

    let (status, body) = app
        .request(
            "POST",
            &uri,
            Some(json!({ "new_status": "viewed", "expected_version": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "viewed");
    assert_eq!(body["version"], 2);
    assert_eq!(body["entity"]["id"], id);

    // Same status again: no new version, even with a stale expectation.
    let (status, body) = app
        .request(
            "POST",
            &uri,
            Some(json!({ "new_status": "viewed", "expected_version": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 2);

    let (status, _) = app
        .request(
            "POST",
            &uri,
            Some(json!({ "new_status": "signed", "expected_version": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .request("POST", &uri, Some(json!({ "new_status": "created" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app
        .request(
            "POST",
            &format!("/internal/documents/{}/status", Uuid::new_v4()),
            Some(json!({ "new_status": "sent" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .request(
            "POST",
            &uri,
            Some(json!({ "entity_id": Uuid::new_v4(), "new_status": "signed" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn signature_marks_document_signed() {
    let app = setup(Options::default());
    let created = create_document(&app, "Lease").await;
    let id = created["id"].as_str().unwrap().to_string();

    let (status, _) = app
        .request("GET", &format!("/documents/{id}/signatures"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, signature) = app
        .request(
            "POST",
            "/signatures",
            Some(json!({
                "document_id": id,
                "signer_email": "carol@example.com",
                "signer_name": "Carol",
                "signature_data": "data:image/png;base64,AAAA",
                "ip_address": "10.0.0.7",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "body: {signature}");
    assert_eq!(signature["document_id"], id.as_str());
    assert_eq!(signature["ip_address"], "10.0.0.7");

    let signed = eventually(|| async {
        let (_, doc) = app.request("GET", &format!("/documents/{id}"), None).await;
        (doc["status"] == "signed").then_some(doc)
    })
    .await;
    assert_eq!(signed["version"], 2);

    let (status, listed) = app
        .request("GET", &format!("/documents/{id}/signatures"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let sig_id = signature["id"].as_str().unwrap();
    let (status, fetched) = app
        .request("GET", &format!("/signatures/{sig_id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["signer_name"], "Carol");
}

#[tokio::test]
async fn signature_validation() {
    let app = setup(Options::default());
    let created = create_document(&app, "Lease").await;
    let id = created["id"].as_str().unwrap();

    let (status, _) = app
        .request(
            "POST",
            "/signatures",
            Some(json!({
                "document_id": id,
                "signer_email": "not-an-email",
                "signer_name": "Carol",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .request(
            "POST",
            "/signatures",
            Some(json!({
                "document_id": Uuid::new_v4(),
                "signer_email": "carol@example.com",
                "signer_name": "Carol",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn token_issuance_disabled_by_default() {
    let app = setup(Options::default());
    let (status, _) = app
        .request("POST", "/auth/token", Some(json!({ "user_id": "alice" })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn token_issuance_when_enabled() {
    let app = setup(Options {
        allow_token_issuance: true,
        ..Options::default()
    });
    let (status, body) = app
        .request(
            "POST",
            "/auth/token",
            Some(json!({ "user_id": "alice", "email": "alice@example.com" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "bearer");
    assert_eq!(body["user_id"], "alice");
    assert_eq!(body["expires_in"], 3600);

    let token = body["access_token"].as_str().unwrap();
    let claims = app.auth.validate(Some(token)).unwrap();
    assert_eq!(claims.sub, "alice");
    assert_eq!(claims.email.as_deref(), Some("alice@example.com"));

    let (status, _) = app
        .request("POST", "/auth/token", Some(json!({ "user_id": " " })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn search_sees_committed_documents() {
    let app = setup(Options {
        pipeline: true,
        ..Options::default()
    });
    create_document(&app, "Office lease").await;
    create_document(&app, "Employment contract").await;

    let results = eventually(|| async {
        let (_, body) = app.request("GET", "/search?q=lease", None).await;
        (body["total"] == 1).then_some(body)
    })
    .await;
    assert_eq!(results["documents"][0]["title"], "Office lease");

    let (status, _) = app.request("GET", "/search?q=", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, suggestions) = app.request("GET", "/suggest?q=Emp", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(suggestions["suggestions"], json!(["Employment contract"]));

    let (status, aggregation) = app.request("GET", "/aggregations/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(aggregation["values"][0]["key"], "created");
    assert_eq!(aggregation["values"][0]["count"], 2);

    let (status, _) = app.request("GET", "/aggregations/title", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    app.cancel.cancel();
}

#[tokio::test]
async fn stats_include_pipeline_counters() {
    let app = setup(Options {
        pipeline: true,
        ..Options::default()
    });
    create_document(&app, "Lease").await;

    let stats = eventually(|| async {
        let (_, body) = app.request("GET", "/stats", None).await;
        let upserted = body["pipeline"]["projector"]["upserted"].as_u64().unwrap_or(0);
        (upserted >= 1).then_some(body)
    })
    .await;
    assert_eq!(stats["total_connections"], 0);
    let heads = stats["log_heads"].as_array().unwrap();
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0]["position"], 1);
    app.cancel.cancel();
}

#[tokio::test]
async fn operator_routes_disabled_by_default() {
    let app = setup(Options::default());
    let entity = Uuid::new_v4();
    let calls = [
        ("/internal/resnapshot".to_string(), None),
        (
            "/internal/consumers/search-projector/rewind".to_string(),
            Some(json!({})),
        ),
        (
            format!("/broadcast/{entity}"),
            Some(json!({ "type": "notice", "data": {} })),
        ),
    ];
    for (uri, body) in calls {
        let (status, _) = app.request("POST", &uri, body).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn resnapshot_and_rewind() {
    let app = setup(Options {
        admin: true,
        ..Options::default()
    });
    create_document(&app, "One").await;
    create_document(&app, "Two").await;

    let (status, body) = app.request("POST", "/internal/resnapshot", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records"], 2);

    let (status, body) = app
        .request(
            "POST",
            "/internal/consumers/search-projector/rewind",
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["group"], "search-projector");
    assert_eq!(body["partitions"], 2);
    assert_eq!(body["position"], 0);

    let (status, _) = app
        .request("POST", "/internal/consumers/nobody/rewind", Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .request(
            "POST",
            "/internal/consumers/broadcaster/rewind",
            Some(json!({ "position": -1 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn manual_broadcast_without_subscribers() {
    let app = setup(Options {
        admin: true,
        ..Options::default()
    });
    let entity = Uuid::new_v4();
    let (status, body) = app
        .request(
            "POST",
            &format!("/broadcast/{entity}"),
            Some(json!({ "type": "notice", "data": {} })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "broadcasted");
    assert_eq!(body["recipients"], 0);
}

#[tokio::test]
async fn http_status_client_maps_outcomes() {
    let app = setup(Options::default());
    let addr = app.serve().await;
    let client = StatusClient::http(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();

    let doc = app
        .coordinator
        .create_document(NewDocument {
            title: "Lease".to_string(),
            content: None,
            content_type: "text/plain".to_string(),
            created_by: "alice".to_string(),
        })
        .unwrap();

    let response = client
        .update_status(StatusUpdateRequest {
            entity_id: doc.id,
            new_status: DocumentStatus::Sent,
            expected_version: Some(1),
        })
        .await
        .unwrap();
    assert_eq!(response.status, DocumentStatus::Sent);
    assert_eq!(response.version, 2);

    let conflict = client
        .update_status(StatusUpdateRequest {
            entity_id: doc.id,
            new_status: DocumentStatus::Viewed,
            expected_version: Some(1),
        })
        .await;
    assert!(matches!(conflict, Err(StatusUpdateError::VersionConflict(_))));

    let invalid = client
        .update_status(StatusUpdateRequest {
            entity_id: doc.id,
            new_status: DocumentStatus::Created,
            expected_version: None,
        })
        .await;
    assert!(matches!(invalid, Err(StatusUpdateError::InvalidTransition(_))));

    let missing = client
        .update_status(StatusUpdateRequest {
            entity_id: Uuid::new_v4(),
            new_status: DocumentStatus::Sent,
            expected_version: None,
        })
        .await;
    assert!(matches!(missing, Err(StatusUpdateError::NotFound(_))));
}

#[tokio::test]
async fn http_status_client_reports_transport_failure() {
    let client = StatusClient::http("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
    let result = client
        .update_status(StatusUpdateRequest {
            entity_id: Uuid::new_v4(),
            new_status: DocumentStatus::Sent,
            expected_version: None,
        })
        .await;
    assert!(matches!(result, Err(StatusUpdateError::Transport(_))));
}
