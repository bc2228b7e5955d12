use axum::http::{header, HeaderValue, StatusCode};
use axum_test::multipart::{MultipartForm, Part};
use axum_test::TestServer;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use zettel_server::{auth::hash_password, create_router, AppState, Database, FilesystemBackend, TokenSigner};

const SECRET: &str = "test-secret";

struct TestApp {
    server: TestServer,
    tokens: TokenSigner,
    uploads: TempDir,
    ada_id: i64,
    bob_id: i64,
}

async fn create_test_app() -> TestApp {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let ada = db.create_user("ada", &hash_password("secret").unwrap()).await.unwrap();
    let bob = db.create_user("bob", &hash_password("hunter2").unwrap()).await.unwrap();

    let uploads = tempfile::tempdir().unwrap();
    let storage = Arc::new(FilesystemBackend::new(uploads.path()));
    let tokens = TokenSigner::new(SECRET, 15).unwrap();
    let state = AppState::new(db, storage, tokens.clone(), 1024 * 1024);

    TestApp {
        server: TestServer::new(create_router(state)).unwrap(),
        tokens,
        uploads,
        ada_id: ada.id,
        bob_id: bob.id,
    }
}

fn bearer(token: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("Bearer {}", token)).unwrap()
}

impl TestApp {
    fn ada(&self) -> HeaderValue {
        bearer(&self.tokens.issue(self.ada_id).unwrap())
    }

    async fn create_card(&self, card_id: &str, body: &str) -> Value {
        let response = self
            .server
            .post("/api/cards")
            .add_header(header::AUTHORIZATION, self.ada())
            .json(&json!({"card_id": card_id, "title": format!("Card {}", card_id), "body": body}))
            .await;
        response.assert_status_ok();
        response.json::<Value>()["data"].clone()
    }

    async fn upload(&self, name: &str, card_pk: Option<i64>) -> axum_test::TestResponse {
        let mut form = MultipartForm::new().add_part(
            "file",
            Part::bytes(b"file contents".to_vec())
                .file_name(name)
                .mime_type("text/plain"),
        );
        if let Some(card_pk) = card_pk {
            form = form.add_text("card_pk", card_pk.to_string());
        }
        self.server
            .post("/api/files/upload")
            .add_header(header::AUTHORIZATION, self.ada())
            .multipart(form)
            .await
    }
}

#[tokio::test]
async fn test_login_issues_token() {
    let app = create_test_app().await;

    let response = app
        .server
        .post("/api/login")
        .json(&json!({"username": "ada", "password": "secret"}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["user"]["username"], "ada");
    assert!(body["data"]["user"].get("password").is_none());

    let token = body["data"]["access_token"].as_str().unwrap();
    let claims = app.tokens.verify(token).unwrap();
    assert_eq!(claims.sub, app.ada_id);
}

#[tokio::test]
async fn test_login_rejects_wrong_password() {
    let app = create_test_app().await;

    for credentials in [
        json!({"username": "ada", "password": "wrong"}),
        json!({"username": "nobody", "password": "secret"}),
    ] {
        let response = app.server.post("/api/login").json(&credentials).await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["success"], false);
        assert!(body["data"].is_null());
        assert_eq!(body["error"], "Invalid credentials");
    }
}

#[tokio::test]
async fn test_protected_routes_require_valid_token() {
    let app = create_test_app().await;

    app.server.get("/api/cards").await.assert_status(StatusCode::UNAUTHORIZED);

    let tampered = format!("{}x", app.tokens.issue(app.ada_id).unwrap());
    app.server
        .get("/api/cards")
        .add_header(header::AUTHORIZATION, bearer(&tampered))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    let forged = TokenSigner::new("other-secret", 15).unwrap().issue(app.ada_id).unwrap();
    app.server
        .get("/api/files")
        .add_header(header::AUTHORIZATION, bearer(&forged))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    let expired = app
        .tokens
        .issue_at(app.ada_id, Utc::now() - Duration::days(30))
        .unwrap();
    let response = app
        .server
        .get("/api/cards")
        .add_header(header::AUTHORIZATION, bearer(&expired))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(response.json::<Value>()["success"], false);
}

#[tokio::test]
async fn test_card_listing_sorted_partial_and_searchable() {
    let app = create_test_app().await;
    for card_id in ["c2", "c10", "c1"] {
        app.create_card(card_id, "plain body").await;
    }
    app.create_card("x9", "mentions tokio").await;

    let response = app
        .server
        .get("/api/cards")
        .add_header(header::AUTHORIZATION, app.ada())
        .await;
    response.assert_status_ok();
    let cards = response.json::<Value>()["data"].as_array().unwrap().clone();
    let ids: Vec<&str> = cards.iter().map(|c| c["card_id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["x9", "c10", "c2", "c1"]);
    assert!(cards[0].get("body").is_some());

    let partial = app
        .server
        .get("/api/cards")
        .add_query_param("partial", "true")
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .json::<Value>();
    assert!(partial["data"][0].get("body").is_none());
    assert!(partial["data"][0].get("title").is_some());

    let search = app
        .server
        .get("/api/cards")
        .add_query_param("search_term", "tokio")
        .add_query_param("partial", "1")
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .json::<Value>();
    assert_eq!(search["data"].as_array().unwrap().len(), 1);
    assert_eq!(search["data"][0]["card_id"], "x9");
}

#[tokio::test]
async fn test_duplicate_card_id_conflicts() {
    let app = create_test_app().await;
    app.create_card("1a", "first").await;

    let response = app
        .server
        .post("/api/cards")
        .add_header(header::AUTHORIZATION, app.ada())
        .json(&json!({"card_id": "1a", "title": "again", "body": "[zzz]"}))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    assert_eq!(response.json::<Value>()["error"], "id already used");

    let listing = app
        .server
        .get("/api/cards")
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .json::<Value>();
    assert_eq!(listing["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_full_card_includes_references_and_files() {
    let app = create_test_app().await;
    let target = app.create_card("1", "root note").await;
    app.create_card("2", "see [1] and [docs](https://example.com)").await;
    let target_pk = target["id"].as_i64().unwrap();

    app.upload("notes.txt", Some(target_pk))
        .await
        .assert_status(StatusCode::CREATED);

    let response = app
        .server
        .get(&format!("/api/cards/{}", target_pk))
        .add_header(header::AUTHORIZATION, app.ada())
        .await;
    response.assert_status_ok();
    let card = response.json::<Value>()["data"].clone();
    assert_eq!(card["card_id"], "1");
    assert_eq!(card["references"].as_array().unwrap().len(), 1);
    assert_eq!(card["references"][0]["card_id"], "2");
    assert_eq!(card["files"][0]["name"], "notes.txt");
    assert!(card["files"][0].get("path").is_none());

    app.server
        .get("/api/cards/9999")
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_update_and_delete_card() {
    let app = create_test_app().await;
    let target = app.create_card("1", "").await;
    let source = app.create_card("2", "[1]").await;
    let source_pk = source["id"].as_i64().unwrap();
    let target_path = format!("/api/cards/{}", target["id"]);

    let response = app
        .server
        .put(&format!("/api/cards/{}", source_pk))
        .add_header(header::AUTHORIZATION, app.ada())
        .json(&json!({"card_id": "2", "title": "Edited", "body": "no links now", "link": "https://example.com"}))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["data"]["title"], "Edited");

    let target_card = app
        .server
        .get(&target_path)
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .json::<Value>();
    assert!(target_card["data"]["references"].as_array().unwrap().is_empty());

    app.server
        .put(&format!("/api/cards/{}", source_pk))
        .add_header(header::AUTHORIZATION, app.ada())
        .json(&json!({"card_id": "1", "title": "Clash", "body": ""}))
        .await
        .assert_status(StatusCode::CONFLICT);

    app.server
        .delete(&format!("/api/cards/{}", source_pk))
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .assert_status_ok();
    app.server
        .get(&format!("/api/cards/{}", source_pk))
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_user_and_password_routes() {
    let app = create_test_app().await;

    let response = app
        .server
        .get(&format!("/api/users/{}", app.bob_id))
        .add_header(header::AUTHORIZATION, app.ada())
        .await;
    response.assert_status_ok();
    let user = response.json::<Value>()["data"].clone();
    assert_eq!(user["username"], "bob");
    assert!(user.get("password").is_none());

    app.server
        .put(&format!("/api/user/{}/password", app.bob_id))
        .add_header(header::AUTHORIZATION, app.ada())
        .json(&json!({"password": "taken-over"}))
        .await
        .assert_status(StatusCode::FORBIDDEN);

    app.server
        .put(&format!("/api/user/{}/password", app.ada_id))
        .add_header(header::AUTHORIZATION, app.ada())
        .json(&json!({"password": "new-secret"}))
        .await
        .assert_status_ok();

    app.server
        .post("/api/login")
        .json(&json!({"username": "ada", "password": "secret"}))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
    app.server
        .post("/api/login")
        .json(&json!({"username": "ada", "password": "new-secret"}))
        .await
        .assert_status_ok();
    app.server
        .post("/api/login")
        .json(&json!({"username": "bob", "password": "hunter2"}))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_category_routes() {
    let app = create_test_app().await;

    let response = app
        .server
        .post("/api/categories")
        .add_header(header::AUTHORIZATION, app.ada())
        .json(&json!({"name": "Rust", "description": "systems", "regex": "^r[0-9]+"}))
        .await;
    response.assert_status(StatusCode::CREATED);
    let created = response.json::<Value>()["data"].clone();
    let category_id = created["category_id"].as_i64().unwrap();
    assert_eq!(created["message"], "Category created successfully");

    app.server
        .post("/api/categories")
        .add_header(header::AUTHORIZATION, app.ada())
        .json(&json!({"name": "Hidden", "is_active": false}))
        .await
        .assert_status(StatusCode::CREATED);

    let listing = app
        .server
        .get(&format!("/api/users/{}/categories", app.ada_id))
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .json::<Value>();
    let categories = listing["data"].as_array().unwrap();
    assert_eq!(categories.len(), 1);
    assert_eq!(categories[0]["regex"], "^r[0-9]+");
    assert_eq!(categories[0]["created_by"], app.ada_id);

    let response = app
        .server
        .put(&format!("/api/categories/{}", category_id))
        .add_header(header::AUTHORIZATION, app.ada())
        .json(&json!({"name": "Rust lang", "description": null, "regex": "[unclosed"}))
        .await;
    response.assert_status_ok();
    let updated = response.json::<Value>()["data"].clone();
    assert_eq!(updated["name"], "Rust lang");
    assert_eq!(updated["regex"], "[unclosed");
    assert_eq!(updated["is_active"], true);

    app.server
        .put("/api/categories/9999")
        .add_header(header::AUTHORIZATION, app.ada())
        .json(&json!({"name": "Ghost"}))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    app.server
        .post("/api/categories")
        .add_header(header::AUTHORIZATION, app.ada())
        .json(&json!({"name": "  "}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_file_lifecycle() {
    let app = create_test_app().await;
    let card = app.create_card("1", "").await;
    let card_pk = card["id"].as_i64().unwrap();

    let response = app.upload("report final.txt", Some(card_pk)).await;
    response.assert_status(StatusCode::CREATED);
    let uploaded = response.json::<Value>()["data"].clone();
    assert_eq!(uploaded["message"], "File uploaded successfully");
    let file = &uploaded["file"];
    let file_id = file["id"].as_i64().unwrap();
    assert_eq!(file["name"], "report_final.txt");
    assert_eq!(file["type"], "text/plain");
    assert_eq!(file["size"], 13);
    assert_eq!(file["card"]["card_id"], "1");
    assert!(file.get("filename").is_none());

    let listing = app
        .server
        .get("/api/files")
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .json::<Value>();
    assert_eq!(listing["data"].as_array().unwrap().len(), 1);
    assert_eq!(listing["data"][0]["card"]["id"], card_pk);

    let download = app
        .server
        .get(&format!("/api/files/download/{}", file_id))
        .add_header(header::AUTHORIZATION, app.ada())
        .await;
    download.assert_status_ok();
    assert_eq!(download.as_bytes().as_ref(), b"file contents");
    assert_eq!(download.header(header::CONTENT_TYPE), "text/plain");
    assert_eq!(
        download.header(header::CONTENT_DISPOSITION),
        "attachment; filename=\"report_final.txt\""
    );

    let response = app
        .server
        .patch(&format!("/api/files/{}", file_id))
        .add_header(header::AUTHORIZATION, app.ada())
        .json(&json!({"name": "renamed.txt"}))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["data"]["name"], "renamed.txt");

    app.server
        .delete(&format!("/api/files/{}", file_id))
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .assert_status_ok();

    for path in [
        format!("/api/files/{}", file_id),
        format!("/api/files/download/{}", file_id),
    ] {
        app.server
            .get(&path)
            .add_header(header::AUTHORIZATION, app.ada())
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
    let listing = app
        .server
        .get("/api/files")
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .json::<Value>();
    assert!(listing["data"].as_array().unwrap().is_empty());

    // Soft delete leaves the blob in place
    let blobs = std::fs::read_dir(app.uploads.path()).unwrap().count();
    assert_eq!(blobs, 1);
}

#[tokio::test]
async fn test_patch_file_with_empty_body_is_rejected() {
    let app = create_test_app().await;
    let response = app.upload("a.txt", None).await;
    let file_id = response.json::<Value>()["data"]["file"]["id"].as_i64().unwrap();

    let before = app
        .server
        .get(&format!("/api/files/{}", file_id))
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .json::<Value>();

    for body in [json!({}), json!({"path": "/etc/passwd"})] {
        app.server
            .patch(&format!("/api/files/{}", file_id))
            .add_header(header::AUTHORIZATION, app.ada())
            .json(&body)
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    let after = app
        .server
        .get(&format!("/api/files/{}", file_id))
        .add_header(header::AUTHORIZATION, app.ada())
        .await
        .json::<Value>();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_upload_validation() {
    let app = create_test_app().await;

    app.upload("a.txt", Some(404))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    assert_eq!(std::fs::read_dir(app.uploads.path()).unwrap().count(), 0);

    let response = app
        .server
        .post("/api/files/upload")
        .add_header(header::AUTHORIZATION, app.ada())
        .multipart(MultipartForm::new().add_text("card_pk", "1"))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"], "Validation error: No file part");
}

fn assert_validation_envelope(response: &axum_test::TestResponse) {
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert!(body["data"].is_null());
    assert!(body["error"].as_str().unwrap().starts_with("Validation error: "));
}

#[tokio::test]
async fn test_malformed_requests_use_error_envelope() {
    let app = create_test_app().await;

    let response = app
        .server
        .post("/api/cards")
        .add_header(header::AUTHORIZATION, app.ada())
        .json(&json!({"card_id": "1", "body": "x"}))
        .await;
    assert_validation_envelope(&response);
    assert!(response.json::<Value>()["error"].as_str().unwrap().contains("title"));

    let response = app
        .server
        .post("/api/login")
        .json(&json!({"username": "ada"}))
        .await;
    assert_validation_envelope(&response);

    let file_id = app.upload("a.txt", None).await.json::<Value>()["data"]["file"]["id"]
        .as_i64()
        .unwrap();
    let response = app
        .server
        .patch(&format!("/api/files/{}", file_id))
        .add_header(header::AUTHORIZATION, app.ada())
        .await;
    assert_validation_envelope(&response);

    let response = app
        .server
        .patch(&format!("/api/files/{}", file_id))
        .add_header(header::AUTHORIZATION, app.ada())
        .text("not json")
        .await;
    assert_validation_envelope(&response);

    let response = app
        .server
        .get("/api/cards/abc")
        .add_header(header::AUTHORIZATION, app.ada())
        .await;
    assert_validation_envelope(&response);
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() {
    let app = create_test_app().await;

    let form = MultipartForm::new().add_part(
        "file",
        Part::bytes(vec![b'x'; 2 * 1024 * 1024])
            .file_name("big.bin")
            .mime_type("application/octet-stream"),
    );
    let response = app
        .server
        .post("/api/files/upload")
        .add_header(header::AUTHORIZATION, app.ada())
        .multipart(form)
        .await;

    response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().starts_with("Payload too large"));
    assert_eq!(std::fs::read_dir(app.uploads.path()).unwrap().count(), 0);
}
