//! State service RPC tests against a mock HTTP server

use serde_json::{Value as Json, json};
use statecraft_core::ResourceStatus;
use statecraft_core::state::StoredState;
use statecraft_core::store::StateStore;
use statecraft_remote::{RemoteBackend, RemoteConfig, RemoteStateStore};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockBuilder, MockServer, ResponseTemplate};

// =============================================================================
// Helpers
// =============================================================================

const TOKEN: &str = "test-token";

fn chain() -> Vec<String> {
    vec!["prod".to_string(), "api".to_string()]
}

fn store_for(server: &MockServer) -> RemoteStateStore {
    let backend = RemoteBackend::new(RemoteConfig::new(server.uri()).with_token(TOKEN)).unwrap();
    backend.store(&chain())
}

fn record(id: &str, seq: u64) -> Json {
    json!({
        "status": "created",
        "kind": "test::Thing",
        "id": id,
        "fqn": format!("prod/api/{id}"),
        "seq": seq,
        "props": { "name": id },
        "updated_at": "2024-05-01T10:00:00Z",
    })
}

fn ok(result: Json) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "success": true, "errors": [], "result": result }))
}

/// `POST /rpc` のうち、指定したメソッドとパラメータを持つ認証済みリクエスト
fn rpc(body: Json) -> MockBuilder {
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
        .and(body_partial_json(body))
}

// =============================================================================
// Reads
// =============================================================================

/// 存在するレコードを取得できる
#[tokio::test]
async fn test_get_present() {
    let server = MockServer::start().await;
    rpc(json!({ "method": "get", "chain": ["prod", "api"], "id": "db" }))
        .respond_with(ok(record("db", 3)))
        .expect(1)
        .mount(&server)
        .await;

    let state = store_for(&server).get("db").await.unwrap().unwrap();
    assert_eq!(state.id, "db");
    assert_eq!(state.fqn, "prod/api/db");
    assert_eq!(state.seq, 3);
    assert_eq!(state.status, ResourceStatus::Created);
    assert_eq!(state.props, json!({ "name": "db" }));
}

/// `result: null` は未登録として扱う
#[tokio::test]
async fn test_get_absent() {
    let server = MockServer::start().await;
    rpc(json!({ "method": "get", "id": "missing" }))
        .respond_with(ok(Json::Null))
        .mount(&server)
        .await;

    assert!(store_for(&server).get("missing").await.unwrap().is_none());
}

/// getBatch は見つかったIDだけを返す
#[tokio::test]
async fn test_get_batch() {
    let server = MockServer::start().await;
    rpc(json!({ "method": "getBatch", "ids": ["a", "b", "c"] }))
        .respond_with(ok(json!({ "a": record("a", 0), "c": record("c", 2) })))
        .expect(1)
        .mount(&server)
        .await;

    let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let found = store_for(&server).get_batch(&ids).await.unwrap();
    assert_eq!(found.keys().collect::<Vec<_>>(), ["a", "c"]);
    assert_eq!(found["c"].seq, 2);
}

/// all はサーバーの返した順序を保つ
#[tokio::test]
async fn test_all_keeps_order() {
    let server = MockServer::start().await;
    rpc(json!({ "method": "all" }))
        .respond_with(ok(json!({ "web": record("web", 1), "db": record("db", 0) })))
        .mount(&server)
        .await;

    let all = store_for(&server).all().await.unwrap();
    assert_eq!(all.keys().collect::<Vec<_>>(), ["web", "db"]);
    assert_eq!(all["db"].props, json!({ "name": "db" }));
}

/// list と count
#[tokio::test]
async fn test_list_and_count() {
    let server = MockServer::start().await;
    rpc(json!({ "method": "list" }))
        .respond_with(ok(json!(["db", "web"])))
        .mount(&server)
        .await;
    rpc(json!({ "method": "count" }))
        .respond_with(ok(json!(2)))
        .mount(&server)
        .await;

    let store = store_for(&server);
    assert_eq!(store.list().await.unwrap(), ["db", "web"]);
    assert_eq!(store.count().await.unwrap(), 2);
}

// =============================================================================
// Writes
// =============================================================================

/// set はレコード全体を `state` として送る
#[tokio::test]
async fn test_set_sends_record() {
    let server = MockServer::start().await;
    rpc(json!({
        "method": "set",
        "chain": ["prod", "api"],
        "id": "db",
        "state": { "id": "db", "seq": 4, "status": "created", "props": { "name": "db" } },
    }))
    .respond_with(ok(Json::Null))
    .expect(1)
    .mount(&server)
    .await;

    let state: StoredState = serde_json::from_value(record("db", 4)).unwrap();
    store_for(&server).set("db", &state).await.unwrap();
}

/// delete は対象IDだけを送る
#[tokio::test]
async fn test_delete() {
    let server = MockServer::start().await;
    rpc(json!({ "method": "delete", "id": "db" }))
        .respond_with(ok(Json::Null))
        .expect(1)
        .mount(&server)
        .await;

    store_for(&server).delete("db").await.unwrap();
}

/// init と deinit は引数なしで呼ばれる
#[tokio::test]
async fn test_init_and_deinit() {
    let server = MockServer::start().await;
    rpc(json!({ "method": "init" }))
        .respond_with(ok(Json::Null))
        .expect(1)
        .mount(&server)
        .await;
    rpc(json!({ "method": "deinit" }))
        .respond_with(ok(Json::Null))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    store.init().await.unwrap();
    store.deinit().await.unwrap();
}

// =============================================================================
// Failures
// =============================================================================

/// 2xx 以外のステータスはボディ付きのストアエラーになる
#[tokio::test]
async fn test_non_success_status() {
    let server = MockServer::start().await;
    rpc(json!({ "method": "get" }))
        .respond_with(ResponseTemplate::new(503).set_body_string("worker overloaded"))
        .mount(&server)
        .await;

    let err = store_for(&server).get("db").await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("HTTP 503"), "unexpected error: {message}");
    assert!(message.contains("worker overloaded"), "unexpected error: {message}");
}

/// `success: false` は最初のエラーメッセージを返す
#[tokio::test]
async fn test_api_error_envelope() {
    let server = MockServer::start().await;
    rpc(json!({ "method": "set" }))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "errors": [{ "message": "scope is locked" }, { "message": "ignored" }],
            "result": null,
        })))
        .mount(&server)
        .await;

    let state: StoredState = serde_json::from_value(record("db", 0)).unwrap();
    let err = store_for(&server).set("db", &state).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("scope is locked"), "unexpected error: {message}");
    assert!(!message.contains("ignored"));
}

/// トークンが一致しなければリクエストはマッチしない
#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let server = MockServer::start().await;
    rpc(json!({ "method": "get" }))
        .respond_with(ok(Json::Null))
        .mount(&server)
        .await;

    let backend =
        RemoteBackend::new(RemoteConfig::new(server.uri()).with_token("other-token")).unwrap();
    let err = backend.store(&chain()).get("db").await.unwrap_err();
    assert!(err.to_string().contains("HTTP 404"));
}
