//! Statecraft remote state store
//!
//! Talks to a state service (e.g. a durable-object worker) over a single RPC
//! endpoint. Every store operation is one `POST {url}/rpc`:
//!
//! ```text
//! → {"method": "get", "chain": ["prod", "api"], "id": "worker"}
//! ← {"success": true, "errors": [], "result": { ...StoredState... }}
//! ```
//!
//! The service owns all concurrency control; this client keeps no state.

mod error;

pub use error::{RemoteStoreError, Result};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};
use statecraft_core::state::StoredState;
use statecraft_core::store::{StateStore, StoreFactory};
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for the state service
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub token: Option<String>,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Read the bearer token from the environment variable `token_env`
    pub fn from_env(url: impl Into<String>, token_env: &str) -> Result<Self> {
        let token = std::env::var(token_env)
            .map_err(|_| RemoteStoreError::MissingEnvVar(token_env.to_string()))?;
        Ok(Self::new(url).with_token(token))
    }
}

#[derive(Debug)]
struct Client {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl Client {
    async fn call<T: DeserializeOwned>(&self, request: &RpcRequest<'_>) -> Result<T> {
        let mut builder = self.http.post(&self.endpoint).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteStoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: ApiResponse<T> = response.json().await?;
        tracing::debug!("{} {:?} -> ok", request.method, request.chain);
        envelope.into_result()
    }
}

/// All scopes of a tree, stored by one remote service
#[derive(Clone)]
pub struct RemoteBackend {
    client: Arc<Client>,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let endpoint = rpc_endpoint(&config.url)?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client: Arc::new(Client {
                http,
                endpoint,
                token: config.token,
            }),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.client.endpoint
    }

    pub fn store(&self, chain: &[String]) -> RemoteStateStore {
        RemoteStateStore {
            client: self.client.clone(),
            chain: chain.to_vec(),
        }
    }
}

impl StoreFactory for RemoteBackend {
    fn create(&self, chain: &[String]) -> Arc<dyn StateStore> {
        Arc::new(self.store(chain))
    }
}

/// Remote records of one scope chain
pub struct RemoteStateStore {
    client: Arc<Client>,
    chain: Vec<String>,
}

impl RemoteStateStore {
    fn request(&self, method: &'static str, params: Json) -> RpcRequest<'_> {
        RpcRequest {
            method,
            chain: &self.chain,
            params,
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &'static str, params: Json) -> Result<T> {
        self.client.call(&self.request(method, params)).await
    }
}

#[async_trait]
impl StateStore for RemoteStateStore {
    async fn init(&self) -> statecraft_core::Result<()> {
        self.call::<Json>("init", json!({})).await?;
        Ok(())
    }

    async fn deinit(&self) -> statecraft_core::Result<()> {
        self.call::<Json>("deinit", json!({})).await?;
        Ok(())
    }

    async fn list(&self) -> statecraft_core::Result<Vec<String>> {
        Ok(self.call("list", json!({})).await?)
    }

    async fn count(&self) -> statecraft_core::Result<usize> {
        Ok(self.call("count", json!({})).await?)
    }

    async fn get(&self, id: &str) -> statecraft_core::Result<Option<StoredState>> {
        Ok(self.call("get", json!({ "id": id })).await?)
    }

    async fn get_batch(
        &self,
        ids: &[String],
    ) -> statecraft_core::Result<IndexMap<String, StoredState>> {
        Ok(self.call("getBatch", json!({ "ids": ids })).await?)
    }

    async fn all(&self) -> statecraft_core::Result<IndexMap<String, StoredState>> {
        Ok(self.call("all", json!({})).await?)
    }

    async fn set(&self, id: &str, state: &StoredState) -> statecraft_core::Result<()> {
        let params = json!({ "id": id, "state": serde_json::to_value(state)? });
        self.call::<Json>("set", params).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> statecraft_core::Result<()> {
        self.call::<Json>("delete", json!({ "id": id })).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    method: &'static str,
    chain: &'a [String],
    #[serde(flatten)]
    params: Json,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl<T: DeserializeOwned> ApiResponse<T> {
    fn into_result(self) -> Result<T> {
        if !self.success {
            let error_msg = self
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(RemoteStoreError::ApiError(error_msg));
        }
        match self.result {
            Some(result) => Ok(result),
            // `null` results (e.g. a missing record) decode through T itself
            None => Ok(serde_json::from_value(Json::Null)?),
        }
    }
}

fn rpc_endpoint(url: &str) -> Result<String> {
    let base = url.trim_end_matches('/');
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(RemoteStoreError::InvalidUrl(url.to_string()));
    }
    Ok(format!("{base}/rpc"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use statecraft_core::ResourceStatus;

    #[test]
    fn test_rpc_endpoint() {
        assert_eq!(
            rpc_endpoint("https://state.example.com/").unwrap(),
            "https://state.example.com/rpc"
        );
        assert!(matches!(
            rpc_endpoint("state.example.com"),
            Err(RemoteStoreError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_request_body_is_flat() {
        let backend = RemoteBackend::new(RemoteConfig::new("http://localhost:8787")).unwrap();
        let store = backend.store(&["prod".to_string(), "api".to_string()]);
        let body = serde_json::to_value(store.request("get", json!({ "id": "worker" }))).unwrap();

        assert_eq!(
            body,
            json!({ "method": "get", "chain": ["prod", "api"], "id": "worker" })
        );
    }

    #[test]
    fn test_envelope_decoding() {
        let ok: ApiResponse<Option<StoredState>> =
            serde_json::from_value(json!({ "success": true, "result": null })).unwrap();
        assert!(ok.into_result().unwrap().is_none());

        let record = json!({
            "status": "created",
            "kind": "test::Thing",
            "id": "db",
            "fqn": "prod/db",
            "seq": 0,
            "props": {},
            "updated_at": chrono::Utc::now(),
        });
        let ok: ApiResponse<Option<StoredState>> =
            serde_json::from_value(json!({ "success": true, "result": record })).unwrap();
        let state = ok.into_result().unwrap().unwrap();
        assert_eq!(state.status, ResourceStatus::Created);
        assert_eq!(state.data, json!({}));

        let failed: ApiResponse<Json> = serde_json::from_value(json!({
            "success": false,
            "errors": [{ "message": "scope is locked" }],
        }))
        .unwrap();
        assert!(matches!(
            failed.into_result(),
            Err(RemoteStoreError::ApiError(msg)) if msg == "scope is locked"
        ));
    }

    #[test]
    fn test_config_from_env_requires_token() {
        let err = RemoteConfig::from_env("https://x", "STATECRAFT_TEST_UNSET_TOKEN").unwrap_err();
        assert!(matches!(err, RemoteStoreError::MissingEnvVar(name) if name == "STATECRAFT_TEST_UNSET_TOKEN"));
    }
}
