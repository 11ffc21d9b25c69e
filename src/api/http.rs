use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use tracing::debug;

use super::{ApiError, Control, CrewApi, Kind};
use crate::config::ApiConfig;

/// `CrewApi` over HTTP with reqwest.
#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpApi {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| ApiError::network(&config.base_url, e))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/api/v1/{}", self.base_url, path);
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, ApiError> {
        debug!(%method, %path, "api request");
        let mut req = self.request(method, path);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| ApiError::network(path, e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| ApiError::network(path, e))?;

        if !status.is_success() {
            return Err(ApiError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        let value: Value = serde_json::from_str(&text).map_err(|e| ApiError::Decode {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(unwrap_envelope(value))
    }
}

/// Accept both bare bodies and `{"data": ..., "meta": ...}` envelopes.
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map)
            if map.contains_key("data") && map.keys().all(|k| k == "data" || k == "meta") =>
        {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Lists come back bare, enveloped, or keyed (`{"logs": [...]}`).
fn into_list(path: &str, value: Value, key: &str) -> Result<Vec<Value>, ApiError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(ApiError::Decode {
                path: path.to_string(),
                reason: format!("expected a list or an object with '{}'", key),
            }),
        },
        other => Err(ApiError::Decode {
            path: path.to_string(),
            reason: format!("expected a list, got {}", other),
        }),
    }
}

#[async_trait]
impl CrewApi for HttpApi {
    async fn list(&self, kind: Kind) -> Result<Vec<Value>, ApiError> {
        let path = kind.path();
        let value = self.call(Method::GET, path, None).await?;
        into_list(path, value, path)
    }

    async fn get(&self, kind: Kind, id: &str) -> Result<Value, ApiError> {
        self.call(Method::GET, &format!("{}/{}", kind.path(), id), None).await
    }

    async fn create(&self, kind: Kind, body: &Value) -> Result<Value, ApiError> {
        self.call(Method::POST, kind.path(), Some(body)).await
    }

    async fn update(&self, kind: Kind, id: &str, body: &Value) -> Result<Value, ApiError> {
        self.call(Method::PUT, &format!("{}/{}", kind.path(), id), Some(body)).await
    }

    async fn delete(&self, kind: Kind, id: &str) -> Result<(), ApiError> {
        self.call(Method::DELETE, &format!("{}/{}", kind.path(), id), None).await?;
        Ok(())
    }

    async fn execute(&self, crew_id: &str, params: &Value) -> Result<Value, ApiError> {
        self.call(Method::POST, &format!("crews/{}/execute", crew_id), Some(params)).await
    }

    async fn execution(&self, id: &str) -> Result<Value, ApiError> {
        self.call(Method::GET, &format!("executions/{}", id), None).await
    }

    async fn execution_logs(&self, id: &str) -> Result<Vec<Value>, ApiError> {
        let path = format!("executions/{}/logs", id);
        let value = self.call(Method::GET, &path, None).await?;
        into_list(&path, value, "logs")
    }

    async fn control(&self, id: &str, action: Control) -> Result<(), ApiError> {
        let path = format!("executions/{}/{}", id, action.path());
        self.call(Method::POST, &path, None).await?;
        Ok(())
    }

    async fn export_crew(&self, id: &str) -> Result<Value, ApiError> {
        self.call(Method::GET, &format!("crews/{}/export", id), None).await
    }

    async fn import_crew(&self, body: &Value) -> Result<Value, ApiError> {
        self.call(Method::POST, "crews/import", Some(body)).await
    }

    async fn health(&self) -> Result<Value, ApiError> {
        self.call(Method::GET, "system/health", None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_envelope() {
        assert_eq!(unwrap_envelope(json!({"data": [1], "meta": {}})), json!([1]));
        assert_eq!(unwrap_envelope(json!({"data": 1, "other": 2})), json!({"data": 1, "other": 2}));
        assert_eq!(unwrap_envelope(json!({"id": "x"})), json!({"id": "x"}));
    }

    #[test]
    fn test_into_list_shapes() {
        assert_eq!(into_list("p", json!([1, 2]), "logs").unwrap().len(), 2);
        assert_eq!(into_list("p", json!({"logs": [1]}), "logs").unwrap().len(), 1);
        assert!(into_list("p", Value::Null, "logs").unwrap().is_empty());
        assert!(into_list("p", json!({"nope": 1}), "logs").is_err());
        assert!(into_list("p", json!("str"), "logs").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let config = ApiConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            connect_timeout_secs: 1,
            timeout_secs: 2,
            ..ApiConfig::default()
        };
        let api = HttpApi::new(&config).unwrap();
        let err = api.health().await.unwrap_err();
        assert!(err.is_transport(), "{err}");
    }
}
