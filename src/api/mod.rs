//! REST transport to the orchestration service.
//!
//! Stores talk to the service only through the [`CrewApi`] trait. Bodies
//! are opaque JSON; the stores canonicalise and type them.

pub mod http;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use self::http::HttpApi;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error calling {path}: {reason}")]
    Network { path: String, reason: String },

    #[error("server returned {status} for {path}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {path}: {reason}")]
    Decode { path: String, reason: String },
}

impl ApiError {
    /// True for failures where the request never got an answer. Only these
    /// are eligible for the local fallback policy.
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Network { .. })
    }

    pub fn network(path: impl Into<String>, reason: impl fmt::Display) -> Self {
        ApiError::Network {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Resource collections exposed under `/api/v1/<kind>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Crews,
    Agents,
    Tasks,
    Templates,
}

impl Kind {
    pub fn path(self) -> &'static str {
        match self {
            Kind::Crews => "crews",
            Kind::Agents => "agents",
            Kind::Tasks => "tasks",
            Kind::Templates => "templates",
        }
    }

    /// Singular noun for log lines and messages.
    pub fn noun(self) -> &'static str {
        match self {
            Kind::Crews => "crew",
            Kind::Agents => "agent",
            Kind::Tasks => "task",
            Kind::Templates => "template",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.path())
    }
}

/// Remote actions on a running execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Cancel,
    Pause,
    Resume,
}

impl Control {
    pub fn path(self) -> &'static str {
        match self {
            Control::Cancel => "cancel",
            Control::Pause => "pause",
            Control::Resume => "resume",
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.path())
    }
}

/// The REST surface consumed by the stores.
#[async_trait]
pub trait CrewApi: Send + Sync {
    async fn list(&self, kind: Kind) -> Result<Vec<Value>, ApiError>;
    async fn get(&self, kind: Kind, id: &str) -> Result<Value, ApiError>;
    async fn create(&self, kind: Kind, body: &Value) -> Result<Value, ApiError>;
    async fn update(&self, kind: Kind, id: &str, body: &Value) -> Result<Value, ApiError>;
    async fn delete(&self, kind: Kind, id: &str) -> Result<(), ApiError>;

    async fn execute(&self, crew_id: &str, params: &Value) -> Result<Value, ApiError>;
    async fn execution(&self, id: &str) -> Result<Value, ApiError>;
    async fn execution_logs(&self, id: &str) -> Result<Vec<Value>, ApiError>;
    async fn control(&self, id: &str, action: Control) -> Result<(), ApiError>;

    async fn export_crew(&self, id: &str) -> Result<Value, ApiError>;
    async fn import_crew(&self, body: &Value) -> Result<Value, ApiError>;

    async fn health(&self) -> Result<Value, ApiError>;
}

/// In-process fake used by the store tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers from in-memory collections; `offline` makes every call a
    /// network failure, `reject` makes controls come back as HTTP 409.
    #[derive(Default)]
    pub struct FakeApi {
        pub offline: AtomicBool,
        pub reject: AtomicBool,
        pub calls: AtomicUsize,
        items: Mutex<HashMap<&'static str, Vec<Value>>>,
        next: AtomicUsize,
    }

    impl FakeApi {
        pub fn offline() -> Self {
            let api = Self::default();
            api.offline.store(true, Ordering::SeqCst);
            api
        }

        pub fn seed(&self, kind: Kind, item: Value) {
            let mut items = self.items.lock().unwrap();
            items.entry(kind.path()).or_default().push(item);
        }

        fn gate(&self, path: &str) -> Result<(), ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(ApiError::network(path, "connection refused"));
            }
            Ok(())
        }

        fn fresh_id(&self, prefix: &str) -> String {
            format!("{}-{}", prefix, self.next.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[async_trait]
    impl CrewApi for FakeApi {
        async fn list(&self, kind: Kind) -> Result<Vec<Value>, ApiError> {
            self.gate(kind.path())?;
            Ok(self.items.lock().unwrap().get(kind.path()).cloned().unwrap_or_default())
        }

        async fn get(&self, kind: Kind, id: &str) -> Result<Value, ApiError> {
            self.gate(kind.path())?;
            self.items
                .lock()
                .unwrap()
                .get(kind.path())
                .and_then(|v| v.iter().find(|i| i["id"] == id).cloned())
                .ok_or_else(|| ApiError::Status {
                    path: kind.path().into(),
                    status: 404,
                    body: "not found".into(),
                })
        }

        async fn create(&self, kind: Kind, body: &Value) -> Result<Value, ApiError> {
            self.gate(kind.path())?;
            let mut item = body.clone();
            item["id"] = json!(self.fresh_id("srv"));
            self.seed(kind, item.clone());
            Ok(item)
        }

        async fn update(&self, kind: Kind, id: &str, body: &Value) -> Result<Value, ApiError> {
            self.gate(kind.path())?;
            let mut items = self.items.lock().unwrap();
            let list = items.entry(kind.path()).or_default();
            let Some(item) = list.iter_mut().find(|i| i["id"] == id) else {
                return Err(ApiError::Status {
                    path: kind.path().into(),
                    status: 404,
                    body: "not found".into(),
                });
            };
            if let (Some(dst), Some(src)) = (item.as_object_mut(), body.as_object()) {
                for (k, v) in src {
                    dst.insert(k.clone(), v.clone());
                }
            }
            Ok(item.clone())
        }

        async fn delete(&self, kind: Kind, id: &str) -> Result<(), ApiError> {
            self.gate(kind.path())?;
            let mut items = self.items.lock().unwrap();
            items.entry(kind.path()).or_default().retain(|i| i["id"] != id);
            Ok(())
        }

        async fn execute(&self, crew_id: &str, _params: &Value) -> Result<Value, ApiError> {
            self.gate("execute")?;
            Ok(json!({
                "id": self.fresh_id("exec"),
                "crew_id": crew_id,
                "status": "running",
                "started_at": "2025-01-01T00:00:00"
            }))
        }

        async fn execution(&self, id: &str) -> Result<Value, ApiError> {
            self.gate("executions")?;
            Ok(json!({"id": id, "crew_id": "c1", "status": "completed", "result": "done"}))
        }

        async fn execution_logs(&self, id: &str) -> Result<Vec<Value>, ApiError> {
            self.gate("logs")?;
            Ok(vec![
                json!({"message": format!("started {id}"), "type": "info"}),
                json!({"message": "finished", "type": "success"}),
            ])
        }

        async fn control(&self, _id: &str, action: Control) -> Result<(), ApiError> {
            self.gate(action.path())?;
            if self.reject.load(Ordering::SeqCst) {
                return Err(ApiError::Status {
                    path: action.path().into(),
                    status: 409,
                    body: "not running".into(),
                });
            }
            Ok(())
        }

        async fn export_crew(&self, id: &str) -> Result<Value, ApiError> {
            self.get(Kind::Crews, id).await
        }

        async fn import_crew(&self, body: &Value) -> Result<Value, ApiError> {
            self.create(Kind::Crews, body).await
        }

        async fn health(&self) -> Result<Value, ApiError> {
            self.gate("health")?;
            Ok(json!({"status": "healthy"}))
        }
    }
}
