//! Live update channel -- one push connection scoped to one execution.
//!
//! The connection is reached through a [`Connector`]; frames are parsed
//! into [`ChannelMessage`]s and handed to a [`MessageSink`] (the execution
//! store) from a dedicated task. There is no reconnect and no backpressure:
//! malformed frames are dropped, and the task ends when the stream does.

pub mod ws;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::SystemMetrics;

pub use self::ws::WsConnector;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect live channel to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("live channel transport error: {0}")]
    Transport(String),

    #[error("malformed frame: {0}")]
    Parse(String),
}

/// Text frames as they arrive on the wire.
pub type FrameStream = BoxStream<'static, Result<String, ChannelError>>;

/// Opens push connections. Implemented over websockets in production and by
/// an in-memory spy in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, execution_id: &str) -> Result<FrameStream, ChannelError>;
}

/// Receives parsed messages from a channel task.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn deliver(&self, generation: u64, message: ChannelMessage);

    /// The stream ended or failed without being closed by us.
    async fn disconnected(&self, generation: u64);
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// Shallow patch for the record named by its `id`.
    ExecutionUpdate(Map<String, Value>),
    LogUpdate(LogUpdate),
    SystemMetrics(SystemMetrics),
    ExecutionComplete(Completion),
    ExecutionError(Failure),
    /// Anything else the server sends; ignored.
    Unknown { kind: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogUpdate {
    pub execution_id: Option<String>,
    pub level: Option<String>,
    pub message: String,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub id: String,
    pub result: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub id: String,
    pub error: Option<String>,
}

fn text(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// The execution a payload is about: `execution_id` first, then `id`.
fn execution_ref(map: &Map<String, Value>) -> Option<String> {
    text(map, "execution_id").or_else(|| text(map, "id"))
}

impl LogUpdate {
    fn from_payload(payload: &Map<String, Value>) -> Self {
        // the orchestration service nests the line under `log`
        let line = match payload.get("log") {
            Some(Value::Object(log)) if !payload.contains_key("message") => log,
            _ => payload,
        };
        Self {
            execution_id: execution_ref(payload),
            level: text(line, "level").or_else(|| text(line, "type")),
            message: text(line, "message").unwrap_or_default(),
            source: text(line, "source"),
        }
    }
}

impl Completion {
    fn from_payload(payload: &Map<String, Value>) -> Result<Self, ChannelError> {
        let id = execution_ref(payload)
            .ok_or_else(|| ChannelError::Parse("execution_complete without an execution id".to_string()))?;
        let duration_ms = payload
            .get("duration_ms")
            .or_else(|| payload.get("duration"))
            .and_then(Value::as_u64);
        Ok(Self {
            id,
            result: text(payload, "result"),
            duration_ms,
        })
    }
}

impl Failure {
    fn from_payload(payload: &Map<String, Value>) -> Result<Self, ChannelError> {
        let id = execution_ref(payload)
            .ok_or_else(|| ChannelError::Parse("execution_error without an execution id".to_string()))?;
        Ok(Self {
            id,
            error: text(payload, "error"),
        })
    }
}

impl ChannelMessage {
    /// Parse a `{type, payload}` envelope. Envelopes without a `payload`
    /// key carry their fields inline.
    pub fn parse(text: &str) -> Result<Self, ChannelError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ChannelError::Parse(e.to_string()))?;
        let Value::Object(mut envelope) = value else {
            return Err(ChannelError::Parse("frame is not a JSON object".to_string()));
        };
        let kind = match envelope.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(ChannelError::Parse("frame has no 'type'".to_string())),
        };
        let payload = match envelope.remove("payload") {
            Some(payload) => payload,
            None => Value::Object(envelope),
        };
        Self::from_parts(kind, payload)
    }

    fn from_parts(kind: String, payload: Value) -> Result<Self, ChannelError> {
        const KNOWN: &[&str] = &[
            "execution_update",
            "log_update",
            "system_metrics",
            "execution_complete",
            "execution_error",
        ];
        if !KNOWN.contains(&kind.as_str()) {
            return Ok(ChannelMessage::Unknown { kind });
        }
        let Value::Object(payload) = payload else {
            return Err(ChannelError::Parse(format!("{}: payload is not an object", kind)));
        };

        let message = match kind.as_str() {
            "execution_update" => {
                if !payload.contains_key("id") {
                    return Err(ChannelError::Parse("execution_update without an id".to_string()));
                }
                ChannelMessage::ExecutionUpdate(payload)
            }
            "log_update" => ChannelMessage::LogUpdate(LogUpdate::from_payload(&payload)),
            "system_metrics" => ChannelMessage::SystemMetrics(
                serde_json::from_value(Value::Object(payload))
                    .map_err(|e| ChannelError::Parse(format!("{}: {}", kind, e)))?,
            ),
            "execution_complete" => ChannelMessage::ExecutionComplete(Completion::from_payload(&payload)?),
            "execution_error" => ChannelMessage::ExecutionError(Failure::from_payload(&payload)?),
            _ => ChannelMessage::Unknown { kind },
        };
        Ok(message)
    }

    pub fn kind(&self) -> &str {
        match self {
            ChannelMessage::ExecutionUpdate(_) => "execution_update",
            ChannelMessage::LogUpdate(_) => "log_update",
            ChannelMessage::SystemMetrics(_) => "system_metrics",
            ChannelMessage::ExecutionComplete(_) => "execution_complete",
            ChannelMessage::ExecutionError(_) => "execution_error",
            ChannelMessage::Unknown { kind } => kind,
        }
    }
}

// ---------------------------------------------------------------------------
// LiveChannel
// ---------------------------------------------------------------------------

/// Handle to a running channel task.
pub struct LiveChannel {
    execution_id: String,
    generation: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl LiveChannel {
    /// Start pumping `frames` into `sink`.
    pub fn spawn<S: MessageSink>(execution_id: &str, generation: u64, frames: FrameStream, sink: S) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(pump(execution_id.to_string(), generation, frames, sink, token.clone()));
        info!(%execution_id, generation, "live channel opened");
        Self {
            execution_id: execution_id.to_string(),
            generation,
            token,
            task,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop delivering. Safe to call from inside the channel's own task.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Stop delivering and wait until the task (and its connection) is gone.
    /// Must not be called from the channel's own task.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!(execution_id = %self.execution_id, "live channel task panicked");
            }
        }
    }
}

async fn pump<S: MessageSink>(
    execution_id: String,
    generation: u64,
    mut frames: FrameStream,
    sink: S,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(%execution_id, generation, "live channel closed");
                return;
            }
            frame = frames.next() => match frame {
                Some(Ok(text)) => match ChannelMessage::parse(&text) {
                    Ok(message) => {
                        debug!(%execution_id, kind = message.kind(), "live channel message");
                        sink.deliver(generation, message).await;
                    }
                    Err(e) => warn!(%execution_id, error = %e, "dropping malformed frame"),
                },
                Some(Err(e)) => {
                    warn!(%execution_id, error = %e, "live channel failed");
                    break;
                }
                None => {
                    info!(%execution_id, "live channel ended by server");
                    break;
                }
            }
        }
    }
    // a close racing the end of the stream wins; nothing to release then
    if !token.is_cancelled() {
        sink.disconnected(generation).await;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_typed_messages() {
        let msg = ChannelMessage::parse(r#"{"type":"execution_complete","payload":{"id":"e1","result":"ok"}}"#).unwrap();
        assert_eq!(
            msg,
            ChannelMessage::ExecutionComplete(Completion {
                id: "e1".into(),
                result: Some("ok".into()),
                duration_ms: None
            })
        );

        let msg = ChannelMessage::parse(r#"{"type":"log_update","payload":{"message":"hi"}}"#).unwrap();
        match msg {
            ChannelMessage::LogUpdate(log) => {
                assert_eq!(log.message, "hi");
                assert!(log.level.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg = ChannelMessage::parse(r#"{"type":"system_metrics","payload":{"cpu":12.5,"gpu":3}}"#).unwrap();
        match msg {
            ChannelMessage::SystemMetrics(m) => {
                assert_eq!(m.cpu, 12.5);
                assert_eq!(m.extra.get("gpu"), Some(&json!(3)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_inline_fields_without_payload() {
        let msg = ChannelMessage::parse(r#"{"type":"execution_error","execution_id":"e9","error":"boom"}"#).unwrap();
        assert_eq!(
            msg,
            ChannelMessage::ExecutionError(Failure {
                id: "e9".into(),
                error: Some("boom".into())
            })
        );
    }

    #[test]
    fn test_execution_id_wins_when_payload_names_both() {
        let msg = ChannelMessage::parse(
            r#"{"type":"execution_complete","payload":{"id":"e1","execution_id":"e1","result":"ok","duration":7}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ChannelMessage::ExecutionComplete(Completion {
                id: "e1".into(),
                result: Some("ok".into()),
                duration_ms: Some(7)
            })
        );

        let msg = ChannelMessage::parse(
            r#"{"type":"execution_error","payload":{"id":"e2","execution_id":"e2","error":"boom"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ChannelMessage::ExecutionError(Failure {
                id: "e2".into(),
                error: Some("boom".into())
            })
        );

        // the line's own id must not be taken for the execution
        let msg = ChannelMessage::parse(
            r#"{"type":"log_update","payload":{"id":"line-9","execution_id":"e3","message":"hi","level":"warning","type":"info"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ChannelMessage::LogUpdate(LogUpdate {
                execution_id: Some("e3".into()),
                level: Some("warning".into()),
                message: "hi".into(),
                source: None
            })
        );
    }

    #[test]
    fn test_parse_nested_log_line() {
        let msg = ChannelMessage::parse(
            r#"{"type":"log_update","execution_id":"e1","log":{"timestamp":"2025-01-01T09:00:00","message":"Agent ready","type":"success"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ChannelMessage::LogUpdate(LogUpdate {
                execution_id: Some("e1".into()),
                level: Some("success".into()),
                message: "Agent ready".into(),
                source: None
            })
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let msg = ChannelMessage::parse(r#"{"type":"execution_started","payload":{}}"#).unwrap();
        assert_eq!(msg.kind(), "execution_started");
        let msg = ChannelMessage::parse(r#"{"type":"pong","payload":null}"#).unwrap();
        assert_eq!(msg.kind(), "pong");
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(ChannelMessage::parse("not json").is_err());
        assert!(ChannelMessage::parse("[1,2]").is_err());
        assert!(ChannelMessage::parse(r#"{"payload":{}}"#).is_err());
        assert!(ChannelMessage::parse(r#"{"type":"execution_update","payload":{"status":"running"}}"#).is_err());
        assert!(ChannelMessage::parse(r#"{"type":"execution_complete","payload":{}}"#).is_err());
    }
}
