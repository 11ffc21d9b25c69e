//! Execution bundle files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::model::ExecutionRecord;
use crate::store::ExecutionBundle;

/// `execution-<id>-<timestamp>.json`, safe for any filesystem.
pub fn default_file_name(record: &ExecutionRecord, at: DateTime<Utc>) -> String {
    format!("execution-{}-{}.json", record.id, at.format("%Y%m%dT%H%M%SZ"))
}

/// Write `bundle` as pretty JSON. A directory (or no path) gets the
/// default file name.
pub fn write_bundle(bundle: &ExecutionBundle, output: Option<&Path>) -> Result<PathBuf> {
    let name = default_file_name(&bundle.execution, bundle.exported_at);
    let path = match output {
        Some(p) if p.is_dir() => p.join(name),
        Some(p) => p.to_path_buf(),
        None => PathBuf::from(name),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(bundle)?;
    std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), execution_id = %bundle.execution.id, "execution exported");
    Ok(path)
}

/// Read a bundle file. Legacy keys in the record are accepted.
pub fn read_bundle(path: &Path) -> Result<ExecutionBundle> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("{} is not JSON", path.display()))?;

    let execution = value
        .get_mut("execution")
        .map(serde_json::Value::take)
        .context("bundle has no 'execution' object")?;
    let execution = ExecutionRecord::from_json(execution).context("unreadable execution record")?;
    let logs = match value.get_mut("logs").map(serde_json::Value::take) {
        Some(serde_json::Value::Null) | None => Vec::new(),
        Some(logs) => serde_json::from_value(logs).context("unreadable logs")?,
    };
    let exported_at = value
        .get("exported_at")
        .or_else(|| value.get("exportedAt"))
        .and_then(serde_json::Value::as_str)
        .and_then(|s| crate::model::timestamp::parse(s).ok())
        .unwrap_or_else(Utc::now);

    Ok(ExecutionBundle {
        execution,
        logs,
        exported_at,
    })
}
