//! Ephemeral user-facing notifications.
//!
//! Each notification with a positive duration owns a one-shot timer task.
//! Dismissing it early aborts the timer; clearing the queue aborts them all.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Error,
    Warning,
    #[default]
    Info,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationKind::Success => "success",
            NotificationKind::Error => "error",
            NotificationKind::Warning => "warning",
            NotificationKind::Info => "info",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    /// Milliseconds until removal; 0 keeps it until dismissed.
    pub duration: u64,
    pub created_at: DateTime<Utc>,
}

/// Request to add a notification; unset fields take the queue defaults.
#[derive(Debug, Clone, Default)]
pub struct NewNotification {
    pub kind: Option<NotificationKind>,
    pub title: Option<String>,
    pub message: Option<String>,
    pub duration: Option<u64>,
}

impl NewNotification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            title: Some(title.into()),
            message: Some(message.into()),
            duration: None,
        }
    }

    pub fn with_duration(mut self, ms: u64) -> Self {
        self.duration = Some(ms);
        self
    }
}

struct Inner {
    items: Mutex<Vec<Notification>>,
    timers: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Inner {
    fn items(&self) -> MutexGuard<'_, Vec<Notification>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take(&self, id: u64) -> bool {
        let mut items = self.items();
        let before = items.len();
        items.retain(|n| n.id != id);
        items.len() != before
    }
}

/// Shared handle to the notification list. Cloning is cheap.
#[derive(Clone)]
pub struct NotificationQueue {
    inner: Arc<Inner>,
    default_duration: u64,
}

impl NotificationQueue {
    pub fn new(default_duration_ms: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(Vec::new()),
                timers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            default_duration: default_duration_ms,
        }
    }

    /// Append a notification and schedule its expiry. Returns its id.
    pub fn add(&self, request: NewNotification) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let note = Notification {
            id,
            kind: request.kind.unwrap_or_default(),
            title: request.title.unwrap_or_default(),
            message: request.message.unwrap_or_default(),
            duration: request.duration.unwrap_or(self.default_duration),
            created_at: Utc::now(),
        };
        let duration = note.duration;
        debug!(id, kind = %note.kind, title = %note.title, duration, "notification added");
        self.inner.items().push(note);

        if duration > 0 {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let weak: Weak<Inner> = Arc::downgrade(&self.inner);
                    // held across spawn so the timer cannot run before it is registered
                    let mut timers = self.inner.timers();
                    let timer = handle.spawn(async move {
                        tokio::time::sleep(Duration::from_millis(duration)).await;
                        if let Some(inner) = weak.upgrade() {
                            inner.timers().remove(&id);
                            if inner.take(id) {
                                debug!(id, "notification expired");
                            }
                        }
                    });
                    timers.insert(id, timer);
                }
                Err(_) => warn!(id, "no async runtime, notification will not expire"),
            }
        }
        id
    }

    /// Dismiss a notification now. Unknown ids are a no-op.
    pub fn remove(&self, id: u64) -> bool {
        if let Some(timer) = self.inner.timers().remove(&id) {
            timer.abort();
        }
        self.inner.take(id)
    }

    pub fn clear(&self) {
        for (_, timer) in self.inner.timers().drain() {
            timer.abort();
        }
        self.inner.items().clear();
    }

    pub fn list(&self) -> Vec<Notification> {
        self.inner.items().clone()
    }

    pub fn get(&self, id: u64) -> Option<Notification> {
        self.inner.items().iter().find(|n| n.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of expiry timers still pending.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers().len()
    }

    pub fn success(&self, title: impl Into<String>, message: impl Into<String>) -> u64 {
        self.add(NewNotification::new(NotificationKind::Success, title, message))
    }

    pub fn error(&self, title: impl Into<String>, message: impl Into<String>) -> u64 {
        self.add(NewNotification::new(NotificationKind::Error, title, message))
    }

    pub fn warning(&self, title: impl Into<String>, message: impl Into<String>) -> u64 {
        self.add(NewNotification::new(NotificationKind::Warning, title, message))
    }

    pub fn info(&self, title: impl Into<String>, message: impl Into<String>) -> u64 {
        self.add(NewNotification::new(NotificationKind::Info, title, message))
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new(5000)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, timer) in self.timers().drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_notification_expires_after_duration() {
        let queue = NotificationQueue::default();
        let id = queue.add(NewNotification::new(NotificationKind::Success, "Saved", "ok").with_duration(1000));
        assert!(queue.get(id).is_some());

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(queue.get(id).is_some());

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert!(queue.get(id).is_none());
        assert_eq!(queue.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_defaults_applied() {
        let queue = NotificationQueue::new(5000);
        let id = queue.add(NewNotification::default());
        let note = queue.get(id).unwrap();
        assert_eq!(note.kind, NotificationKind::Info);
        assert_eq!(note.duration, 5000);
        assert_eq!(note.title, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_remove_cancels_timer() {
        let queue = NotificationQueue::default();
        let id = queue.info("Heads up", "something");
        assert_eq!(queue.pending_timers(), 1);
        assert!(queue.remove(id));
        assert_eq!(queue.pending_timers(), 0);
        assert!(!queue.remove(id));

        // another entry is not touched by the cancelled timer
        let other = queue.add(NewNotification::default().with_duration(0));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(queue.get(other).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_is_sticky() {
        let queue = NotificationQueue::default();
        let id = queue.add(NewNotification::new(NotificationKind::Error, "Boom", "").with_duration(0));
        assert_eq!(queue.pending_timers(), 0);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(queue.get(id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_everything() {
        let queue = NotificationQueue::default();
        for i in 0..5 {
            queue.warning(format!("w{i}"), "");
        }
        assert_eq!(queue.len(), 5);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pending_timers(), 0);
    }

    #[test]
    fn test_add_outside_runtime_keeps_notification() {
        let queue = NotificationQueue::default();
        let id = queue.info("no runtime", "");
        assert!(queue.get(id).is_some());
        assert_eq!(queue.pending_timers(), 0);
    }
}
