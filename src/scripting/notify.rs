/// `scripting/notify.rs` — user-visible notifications
///
/// Stand-in for the host's toast popups. Every notification is mirrored to the
/// `log` facade and the last N are kept for the UI to render.
use std::{
    collections::VecDeque,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Success,
    Warn,
    Error,
}

impl NotifyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyLevel::Info => "info",
            NotifyLevel::Success => "success",
            NotifyLevel::Warn => "warn",
            NotifyLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotifyLevel,
    pub message: String,
    pub timestamp: i64,
}

/// Best-effort toast sink. Implementations must never fail.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NotifyLevel, message: &str);

    fn success(&self, message: &str) {
        self.notify(NotifyLevel::Success, message);
    }

    fn info(&self, message: &str) {
        self.notify(NotifyLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.notify(NotifyLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.notify(NotifyLevel::Error, message);
    }
}

/// Bounded notification history.
pub struct Notifications {
    history: Mutex<VecDeque<Notification>>,
    capacity: usize,
}

impl Notifications {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Most recent `limit` notifications, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Notification> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn count(&self, level: NotifyLevel) -> usize {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|n| n.level == level)
            .count()
    }

    pub fn clear(&self) {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for Notifications {
    fn default() -> Self {
        Self::new(200)
    }
}

impl Notifier for Notifications {
    fn notify(&self, level: NotifyLevel, message: &str) {
        match level {
            NotifyLevel::Error => log::error!("[toast] {}", message),
            NotifyLevel::Warn => log::warn!("[toast] {}", message),
            NotifyLevel::Info | NotifyLevel::Success => log::info!("[toast][{}] {}", level.as_str(), message),
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(Notification {
            level,
            message: message.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        });
        while history.len() > self.capacity {
            history.pop_front();
        }
    }
}
