use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Severity attached to an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id: Option<String>,
    pub action: String,
    pub module: String,
    pub details: serde_json::Value,
    pub timestamp: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub category: String,
    pub module: String,
    pub priority: String,
    pub channels: Vec<String>,
}

/// Audit log collaborator. Fire-and-forget: implementations report failure
/// through their Result, the engine logs and moves on.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_activity(&self, entry: AuditEntry) -> anyhow::Result<()>;
}

/// Notification collaborator, best-effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_notification(&self, user_id: Option<&str>, notification: Notification)
        -> anyhow::Result<()>;
}

/// Dispatch an audit entry, isolating any failure from the caller.
pub async fn audit(sink: &dyn AuditSink, entry: AuditEntry) {
    let action = entry.action.clone();
    if let Err(e) = sink.log_activity(entry).await {
        tracing::warn!(action = %action, error = %e, "Audit entry dropped");
    }
}

/// Dispatch a notification, isolating any failure from the caller.
pub async fn notify(notifier: &dyn Notifier, user_id: Option<&str>, notification: Notification) {
    let title = notification.title.clone();
    if let Err(e) = notifier.send_notification(user_id, notification).await {
        tracing::warn!(title = %title, error = %e, "Notification dropped");
    }
}

// ── Default tracing-backed implementations ──

pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_activity(&self, entry: AuditEntry) -> anyhow::Result<()> {
        tracing::info!(
            action = %entry.action,
            module = %entry.module,
            user_id = entry.user_id.as_deref().unwrap_or("-"),
            details = %entry.details,
            "audit"
        );
        Ok(())
    }
}

pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send_notification(
        &self,
        user_id: Option<&str>,
        notification: Notification,
    ) -> anyhow::Result<()> {
        tracing::info!(
            user_id = user_id.unwrap_or("-"),
            kind = %notification.kind,
            title = %notification.title,
            priority = %notification.priority,
            "notification"
        );
        Ok(())
    }
}

impl AuditEntry {
    pub fn new(action: &str, module: &str, details: serde_json::Value) -> Self {
        Self {
            user_id: None,
            action: action.to_string(),
            module: module.to_string(),
            details,
            timestamp: chrono::Utc::now().to_rfc3339(),
            severity: Severity::Info,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}
