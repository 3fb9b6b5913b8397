use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;

use crate::{formatting::truncate_with_ellipsis, Result};

// ============== Timestamp Helpers ==============

/// RFC3339 timestamp in UTC.
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

// ============== Audit Logging ==============

const AUDIT_MAX_TEXT: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Message,
    Auth,
    Error,
    RateLimit,
    Payment,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: AuditKind,
    pub user_id: i64,
    pub username: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<i64>,
}

impl AuditEvent {
    fn base(event: AuditKind, user_id: i64, username: &str) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            event,
            user_id,
            username: username.to_string(),
            message_type: None,
            content: None,
            response: None,
            authorized: None,
            error: None,
            context: None,
            retry_after: None,
            invoice_id: None,
            tokens: None,
        }
    }

    pub fn message(
        user_id: i64,
        username: &str,
        message_type: &str,
        content: &str,
        response: Option<&str>,
    ) -> Self {
        Self {
            message_type: Some(message_type.to_string()),
            content: Some(content.to_string()),
            response: response.map(str::to_string),
            ..Self::base(AuditKind::Message, user_id, username)
        }
    }

    pub fn auth(user_id: i64, username: &str, authorized: bool) -> Self {
        Self {
            authorized: Some(authorized),
            ..Self::base(AuditKind::Auth, user_id, username)
        }
    }

    pub fn error(user_id: i64, username: &str, error: &str, context: Option<&str>) -> Self {
        Self {
            error: Some(error.to_string()),
            context: context.map(str::to_string),
            ..Self::base(AuditKind::Error, user_id, username)
        }
    }

    pub fn rate_limit(user_id: i64, username: &str, retry_after: f64) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::base(AuditKind::RateLimit, user_id, username)
        }
    }

    /// A top-up invoice credited to the user's balance.
    pub fn payment(user_id: i64, username: &str, invoice_id: i64, tokens: i64) -> Self {
        Self {
            invoice_id: Some(invoice_id),
            tokens: Some(tokens),
            ..Self::base(AuditKind::Payment, user_id, username)
        }
    }
}

/// Append-only audit log, either JSON lines or a readable block per event.
#[derive(Clone, Debug)]
pub struct AuditLogger {
    path: PathBuf,
    json: bool,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, mut event: AuditEvent) -> Result<()> {
        for field in [&mut event.content, &mut event.response, &mut event.error] {
            if let Some(s) = field.as_mut() {
                *s = truncate_with_ellipsis(s, AUDIT_MAX_TEXT);
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            writeln!(file, "{}", serde_json::to_string(&event)?)?;
            return Ok(());
        }

        let mut out = format!("\n{}", "=".repeat(60));
        if let serde_json::Value::Object(fields) = serde_json::to_value(&event)? {
            for (key, value) in fields {
                let shown = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                out.push_str(&format!("\n{key}: {shown}"));
            }
        }
        out.push('\n');
        file.write_all(out.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_file(prefix: &str) -> PathBuf {
        let pid = std::process::id();
        let ts = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}.log"))
    }

    #[test]
    fn json_lines_are_truncated() {
        let log = AuditLogger::new(tmp_file("atb-audit-json"), true);
        let content = "x".repeat(AUDIT_MAX_TEXT + 1);
        log.write(AuditEvent::message(1, "u", "text", &content, None))
            .unwrap();

        let written = std::fs::read_to_string(log.path()).unwrap();
        let v: serde_json::Value = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(v["event"], "message");
        assert_eq!(
            v["content"].as_str().unwrap().len(),
            AUDIT_MAX_TEXT + "...".len()
        );
        assert!(v.get("response").is_none());
        let _ = std::fs::remove_file(log.path());
    }

    #[test]
    fn text_format_lists_fields() {
        let log = AuditLogger::new(tmp_file("atb-audit-text"), false);
        log.write(AuditEvent::payment(5, "ann", 42, 10_000)).unwrap();
        log.write(AuditEvent::rate_limit(5, "ann", 1.5)).unwrap();

        let written = std::fs::read_to_string(log.path()).unwrap();
        assert!(written.contains("event: payment"));
        assert!(written.contains("invoice_id: 42"));
        assert!(written.contains("tokens: 10000"));
        assert!(written.contains("retry_after: 1.5"));
        let _ = std::fs::remove_file(log.path());
    }
}
