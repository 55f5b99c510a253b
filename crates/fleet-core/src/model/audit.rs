// ============================================
// File: crates/fleet-core/src/model/audit.rs
// ============================================
//! # Audit Events
//!
//! ## Main Functionality
//! - `AuditEvent`: One append-only record of a security-relevant action
//! - `redact_value`: Masks sensitive keys anywhere in a JSON tree
//! - `redact_text`: Masks `key=value` / `"key":"value"` secrets in free text
//!
//! ## ⚠️ Important Note for Next Developer
//! - Every event is redacted at construction; sinks may assume clean input
//! - Remote panels echo request bodies in error messages; run remote text
//!   through `redact_text` before storing it anywhere
//!
//! ## Last Modified
//! v0.1.0 - Initial audit model

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fleet_common::{NodeId, Timestamp};

/// Replacement for masked values.
pub const REDACTED: &str = "[REDACTED]";

/// Keys masked wherever they appear.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "pass",
    "secret",
    "token",
    "confirmtoken",
    "cookie",
    "authorization",
    "uuid",
    "privatekey",
    "sessiontoken",
];

/// Outcome recorded on an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The action completed.
    Success,
    /// The action was refused or failed.
    Failed,
    /// Informational.
    Info,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// When it happened.
    pub ts: Timestamp,
    /// Who did it.
    pub actor: String,
    /// Dotted event name, e.g. `batch.execute`.
    pub event_type: String,
    /// Outcome.
    pub outcome: AuditOutcome,
    /// Client the action concerned, if exactly one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_email: Option<String>,
    /// Node the action concerned, if exactly one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<NodeId>,
    /// Redacted structured detail.
    #[serde(default)]
    pub detail: Value,
}

impl AuditEvent {
    /// Creates an event stamped now, with empty detail.
    #[must_use]
    pub fn new(actor: impl Into<String>, event_type: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            ts: Timestamp::now(),
            actor: actor.into(),
            event_type: event_type.into(),
            outcome,
            target_email: None,
            server_id: None,
            detail: Value::Null,
        }
    }

    /// Sets the client email.
    #[must_use]
    pub fn with_target_email(mut self, email: Option<impl Into<String>>) -> Self {
        self.target_email = email.map(Into::into);
        self
    }

    /// Sets the node.
    #[must_use]
    pub fn with_server(mut self, id: NodeId) -> Self {
        self.server_id = Some(id);
        self
    }

    /// Sets the detail, redacting it.
    #[must_use]
    pub fn with_detail(mut self, mut detail: Value) -> Self {
        redact_value(&mut detail);
        self.detail = detail;
        self
    }
}

// ============================================
// Redaction
// ============================================

fn is_sensitive_key(key: &str) -> bool {
    let lowered: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();
    SENSITIVE_KEYS.contains(&lowered.as_str())
}

/// Masks sensitive values in place.
///
/// Besides the fixed key list, a string `id` inside an object that also
/// carries an `email` is a client credential (UUID or trojan password) and
/// is masked too. Numeric ids are left alone.
pub fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let is_client = map.contains_key("email");
            for (key, v) in map.iter_mut() {
                if is_sensitive_key(key) || (is_client && key == "id" && v.is_string()) {
                    *v = Value::String(REDACTED.into());
                } else {
                    redact_value(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_value),
        Value::String(s) => {
            if s.contains('=') || s.contains(':') {
                let cleaned = redact_text(s);
                if cleaned != *s {
                    *s = cleaned;
                }
            }
        }
        _ => {}
    }
}

/// Masks `key=value` and `"key":"value"` pairs whose key is sensitive.
#[must_use]
pub fn redact_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find(|c: char| c == '=' || c == ':') {
        let (before, after) = rest.split_at(pos);
        let key = trailing_key(before);
        out.push_str(before);
        out.push_str(&after[..1]);
        let mut after = &after[1..];

        if is_sensitive_key(key) {
            let trimmed = after.trim_start();
            out.push_str(&after[..after.len() - trimmed.len()]);
            after = trimmed;
            let (quoted, body) = match after.strip_prefix('"') {
                Some(b) => (true, b),
                None => (false, after),
            };
            let end = if quoted {
                body.find('"').unwrap_or(body.len())
            } else {
                body.find(|c: char| c.is_whitespace() || matches!(c, '&' | ',' | ';' | '}'))
                    .unwrap_or(body.len())
            };
            if quoted {
                out.push('"');
            }
            out.push_str(REDACTED);
            after = &body[end..];
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

fn trailing_key(before: &str) -> &str {
    let trimmed = before.trim_end().trim_end_matches('"');
    let start = trimmed
        .rfind(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .map_or(0, |i| i + 1);
    &trimmed[start..]
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redact_value_nested() {
        let mut v = json!({
            "username": "admin",
            "password": "hunter2",
            "payload": {
                "clients": [{"email": "alice", "id": "3f1c-uuid", "totalGB": 0}],
                "inboundIds": [1]
            },
            "confirm_token": "abc",
            "id": 7
        });
        redact_value(&mut v);

        assert_eq!(v["username"], "admin");
        assert_eq!(v["password"], REDACTED);
        assert_eq!(v["confirm_token"], REDACTED);
        assert_eq!(v["payload"]["clients"][0]["id"], REDACTED);
        assert_eq!(v["payload"]["clients"][0]["email"], "alice");
        assert_eq!(v["id"], 7);
    }

    #[test]
    fn test_redact_text_pairs() {
        let cleaned = redact_text("login failed for user=admin password=hunter2 retry");
        assert_eq!(cleaned, "login failed for user=admin password=[REDACTED] retry");

        let cleaned = redact_text(r#"bad body {"username":"admin","password":"hunter2"}"#);
        assert!(!cleaned.contains("hunter2"));
        assert!(cleaned.contains(r#""username":"admin""#));

        let cleaned = redact_text("Set-Cookie: 3x-ui=MTY5abc; Path=/");
        assert!(cleaned.contains("MTY5abc"));
        let cleaned = redact_text("cookie: 3x-ui=MTY5abc; Path=/");
        assert!(!cleaned.contains("MTY5abc"));
    }

    #[test]
    fn test_redact_text_passthrough() {
        let text = "Inbound 3 not found: port 443";
        assert_eq!(redact_text(text), text);
    }

    #[test]
    fn test_event_detail_is_redacted() {
        let event = AuditEvent::new("ops", "node.test", AuditOutcome::Success)
            .with_detail(json!({"password": "x", "ok": true}));
        assert_eq!(event.detail["password"], REDACTED);
        assert_eq!(event.detail["ok"], true);
    }
}
