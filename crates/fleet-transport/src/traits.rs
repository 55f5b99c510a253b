// ============================================
// File: crates/fleet-transport/src/traits.rs
// ============================================
//! # Panel Transport Traits
//!
//! ## Creation Reason
//! Abstracts the remote panel protocol so the session manager, engine and
//! aggregator run unchanged against real panels and against the in-memory
//! mock fleet.
//!
//! ## Main Functionality
//! - `PanelTransport`: Login and authenticated call primitives
//! - `RemoteRequest` / `RemoteResponse`: Generic `{success, msg, obj}` calls
//! - `PanelCredentials` / `SessionToken`: Secrets with redacted `Debug`
//!
//! ## Protocol Shape
//! ```text
//! login(base_url, user, pass) ──► SessionToken (cookie)
//! call(base_url, token, GET|POST path [json]) ──► {success, msg, obj}
//!                                           └──► AuthRejected (401/403/3xx)
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Implementations must be Send + Sync (shared across node tasks)
//! - A transport holds no per-node state; sessions live in the server's
//!   session manager
//!
//! ## Last Modified
//! v0.1.0 - Initial trait definitions

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

// ============================================
// Credentials and Tokens
// ============================================

/// Login credentials for one panel.
#[derive(Clone)]
pub struct PanelCredentials {
    /// Panel user.
    pub username: String,
    /// Panel password.
    pub password: String,
}

impl PanelCredentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for PanelCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanelCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Opaque session token (cookie header value).
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// Wraps a token value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the header value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

// ============================================
// Requests and Responses
// ============================================

/// HTTP method of a panel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}

/// A call against the panel API.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    /// Method.
    pub method: Method,
    /// Path below the base URL, starting with `/`.
    pub path: String,
    /// JSON body for POST calls.
    pub body: Option<Value>,
}

impl RemoteRequest {
    /// Creates a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    /// Creates a POST request without a body.
    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body: None,
        }
    }

    /// Creates a POST request with a JSON body.
    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body: Some(body),
        }
    }
}

impl fmt::Display for RemoteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// The panel's `{success, msg, obj}` envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteResponse {
    /// Whether the panel applied the call.
    #[serde(default)]
    pub success: bool,
    /// Human-readable message.
    #[serde(default)]
    pub msg: String,
    /// Call-specific payload.
    #[serde(default)]
    pub obj: Value,
}

impl RemoteResponse {
    /// Creates a successful response.
    #[must_use]
    pub fn ok(obj: Value) -> Self {
        Self {
            success: true,
            msg: String::new(),
            obj,
        }
    }

    /// Creates a refused response.
    pub fn refused(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            msg: msg.into(),
            obj: Value::Null,
        }
    }
}

// ============================================
// PanelTransport Trait
// ============================================

/// Remote panel protocol.
#[async_trait]
pub trait PanelTransport: Send + Sync + 'static {
    /// Logs in and returns a session token.
    ///
    /// # Errors
    /// - `LoginFailed` if the credentials are refused
    /// - `Unreachable` / `Timeout` on network failure
    async fn login(&self, base_url: &str, credentials: &PanelCredentials) -> Result<SessionToken>;

    /// Performs an authenticated call.
    ///
    /// A response with `success: false` is returned as `Ok`; callers decide
    /// what a refusal means for their step.
    ///
    /// # Errors
    /// - `AuthRejected` if the session is no longer valid
    /// - `Unreachable` / `Timeout` on network failure
    /// - `Protocol` on an unexpected status or body
    async fn call(
        &self,
        base_url: &str,
        token: &SessionToken,
        request: &RemoteRequest,
    ) -> Result<RemoteResponse>;
}
