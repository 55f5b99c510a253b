// ============================================
// File: crates/fleet-transport/src/http.rs
// ============================================
//! # HTTP Panel Transport
//!
//! ## Creation Reason
//! Production implementation of [`PanelTransport`] speaking the 3x-ui style
//! panel API over HTTP(S).
//!
//! ## Main Functionality
//! - `POST {base}/login` with form credentials, session from `Set-Cookie`
//! - Authenticated calls carrying the session in the `Cookie` header
//! - Status mapping: 401/403/3xx → `AuthRejected`
//!
//! ## ⚠️ Important Note for Next Developer
//! - Redirects are disabled: an expired panel session answers API calls
//!   with a redirect to the login page, which must surface as `AuthRejected`
//! - Accepting self-signed panel certificates is an explicit config
//!   switch, off by default
//!
//! ## Last Modified
//! v0.1.0 - Initial HTTP transport

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{redirect, Client, StatusCode};
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::traits::{Method, PanelCredentials, PanelTransport, RemoteRequest, RemoteResponse, SessionToken};

/// Path of the panel login endpoint.
pub const LOGIN_PATH: &str = "/login";

// ============================================
// Configuration
// ============================================

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Whole-request timeout.
    pub request_timeout: Duration,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Accept self-signed panel certificates.
    pub accept_invalid_certs: bool,
    /// `User-Agent` header.
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            accept_invalid_certs: false,
            user_agent: concat!("fleet-control/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

// ============================================
// HttpPanelTransport
// ============================================

/// reqwest-backed panel transport.
pub struct HttpPanelTransport {
    client: Client,
    request_timeout: Duration,
}

impl HttpPanelTransport {
    /// Builds the HTTP client.
    ///
    /// # Errors
    /// Returns `Config` if the TLS backend cannot be initialized.
    pub fn new(config: &HttpTransportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .redirect(redirect::Policy::none())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| TransportError::Config {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            request_timeout: config.request_timeout,
        })
    }

    fn url(base_url: &str, path: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), path)
    }

    fn map_send_error(&self, base_url: &str, err: &reqwest::Error) -> TransportError {
        if err.is_timeout() {
            let ms = u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX);
            TransportError::timeout(base_url, ms)
        } else if err.is_connect() || err.is_request() {
            TransportError::unreachable(base_url, root_cause(err))
        } else {
            TransportError::protocol(root_cause(err))
        }
    }
}

#[async_trait]
impl PanelTransport for HttpPanelTransport {
    async fn login(&self, base_url: &str, credentials: &PanelCredentials) -> Result<SessionToken> {
        let url = Self::url(base_url, LOGIN_PATH);
        debug!(url = %url, username = %credentials.username, "Panel login");

        let response = self
            .client
            .post(&url)
            .form(&[
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| self.map_send_error(base_url, &e))?;

        let status = response.status();
        let cookie = session_cookie(response.headers());

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::login_failed(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(TransportError::protocol(format!("login returned HTTP {status}")));
        }

        let body: RemoteResponse = response
            .json()
            .await
            .map_err(|e| TransportError::protocol(format!("login body: {e}")))?;

        if !body.success {
            let reason = if body.msg.is_empty() {
                "credentials refused".to_string()
            } else {
                body.msg
            };
            return Err(TransportError::login_failed(reason));
        }

        cookie
            .map(SessionToken::new)
            .ok_or_else(|| TransportError::protocol("login succeeded without a session cookie"))
    }

    async fn call(
        &self,
        base_url: &str,
        token: &SessionToken,
        request: &RemoteRequest,
    ) -> Result<RemoteResponse> {
        let url = Self::url(base_url, &request.path);
        trace!(request = %request, base_url, "Panel call");

        let builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        let builder = builder.header(COOKIE, token.as_str());
        let builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| self.map_send_error(base_url, &e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || status.is_redirection()
        {
            return Err(TransportError::auth_rejected(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(TransportError::protocol(format!(
                "{request} returned HTTP {status}"
            )));
        }

        response
            .json::<RemoteResponse>()
            .await
            .map_err(|e| TransportError::protocol(format!("{request} body: {e}")))
    }
}

impl std::fmt::Debug for HttpPanelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPanelTransport")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

// ============================================
// Helpers
// ============================================

/// Joins the `name=value` parts of every `Set-Cookie` header.
fn session_cookie(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let pairs: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('=') && !pair.ends_with('='))
        .collect();

    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

fn root_cause(err: &reqwest::Error) -> String {
    let mut source: &dyn std::error::Error = err;
    while let Some(next) = source.source() {
        source = next;
    }
    source.to_string()
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn test_session_cookie_extraction() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("3x-ui=MTY5; Path=/; HttpOnly"));
        headers.append(SET_COOKIE, HeaderValue::from_static("lang=en-US; Path=/"));
        assert_eq!(session_cookie(&headers).as_deref(), Some("3x-ui=MTY5; lang=en-US"));
    }

    #[test]
    fn test_session_cookie_ignores_cleared() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("3x-ui=; Max-Age=0"));
        assert_eq!(session_cookie(&headers), None);
    }

    #[test]
    fn test_url_join() {
        assert_eq!(
            HttpPanelTransport::url("https://a.example:2053/base/", "/login"),
            "https://a.example:2053/base/login"
        );
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let transport = HttpPanelTransport::new(&HttpTransportConfig {
            request_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            ..HttpTransportConfig::default()
        })
        .unwrap();

        // Port 9 on loopback: nothing listens, connect is refused immediately.
        let err = transport
            .login("http://127.0.0.1:9", &PanelCredentials::new("admin", "pw"))
            .await
            .unwrap_err();
        assert!(err.is_unreachable(), "{err:?}");
    }
}
