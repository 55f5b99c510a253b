// ============================================
// File: crates/fleet-transport/src/mock.rs
// ============================================
//! # Mock Panel Fleet
//!
//! ## Creation Reason
//! Provides an in-memory fleet of panels for exercising the session
//! manager, execution engine and aggregator without any network.
//!
//! ## Main Functionality
//! - `MockPanelFleet`: [`PanelTransport`] routing calls by base URL
//! - `MockPanel`: One panel with inbounds, clients, sessions and fault knobs
//!
//! ## Emulated Endpoints
//! ```text
//! POST /login
//! GET  /panel/api/inbounds/list
//! POST /panel/api/inbounds/add
//! POST /panel/api/inbounds/del/{id}
//! POST /panel/api/inbounds/update/{id}
//! POST /panel/api/inbounds/addClient
//! POST /panel/api/inbounds/updateClient/{clientId}
//! POST /panel/api/inbounds/{id}/delClientByEmail/{email}
//! POST /panel/api/inbounds/{id}/resetClientTraffic/{email}
//! POST /panel/api/inbounds/resetAllClientTraffics/{id}
//! POST /panel/api/inbounds/onlines
//! GET  /panel/api/server/status
//! ```
//!
//! ## Fault Knobs
//! - `set_unreachable`: every call fails with `Unreachable`
//! - `set_delay` / `set_login_delay`: sleep before answering (tokio time)
//! - `expire_sessions`: drop live sessions, next call is `AuthRejected`
//! - `set_password`: rotate the panel password
//!
//! ## ⚠️ Important Note for Next Developer
//! - Refusal messages mirror what real panels answer ("Duplicate email",
//!   "Port already exists", "not found"); the server's step classifier
//!   keys off them
//!
//! ## Last Modified
//! v0.1.0 - Initial mock fleet

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use fleet_common::random_token;

use crate::error::{Result, TransportError};
use crate::traits::{Method, PanelCredentials, PanelTransport, RemoteRequest, RemoteResponse, SessionToken};

const INBOUNDS: &str = "/panel/api/inbounds";

// ============================================
// MockPanelFleet
// ============================================

/// In-memory fleet of panels keyed by base URL.
#[derive(Default)]
pub struct MockPanelFleet {
    panels: RwLock<HashMap<String, Arc<MockPanel>>>,
}

impl MockPanelFleet {
    /// Creates an empty fleet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a panel reachable at `base_url`.
    pub fn add_panel(&self, base_url: &str, username: &str, password: &str) -> Arc<MockPanel> {
        let panel = Arc::new(MockPanel::new(username, password));
        self.panels
            .write()
            .insert(base_url.trim_end_matches('/').to_string(), Arc::clone(&panel));
        panel
    }

    /// Returns the panel at `base_url`.
    #[must_use]
    pub fn panel(&self, base_url: &str) -> Option<Arc<MockPanel>> {
        self.panels.read().get(base_url.trim_end_matches('/')).cloned()
    }

    fn lookup(&self, base_url: &str) -> Result<Arc<MockPanel>> {
        self.panel(base_url)
            .ok_or_else(|| TransportError::unreachable(base_url, "no such host"))
    }
}

#[async_trait]
impl PanelTransport for MockPanelFleet {
    async fn login(&self, base_url: &str, credentials: &PanelCredentials) -> Result<SessionToken> {
        let panel = self.lookup(base_url)?;
        panel.logins.fetch_add(1, Ordering::SeqCst);

        let delay = panel.login_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if panel.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::unreachable(base_url, "connection refused"));
        }

        let mut state = panel.state.lock();
        if credentials.username != state.username || credentials.password != state.password {
            return Err(TransportError::login_failed("Invalid username or password"));
        }
        let token = format!("3x-ui={}", random_token(16));
        state.sessions.insert(token.clone());
        Ok(SessionToken::new(token))
    }

    async fn call(
        &self,
        base_url: &str,
        token: &SessionToken,
        request: &RemoteRequest,
    ) -> Result<RemoteResponse> {
        let panel = self.lookup(base_url)?;
        panel.calls.fetch_add(1, Ordering::SeqCst);

        let delay = panel.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if panel.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::unreachable(base_url, "connection refused"));
        }

        let mut state = panel.state.lock();
        if !state.sessions.contains(token.as_str()) {
            return Err(TransportError::auth_rejected("HTTP 307 Temporary Redirect"));
        }
        state.log.push(format!("{request}"));
        Ok(state.handle(request))
    }
}

// ============================================
// MockPanel
// ============================================

/// One emulated panel.
pub struct MockPanel {
    state: Mutex<PanelState>,
    logins: AtomicUsize,
    calls: AtomicUsize,
    delay_ms: AtomicU64,
    login_delay_ms: AtomicU64,
    unreachable: AtomicBool,
}

impl MockPanel {
    fn new(username: &str, password: &str) -> Self {
        Self {
            state: Mutex::new(PanelState {
                username: username.to_string(),
                password: password.to_string(),
                sessions: HashSet::new(),
                inbounds: BTreeMap::new(),
                next_id: 1,
                onlines: Vec::new(),
                log: Vec::new(),
            }),
            logins: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
            login_delay_ms: AtomicU64::new(0),
            unreachable: AtomicBool::new(false),
        }
    }

    // ========================================
    // Fixtures
    // ========================================

    /// Creates an inbound with a given id.
    pub fn add_inbound(&self, id: u32, port: u16, protocol: &str) {
        let mut state = self.state.lock();
        state.inbounds.insert(id, MockInbound::new(id, port, protocol));
        state.next_id = state.next_id.max(id + 1);
    }

    /// Adds an enabled client to an existing inbound.
    pub fn add_client(&self, inbound_id: u32, email: &str) {
        let mut state = self.state.lock();
        if let Some(inbound) = state.inbounds.get_mut(&inbound_id) {
            inbound.clients.push(json!({
                "id": random_token(8),
                "email": email,
                "enable": true,
            }));
            inbound.client_traffic.insert(email.to_string(), (0, 0));
        }
    }

    /// Flips an inbound's enable flag without going through the API.
    pub fn set_inbound_enabled(&self, id: u32, enable: bool) {
        if let Some(inbound) = self.state.lock().inbounds.get_mut(&id) {
            inbound.enable = enable;
        }
    }

    /// Sets traffic counters of an inbound.
    pub fn set_traffic(&self, inbound_id: u32, up: u64, down: u64) {
        if let Some(inbound) = self.state.lock().inbounds.get_mut(&inbound_id) {
            inbound.up = up;
            inbound.down = down;
        }
    }

    /// Sets traffic counters of a client.
    pub fn set_client_traffic(&self, inbound_id: u32, email: &str, up: u64, down: u64) {
        if let Some(inbound) = self.state.lock().inbounds.get_mut(&inbound_id) {
            inbound.client_traffic.insert(email.to_string(), (up, down));
        }
    }

    /// Sets the emails reported as online.
    pub fn set_online(&self, emails: &[&str]) {
        self.state.lock().onlines = emails.iter().map(ToString::to_string).collect();
    }

    // ========================================
    // Fault Knobs
    // ========================================

    /// Makes every call fail as unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delays every authenticated call.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Delays every login.
    pub fn set_login_delay(&self, delay: Duration) {
        self.login_delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Invalidates every live session.
    pub fn expire_sessions(&self) {
        self.state.lock().sessions.clear();
    }

    /// Changes the panel password; live sessions stay valid.
    pub fn set_password(&self, password: &str) {
        self.state.lock().password = password.to_string();
    }

    // ========================================
    // Inspection
    // ========================================

    /// Number of login attempts.
    #[must_use]
    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    /// Number of authenticated call attempts.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns `METHOD path` of every call that reached the handler.
    #[must_use]
    pub fn call_log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Returns whether an inbound exists and is enabled.
    #[must_use]
    pub fn inbound_enabled(&self, id: u32) -> Option<bool> {
        self.state.lock().inbounds.get(&id).map(|i| i.enable)
    }

    /// Returns the ids of all inbounds.
    #[must_use]
    pub fn inbound_ids(&self) -> Vec<u32> {
        self.state.lock().inbounds.keys().copied().collect()
    }

    /// Returns the port of an inbound.
    #[must_use]
    pub fn inbound_port(&self, id: u32) -> Option<u16> {
        self.state.lock().inbounds.get(&id).map(|i| i.port)
    }

    /// Returns a client's enable flag, if it exists.
    #[must_use]
    pub fn client_enabled(&self, inbound_id: u32, email: &str) -> Option<bool> {
        let state = self.state.lock();
        let inbound = state.inbounds.get(&inbound_id)?;
        inbound
            .find_client(email)
            .and_then(|c| c.get("enable"))
            .and_then(Value::as_bool)
    }

    /// Returns a client's traffic counters, if it exists.
    #[must_use]
    pub fn client_traffic(&self, inbound_id: u32, email: &str) -> Option<(u64, u64)> {
        let state = self.state.lock();
        state.inbounds.get(&inbound_id)?.client_traffic.get(email).copied()
    }

    /// Returns the emails of an inbound's clients.
    #[must_use]
    pub fn client_emails(&self, inbound_id: u32) -> Vec<String> {
        let state = self.state.lock();
        state
            .inbounds
            .get(&inbound_id)
            .map(|i| {
                i.clients
                    .iter()
                    .filter_map(|c| c.get("email").and_then(Value::as_str))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ============================================
// Panel State
// ============================================

struct MockInbound {
    id: u32,
    port: u16,
    protocol: String,
    remark: String,
    enable: bool,
    up: u64,
    down: u64,
    total: u64,
    stream_settings: Value,
    clients: Vec<Value>,
    client_traffic: BTreeMap<String, (u64, u64)>,
}

impl MockInbound {
    fn new(id: u32, port: u16, protocol: &str) -> Self {
        Self {
            id,
            port,
            protocol: protocol.to_string(),
            remark: format!("inbound-{id}"),
            enable: true,
            up: 0,
            down: 0,
            total: 0,
            stream_settings: json!({"network": "tcp"}),
            clients: Vec::new(),
            client_traffic: BTreeMap::new(),
        }
    }

    fn find_client(&self, key: &str) -> Option<&Value> {
        self.clients.iter().find(|c| client_matches(c, key))
    }

    fn to_json(&self) -> Value {
        let stats: Vec<Value> = self
            .clients
            .iter()
            .filter_map(|c| {
                let email = c.get("email")?.as_str()?;
                let (up, down) = self.client_traffic.get(email).copied().unwrap_or((0, 0));
                Some(json!({
                    "inboundId": self.id,
                    "email": email,
                    "enable": c.get("enable").and_then(Value::as_bool).unwrap_or(true),
                    "up": up,
                    "down": down,
                }))
            })
            .collect();

        json!({
            "id": self.id,
            "up": self.up,
            "down": self.down,
            "total": self.total,
            "remark": self.remark,
            "enable": self.enable,
            "expiryTime": 0,
            "listen": "",
            "port": self.port,
            "protocol": self.protocol,
            "settings": json!({"clients": self.clients}).to_string(),
            "streamSettings": self.stream_settings.to_string(),
            "sniffing": "{}",
            "clientStats": stats,
        })
    }
}

fn client_matches(client: &Value, key: &str) -> bool {
    client.get("email").and_then(Value::as_str) == Some(key)
        || client.get("id").and_then(Value::as_str) == Some(key)
        || client.get("password").and_then(Value::as_str) == Some(key)
}

/// Parses a settings field that panels send as a JSON string.
fn embedded_json(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

fn body_clients(body: &Value) -> Vec<Value> {
    embedded_json(body.get("settings"))
        .get("clients")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn body_inbound_id(body: &Value) -> Option<u32> {
    body.get("id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
}

struct PanelState {
    username: String,
    password: String,
    sessions: HashSet<String>,
    inbounds: BTreeMap<u32, MockInbound>,
    next_id: u32,
    onlines: Vec<String>,
    log: Vec<String>,
}

impl PanelState {
    fn handle(&mut self, request: &RemoteRequest) -> RemoteResponse {
        let body = request.body.clone().unwrap_or(Value::Null);
        let path = request.path.as_str();

        if path == "/panel/api/server/status" {
            return RemoteResponse::ok(self.status());
        }
        let Some(rest) = path.strip_prefix(INBOUNDS) else {
            return RemoteResponse::refused(format!("unknown path {path}"));
        };
        let segments: Vec<&str> = rest.trim_start_matches('/').split('/').collect();

        match (request.method, segments.as_slice()) {
            (Method::Get, ["list"]) => RemoteResponse::ok(Value::Array(
                self.inbounds.values().map(MockInbound::to_json).collect(),
            )),
            (Method::Post, ["onlines"]) => RemoteResponse::ok(json!(self.onlines)),
            (Method::Post, ["add"]) => self.add_inbound(&body),
            (Method::Post, ["del", id]) => match parse_id(id) {
                Some(id) if self.inbounds.remove(&id).is_some() => RemoteResponse::ok(Value::Null),
                _ => RemoteResponse::refused("Delete inbound failed: record not found"),
            },
            (Method::Post, ["update", id]) => self.update_inbound(parse_id(id), &body),
            (Method::Post, ["addClient"]) => self.add_clients(&body),
            (Method::Post, ["updateClient", client_id]) => self.update_client(client_id, &body),
            (Method::Post, [id, "delClientByEmail", email]) => {
                self.with_inbound(parse_id(id), |inbound| {
                    let before = inbound.clients.len();
                    inbound.clients.retain(|c| !client_matches(c, email));
                    if inbound.clients.len() == before {
                        return RemoteResponse::refused(format!("Client {email} not found"));
                    }
                    inbound.client_traffic.remove(*email);
                    RemoteResponse::ok(Value::Null)
                })
            }
            (Method::Post, [id, "resetClientTraffic", email]) => {
                self.with_inbound(parse_id(id), |inbound| {
                    if inbound.find_client(email).is_none() {
                        return RemoteResponse::refused(format!("Client {email} not found"));
                    }
                    inbound.client_traffic.insert((*email).to_string(), (0, 0));
                    RemoteResponse::ok(Value::Null)
                })
            }
            (Method::Post, ["resetAllClientTraffics", id]) => {
                self.with_inbound(parse_id(id), |inbound| {
                    for counters in inbound.client_traffic.values_mut() {
                        *counters = (0, 0);
                    }
                    inbound.up = 0;
                    inbound.down = 0;
                    RemoteResponse::ok(Value::Null)
                })
            }
            _ => RemoteResponse::refused(format!("unknown path {path}")),
        }
    }

    fn with_inbound(
        &mut self,
        id: Option<u32>,
        f: impl FnOnce(&mut MockInbound) -> RemoteResponse,
    ) -> RemoteResponse {
        match id.and_then(|id| self.inbounds.get_mut(&id)) {
            Some(inbound) => f(inbound),
            None => RemoteResponse::refused("Inbound not found"),
        }
    }

    fn status(&self) -> Value {
        json!({
            "cpu": 12.5,
            "mem": {"current": 512_u64 * 1024 * 1024, "total": 2048_u64 * 1024 * 1024},
            "uptime": 86_400,
            "netTraffic": {"sent": 1_000_u64, "recv": 2_000_u64},
            "xray": {"state": "running", "version": "1.8.4"},
        })
    }

    fn add_inbound(&mut self, body: &Value) -> RemoteResponse {
        let port = body
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(0);
        if port == 0 {
            return RemoteResponse::refused("port is required");
        }
        if self.inbounds.values().any(|i| i.port == port) {
            return RemoteResponse::refused(format!("Port already exists: {port}"));
        }
        let id = self.next_id;
        self.next_id += 1;

        let protocol = body.get("protocol").and_then(Value::as_str).unwrap_or("vless");
        let mut inbound = MockInbound::new(id, port, protocol);
        if let Some(remark) = body.get("remark").and_then(Value::as_str) {
            inbound.remark = remark.to_string();
        }
        inbound.enable = body.get("enable").and_then(Value::as_bool).unwrap_or(true);
        for client in body_clients(body) {
            if let Some(email) = client.get("email").and_then(Value::as_str) {
                inbound.client_traffic.insert(email.to_string(), (0, 0));
            }
            inbound.clients.push(client);
        }
        let obj = inbound.to_json();
        self.inbounds.insert(id, inbound);
        RemoteResponse::ok(obj)
    }

    fn update_inbound(&mut self, id: Option<u32>, body: &Value) -> RemoteResponse {
        self.with_inbound(id, |inbound| {
            if let Some(enable) = body.get("enable").and_then(Value::as_bool) {
                inbound.enable = enable;
            }
            if let Some(remark) = body.get("remark").and_then(Value::as_str) {
                inbound.remark = remark.to_string();
            }
            RemoteResponse::ok(inbound.to_json())
        })
    }

    fn add_clients(&mut self, body: &Value) -> RemoteResponse {
        let clients = body_clients(body);
        self.with_inbound(body_inbound_id(body), |inbound| {
            for client in &clients {
                let Some(email) = client.get("email").and_then(Value::as_str) else {
                    return RemoteResponse::refused("client email is required");
                };
                if inbound.find_client(email).is_some() {
                    return RemoteResponse::refused(format!("Duplicate email: {email}"));
                }
            }
            for client in clients {
                if let Some(email) = client.get("email").and_then(Value::as_str) {
                    inbound.client_traffic.insert(email.to_string(), (0, 0));
                }
                inbound.clients.push(client);
            }
            RemoteResponse::ok(Value::Null)
        })
    }

    fn update_client(&mut self, client_id: &str, body: &Value) -> RemoteResponse {
        let Some(replacement) = body_clients(body).into_iter().next() else {
            return RemoteResponse::refused("client is required");
        };
        self.with_inbound(body_inbound_id(body), |inbound| {
            let Some(existing) = inbound.clients.iter_mut().find(|c| client_matches(c, client_id)) else {
                return RemoteResponse::refused(format!("Client {client_id} not found"));
            };
            if let (Some(target), Some(fields)) = (existing.as_object_mut(), replacement.as_object()) {
                for (k, v) in fields {
                    target.insert(k.clone(), v.clone());
                }
            }
            RemoteResponse::ok(Value::Null)
        })
    }
}

fn parse_id(raw: &str) -> Option<u32> {
    raw.parse().ok()
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://mock-1.example";

    async fn logged_in() -> (MockPanelFleet, Arc<MockPanel>, SessionToken) {
        let fleet = MockPanelFleet::new();
        let panel = fleet.add_panel(URL, "admin", "pw");
        let token = fleet
            .login(URL, &PanelCredentials::new("admin", "pw"))
            .await
            .unwrap();
        (fleet, panel, token)
    }

    #[tokio::test]
    async fn test_login_and_bad_credentials() {
        let (fleet, panel, _) = logged_in().await;
        let err = fleet
            .login(URL, &PanelCredentials::new("admin", "wrong"))
            .await
            .unwrap_err();
        assert!(err.is_login_failed());
        assert_eq!(panel.login_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_host_is_unreachable() {
        let fleet = MockPanelFleet::new();
        let err = fleet
            .login("https://nowhere", &PanelCredentials::new("a", "b"))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_expired_session_rejected() {
        let (fleet, panel, token) = logged_in().await;
        panel.expire_sessions();
        let err = fleet
            .call(URL, &token, &RemoteRequest::get("/panel/api/inbounds/list"))
            .await
            .unwrap_err();
        assert!(err.is_auth_rejected());
    }

    #[tokio::test]
    async fn test_client_lifecycle() {
        let (fleet, panel, token) = logged_in().await;
        panel.add_inbound(1, 443, "vless");

        let add = RemoteRequest::post_json(
            "/panel/api/inbounds/addClient",
            json!({"id": 1, "settings": json!({"clients": [{"id": "u-1", "email": "alice", "enable": true}]}).to_string()}),
        );
        assert!(fleet.call(URL, &token, &add).await.unwrap().success);
        let again = fleet.call(URL, &token, &add).await.unwrap();
        assert!(!again.success);
        assert!(again.msg.contains("Duplicate email"));

        let disable = RemoteRequest::post_json(
            "/panel/api/inbounds/updateClient/u-1",
            json!({"id": 1, "settings": json!({"clients": [{"id": "u-1", "email": "alice", "enable": false}]}).to_string()}),
        );
        assert!(fleet.call(URL, &token, &disable).await.unwrap().success);
        assert_eq!(panel.client_enabled(1, "alice"), Some(false));

        let del = RemoteRequest::post("/panel/api/inbounds/1/delClientByEmail/alice");
        assert!(fleet.call(URL, &token, &del).await.unwrap().success);
        let gone = fleet.call(URL, &token, &del).await.unwrap();
        assert!(gone.msg.contains("not found"));
    }

    #[tokio::test]
    async fn test_inbound_list_shape() {
        let (fleet, panel, token) = logged_in().await;
        panel.add_inbound(4, 8443, "trojan");
        panel.add_client(4, "bob");
        panel.set_traffic(4, 10, 20);

        let resp = fleet
            .call(URL, &token, &RemoteRequest::get("/panel/api/inbounds/list"))
            .await
            .unwrap();
        let inbound = &resp.obj[0];
        assert_eq!(inbound["id"], 4);
        assert_eq!(inbound["up"], 10);
        assert!(inbound["settings"].is_string());
        assert_eq!(inbound["clientStats"][0]["email"], "bob");
    }

    #[tokio::test]
    async fn test_duplicate_port_refused() {
        let (fleet, panel, token) = logged_in().await;
        panel.add_inbound(1, 443, "vless");
        let resp = fleet
            .call(
                URL,
                &token,
                &RemoteRequest::post_json("/panel/api/inbounds/add", json!({"port": 443, "protocol": "vless"})),
            )
            .await
            .unwrap();
        assert!(!resp.success);
        assert!(resp.msg.contains("already exists"));
    }
}
