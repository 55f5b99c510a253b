// ============================================
// File: crates/fleet-server/src/services/actions.rs
// ============================================
//! # Panel Action Adapter
//!
//! ## Creation Reason
//! Translates one step of a [`BatchAction`] on one node into panel API
//! calls and classifies the answer.
//!
//! ## Main Functionality
//! - `run_step`: Executes one `(action, scope)` step through the session
//!   manager
//! - `StepOutcome`: Success / skipped (already satisfied) / failed
//!
//! ## Step Mapping
//! ```text
//! users.add            POST addClient                     dup email  → skipped
//! users.update         list → POST updateClient/{id}      no change  → skipped
//! users.enable|disable list → POST updateClient/{id}      same flag  → skipped
//! users.delete         POST {ib}/delClientByEmail/{email} not found  → skipped
//! users.reset_traffic  POST {ib}/resetClientTraffic/{email}
//! inbounds.add         POST add                           port taken → skipped
//! inbounds.delete      POST del/{id}                      not found  → skipped
//! inbounds.enable|...  list → POST update/{id}            same flag  → skipped
//! inbounds.reset_...   POST resetAllClientTraffics/{id}
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Panels embed `settings` / `streamSettings` / `sniffing` as JSON strings
//! - Every error text leaving this module has passed `redact_text`
//! - `node_level` failures (session, credential, network) abort the rest of
//!   the node's steps; panel refusals do not
//!
//! ## Last Modified
//! v0.1.0 - Initial action adapter

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{json, Value};

use fleet_common::NodeId;
use fleet_core::action::{ActionVerb, ClientSpec, InboundSpec};
use fleet_core::model::redact_text;
use fleet_core::{BatchAction, StepScope};
use fleet_transport::{RemoteRequest, RemoteResponse};

use crate::services::session::NodeSessionManager;

const INBOUNDS: &str = "/panel/api/inbounds";

/// Bytes escaped when a client key becomes a path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'@')
    .remove(b'+');

// ============================================
// StepOutcome
// ============================================

/// Classified result of one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Remote state changed.
    Success(Option<Value>),
    /// Remote state already satisfied the step.
    Skipped(String),
    /// The step did not complete.
    Failed {
        /// Sanitized error text.
        message: String,
        /// The node itself could not be used (login, credential, network).
        node_level: bool,
    },
}

impl StepOutcome {
    fn refused(message: impl AsRef<str>) -> Self {
        Self::Failed {
            message: redact_text(message.as_ref()),
            node_level: false,
        }
    }

    fn node_failure(message: impl AsRef<str>) -> Self {
        Self::Failed {
            message: redact_text(message.as_ref()),
            node_level: true,
        }
    }
}

/// Failure of a step before a classifiable panel answer arrived.
type StepError = StepOutcome;

// ============================================
// Dispatch
// ============================================

/// Executes one step of `action` on `node`.
pub async fn run_step(
    sessions: &NodeSessionManager,
    node: &NodeId,
    action: &BatchAction,
    scope: &StepScope,
) -> StepOutcome {
    let step = Step { sessions, node };
    let result = match (action, scope) {
        (BatchAction::UsersAdd(_), StepScope::Client { inbound_id, email }) => match action.client(email) {
            Some(client) => step.add_client(*inbound_id, client).await,
            None => Err(StepOutcome::refused(format!("no client definition for {email}"))),
        },
        (BatchAction::UsersUpdate(p), StepScope::Client { inbound_id, .. }) => {
            step.update_client(*inbound_id, &p.client).await
        }
        (BatchAction::UsersEnable(_), StepScope::Client { inbound_id, email }) => {
            step.set_client_enabled(*inbound_id, email, true).await
        }
        (BatchAction::UsersDisable(_), StepScope::Client { inbound_id, email }) => {
            step.set_client_enabled(*inbound_id, email, false).await
        }
        (BatchAction::UsersDelete(_), StepScope::Client { inbound_id, email }) => {
            let path = format!("{INBOUNDS}/{inbound_id}/delClientByEmail/{}", utf8_percent_encode(email, PATH_SEGMENT));
            step.post(RemoteRequest::post(path), ActionVerb::Delete).await
        }
        (BatchAction::UsersResetTraffic(_), StepScope::Client { inbound_id, email }) => {
            let path = format!("{INBOUNDS}/{inbound_id}/resetClientTraffic/{}", utf8_percent_encode(email, PATH_SEGMENT));
            step.post(RemoteRequest::post(path), ActionVerb::ResetTraffic).await
        }
        (BatchAction::InboundsAdd(spec), StepScope::Port { .. }) => {
            step.post(RemoteRequest::post_json(format!("{INBOUNDS}/add"), inbound_body(spec)), ActionVerb::Add)
                .await
        }
        (BatchAction::InboundsDelete(_), StepScope::Inbound { id }) => {
            step.post(RemoteRequest::post(format!("{INBOUNDS}/del/{id}")), ActionVerb::Delete)
                .await
        }
        (BatchAction::InboundsEnable(_), StepScope::Inbound { id }) => {
            step.set_inbound_enabled(*id, true).await
        }
        (BatchAction::InboundsDisable(_), StepScope::Inbound { id }) => {
            step.set_inbound_enabled(*id, false).await
        }
        (BatchAction::InboundsResetTraffic(_), StepScope::Inbound { id }) => {
            step.post(
                RemoteRequest::post(format!("{INBOUNDS}/resetAllClientTraffics/{id}")),
                ActionVerb::ResetTraffic,
            )
            .await
        }
        (action, scope) => Err(StepOutcome::refused(format!("{scope} is not a step of {action}"))),
    };
    result.unwrap_or_else(|failure| failure)
}

// ============================================
// Step Implementations
// ============================================

struct Step<'a> {
    sessions: &'a NodeSessionManager,
    node: &'a NodeId,
}

impl Step<'_> {
    async fn call(&self, request: &RemoteRequest) -> Result<RemoteResponse, StepError> {
        self.sessions
            .invoke(self.node, request)
            .await
            .map_err(|e| StepOutcome::node_failure(e.to_string()))
    }

    /// Posts a mutation and classifies a refusal by verb.
    async fn post(&self, request: RemoteRequest, verb: ActionVerb) -> Result<StepOutcome, StepError> {
        let response = self.call(&request).await?;
        Ok(classify(response, verb))
    }

    async fn add_client(&self, inbound_id: u32, client: &ClientSpec) -> Result<StepOutcome, StepError> {
        let client = serde_json::to_value(client).map_err(|e| StepOutcome::refused(e.to_string()))?;
        let body = json!({
            "id": inbound_id,
            "settings": json!({ "clients": [client] }).to_string(),
        });
        self.post(RemoteRequest::post_json(format!("{INBOUNDS}/addClient"), body), ActionVerb::Add)
            .await
    }

    async fn update_client(&self, inbound_id: u32, spec: &ClientSpec) -> Result<StepOutcome, StepError> {
        let existing = self.find_client(inbound_id, &spec.email).await?;
        let Value::Object(mut merged) = existing.clone() else {
            return Err(StepOutcome::refused(format!("client {} is malformed", spec.email)));
        };
        let Value::Object(fields) = serde_json::to_value(spec).map_err(|e| StepOutcome::refused(e.to_string()))? else {
            return Err(StepOutcome::refused("client definition is not an object"));
        };
        for (k, v) in fields {
            merged.insert(k, v);
        }
        let merged = Value::Object(merged);
        if merged == existing {
            return Ok(StepOutcome::Skipped("client already up to date".into()));
        }
        self.write_client(inbound_id, &existing, merged).await
    }

    async fn set_client_enabled(&self, inbound_id: u32, email: &str, enable: bool) -> Result<StepOutcome, StepError> {
        let existing = self.find_client(inbound_id, email).await?;
        if existing.get("enable").and_then(Value::as_bool).unwrap_or(true) == enable {
            return Ok(StepOutcome::Skipped(format!("client already {}", enabled_word(enable))));
        }
        let mut updated = existing.clone();
        if let Some(obj) = updated.as_object_mut() {
            obj.insert("enable".into(), Value::Bool(enable));
        }
        self.write_client(inbound_id, &existing, updated).await
    }

    async fn write_client(&self, inbound_id: u32, existing: &Value, client: Value) -> Result<StepOutcome, StepError> {
        let key = client_key(existing)
            .ok_or_else(|| StepOutcome::refused("client has neither id nor email"))?;
        let body = json!({
            "id": inbound_id,
            "settings": json!({ "clients": [client] }).to_string(),
        });
        let path = format!("{INBOUNDS}/updateClient/{}", utf8_percent_encode(&key, PATH_SEGMENT));
        self.post(RemoteRequest::post_json(path, body), ActionVerb::Update).await
    }

    async fn set_inbound_enabled(&self, id: u32, enable: bool) -> Result<StepOutcome, StepError> {
        let inbound = self.find_inbound(id).await?;
        if inbound.get("enable").and_then(Value::as_bool) == Some(enable) {
            return Ok(StepOutcome::Skipped(format!("inbound already {}", enabled_word(enable))));
        }
        let mut body = inbound;
        if let Some(obj) = body.as_object_mut() {
            obj.remove("clientStats");
            obj.insert("enable".into(), Value::Bool(enable));
        }
        self.post(
            RemoteRequest::post_json(format!("{INBOUNDS}/update/{id}"), body),
            ActionVerb::Update,
        )
        .await
    }

    // ========================================
    // Reads
    // ========================================

    async fn inbounds(&self) -> Result<Vec<Value>, StepError> {
        let response = self.call(&RemoteRequest::get(format!("{INBOUNDS}/list"))).await?;
        if !response.success {
            return Err(StepOutcome::refused(format!("listing inbounds refused: {}", response.msg)));
        }
        match response.obj {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            _ => Err(StepOutcome::refused("inbound list is not an array")),
        }
    }

    async fn find_inbound(&self, id: u32) -> Result<Value, StepError> {
        self.inbounds()
            .await?
            .into_iter()
            .find(|i| i.get("id").and_then(Value::as_u64) == Some(u64::from(id)))
            .ok_or_else(|| StepOutcome::refused(format!("inbound {id} not found")))
    }

    async fn find_client(&self, inbound_id: u32, email: &str) -> Result<Value, StepError> {
        let inbound = self.find_inbound(inbound_id).await?;
        embedded_json(inbound.get("settings"))
            .get("clients")
            .and_then(Value::as_array)
            .and_then(|clients| {
                clients
                    .iter()
                    .find(|c| c.get("email").and_then(Value::as_str) == Some(email))
                    .cloned()
            })
            .ok_or_else(|| StepOutcome::refused(format!("client {email} not found in inbound {inbound_id}")))
    }
}

// ============================================
// Classification
// ============================================

/// Maps a panel answer to a step outcome.
fn classify(response: RemoteResponse, verb: ActionVerb) -> StepOutcome {
    if response.success {
        // Only the remote id of a created object is kept; full objects carry
        // client secrets.
        let detail = response
            .obj
            .get("id")
            .filter(|id| id.is_u64())
            .map(|id| json!({ "remoteId": id }));
        return StepOutcome::Success(detail);
    }
    if already_satisfied(verb, &response.msg) {
        return StepOutcome::Skipped(redact_text(&response.msg));
    }
    let msg = if response.msg.is_empty() {
        "panel refused the request".to_string()
    } else {
        response.msg
    };
    StepOutcome::refused(msg)
}

/// Returns `true` if a refusal means the desired state already holds.
fn already_satisfied(verb: ActionVerb, msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    match verb {
        ActionVerb::Add => msg.contains("duplicate") || msg.contains("already exist"),
        ActionVerb::Delete => msg.contains("not found") || msg.contains("not exist"),
        ActionVerb::Enable | ActionVerb::Disable => msg.contains("already"),
        ActionVerb::Update | ActionVerb::ResetTraffic => false,
    }
}

// ============================================
// Helpers
// ============================================

fn inbound_body(spec: &InboundSpec) -> Value {
    json!({
        "remark": spec.remark,
        "port": spec.port,
        "protocol": spec.protocol,
        "listen": spec.listen,
        "enable": spec.enable,
        "total": spec.total,
        "expiryTime": spec.expiry_time,
        "settings": spec.settings.to_string(),
        "streamSettings": spec.stream_settings.to_string(),
        "sniffing": spec.sniffing.to_string(),
    })
}

/// Parses a field that panels send as a JSON string.
fn embedded_json(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

/// Key the panel uses to address a client: UUID, trojan password, or email.
fn client_key(client: &Value) -> Option<String> {
    ["id", "password", "email"]
        .iter()
        .find_map(|k| client.get(*k).and_then(Value::as_str).filter(|s| !s.is_empty()))
        .map(ToString::to_string)
}

const fn enabled_word(enable: bool) -> &'static str {
    if enable {
        "enabled"
    } else {
        "disabled"
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use fleet_core::action::{ClientRefPayload, InboundRefPayload, UsersAddPayload, UsersUpdatePayload};
    use fleet_core::crypto::CredentialVault;
    use fleet_core::model::NodeDraft;
    use fleet_transport::{MockPanel, MockPanelFleet, PanelTransport};

    use crate::services::registry::NodeRegistry;
    use crate::store::{MemoryStore, RecordStore};

    const URL: &str = "https://edge-1.example";

    async fn setup() -> (Arc<MockPanel>, NodeSessionManager, NodeId) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let vault = Arc::new(CredentialVault::from_material(b"actions test key material", 1).unwrap());
        let registry = Arc::new(NodeRegistry::new(store, vault));
        let fleet = Arc::new(MockPanelFleet::new());
        let panel = fleet.add_panel(URL, "admin", "pw");
        panel.add_inbound(1, 443, "vless");

        let id: NodeId = "edge-1".parse().unwrap();
        let draft = NodeDraft {
            name: "Edge 1".into(),
            base_url: URL.into(),
            username: "admin".into(),
            password: Some("pw".into()),
            ..NodeDraft::default()
        };
        registry.add(Some(id.clone()), &draft).await.unwrap();
        let transport: Arc<dyn PanelTransport> = fleet;
        let sessions = NodeSessionManager::new(registry, transport, Duration::from_secs(600));
        (panel, sessions, id)
    }

    fn client_scope(email: &str) -> StepScope {
        StepScope::Client {
            inbound_id: 1,
            email: email.into(),
        }
    }

    #[tokio::test]
    async fn test_add_client_then_duplicate_is_skipped() {
        let (panel, sessions, id) = setup().await;
        let mut action = BatchAction::UsersAdd(UsersAddPayload {
            inbound_ids: vec![1],
            clients: vec![ClientSpec::new("alice")],
        });
        action.assign_client_ids();

        let first = run_step(&sessions, &id, &action, &client_scope("alice")).await;
        assert!(matches!(first, StepOutcome::Success(_)));
        assert_eq!(panel.client_emails(1), vec!["alice".to_string()]);

        let second = run_step(&sessions, &id, &action, &client_scope("alice")).await;
        assert!(matches!(second, StepOutcome::Skipped(_)), "{second:?}");
    }

    #[tokio::test]
    async fn test_disable_is_idempotent() {
        let (panel, sessions, id) = setup().await;
        panel.add_client(1, "bob");
        let action = BatchAction::UsersDisable(ClientRefPayload {
            inbound_ids: vec![1],
            emails: vec!["bob".into()],
        });

        let first = run_step(&sessions, &id, &action, &client_scope("bob")).await;
        assert!(matches!(first, StepOutcome::Success(_)), "{first:?}");
        assert_eq!(panel.client_enabled(1, "bob"), Some(false));

        let second = run_step(&sessions, &id, &action, &client_scope("bob")).await;
        assert_eq!(second, StepOutcome::Skipped("client already disabled".into()));
    }

    #[tokio::test]
    async fn test_update_missing_client_fails() {
        let (_, sessions, id) = setup().await;
        let action = BatchAction::UsersUpdate(UsersUpdatePayload {
            inbound_ids: vec![1],
            client: ClientSpec::new("ghost"),
        });
        let outcome = run_step(&sessions, &id, &action, &client_scope("ghost")).await;
        assert!(matches!(outcome, StepOutcome::Failed { node_level: false, .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_client_is_skipped() {
        let (_, sessions, id) = setup().await;
        let action = BatchAction::UsersDelete(ClientRefPayload {
            inbound_ids: vec![1],
            emails: vec!["nobody".into()],
        });
        let outcome = run_step(&sessions, &id, &action, &client_scope("nobody")).await;
        assert!(matches!(outcome, StepOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_inbound_toggle() {
        let (panel, sessions, id) = setup().await;
        let disable = BatchAction::InboundsDisable(InboundRefPayload { inbound_ids: vec![1] });
        let scope = StepScope::Inbound { id: 1 };

        assert!(matches!(
            run_step(&sessions, &id, &disable, &scope).await,
            StepOutcome::Success(_)
        ));
        assert_eq!(panel.inbound_enabled(1), Some(false));
        assert!(matches!(
            run_step(&sessions, &id, &disable, &scope).await,
            StepOutcome::Skipped(_)
        ));
    }

    #[tokio::test]
    async fn test_add_inbound_on_taken_port_is_skipped() {
        let (_, sessions, id) = setup().await;
        let action = BatchAction::InboundsAdd(InboundSpec {
            remark: "edge".into(),
            port: 443,
            protocol: "vless".into(),
            listen: String::new(),
            enable: true,
            total: 0,
            expiry_time: 0,
            settings: json!({"clients": []}),
            stream_settings: json!({"network": "tcp"}),
            sniffing: json!({}),
        });
        let outcome = run_step(&sessions, &id, &action, &StepScope::Port { port: 443 }).await;
        assert!(matches!(outcome, StepOutcome::Skipped(_)), "{outcome:?}");
    }

    #[tokio::test]
    async fn test_add_inbound_on_free_port() {
        let (panel, sessions, id) = setup().await;
        let action = BatchAction::InboundsAdd(InboundSpec {
            remark: "edge-alt".into(),
            port: 8443,
            protocol: "trojan".into(),
            listen: String::new(),
            enable: true,
            total: 0,
            expiry_time: 0,
            settings: json!({"clients": []}),
            stream_settings: json!({"network": "tcp"}),
            sniffing: json!({}),
        });
        let outcome = run_step(&sessions, &id, &action, &StepScope::Port { port: 8443 }).await;
        assert!(matches!(outcome, StepOutcome::Success(_)), "{outcome:?}");
        assert_eq!(panel.inbound_port(2), Some(8443));
        assert!(panel
            .call_log()
            .contains(&"POST /panel/api/inbounds/add".to_string()));
    }

    #[tokio::test]
    async fn test_reset_client_traffic() {
        let (panel, sessions, id) = setup().await;
        panel.add_client(1, "carol");
        panel.set_client_traffic(1, "carol", 10, 20);
        let action = BatchAction::UsersResetTraffic(ClientRefPayload {
            inbound_ids: vec![1],
            emails: vec!["carol".into()],
        });

        let outcome = run_step(&sessions, &id, &action, &client_scope("carol")).await;
        assert!(matches!(outcome, StepOutcome::Success(_)), "{outcome:?}");
        assert_eq!(panel.client_traffic(1, "carol"), Some((0, 0)));
    }

    #[tokio::test]
    async fn test_unreachable_is_node_level() {
        let (panel, sessions, id) = setup().await;
        panel.set_unreachable(true);
        let action = BatchAction::InboundsResetTraffic(InboundRefPayload { inbound_ids: vec![1] });
        let outcome = run_step(&sessions, &id, &action, &StepScope::Inbound { id: 1 }).await;
        assert!(matches!(outcome, StepOutcome::Failed { node_level: true, .. }));
    }

    #[test]
    fn test_already_satisfied_table() {
        assert!(already_satisfied(ActionVerb::Add, "Duplicate email: a@b"));
        assert!(already_satisfied(ActionVerb::Add, "Port already exists: 443"));
        assert!(already_satisfied(ActionVerb::Delete, "Delete inbound failed: record not found"));
        assert!(!already_satisfied(ActionVerb::ResetTraffic, "Client x not found"));
    }

    #[test]
    fn test_client_key_escaping() {
        let segment = |raw: &str| utf8_percent_encode(raw, PATH_SEGMENT).to_string();
        assert_eq!(segment("alice@example.com"), "alice@example.com");
        assert_eq!(segment("a b/c"), "a%20b%2Fc");
        assert_eq!(segment("bob+1~x"), "bob+1~x");
        assert_eq!(segment("ü?"), "%C3%BC%3F");
    }
}
