// ============================================
// File: crates/fleet-core/src/action.rs
// ============================================
//! # Batch Action Catalog
//!
//! ## Creation Reason
//! A batch names a `type`/`action` pair and an untyped payload on the wire.
//! This module turns that triple into a closed enum with typed payloads so
//! unsupported combinations and malformed payloads are rejected before any
//! node is contacted.
//!
//! ## Main Functionality
//! - `ActionDomain` / `ActionVerb`: The two halves of an action signature
//! - `BatchAction`: Every supported signature with its typed payload
//! - `StepScope`: One remote sub-resource an action touches on every node
//!
//! ## Catalog
//! ```text
//! users.add            inbound_ids × clients   → Client steps
//! users.update         inbound_ids × client    → Client steps
//! users.delete         inbound_ids × emails    → Client steps   (destructive)
//! users.enable         inbound_ids × emails    → Client steps
//! users.disable        inbound_ids × emails    → Client steps   (destructive)
//! users.reset_traffic  inbound_ids × emails    → Client steps   (destructive)
//! inbounds.add         inbound spec            → Port step
//! inbounds.delete      inbound_ids             → Inbound steps  (destructive)
//! inbounds.enable      inbound_ids             → Inbound steps
//! inbounds.disable     inbound_ids             → Inbound steps  (destructive)
//! inbounds.reset_traffic inbound_ids           → Inbound steps  (destructive)
//! ```
//! `inbounds.update` is not in the catalog: inbound bodies differ per node.
//!
//! ## Last Modified
//! v0.1.0 - Initial catalog

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fleet_common::random_token;

use crate::error::{CoreError, Result};

// ============================================
// Signature Halves
// ============================================

/// Resource family an action operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDomain {
    /// Clients inside inbounds.
    Users,
    /// Inbounds themselves.
    Inbounds,
}

impl ActionDomain {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Inbounds => "inbounds",
        }
    }
}

impl fmt::Display for ActionDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionDomain {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "users" => Ok(Self::Users),
            "inbounds" => Ok(Self::Inbounds),
            other => Err(CoreError::unsupported(other, "*")),
        }
    }
}

/// Verb applied to the resource family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionVerb {
    /// Create.
    Add,
    /// Modify in place.
    Update,
    /// Remove.
    Delete,
    /// Turn on.
    Enable,
    /// Turn off.
    Disable,
    /// Zero the traffic counters.
    ResetTraffic,
}

impl ActionVerb {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::ResetTraffic => "reset_traffic",
        }
    }

    /// Returns `true` for verbs that lose state or cut users off.
    #[must_use]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Delete | Self::Disable | Self::ResetTraffic)
    }
}

impl fmt::Display for ActionVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionVerb {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Self::Add),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "enable" => Ok(Self::Enable),
            "disable" => Ok(Self::Disable),
            "reset_traffic" | "resetTraffic" => Ok(Self::ResetTraffic),
            other => Err(CoreError::unsupported("*", other)),
        }
    }
}

// ============================================
// Payload Types
// ============================================

/// A client (user) definition inside an inbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSpec {
    /// Unique client label; panels key clients by it.
    pub email: String,
    /// Client UUID or password; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Whether the client may connect.
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Traffic quota in bytes, 0 for unlimited.
    #[serde(default, rename = "totalGB")]
    pub total_gb: u64,
    /// Expiry as Unix millis, 0 for never.
    #[serde(default)]
    pub expiry_time: i64,
    /// Concurrent IP limit, 0 for unlimited.
    #[serde(default)]
    pub limit_ip: u32,
    /// XTLS flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    /// Subscription id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_id: Option<String>,
}

impl ClientSpec {
    /// Creates an enabled client with no limits.
    #[must_use]
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            id: None,
            enable: true,
            total_gb: 0,
            expiry_time: 0,
            limit_ip: 0,
            flow: None,
            sub_id: None,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Payload of `users.add`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsersAddPayload {
    /// Inbounds to add every client to.
    pub inbound_ids: Vec<u32>,
    /// Clients to add.
    pub clients: Vec<ClientSpec>,
}

/// Payload of `users.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsersUpdatePayload {
    /// Inbounds holding the client.
    pub inbound_ids: Vec<u32>,
    /// New client definition, matched by email.
    pub client: ClientSpec,
}

/// Payload naming existing clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRefPayload {
    /// Inbounds holding the clients.
    pub inbound_ids: Vec<u32>,
    /// Client emails.
    pub emails: Vec<String>,
}

/// Payload naming existing inbounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRefPayload {
    /// Inbound ids.
    pub inbound_ids: Vec<u32>,
}

/// Full inbound definition for `inbounds.add`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundSpec {
    /// Display remark.
    #[serde(default)]
    pub remark: String,
    /// Listening port; the panel rejects duplicates.
    pub port: u16,
    /// Proxy protocol (`vless`, `vmess`, `trojan`, ...).
    pub protocol: String,
    /// Listen address, empty for all.
    #[serde(default)]
    pub listen: String,
    /// Whether the inbound starts enabled.
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Traffic quota in bytes, 0 for unlimited.
    #[serde(default)]
    pub total: u64,
    /// Expiry as Unix millis, 0 for never.
    #[serde(default)]
    pub expiry_time: i64,
    /// Protocol settings object.
    #[serde(default = "empty_object")]
    pub settings: Value,
    /// Transport settings object.
    #[serde(default = "empty_object")]
    pub stream_settings: Value,
    /// Sniffing settings object.
    #[serde(default = "empty_object")]
    pub sniffing: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

// ============================================
// StepScope
// ============================================

/// One remote sub-resource touched by an action on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepScope {
    /// A whole inbound.
    Inbound {
        /// Inbound id.
        id: u32,
    },
    /// One client inside an inbound.
    Client {
        /// Inbound id.
        #[serde(rename = "inboundId")]
        inbound_id: u32,
        /// Client email.
        email: String,
    },
    /// An inbound to be created on a port.
    Port {
        /// Listening port.
        port: u16,
    },
}

impl fmt::Display for StepScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound { id } => write!(f, "inbound:{id}"),
            Self::Client { inbound_id, email } => write!(f, "client:{inbound_id}/{email}"),
            Self::Port { port } => write!(f, "port:{port}"),
        }
    }
}

// ============================================
// BatchAction
// ============================================

/// Every supported `type.action` pair with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchAction {
    /// `users.add`
    UsersAdd(UsersAddPayload),
    /// `users.update`
    UsersUpdate(UsersUpdatePayload),
    /// `users.delete`
    UsersDelete(ClientRefPayload),
    /// `users.enable`
    UsersEnable(ClientRefPayload),
    /// `users.disable`
    UsersDisable(ClientRefPayload),
    /// `users.reset_traffic`
    UsersResetTraffic(ClientRefPayload),
    /// `inbounds.add`
    InboundsAdd(InboundSpec),
    /// `inbounds.delete`
    InboundsDelete(InboundRefPayload),
    /// `inbounds.enable`
    InboundsEnable(InboundRefPayload),
    /// `inbounds.disable`
    InboundsDisable(InboundRefPayload),
    /// `inbounds.reset_traffic`
    InboundsResetTraffic(InboundRefPayload),
}

impl BatchAction {
    /// Builds and validates an action from its wire parts.
    ///
    /// # Errors
    /// - `UnsupportedAction` for pairs outside the catalog
    /// - `InvalidPayload` if the payload doesn't match or fails validation
    pub fn from_parts(domain: &str, verb: &str, payload: Value) -> Result<Self> {
        let unsupported = || CoreError::unsupported(domain, verb);
        let d = ActionDomain::from_str(domain).map_err(|_| unsupported())?;
        let v = ActionVerb::from_str(verb).map_err(|_| unsupported())?;
        let signature = format!("{d}.{v}");

        let action = match (d, v) {
            (ActionDomain::Users, ActionVerb::Add) => Self::UsersAdd(parse(&signature, payload)?),
            (ActionDomain::Users, ActionVerb::Update) => {
                Self::UsersUpdate(parse(&signature, payload)?)
            }
            (ActionDomain::Users, ActionVerb::Delete) => {
                Self::UsersDelete(parse(&signature, payload)?)
            }
            (ActionDomain::Users, ActionVerb::Enable) => {
                Self::UsersEnable(parse(&signature, payload)?)
            }
            (ActionDomain::Users, ActionVerb::Disable) => {
                Self::UsersDisable(parse(&signature, payload)?)
            }
            (ActionDomain::Users, ActionVerb::ResetTraffic) => {
                Self::UsersResetTraffic(parse(&signature, payload)?)
            }
            (ActionDomain::Inbounds, ActionVerb::Add) => {
                Self::InboundsAdd(parse(&signature, payload)?)
            }
            (ActionDomain::Inbounds, ActionVerb::Update) => return Err(unsupported()),
            (ActionDomain::Inbounds, ActionVerb::Delete) => {
                Self::InboundsDelete(parse(&signature, payload)?)
            }
            (ActionDomain::Inbounds, ActionVerb::Enable) => {
                Self::InboundsEnable(parse(&signature, payload)?)
            }
            (ActionDomain::Inbounds, ActionVerb::Disable) => {
                Self::InboundsDisable(parse(&signature, payload)?)
            }
            (ActionDomain::Inbounds, ActionVerb::ResetTraffic) => {
                Self::InboundsResetTraffic(parse(&signature, payload)?)
            }
        };
        action.validate()?;
        Ok(action)
    }

    /// Returns the resource family.
    #[must_use]
    pub const fn domain(&self) -> ActionDomain {
        match self {
            Self::UsersAdd(_)
            | Self::UsersUpdate(_)
            | Self::UsersDelete(_)
            | Self::UsersEnable(_)
            | Self::UsersDisable(_)
            | Self::UsersResetTraffic(_) => ActionDomain::Users,
            Self::InboundsAdd(_)
            | Self::InboundsDelete(_)
            | Self::InboundsEnable(_)
            | Self::InboundsDisable(_)
            | Self::InboundsResetTraffic(_) => ActionDomain::Inbounds,
        }
    }

    /// Returns the verb.
    #[must_use]
    pub const fn verb(&self) -> ActionVerb {
        match self {
            Self::UsersAdd(_) | Self::InboundsAdd(_) => ActionVerb::Add,
            Self::UsersUpdate(_) => ActionVerb::Update,
            Self::UsersDelete(_) | Self::InboundsDelete(_) => ActionVerb::Delete,
            Self::UsersEnable(_) | Self::InboundsEnable(_) => ActionVerb::Enable,
            Self::UsersDisable(_) | Self::InboundsDisable(_) => ActionVerb::Disable,
            Self::UsersResetTraffic(_) | Self::InboundsResetTraffic(_) => {
                ActionVerb::ResetTraffic
            }
        }
    }

    /// Returns `type.action`, e.g. `users.delete`.
    #[must_use]
    pub fn signature(&self) -> String {
        format!("{}.{}", self.domain(), self.verb())
    }

    /// Returns `true` if the verb is destructive.
    #[must_use]
    pub const fn is_destructive(&self) -> bool {
        self.verb().is_destructive()
    }

    /// Serializes the typed payload back to JSON.
    #[must_use]
    pub fn payload(&self) -> Value {
        let encoded = match self {
            Self::UsersAdd(p) => serde_json::to_value(p),
            Self::UsersUpdate(p) => serde_json::to_value(p),
            Self::UsersDelete(p)
            | Self::UsersEnable(p)
            | Self::UsersDisable(p)
            | Self::UsersResetTraffic(p) => serde_json::to_value(p),
            Self::InboundsAdd(p) => serde_json::to_value(p),
            Self::InboundsDelete(p)
            | Self::InboundsEnable(p)
            | Self::InboundsDisable(p)
            | Self::InboundsResetTraffic(p) => serde_json::to_value(p),
        };
        encoded.unwrap_or(Value::Null)
    }

    /// Checks payload contents beyond their shape.
    ///
    /// # Errors
    /// Returns `InvalidPayload` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let sig = self.signature();
        let bad = |reason: &str| Err(CoreError::invalid_payload(&sig, reason));

        match self {
            Self::UsersAdd(p) => {
                check_inbound_ids(&sig, &p.inbound_ids)?;
                if p.clients.is_empty() {
                    return bad("clients must not be empty");
                }
                let mut seen = HashSet::new();
                for client in &p.clients {
                    check_email(&sig, &client.email)?;
                    if !seen.insert(client.email.as_str()) {
                        return bad("duplicate client email");
                    }
                }
                Ok(())
            }
            Self::UsersUpdate(p) => {
                check_inbound_ids(&sig, &p.inbound_ids)?;
                check_email(&sig, &p.client.email)
            }
            Self::UsersDelete(p)
            | Self::UsersEnable(p)
            | Self::UsersDisable(p)
            | Self::UsersResetTraffic(p) => {
                check_inbound_ids(&sig, &p.inbound_ids)?;
                if p.emails.is_empty() {
                    return bad("emails must not be empty");
                }
                p.emails.iter().try_for_each(|e| check_email(&sig, e))
            }
            Self::InboundsAdd(spec) => {
                if spec.port == 0 {
                    return bad("port must be non-zero");
                }
                if spec.protocol.trim().is_empty() {
                    return bad("protocol must not be empty");
                }
                Ok(())
            }
            Self::InboundsDelete(p)
            | Self::InboundsEnable(p)
            | Self::InboundsDisable(p)
            | Self::InboundsResetTraffic(p) => check_inbound_ids(&sig, &p.inbound_ids),
        }
    }

    /// Lists the sub-resources this action touches on every node, in
    /// execution order.
    #[must_use]
    pub fn scopes(&self) -> Vec<StepScope> {
        match self {
            Self::UsersAdd(p) => client_scopes(
                &p.inbound_ids,
                p.clients.iter().map(|c| c.email.as_str()),
            ),
            Self::UsersUpdate(p) => {
                client_scopes(&p.inbound_ids, std::iter::once(p.client.email.as_str()))
            }
            Self::UsersDelete(p)
            | Self::UsersEnable(p)
            | Self::UsersDisable(p)
            | Self::UsersResetTraffic(p) => {
                client_scopes(&p.inbound_ids, p.emails.iter().map(String::as_str))
            }
            Self::InboundsAdd(spec) => vec![StepScope::Port { port: spec.port }],
            Self::InboundsDelete(p)
            | Self::InboundsEnable(p)
            | Self::InboundsDisable(p)
            | Self::InboundsResetTraffic(p) => dedup(&p.inbound_ids)
                .into_iter()
                .map(|id| StepScope::Inbound { id })
                .collect(),
        }
    }

    /// Returns the client email when the action targets exactly one client.
    #[must_use]
    pub fn target_email(&self) -> Option<&str> {
        match self {
            Self::UsersAdd(p) if p.clients.len() == 1 => Some(p.clients[0].email.as_str()),
            Self::UsersUpdate(p) => Some(p.client.email.as_str()),
            Self::UsersDelete(p)
            | Self::UsersEnable(p)
            | Self::UsersDisable(p)
            | Self::UsersResetTraffic(p)
                if p.emails.len() == 1 =>
            {
                Some(p.emails[0].as_str())
            }
            _ => None,
        }
    }

    /// Looks up the client definition carried for `email`.
    #[must_use]
    pub fn client(&self, email: &str) -> Option<&ClientSpec> {
        match self {
            Self::UsersAdd(p) => p.clients.iter().find(|c| c.email == email),
            Self::UsersUpdate(p) if p.client.email == email => Some(&p.client),
            _ => None,
        }
    }

    /// Fills in missing client ids so every node receives the same one.
    pub fn assign_client_ids(&mut self) {
        if let Self::UsersAdd(p) = self {
            for client in &mut p.clients {
                if client.id.is_none() {
                    client.id = Some(generate_client_uuid());
                }
            }
        }
    }
}

impl fmt::Display for BatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain(), self.verb())
    }
}

// ============================================
// Helpers
// ============================================

fn parse<T: serde::de::DeserializeOwned>(signature: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| CoreError::invalid_payload(signature, e.to_string()))
}

fn check_inbound_ids(signature: &str, ids: &[u32]) -> Result<()> {
    if ids.is_empty() {
        return Err(CoreError::invalid_payload(signature, "inboundIds must not be empty"));
    }
    if ids.contains(&0) {
        return Err(CoreError::invalid_payload(signature, "inbound id 0 is invalid"));
    }
    Ok(())
}

fn check_email(signature: &str, email: &str) -> Result<()> {
    if email.trim().is_empty() {
        return Err(CoreError::invalid_payload(signature, "client email must not be empty"));
    }
    if email.contains('/') || email.len() > 128 {
        return Err(CoreError::invalid_payload(
            signature,
            format!("client email '{email}' is not usable"),
        ));
    }
    Ok(())
}

fn dedup(ids: &[u32]) -> Vec<u32> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn client_scopes<'a>(inbound_ids: &[u32], emails: impl Iterator<Item = &'a str> + Clone) -> Vec<StepScope> {
    let mut scopes = Vec::new();
    for inbound_id in dedup(inbound_ids) {
        let mut seen = HashSet::new();
        for email in emails.clone() {
            if seen.insert(email) {
                scopes.push(StepScope::Client {
                    inbound_id,
                    email: email.to_string(),
                });
            }
        }
    }
    scopes
}

/// Generates an RFC 4122 version-4 shaped identifier.
fn generate_client_uuid() -> String {
    let hex = random_token(16);
    let mut chars: Vec<char> = hex.chars().collect();
    chars[12] = '4';
    chars[16] = match chars[16] {
        '0' | '4' | '8' | 'c' => '8',
        '1' | '5' | '9' | 'd' => '9',
        '2' | '6' | 'a' | 'e' => 'a',
        _ => 'b',
    };
    let s: String = chars.into_iter().collect();
    format!("{}-{}-{}-{}-{}", &s[0..8], &s[8..12], &s[12..16], &s[16..20], &s[20..32])
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_parts_users_add() {
        let action = BatchAction::from_parts(
            "users",
            "add",
            json!({"inboundIds": [1, 2], "clients": [{"email": "alice"}, {"email": "bob", "totalGB": 10}]}),
        )
        .unwrap();

        assert_eq!(action.signature(), "users.add");
        assert!(!action.is_destructive());
        assert_eq!(action.scopes().len(), 4);
        assert_eq!(action.target_email(), None);
        assert!(action.client("alice").unwrap().enable);
        assert_eq!(action.client("bob").unwrap().total_gb, 10);
    }

    #[test]
    fn test_inbounds_update_unsupported() {
        let err = BatchAction::from_parts("inbounds", "update", json!({})).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedAction { .. }));

        let err = BatchAction::from_parts("routers", "add", json!({})).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedAction { .. }));

        let err = BatchAction::from_parts("users", "explode", json!({})).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedAction { .. }));
    }

    #[test]
    fn test_payload_validation() {
        let cases = [
            ("users", "add", json!({"inboundIds": [1], "clients": []})),
            ("users", "add", json!({"inboundIds": [], "clients": [{"email": "a"}]})),
            ("users", "add", json!({"inboundIds": [1], "clients": [{"email": "a"}, {"email": "a"}]})),
            ("users", "delete", json!({"inboundIds": [1], "emails": []})),
            ("users", "delete", json!({"inboundIds": [1], "emails": ["a/b"]})),
            ("inbounds", "delete", json!({"inboundIds": [0]})),
            ("inbounds", "add", json!({"port": 0, "protocol": "vless"})),
            ("inbounds", "disable", json!({"ids": [1]})),
        ];
        for (domain, verb, payload) in cases {
            let err = BatchAction::from_parts(domain, verb, payload.clone()).unwrap_err();
            assert!(err.is_request_error(), "{domain}.{verb} {payload}");
        }
    }

    #[test]
    fn test_destructive_classification() {
        for (verb, destructive) in [
            (ActionVerb::Add, false),
            (ActionVerb::Update, false),
            (ActionVerb::Enable, false),
            (ActionVerb::Delete, true),
            (ActionVerb::Disable, true),
            (ActionVerb::ResetTraffic, true),
        ] {
            assert_eq!(verb.is_destructive(), destructive, "{verb}");
        }
    }

    #[test]
    fn test_scopes_are_deduplicated() {
        let action = BatchAction::from_parts(
            "inbounds",
            "disable",
            json!({"inboundIds": [3, 3, 4]}),
        )
        .unwrap();
        assert_eq!(
            action.scopes(),
            vec![StepScope::Inbound { id: 3 }, StepScope::Inbound { id: 4 }]
        );

        let action = BatchAction::from_parts(
            "users",
            "disable",
            json!({"inboundIds": [1], "emails": ["a", "a"]}),
        )
        .unwrap();
        assert_eq!(action.scopes().len(), 1);
        assert_eq!(action.target_email(), None);
    }

    #[test]
    fn test_payload_roundtrip_through_parts() {
        let action = BatchAction::from_parts(
            "inbounds",
            "add",
            json!({"port": 443, "protocol": "vless", "remark": "edge"}),
        )
        .unwrap();
        let again = BatchAction::from_parts("inbounds", "add", action.payload()).unwrap();
        assert_eq!(action, again);
        assert_eq!(action.scopes(), vec![StepScope::Port { port: 443 }]);
    }

    #[test]
    fn test_assign_client_ids() {
        let mut action = BatchAction::from_parts(
            "users",
            "add",
            json!({"inboundIds": [1], "clients": [{"email": "a"}, {"email": "b", "id": "fixed"}]}),
        )
        .unwrap();
        action.assign_client_ids();

        let a = action.client("a").unwrap().id.clone().unwrap();
        assert_eq!(a.len(), 36);
        assert_eq!(&a[14..15], "4");
        assert_eq!(action.client("b").unwrap().id.as_deref(), Some("fixed"));
    }

    #[test]
    fn test_step_scope_display_and_json() {
        let scope = StepScope::Client {
            inbound_id: 7,
            email: "alice".into(),
        };
        assert_eq!(scope.to_string(), "client:7/alice");
        let json = serde_json::to_value(&scope).unwrap();
        assert_eq!(json, json!({"kind": "client", "inboundId": 7, "email": "alice"}));
    }
}
