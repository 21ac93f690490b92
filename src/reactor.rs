//! Client-side tool-call reactor.
//!
//! After every update of the message list the reactor looks for the newest tool
//! call matching each of four predicates and turns it into a pending interaction,
//! at most once per idempotency key. One reactor belongs to one chat session;
//! `reset` starts a new session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::Duration;

use crate::constants::{
    PROJECT_TOOL_PREFIX, TEAM_CHAT_TOOL_PREFIX, TOOL_GET_USER_LOCATION, TOOL_REQUEST_WALLET_RECORD,
    TOOL_TURN_PRIVACY_ON,
};
pub use crate::idempotency::parse_tool_call_result;
use crate::idempotency::resolve_key;
use crate::types::{ChatMessage, ToolCall};

const DEFAULT_PSEUDO_USER_PROMPT: &str = "Your teammate is waiting for a reply. Please answer on their behalf.";
const DEFAULT_TEAMMATE_LABEL: &str = "Teammate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletRecordType {
    UsernamePassword,
    SessionCookie,
    AccessToken,
}

impl WalletRecordType {
    /// Anything unrecognized becomes `AccessToken`.
    pub fn normalize(raw: Option<&str>) -> Self {
        let normalized = match raw {
            Some(s) => s.trim().to_uppercase().replace(['-', ' '], "_"),
            None => return WalletRecordType::AccessToken,
        };
        match normalized.as_str() {
            "USERNAME_PASSWORD" => WalletRecordType::UsernamePassword,
            "SESSION_COOKIE" => WalletRecordType::SessionCookie,
            _ => WalletRecordType::AccessToken,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingLocationRequest {
    pub marker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPrivacyConfirmation {
    pub marker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPseudoUserReply {
    pub marker: String,
    pub prompt: String,
    pub agent_name: String,
    pub teammate_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWalletRequest {
    pub marker: String,
    pub record_type: WalletRecordType,
    pub service: Option<String>,
    pub key: Option<String>,
    pub message: Option<String>,
    pub is_global: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PendingInteraction {
    LocationRequest(PendingLocationRequest),
    PrivacyConfirmation(PendingPrivacyConfirmation),
    PseudoUserReply(PendingPseudoUserReply),
    WalletRequest(PendingWalletRequest),
}

/// A tool call with its result parsed once, plus who sent it.
struct Inspected<'a> {
    call: &'a ToolCall,
    result: Option<Map<String, Value>>,
    sender: &'a str,
}

impl Inspected<'_> {
    fn status(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.get("status"))
            .and_then(|s| s.as_str())
    }

    fn flag(&self, field: &str) -> bool {
        self.result
            .as_ref()
            .and_then(|r| r.get(field))
            .and_then(|v| v.as_bool())
            .unwrap_or_default()
    }

    fn text(&self, fields: &[&str]) -> Option<String> {
        let result = self.result.as_ref()?;
        fields.iter().find_map(|f| match result.get(*f) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            _ => None,
        })
    }
}

fn is_location_unavailable(c: &Inspected<'_>) -> bool {
    c.call.name == TOOL_GET_USER_LOCATION
        && matches!(c.status(), Some("unavailable") | Some("permission_required"))
}

fn is_privacy_confirmation_required(c: &Inspected<'_>) -> bool {
    c.call.name == TOOL_TURN_PRIVACY_ON
        && (c.status() == Some("confirmation_required") || c.flag("requiresConfirmation"))
}

fn is_pseudo_user_reply_requested(c: &Inspected<'_>) -> bool {
    c.call.name.starts_with(TEAM_CHAT_TOOL_PREFIX)
        && (c.status() == Some("pseudo_user_reply_required") || c.flag("awaitingPseudoUser"))
}

fn is_wallet_record_requested(c: &Inspected<'_>) -> bool {
    c.call.name == TOOL_REQUEST_WALLET_RECORD
        || (c.call.name.starts_with(PROJECT_TOOL_PREFIX)
            && c.status() == Some("credential_required"))
}

#[derive(Debug, Default)]
struct SeenMarkers {
    location: HashSet<String>,
    privacy: HashSet<String>,
    pseudo_user: HashSet<String>,
    wallet: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct ToolCallReactor {
    seen: SeenMarkers,
}

impl ToolCallReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every handled marker; called when a new chat session replaces the old one.
    pub fn reset(&mut self) {
        self.seen = SeenMarkers::default();
    }

    /// Inspect the current message list and return the interactions to start now.
    pub fn observe(&mut self, messages: &[ChatMessage]) -> Vec<PendingInteraction> {
        let inspected: Vec<Inspected<'_>> = messages
            .iter()
            .rev()
            .flat_map(|message| {
                message.tool_calls().iter().rev().map(move |call| Inspected {
                    call,
                    result: parse_tool_call_result(&call.result),
                    sender: message.sender.as_str(),
                })
            })
            .collect();

        let mut interactions = Vec::new();

        if let Some(marker) = newly_pending(&inspected, is_location_unavailable, &self.seen.location) {
            self.seen.location.insert(marker.clone());
            interactions.push(PendingInteraction::LocationRequest(PendingLocationRequest {
                marker,
            }));
        }

        if let Some(marker) =
            newly_pending(&inspected, is_privacy_confirmation_required, &self.seen.privacy)
        {
            self.seen.privacy.insert(marker.clone());
            interactions.push(PendingInteraction::PrivacyConfirmation(
                PendingPrivacyConfirmation { marker },
            ));
        }

        let pseudo_user = newest(&inspected, is_pseudo_user_reply_requested)
            .map(|c| (resolve_key(c.call), c))
            .filter(|(marker, _)| !self.seen.pseudo_user.contains(marker));
        let wallet = newest(&inspected, is_wallet_record_requested)
            .map(|c| (resolve_key(c.call), c))
            .filter(|(marker, _)| !self.seen.wallet.contains(marker));

        // Pseudo-user reply wins; a wallet request pending alongside it stays
        // unmarked and comes up on a later update.
        if let Some((marker, c)) = pseudo_user {
            self.seen.pseudo_user.insert(marker.clone());
            interactions.push(PendingInteraction::PseudoUserReply(pseudo_user_reply(
                marker, c,
            )));
        } else if let Some((marker, c)) = wallet {
            self.seen.wallet.insert(marker.clone());
            interactions.push(PendingInteraction::WalletRequest(wallet_request(marker, c)));
        }

        if !interactions.is_empty() {
            tracing::debug!("Reactor triggered {} interaction(s)", interactions.len());
        }
        interactions
    }
}

fn newest<'a, 'b>(
    inspected: &'b [Inspected<'a>],
    predicate: fn(&Inspected<'_>) -> bool,
) -> Option<&'b Inspected<'a>> {
    inspected.iter().find(|c| predicate(c))
}

fn newly_pending(
    inspected: &[Inspected<'_>],
    predicate: fn(&Inspected<'_>) -> bool,
    seen: &HashSet<String>,
) -> Option<String> {
    let marker = resolve_key(newest(inspected, predicate)?.call);
    if seen.contains(&marker) {
        None
    } else {
        Some(marker)
    }
}

fn pseudo_user_reply(marker: String, c: &Inspected<'_>) -> PendingPseudoUserReply {
    PendingPseudoUserReply {
        marker,
        prompt: c
            .text(&["prompt", "message"])
            .unwrap_or_else(|| DEFAULT_PSEUDO_USER_PROMPT.to_string()),
        agent_name: c
            .text(&["agentName"])
            .unwrap_or_else(|| c.sender.to_string()),
        teammate_label: c
            .text(&["teammateLabel", "teammate"])
            .unwrap_or_else(|| DEFAULT_TEAMMATE_LABEL.to_string()),
    }
}

fn wallet_request(marker: String, c: &Inspected<'_>) -> PendingWalletRequest {
    // Fields come from the result, falling back to the call's own arguments.
    let arguments = parse_tool_call_result(&c.call.arguments);
    let field = |name: &str| -> Option<Value> {
        c.result
            .as_ref()
            .and_then(|r| r.get(name))
            .or_else(|| arguments.as_ref().and_then(|a| a.get(name)))
            .cloned()
    };
    let text = |name: &str| match field(name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        _ => None,
    };

    PendingWalletRequest {
        marker,
        record_type: WalletRecordType::normalize(text("recordType").as_deref()),
        service: text("service"),
        key: text("key"),
        message: text("message"),
        is_global: matches!(field("isGlobal"), Some(Value::Bool(true))),
    }
}

/// --- GEOLOCATION ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocationOutcome {
    Resolved(GeoPosition),
    Denied(String),
    TimedOut,
}

/// Source of the device position (the browser geolocation API on the web client).
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_position(&self) -> std::result::Result<GeoPosition, String>;
}

/// Position given up front as `lat,lon` or `lat,lon,accuracy`, for clients
/// without a device sensor. No position configured means the request is denied.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredLocationProvider {
    position: Option<String>,
}

impl ConfiguredLocationProvider {
    pub fn new(position: Option<String>) -> Self {
        Self { position }
    }
}

#[async_trait]
impl LocationProvider for ConfiguredLocationProvider {
    async fn current_position(&self) -> std::result::Result<GeoPosition, String> {
        match self.position.as_deref() {
            Some(raw) => parse_position(raw),
            None => Err("no location configured".to_string()),
        }
    }
}

fn parse_position(raw: &str) -> std::result::Result<GeoPosition, String> {
    let parts = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid location {:?}: {}", raw, e))?;
    match parts.as_slice() {
        [latitude, longitude] => Ok(GeoPosition {
            latitude: *latitude,
            longitude: *longitude,
            accuracy: None,
        }),
        [latitude, longitude, accuracy] => Ok(GeoPosition {
            latitude: *latitude,
            longitude: *longitude,
            accuracy: Some(*accuracy),
        }),
        _ => Err(format!("invalid location {:?}: expected lat,lon", raw)),
    }
}

pub async fn request_user_location(
    provider: &dyn LocationProvider,
    timeout: Duration,
) -> LocationOutcome {
    match tokio::time::timeout(timeout, provider.current_position()).await {
        Ok(Ok(position)) => LocationOutcome::Resolved(position),
        Ok(Err(reason)) => {
            tracing::info!("Location request denied: {}", reason);
            LocationOutcome::Denied(reason)
        }
        Err(_) => {
            tracing::warn!("Location request timed out after {:?}", timeout);
            LocationOutcome::TimedOut
        }
    }
}
