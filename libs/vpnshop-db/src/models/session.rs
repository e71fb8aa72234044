use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named position of a user inside the bot's flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    #[default]
    Menu,
    Profile,
    BuyProtocol,
    BuyServer,
    BuyPlan,
    TopupMethod,
    TopupAmount,
    TopupProof,
    PayProof,
    Renew,
    RenewPlan,
    Payhist,
    Pkeys,
    SupportWait,
    SupportReply,
    PromoWait,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Menu => "menu",
            FlowState::Profile => "profile",
            FlowState::BuyProtocol => "buy_protocol",
            FlowState::BuyServer => "buy_server",
            FlowState::BuyPlan => "buy_plan",
            FlowState::TopupMethod => "topup_method",
            FlowState::TopupAmount => "topup_amount",
            FlowState::TopupProof => "topup_proof",
            FlowState::PayProof => "pay_proof",
            FlowState::Renew => "renew",
            FlowState::RenewPlan => "renew_plan",
            FlowState::Payhist => "payhist",
            FlowState::Pkeys => "pkeys",
            FlowState::SupportWait => "support_wait",
            FlowState::SupportReply => "support_reply",
            FlowState::PromoWait => "promo_wait",
        }
    }

    /// Unknown names (rows written by a newer build) fall back to the menu.
    pub fn from_db(raw: &str) -> Self {
        raw.parse().unwrap_or_default()
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown flow state: {0}")]
pub struct UnknownFlowState(pub String);

impl FromStr for FlowState {
    type Err = UnknownFlowState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s {
            "menu" => FlowState::Menu,
            "profile" => FlowState::Profile,
            "buy_protocol" => FlowState::BuyProtocol,
            "buy_server" => FlowState::BuyServer,
            "buy_plan" => FlowState::BuyPlan,
            "topup_method" => FlowState::TopupMethod,
            "topup_amount" => FlowState::TopupAmount,
            "topup_proof" => FlowState::TopupProof,
            "pay_proof" => FlowState::PayProof,
            "renew" => FlowState::Renew,
            "renew_plan" => FlowState::RenewPlan,
            "payhist" => FlowState::Payhist,
            "pkeys" => FlowState::Pkeys,
            "support_wait" => FlowState::SupportWait,
            "support_reply" => FlowState::SupportReply,
            "promo_wait" => FlowState::PromoWait,
            other => return Err(UnknownFlowState(other.to_string())),
        };
        Ok(state)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_message_id: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuyStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopupStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenewStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupportStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_ticket: Option<bool>,
}

/// Typed view over the session payload. Keys the bot does not know about
/// are kept in `extra` so a row written by another build survives a load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub ui: UiState,
    #[serde(default)]
    pub connect: ConnectStep,
    #[serde(default)]
    pub buy: BuyStep,
    #[serde(default)]
    pub topup: TopupStep,
    #[serde(default)]
    pub renew: RenewStep,
    #[serde(default)]
    pub payhist: CursorStep,
    #[serde(default)]
    pub pkeys: CursorStep,
    #[serde(default)]
    pub support: SupportStep,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Payload {
    /// Lenient decode: a malformed sub-object resets to its default instead
    /// of failing the whole session load.
    pub fn from_value(value: &Value) -> Self {
        match serde_json::from_value::<Payload>(value.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "session payload did not decode, keeping ui only");
                let ui = value
                    .get("ui")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                Payload {
                    ui,
                    ..Payload::default()
                }
            }
        }
    }
}

/// One partial update of a payload sub-object.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadPatch {
    Ui(UiState),
    Connect(ConnectStep),
    Buy(BuyStep),
    Topup(TopupStep),
    Renew(RenewStep),
    Payhist(CursorStep),
    Pkeys(CursorStep),
    Support(SupportStep),
    Other { key: String, fields: Map<String, Value> },
}

impl PayloadPatch {
    pub fn key(&self) -> &str {
        match self {
            PayloadPatch::Ui(_) => "ui",
            PayloadPatch::Connect(_) => "connect",
            PayloadPatch::Buy(_) => "buy",
            PayloadPatch::Topup(_) => "topup",
            PayloadPatch::Renew(_) => "renew",
            PayloadPatch::Payhist(_) => "payhist",
            PayloadPatch::Pkeys(_) => "pkeys",
            PayloadPatch::Support(_) => "support",
            PayloadPatch::Other { key, .. } => key,
        }
    }

    /// Fields carried by the patch. Unset optional fields are omitted, so
    /// they leave the stored value untouched on merge.
    pub fn fields(&self) -> Map<String, Value> {
        let value = match self {
            PayloadPatch::Ui(v) => serde_json::to_value(v),
            PayloadPatch::Connect(v) => serde_json::to_value(v),
            PayloadPatch::Buy(v) => serde_json::to_value(v),
            PayloadPatch::Topup(v) => serde_json::to_value(v),
            PayloadPatch::Renew(v) => serde_json::to_value(v),
            PayloadPatch::Payhist(v) => serde_json::to_value(v),
            PayloadPatch::Pkeys(v) => serde_json::to_value(v),
            PayloadPatch::Support(v) => serde_json::to_value(v),
            PayloadPatch::Other { fields, .. } => return fields.clone(),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn screen(message_id: i32) -> Self {
        PayloadPatch::Ui(UiState {
            screen_message_id: Some(message_id),
        })
    }
}

/// Shallow merge of `patch` into `payload[patch.key]`, the same shape as the
/// `jsonb ||` statement the PostgreSQL store runs.
pub fn merge_patch(payload: &mut Value, patch: &PayloadPatch) {
    if !payload.is_object() {
        *payload = Value::Object(Map::new());
    }
    let Value::Object(root) = payload else {
        return;
    };
    let slot = root
        .entry(patch.key().to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    if let Value::Object(sub) = slot {
        for (k, v) in patch.fields() {
            sub.insert(k, v);
        }
    }
}

/// Drops every flow-scoped key, keeping only `ui`.
pub fn clear_flow_keys(payload: &mut Value) {
    let ui = payload
        .get("ui")
        .cloned()
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(Map::new()));
    let mut root = Map::new();
    root.insert("ui".to_string(), ui);
    *payload = Value::Object(root);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub state: FlowState,
    pub payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overwrites_named_keys_and_keeps_others() {
        let mut payload = json!({"renew": {"index": 2, "profile_id": 9}, "ui": {"screen_message_id": 5}});
        merge_patch(
            &mut payload,
            &PayloadPatch::Renew(RenewStep {
                index: Some(0),
                profile_id: None,
            }),
        );
        assert_eq!(payload["renew"], json!({"index": 0, "profile_id": 9}));
        assert_eq!(payload["ui"], json!({"screen_message_id": 5}));
    }

    #[test]
    fn merge_creates_missing_sub_object() {
        let mut payload = json!({});
        merge_patch(&mut payload, &PayloadPatch::screen(77));
        assert_eq!(payload, json!({"ui": {"screen_message_id": 77}}));
    }

    #[test]
    fn clear_keeps_only_ui() {
        let mut payload = json!({
            "ui": {"screen_message_id": 5},
            "connect": {"protocol": "vless"},
            "legacy": {"x": 1}
        });
        clear_flow_keys(&mut payload);
        assert_eq!(payload, json!({"ui": {"screen_message_id": 5}}));
    }

    #[test]
    fn unknown_keys_land_in_extra() {
        let payload = Payload::from_value(&json!({
            "ui": {"screen_message_id": 1},
            "wizard": {"step": 3}
        }));
        assert_eq!(payload.ui.screen_message_id, Some(1));
        assert_eq!(payload.extra.get("wizard"), Some(&json!({"step": 3})));
    }

    #[test]
    fn malformed_sub_object_keeps_ui() {
        let payload = Payload::from_value(&json!({
            "ui": {"screen_message_id": 4},
            "renew": {"index": "not a number"}
        }));
        assert_eq!(payload.ui.screen_message_id, Some(4));
        assert_eq!(payload.renew, RenewStep::default());
    }

    #[test]
    fn flow_state_round_trips_through_db_names() {
        assert_eq!(FlowState::from_db("renew_plan"), FlowState::RenewPlan);
        assert_eq!(FlowState::from_db("something_new"), FlowState::Menu);
        assert_eq!(FlowState::SupportReply.as_str(), "support_reply");
    }
}
