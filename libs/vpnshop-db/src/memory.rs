//! In-process [`Store`] used by tests and local runs without PostgreSQL.
//!
//! Every method takes the single table lock for its whole body, which gives
//! the same all-or-nothing behaviour as one transaction in [`crate::PgStore`].

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use crate::models::activity::{Event, EventCategory};
use crate::models::catalog::{Plan, Profile, ProfileSource, Server, stub_config_uri};
use crate::models::order::{NewOrder, NewProof, Order, OrderKind, OrderStatus, PaymentRecord, Proof};
use crate::models::promo::PromoCode;
use crate::models::referral::{BonusPolicy, ReferralSummary, Withdrawal, WithdrawalStatus};
use crate::models::session::{FlowState, Payload, PayloadPatch, Session, clear_flow_keys, merge_patch};
use crate::models::support::{Sender, Ticket, TicketStatus};
use crate::models::user::{Account, Contact, ReferrerRef, Role, User, UserSettings};
use crate::store::{
    ApprovalOutcome, BalanceChange, PromoOutcome, ProvisionRequest, PurchaseOutcome, RenewOutcome,
    RenewRequest, Store, SupportSubmission, TicketOutcome, TrialOutcome, WithdrawalDecision,
    WithdrawalRequestOutcome, renewal_expiry,
};

#[derive(Debug, Clone)]
struct ServerRow {
    id: i64,
    name: String,
    country: Option<String>,
    capacity: Option<i32>,
    weight: i32,
    enabled: bool,
}

#[derive(Debug, Clone)]
struct ProfileRow {
    profile: Profile,
    revoked: bool,
}

#[derive(Debug, Clone)]
struct PendingBonus {
    order_id: i64,
    referrer_id: i64,
    bonus: i64,
    due_at: DateTime<Utc>,
    matured: bool,
}

#[derive(Debug, Clone)]
struct StoredProof {
    order_id: i64,
    proof: NewProof,
}

/// One row of the balance ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub user_id: i64,
    pub amount: i64,
    pub reason: String,
}

#[derive(Debug, Default)]
struct Tables {
    users: Vec<User>,
    sessions: HashMap<i64, (FlowState, Value)>,
    settings: HashMap<i64, bool>,
    servers: Vec<ServerRow>,
    plans: Vec<Plan>,
    profiles: Vec<ProfileRow>,
    balances: HashMap<i64, i64>,
    ledger: Vec<LedgerEntry>,
    orders: Vec<Order>,
    proofs: Vec<StoredProof>,
    pending_bonuses: Vec<PendingBonus>,
    wallets: HashMap<i64, i64>,
    withdrawals: Vec<Withdrawal>,
    tickets: Vec<Ticket>,
    messages: Vec<(i64, Sender, String)>,
    promos: Vec<PromoCode>,
    promo_usages: HashSet<(i64, String)>,
    events: Vec<Event>,
    next_profile_id: i64,
}

impl Tables {
    fn server_live(&self, server_id: i64) -> bool {
        self.servers.iter().any(|s| s.id == server_id && s.enabled)
    }

    fn user(&self, user_id: i64) -> Option<&User> {
        self.users.iter().find(|u| u.id == user_id)
    }

    fn user_by_tg(&self, tg_id: i64) -> Option<&User> {
        self.users.iter().find(|u| u.tg_id == tg_id)
    }

    fn session(&self, tg_id: i64) -> Session {
        self.sessions
            .get(&tg_id)
            .map(|(state, payload)| Session {
                state: *state,
                payload: Payload::from_value(payload),
            })
            .unwrap_or_default()
    }

    fn clear_state(&mut self, tg_id: i64, state: FlowState) {
        if let Some((current, payload)) = self.sessions.get_mut(&tg_id) {
            *current = state;
            clear_flow_keys(payload);
        }
    }

    fn apply_delta(&mut self, user_id: i64, delta: i64, reason: &str) -> BalanceChange {
        let balance = self.balances.entry(user_id).or_insert(0);
        if delta < 0 && *balance < -delta {
            return BalanceChange::Insufficient { balance: *balance };
        }
        *balance += delta;
        let balance = *balance;
        if delta != 0 {
            self.ledger.push(LedgerEntry {
                user_id,
                amount: delta,
                reason: reason.to_string(),
            });
        }
        BalanceChange::Applied { balance }
    }

    fn active_keys(&self, server_id: i64) -> i64 {
        self.profiles
            .iter()
            .filter(|p| p.profile.server_id == server_id && p.profile.status == "active")
            .count() as i64
    }

    fn server(&self, row: &ServerRow) -> Server {
        Server {
            id: row.id,
            name: row.name.clone(),
            country: row.country.clone(),
            capacity: row.capacity,
            active_keys: self.active_keys(row.id),
        }
    }

    fn insert_profile(
        &mut self,
        user_id: i64,
        protocol: &str,
        server_id: i64,
        source: ProfileSource,
        access_until: Option<DateTime<Utc>>,
    ) -> Option<String> {
        let trial_taken = self
            .profiles
            .iter()
            .any(|p| p.profile.user_id == user_id && p.profile.is_trial());
        if source == ProfileSource::Trial && trial_taken {
            return None;
        }
        self.next_profile_id += 1;
        let config_uri = stub_config_uri(protocol, source, user_id, server_id);
        let server_name = self
            .servers
            .iter()
            .find(|s| s.id == server_id)
            .map(|s| s.name.clone());
        self.profiles.push(ProfileRow {
            profile: Profile {
                id: self.next_profile_id,
                user_id,
                protocol: protocol.to_string(),
                server_id,
                server_name,
                status: "active".to_string(),
                source: source.as_str().to_string(),
                config_uri: Some(config_uri.clone()),
                created_at: Utc::now(),
                access_until,
            },
            revoked: false,
        });
        Some(config_uri)
    }

    fn decide_order(&mut self, order_id: i64, status: OrderStatus) -> Option<Order> {
        let order = self
            .orders
            .iter_mut()
            .find(|o| o.id == order_id && o.status == OrderStatus::Pending)?;
        order.status = status;
        order.updated_at = Utc::now();
        Some(order.clone())
    }

    fn open_tickets(&self, user_id: i64) -> impl Iterator<Item = &Ticket> {
        self.tickets
            .iter()
            .filter(move |t| t.user_id == user_id && t.status == TicketStatus::Open)
    }

    fn append_message(&mut self, ticket_id: i64, sender: Sender, text: &str) -> Option<Ticket> {
        let ticket = self
            .tickets
            .iter_mut()
            .find(|t| t.id == ticket_id && t.status == TicketStatus::Open)?;
        ticket.message_count += 1;
        ticket.updated_at = Utc::now();
        let ticket = ticket.clone();
        self.messages.push((ticket_id, sender, text.to_string()));
        Some(ticket)
    }

    fn withdrawal_mut(&mut self, withdrawal_id: i64) -> Option<&mut Withdrawal> {
        self.withdrawals
            .iter_mut()
            .find(|w| w.id == withdrawal_id && w.status == WithdrawalStatus::Pending)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_plan(&self, code: &str, title: &str, duration_days: i32, price_minor: i64) -> Plan {
        let mut t = self.tables.lock().await;
        let plan = Plan {
            id: t.plans.len() as i64 + 1,
            code: code.to_string(),
            title: title.to_string(),
            duration_days,
            price_minor,
            currency: "RUB".to_string(),
            enabled: true,
        };
        t.plans.push(plan.clone());
        plan
    }

    pub async fn disable_plan(&self, plan_id: i64) {
        let mut t = self.tables.lock().await;
        if let Some(plan) = t.plans.iter_mut().find(|p| p.id == plan_id) {
            plan.enabled = false;
        }
    }

    pub async fn add_server(&self, name: &str, capacity: Option<i32>) -> Server {
        let mut t = self.tables.lock().await;
        let row = ServerRow {
            id: t.servers.len() as i64 + 1,
            name: name.to_string(),
            country: None,
            capacity,
            weight: 0,
            enabled: true,
        };
        t.servers.push(row.clone());
        t.server(&row)
    }

    pub async fn disable_server(&self, server_id: i64) {
        let mut t = self.tables.lock().await;
        if let Some(server) = t.servers.iter_mut().find(|s| s.id == server_id) {
            server.enabled = false;
        }
    }

    pub async fn add_promo(&self, promo: PromoCode) {
        self.tables.lock().await.promos.push(promo);
    }

    pub async fn set_role(&self, tg_id: i64, role: Role) {
        let mut t = self.tables.lock().await;
        if let Some(user) = t.users.iter_mut().find(|u| u.tg_id == tg_id) {
            user.role = role;
        }
    }

    /// Marks a profile revoked so it leaves every active listing.
    pub async fn revoke_profile(&self, profile_id: i64) {
        let mut t = self.tables.lock().await;
        if let Some(row) = t.profiles.iter_mut().find(|p| p.profile.id == profile_id) {
            row.revoked = true;
            row.profile.status = "revoked".to_string();
        }
    }

    pub async fn credit_wallet(&self, user_id: i64, amount: i64) {
        *self.tables.lock().await.wallets.entry(user_id).or_insert(0) += amount;
    }

    pub async fn wallet_balance(&self, user_id: i64) -> i64 {
        self.tables.lock().await.wallets.get(&user_id).copied().unwrap_or(0)
    }

    pub async fn raw_payload(&self, tg_id: i64) -> Option<Value> {
        self.tables.lock().await.sessions.get(&tg_id).map(|(_, p)| p.clone())
    }

    /// Overwrites the stored payload, bypassing the merge path.
    pub async fn put_raw_payload(&self, tg_id: i64, payload: Value) {
        if let Some((_, stored)) = self.tables.lock().await.sessions.get_mut(&tg_id) {
            *stored = payload;
        }
    }

    pub async fn ledger(&self) -> Vec<LedgerEntry> {
        self.tables.lock().await.ledger.clone()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.tables.lock().await.events.clone()
    }

    pub async fn ticket_messages(&self, ticket_id: i64) -> Vec<(Sender, String)> {
        self.tables
            .lock()
            .await
            .messages
            .iter()
            .filter(|(id, _, _)| *id == ticket_id)
            .map(|(_, sender, text)| (*sender, text.clone()))
            .collect()
    }

    pub async fn pending_bonus_count(&self) -> usize {
        self.tables.lock().await.pending_bonuses.len()
    }

    pub async fn proof_bytes(&self, order_id: i64) -> Option<Vec<u8>> {
        self.tables
            .lock()
            .await
            .proofs
            .iter()
            .find(|p| p.order_id == order_id)
            .map(|p| p.proof.data.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_user(&self, contact: &Contact, referrer: Option<ReferrerRef>) -> Result<User> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let user_id = match t.users.iter().position(|u| u.tg_id == contact.tg_id) {
            Some(idx) => {
                let user = &mut t.users[idx];
                user.chat_id = contact.chat_id;
                user.username = contact.username.clone();
                user.last_seen_at = now;
                user.id
            }
            None => {
                let id = t.users.len() as i64 + 1;
                t.users.push(User {
                    id,
                    tg_id: contact.tg_id,
                    chat_id: contact.chat_id,
                    username: contact.username.clone(),
                    role: Role::User,
                    is_blocked: false,
                    referral_code: Some(format!("REF{}", id)),
                    referrer_id: None,
                    created_at: now,
                    last_seen_at: now,
                });
                id
            }
        };

        let referrer_id = referrer.and_then(|r| match r {
            ReferrerRef::UserId(id) => t.user(id).map(|u| u.id),
            ReferrerRef::Code(code) => t
                .users
                .iter()
                .find(|u| {
                    u.referral_code
                        .as_deref()
                        .is_some_and(|c| c.eq_ignore_ascii_case(&code))
                })
                .map(|u| u.id),
        });
        if let Some(referrer_id) = referrer_id {
            if let Some(user) = t.users.iter_mut().find(|u| u.id == user_id) {
                if user.referrer_id.is_none() && referrer_id != user_id {
                    user.referrer_id = Some(referrer_id);
                }
            }
        }

        t.sessions
            .entry(contact.tg_id)
            .or_insert_with(|| (FlowState::Menu, Value::Object(Map::new())));

        t.user(user_id).cloned().context("user vanished after upsert")
    }

    async fn load_user_with_session(&self, tg_id: i64) -> Result<Option<Account>> {
        let t = self.tables.lock().await;
        Ok(t.user_by_tg(tg_id).map(|user| Account {
            user: user.clone(),
            session: t.session(tg_id),
        }))
    }

    async fn user_by_id(&self, user_id: i64) -> Result<Option<User>> {
        Ok(self.tables.lock().await.user(user_id).cloned())
    }

    async fn set_state_cleared(&self, tg_id: i64, state: FlowState) -> Result<()> {
        self.tables.lock().await.clear_state(tg_id, state);
        Ok(())
    }

    async fn set_state_payload(&self, tg_id: i64, state: FlowState, patch: PayloadPatch) -> Result<()> {
        let mut t = self.tables.lock().await;
        if let Some((current, payload)) = t.sessions.get_mut(&tg_id) {
            *current = state;
            merge_patch(payload, &patch);
        }
        Ok(())
    }

    async fn user_settings(&self, user_id: i64) -> Result<UserSettings> {
        let mut t = self.tables.lock().await;
        let enabled = *t.settings.entry(user_id).or_insert(true);
        Ok(UserSettings {
            user_id,
            notifications_enabled: enabled,
        })
    }

    async fn toggle_notifications(&self, user_id: i64) -> Result<UserSettings> {
        let mut t = self.tables.lock().await;
        let enabled = t.settings.entry(user_id).or_insert(true);
        *enabled = !*enabled;
        Ok(UserSettings {
            user_id,
            notifications_enabled: *enabled,
        })
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        let t = self.tables.lock().await;
        let mut rows: Vec<&ServerRow> = t.servers.iter().filter(|s| s.enabled).collect();
        rows.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));
        Ok(rows.into_iter().map(|row| t.server(row)).collect())
    }

    async fn load_server(&self, server_id: i64) -> Result<Option<Server>> {
        let t = self.tables.lock().await;
        Ok(t.servers
            .iter()
            .find(|s| s.id == server_id && s.enabled)
            .map(|row| t.server(row)))
    }

    async fn list_active_plans(&self) -> Result<Vec<Plan>> {
        let t = self.tables.lock().await;
        let mut plans: Vec<Plan> = t.plans.iter().filter(|p| p.enabled).cloned().collect();
        plans.sort_by_key(|p| (p.price_minor, p.duration_days, p.id));
        Ok(plans)
    }

    async fn load_plan(&self, plan_id: i64) -> Result<Option<Plan>> {
        Ok(self.tables.lock().await.plans.iter().find(|p| p.id == plan_id).cloned())
    }

    async fn get_balance(&self, user_id: i64) -> Result<i64> {
        Ok(self.tables.lock().await.balances.get(&user_id).copied().unwrap_or(0))
    }

    async fn apply_balance_delta(&self, user_id: i64, delta: i64, reason: &str, _meta: Value) -> Result<BalanceChange> {
        Ok(self.tables.lock().await.apply_delta(user_id, delta, reason))
    }

    async fn list_active_profiles(&self, user_id: i64) -> Result<Vec<Profile>> {
        let t = self.tables.lock().await;
        let mut profiles: Vec<Profile> = t
            .profiles
            .iter()
            .filter(|p| p.profile.user_id == user_id && p.profile.status == "active" && !p.revoked)
            .map(|p| p.profile.clone())
            .collect();
        profiles.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(profiles)
    }

    async fn has_trial_used(&self, user_id: i64) -> Result<bool> {
        let t = self.tables.lock().await;
        Ok(t.profiles
            .iter()
            .any(|p| p.profile.user_id == user_id && p.profile.is_trial()))
    }

    async fn update_profile_access_until(&self, profile_id: i64, until: DateTime<Utc>) -> Result<bool> {
        let mut t = self.tables.lock().await;
        match t.profiles.iter_mut().find(|p| p.profile.id == profile_id) {
            Some(row) => {
                row.profile.access_until = Some(until);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_profile_stub(
        &self,
        user_id: i64,
        protocol: &str,
        server_id: i64,
        source: ProfileSource,
        access_until: Option<DateTime<Utc>>,
    ) -> Result<String> {
        self.tables
            .lock()
            .await
            .insert_profile(user_id, protocol, server_id, source, access_until)
            .context("trial already issued for this user")
    }

    async fn issue_trial(&self, req: &ProvisionRequest) -> Result<TrialOutcome> {
        let mut t = self.tables.lock().await;
        if !t.server_live(req.server_id) {
            return Ok(TrialOutcome::ServerUnavailable);
        }
        let access_until = req.access_until();
        let Some(config_uri) = t.insert_profile(
            req.user_id,
            &req.protocol,
            req.server_id,
            ProfileSource::Trial,
            Some(access_until),
        ) else {
            return Ok(TrialOutcome::AlreadyUsed);
        };
        t.clear_state(req.tg_id, FlowState::Menu);
        t.events.push(Event::info(EventCategory::UserActions, "trial_issued").actor(req.tg_id, req.user_id));
        Ok(TrialOutcome::Issued { config_uri, access_until })
    }

    async fn purchase_profile(&self, req: &ProvisionRequest) -> Result<PurchaseOutcome> {
        let mut t = self.tables.lock().await;
        if !t.server_live(req.server_id) {
            return Ok(PurchaseOutcome::ServerUnavailable);
        }
        let balance = match t.apply_delta(req.user_id, -req.price_minor, "plan_purchase") {
            BalanceChange::Applied { balance } => balance,
            BalanceChange::Insufficient { balance } => {
                return Ok(PurchaseOutcome::Insufficient {
                    balance,
                    price: req.price_minor,
                });
            }
        };
        let access_until = req.access_until();
        let config_uri = t
            .insert_profile(
                req.user_id,
                &req.protocol,
                req.server_id,
                ProfileSource::Paid,
                Some(access_until),
            )
            .context("paid profile insert returned nothing")?;
        t.clear_state(req.tg_id, FlowState::Menu);
        t.events.push(Event::info(EventCategory::Payments, "plan_purchased").actor(req.tg_id, req.user_id));
        Ok(PurchaseOutcome::Issued {
            config_uri,
            access_until,
            balance,
        })
    }

    async fn renew_profile(&self, req: &RenewRequest) -> Result<RenewOutcome> {
        let mut t = self.tables.lock().await;
        let current = t
            .profiles
            .iter()
            .find(|p| {
                p.profile.id == req.profile_id
                    && p.profile.user_id == req.user_id
                    && p.profile.status == "active"
                    && !p.revoked
                    && !p.profile.is_trial()
            })
            .map(|p| p.profile.access_until);
        let Some(current) = current else {
            return Ok(RenewOutcome::ProfileGone);
        };

        let balance = match t.apply_delta(req.user_id, -req.price_minor, "renewal") {
            BalanceChange::Applied { balance } => balance,
            BalanceChange::Insufficient { balance } => {
                return Ok(RenewOutcome::Insufficient {
                    balance,
                    price: req.price_minor,
                });
            }
        };
        let access_until = renewal_expiry(req.now, current, req.duration_days);
        if let Some(row) = t.profiles.iter_mut().find(|p| p.profile.id == req.profile_id) {
            row.profile.access_until = Some(access_until);
        }
        t.clear_state(req.tg_id, FlowState::Menu);
        t.events.push(Event::info(EventCategory::Payments, "profile_renewed").actor(req.tg_id, req.user_id));
        Ok(RenewOutcome::Renewed { access_until, balance })
    }

    async fn create_order_with_proof(&self, tg_id: i64, order: &NewOrder, proof: &NewProof) -> Result<i64> {
        let mut t = self.tables.lock().await;
        let id = t.orders.len() as i64 + 1;
        let now = Utc::now();
        t.orders.push(Order {
            id,
            user_id: order.user_id,
            plan_id: order.plan_id,
            amount_minor: order.amount_minor,
            currency: order.currency.clone(),
            kind: order.kind,
            status: OrderStatus::Pending,
            protocol: order.protocol.clone(),
            server_id: order.server_id,
            payment_code: order.payment_code.clone(),
            created_at: now,
            updated_at: now,
        });
        t.proofs.push(StoredProof {
            order_id: id,
            proof: proof.clone(),
        });
        t.clear_state(tg_id, FlowState::Menu);
        t.events.push(
            Event::info(EventCategory::Payments, "proof_uploaded")
                .actor(tg_id, order.user_id)
                .context(json!({ "order_id": id })),
        );
        Ok(id)
    }

    async fn load_order(&self, order_id: i64) -> Result<Option<Order>> {
        Ok(self.tables.lock().await.orders.iter().find(|o| o.id == order_id).cloned())
    }

    async fn load_proof_for_order(&self, order_id: i64) -> Result<Option<Proof>> {
        let t = self.tables.lock().await;
        Ok(t.proofs.iter().rev().find(|p| p.order_id == order_id).map(|p| Proof {
            order_id,
            file_id: p.proof.file_id.clone(),
            file_name: p.proof.file_name.clone(),
            mime_type: p.proof.mime_type.clone(),
        }))
    }

    async fn payment_history(&self, user_id: i64, limit: i64) -> Result<Vec<PaymentRecord>> {
        let t = self.tables.lock().await;
        let mut orders: Vec<&Order> = t.orders.iter().filter(|o| o.user_id == user_id).collect();
        orders.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| b.id.cmp(&a.id)));
        Ok(orders
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|o| {
                let proof = t.proofs.iter().rev().find(|p| p.order_id == o.id);
                PaymentRecord {
                    id: o.id,
                    amount_minor: o.amount_minor,
                    currency: o.currency.clone(),
                    kind: o.kind,
                    status: o.status,
                    updated_at: o.updated_at,
                    proof_file_id: proof.map(|p| p.proof.file_id.clone()),
                    proof_mime: proof.and_then(|p| p.proof.mime_type.clone()),
                }
            })
            .collect())
    }

    async fn approve_order(&self, order_id: i64, bonus: BonusPolicy, now: DateTime<Utc>) -> Result<ApprovalOutcome> {
        let mut t = self.tables.lock().await;
        let Some(order) = t.decide_order(order_id, OrderStatus::Paid) else {
            return Ok(ApprovalOutcome::NotPending);
        };

        let plan = match (order.kind, order.plan_id) {
            (OrderKind::Plan, Some(plan_id)) => t.plans.iter().find(|p| p.id == plan_id).cloned(),
            _ => None,
        };
        let server_live = order.server_id.is_some_and(|id| t.server_live(id));
        let outcome = match (plan, order.protocol.clone(), order.server_id) {
            (Some(plan), Some(protocol), Some(server_id)) if server_live => {
                let access_until = now + Duration::days(plan.duration_days as i64);
                let config_uri = t
                    .insert_profile(order.user_id, &protocol, server_id, ProfileSource::Paid, Some(access_until))
                    .context("paid profile insert returned nothing")?;
                ApprovalOutcome::Provisioned {
                    order: order.clone(),
                    config_uri,
                    access_until,
                }
            }
            _ => match t.apply_delta(order.user_id, order.amount_minor, "topup") {
                BalanceChange::Applied { balance } | BalanceChange::Insufficient { balance } => {
                    ApprovalOutcome::ToppedUp {
                        order: order.clone(),
                        balance,
                    }
                }
            },
        };

        let referrer_id = t.user(order.user_id).and_then(|u| u.referrer_id);
        let amount = bonus.bonus_for(order.amount_minor);
        if let Some(referrer_id) = referrer_id {
            if amount > 0 && !t.pending_bonuses.iter().any(|b| b.order_id == order.id) {
                t.pending_bonuses.push(PendingBonus {
                    order_id: order.id,
                    referrer_id,
                    bonus: amount,
                    due_at: now + Duration::days(bonus.delay_days),
                    matured: false,
                });
            }
        }
        t.events.push(
            Event::info(EventCategory::AdminActions, "order_approved").context(json!({ "order_id": order.id })),
        );
        Ok(outcome)
    }

    async fn reject_order(&self, order_id: i64) -> Result<Option<Order>> {
        let mut t = self.tables.lock().await;
        let order = t.decide_order(order_id, OrderStatus::Failed);
        if order.is_some() {
            t.events.push(
                Event::info(EventCategory::AdminActions, "order_rejected").context(json!({ "order_id": order_id })),
            );
        }
        Ok(order)
    }

    async fn referral_summary(&self, user_id: i64) -> Result<ReferralSummary> {
        let t = self.tables.lock().await;
        Ok(ReferralSummary {
            invited: t.users.iter().filter(|u| u.referrer_id == Some(user_id)).count() as i64,
            wallet_balance: t.wallets.get(&user_id).copied().unwrap_or(0),
            pending_bonus: t
                .pending_bonuses
                .iter()
                .filter(|b| b.referrer_id == user_id && !b.matured)
                .map(|b| b.bonus)
                .sum(),
            pending_withdrawal: t
                .withdrawals
                .iter()
                .find(|w| w.user_id == user_id && w.status == WithdrawalStatus::Pending)
                .cloned(),
        })
    }

    async fn mature_referral_bonuses(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut t = self.tables.lock().await;
        let mut totals: BTreeMap<i64, i64> = BTreeMap::new();
        let mut matured = 0u64;
        for bonus in t.pending_bonuses.iter_mut().filter(|b| !b.matured && b.due_at <= now) {
            bonus.matured = true;
            *totals.entry(bonus.referrer_id).or_default() += bonus.bonus;
            matured += 1;
        }
        for (referrer, total) in totals {
            *t.wallets.entry(referrer).or_insert(0) += total;
        }
        Ok(matured)
    }

    async fn request_withdrawal(&self, user_id: i64, minimum: i64) -> Result<WithdrawalRequestOutcome> {
        let mut t = self.tables.lock().await;
        if let Some(existing) = t
            .withdrawals
            .iter()
            .find(|w| w.user_id == user_id && w.status == WithdrawalStatus::Pending)
        {
            return Ok(WithdrawalRequestOutcome::AlreadyPending(existing.clone()));
        }
        let balance = t.wallets.get(&user_id).copied().unwrap_or(0);
        if balance <= 0 || balance < minimum {
            return Ok(WithdrawalRequestOutcome::BelowMinimum { balance, minimum });
        }
        let withdrawal = Withdrawal {
            id: t.withdrawals.len() as i64 + 1,
            user_id,
            amount: balance,
            status: WithdrawalStatus::Pending,
            created_at: Utc::now(),
        };
        t.withdrawals.push(withdrawal.clone());
        Ok(WithdrawalRequestOutcome::Requested(withdrawal))
    }

    async fn approve_withdrawal(&self, withdrawal_id: i64, minimum: i64) -> Result<WithdrawalDecision> {
        let mut t = self.tables.lock().await;
        let Some(user_id) = t.withdrawal_mut(withdrawal_id).map(|w| w.user_id) else {
            return Ok(WithdrawalDecision::NotPending);
        };
        let wallet = t.wallets.get(&user_id).copied().unwrap_or(0);
        if wallet <= 0 || wallet < minimum {
            let withdrawal = t
                .withdrawal_mut(withdrawal_id)
                .map(|w| {
                    w.status = WithdrawalStatus::Rejected;
                    w.clone()
                })
                .context("withdrawal vanished under lock")?;
            return Ok(WithdrawalDecision::BelowMinimum { withdrawal, wallet });
        }

        let balance = match t.apply_delta(user_id, wallet, "referral_withdrawal") {
            BalanceChange::Applied { balance } | BalanceChange::Insufficient { balance } => balance,
        };
        t.wallets.insert(user_id, 0);
        let withdrawal = t
            .withdrawal_mut(withdrawal_id)
            .map(|w| {
                w.status = WithdrawalStatus::Approved;
                w.amount = wallet;
                w.clone()
            })
            .context("withdrawal vanished under lock")?;
        Ok(WithdrawalDecision::Approved { withdrawal, balance })
    }

    async fn reject_withdrawal(&self, withdrawal_id: i64) -> Result<WithdrawalDecision> {
        let mut t = self.tables.lock().await;
        Ok(match t.withdrawal_mut(withdrawal_id) {
            Some(w) => {
                w.status = WithdrawalStatus::Rejected;
                WithdrawalDecision::Rejected(w.clone())
            }
            None => WithdrawalDecision::NotPending,
        })
    }

    async fn submit_support_message(&self, submission: &SupportSubmission) -> Result<TicketOutcome> {
        let mut t = self.tables.lock().await;
        if !submission.force_new {
            let latest = t
                .open_tickets(submission.user_id)
                .max_by_key(|ticket| ticket.user_ticket_id)
                .map(|ticket| ticket.id);
            if let Some(ticket_id) = latest {
                let ticket = t
                    .append_message(ticket_id, Sender::User, &submission.text)
                    .context("open ticket vanished under lock")?;
                return Ok(TicketOutcome::Attached(ticket));
            }
        }

        let open = t.open_tickets(submission.user_id).count() as i64;
        if open >= submission.open_cap {
            return Ok(TicketOutcome::CapReached { open });
        }

        let user_ticket_id = t
            .tickets
            .iter()
            .filter(|ticket| ticket.user_id == submission.user_id)
            .map(|ticket| ticket.user_ticket_id)
            .max()
            .unwrap_or(0)
            + 1;
        let now = Utc::now();
        let id = t.tickets.len() as i64 + 1;
        t.tickets.push(Ticket {
            id,
            user_id: submission.user_id,
            chat_id: submission.chat_id,
            username: submission.username.clone(),
            user_ticket_id,
            status: TicketStatus::Open,
            message_count: 0,
            created_at: now,
            updated_at: now,
        });
        let ticket = t
            .append_message(id, Sender::User, &submission.text)
            .context("new ticket vanished under lock")?;
        Ok(TicketOutcome::Opened(ticket))
    }

    async fn add_admin_reply(&self, ticket_id: i64, text: &str) -> Result<Option<Ticket>> {
        Ok(self.tables.lock().await.append_message(ticket_id, Sender::Admin, text))
    }

    async fn close_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>> {
        let mut t = self.tables.lock().await;
        Ok(t.tickets
            .iter_mut()
            .find(|ticket| ticket.id == ticket_id && ticket.status == TicketStatus::Open)
            .map(|ticket| {
                ticket.status = TicketStatus::Closed;
                ticket.updated_at = Utc::now();
                ticket.clone()
            }))
    }

    async fn redeem_promo(&self, user_id: i64, code: &str, now: DateTime<Utc>) -> Result<PromoOutcome> {
        let code = PromoCode::normalize(code);
        let mut t = self.tables.lock().await;
        let Some(promo) = t.promos.iter().find(|p| p.code == code && p.active).cloned() else {
            return Ok(PromoOutcome::NotFound);
        };
        if promo.is_expired(now) {
            return Ok(PromoOutcome::Expired);
        }
        if promo.is_exhausted() {
            return Ok(PromoOutcome::Exhausted);
        }
        if !t.promo_usages.insert((user_id, promo.code.clone())) {
            return Ok(PromoOutcome::AlreadyUsed);
        }
        if let Some(stored) = t.promos.iter_mut().find(|p| p.code == promo.code) {
            stored.used_count += 1;
        }
        let balance = match t.apply_delta(user_id, promo.bonus_minor, "promo") {
            BalanceChange::Applied { balance } | BalanceChange::Insufficient { balance } => balance,
        };
        Ok(PromoOutcome::Redeemed {
            bonus: promo.bonus_minor,
            balance,
        })
    }

    async fn log_event(&self, event: &Event) -> Result<()> {
        self.tables.lock().await.events.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn contact(tg_id: i64) -> Contact {
        Contact {
            tg_id,
            chat_id: tg_id,
            username: Some(format!("user{}", tg_id)),
        }
    }

    fn provision(user: &User, plan: &Plan, server_id: i64) -> ProvisionRequest {
        ProvisionRequest {
            tg_id: user.tg_id,
            user_id: user.id,
            protocol: "vless".to_string(),
            server_id,
            plan_id: plan.id,
            price_minor: plan.price_minor,
            duration_days: plan.duration_days,
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_assigns_code_and_keeps_first_referrer() {
        let store = MemoryStore::new();
        let a = store.upsert_user(&contact(1), None).await.unwrap();
        let b = store.upsert_user(&contact(2), None).await.unwrap();
        assert_eq!(a.referral_code.as_deref(), Some("REF1"));

        let c = store
            .upsert_user(&contact(3), Some(ReferrerRef::Code("ref1".to_string())))
            .await
            .unwrap();
        assert_eq!(c.referrer_id, Some(a.id));

        let c = store
            .upsert_user(&contact(3), Some(ReferrerRef::UserId(b.id)))
            .await
            .unwrap();
        assert_eq!(c.referrer_id, Some(a.id));

        let self_ref = store
            .upsert_user(&contact(2), Some(ReferrerRef::UserId(b.id)))
            .await
            .unwrap();
        assert_eq!(self_ref.referrer_id, None);
    }

    #[tokio::test]
    async fn payload_merge_and_clear_round_trip() {
        let store = MemoryStore::new();
        store.upsert_user(&contact(5), None).await.unwrap();
        store
            .set_state_payload(5, FlowState::Menu, PayloadPatch::screen(42))
            .await
            .unwrap();
        store
            .set_state_payload(
                5,
                FlowState::BuyServer,
                PayloadPatch::Connect(crate::models::session::ConnectStep {
                    protocol: Some("vless".to_string()),
                    server_id: None,
                }),
            )
            .await
            .unwrap();

        let account = store.load_user_with_session(5).await.unwrap().unwrap();
        assert_eq!(account.session.state, FlowState::BuyServer);
        assert_eq!(account.session.payload.ui.screen_message_id, Some(42));
        assert_eq!(account.session.payload.connect.protocol.as_deref(), Some("vless"));

        store.set_state_cleared(5, FlowState::Menu).await.unwrap();
        let raw = store.raw_payload(5).await.unwrap();
        assert_eq!(raw, json!({ "ui": { "screen_message_id": 42 } }));
    }

    #[tokio::test]
    async fn racing_purchases_never_overdraw() {
        let store = Arc::new(MemoryStore::new());
        let user = store.upsert_user(&contact(9), None).await.unwrap();
        let plan = store.add_plan("month", "Month", 30, 600).await;
        let server = store.add_server("nl-1", Some(10)).await;
        store
            .apply_balance_delta(user.id, 1000, "seed", Value::Null)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            let req = provision(&user, &plan, server.id);
            handles.push(tokio::spawn(async move { store.purchase_profile(&req).await.unwrap() }));
        }
        let mut issued = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), PurchaseOutcome::Issued { .. }) {
                issued += 1;
            }
        }
        assert_eq!(issued, 1);
        assert_eq!(store.get_balance(user.id).await.unwrap(), 400);
        assert_eq!(store.list_active_profiles(user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trial_is_issued_once() {
        let store = MemoryStore::new();
        let user = store.upsert_user(&contact(4), None).await.unwrap();
        let plan = store.add_plan("trial", "Trial", 3, 0).await;
        let server = store.add_server("de-1", None).await;
        let req = provision(&user, &plan, server.id);

        assert!(matches!(store.issue_trial(&req).await.unwrap(), TrialOutcome::Issued { .. }));
        assert_eq!(store.issue_trial(&req).await.unwrap(), TrialOutcome::AlreadyUsed);
        assert!(store.has_trial_used(user.id).await.unwrap());
        assert_eq!(store.list_active_profiles(user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn approval_is_single_shot_and_schedules_bonus_once() {
        let store = MemoryStore::new();
        let referrer = store.upsert_user(&contact(1), None).await.unwrap();
        let buyer = store
            .upsert_user(&contact(2), Some(ReferrerRef::UserId(referrer.id)))
            .await
            .unwrap();
        let order = NewOrder {
            user_id: buyer.id,
            plan_id: None,
            amount_minor: 50_000,
            currency: "RUB".to_string(),
            kind: OrderKind::Topup,
            protocol: None,
            server_id: None,
            payment_code: Some("ABC".to_string()),
        };
        let proof = NewProof {
            file_id: "file-1".to_string(),
            file_name: None,
            mime_type: Some("image/jpeg".to_string()),
            file_size: Some(3),
            data: vec![1, 2, 3],
        };
        let order_id = store.create_order_with_proof(2, &order, &proof).await.unwrap();
        let policy = BonusPolicy {
            percent: 10,
            delay_days: 7,
        };
        let now = Utc::now();

        let first = store.approve_order(order_id, policy, now).await.unwrap();
        assert!(matches!(first, ApprovalOutcome::ToppedUp { balance: 50_000, .. }));
        let second = store.approve_order(order_id, policy, now).await.unwrap();
        assert!(matches!(second, ApprovalOutcome::NotPending));
        assert_eq!(store.get_balance(buyer.id).await.unwrap(), 50_000);
        assert_eq!(store.pending_bonus_count().await, 1);

        assert_eq!(store.mature_referral_bonuses(now).await.unwrap(), 0);
        assert_eq!(store.mature_referral_bonuses(now + Duration::days(8)).await.unwrap(), 1);
        assert_eq!(store.mature_referral_bonuses(now + Duration::days(9)).await.unwrap(), 0);
        assert_eq!(store.wallet_balance(referrer.id).await, 5_000);
    }

    #[tokio::test]
    async fn withdrawal_approval_rechecks_minimum() {
        let store = MemoryStore::new();
        let user = store.upsert_user(&contact(1), None).await.unwrap();
        store.credit_wallet(user.id, 20_000).await;

        let WithdrawalRequestOutcome::Requested(w) = store.request_withdrawal(user.id, 10_000).await.unwrap() else {
            panic!("expected request");
        };
        assert!(matches!(
            store.request_withdrawal(user.id, 10_000).await.unwrap(),
            WithdrawalRequestOutcome::AlreadyPending(_)
        ));

        let decision = store.approve_withdrawal(w.id, 30_000).await.unwrap();
        assert!(matches!(decision, WithdrawalDecision::BelowMinimum { wallet: 20_000, .. }));

        let WithdrawalRequestOutcome::Requested(w) = store.request_withdrawal(user.id, 10_000).await.unwrap() else {
            panic!("expected request");
        };
        let decision = store.approve_withdrawal(w.id, 10_000).await.unwrap();
        assert!(matches!(decision, WithdrawalDecision::Approved { balance: 20_000, .. }));
        assert_eq!(store.wallet_balance(user.id).await, 0);
        assert!(matches!(
            store.approve_withdrawal(w.id, 10_000).await.unwrap(),
            WithdrawalDecision::NotPending
        ));
    }

    #[tokio::test]
    async fn support_attaches_then_caps_new_tickets() {
        let store = MemoryStore::new();
        let user = store.upsert_user(&contact(1), None).await.unwrap();
        let submit = |text: &str, force_new: bool| SupportSubmission {
            user_id: user.id,
            chat_id: 1,
            username: None,
            text: text.to_string(),
            force_new,
            open_cap: 2,
        };

        let TicketOutcome::Opened(first) = store.submit_support_message(&submit("hi", false)).await.unwrap() else {
            panic!("expected open");
        };
        let TicketOutcome::Attached(same) = store.submit_support_message(&submit("again", false)).await.unwrap()
        else {
            panic!("expected attach");
        };
        assert_eq!(same.id, first.id);
        assert_eq!(same.message_count, 2);

        let TicketOutcome::Opened(second) = store.submit_support_message(&submit("new", true)).await.unwrap() else {
            panic!("expected second ticket");
        };
        assert_eq!(second.user_ticket_id, 2);
        assert!(matches!(
            store.submit_support_message(&submit("third", true)).await.unwrap(),
            TicketOutcome::CapReached { open: 2 }
        ));

        store.close_ticket(first.id).await.unwrap();
        assert!(store.add_admin_reply(first.id, "late").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn promo_redeems_once_per_user() {
        let store = MemoryStore::new();
        let user = store.upsert_user(&contact(1), None).await.unwrap();
        store
            .add_promo(PromoCode {
                code: "WELCOME".to_string(),
                bonus_minor: 10_000,
                active: true,
                max_uses: Some(10),
                used_count: 0,
                expires_at: None,
            })
            .await;
        let now = Utc::now();
        assert_eq!(
            store.redeem_promo(user.id, " welcome ", now).await.unwrap(),
            PromoOutcome::Redeemed {
                bonus: 10_000,
                balance: 10_000
            }
        );
        assert_eq!(
            store.redeem_promo(user.id, "WELCOME", now).await.unwrap(),
            PromoOutcome::AlreadyUsed
        );
        assert_eq!(store.redeem_promo(user.id, "NOPE", now).await.unwrap(), PromoOutcome::NotFound);
    }
}
