//! The persistence contract consumed by the bot.
//!
//! Every method is a single atomic unit. Operations that pair a monetary
//! effect with provisioning or a state change (`purchase_profile`,
//! `renew_profile`, `approve_order`, ...) run inside one transaction, so a
//! caller never observes half of them.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::activity::Event;
use crate::models::catalog::{Plan, Profile, ProfileSource, Server};
use crate::models::order::{NewOrder, NewProof, Order, PaymentRecord, Proof};
use crate::models::referral::{BonusPolicy, ReferralSummary, Withdrawal};
use crate::models::session::{FlowState, PayloadPatch};
use crate::models::support::Ticket;
use crate::models::user::{Account, Contact, ReferrerRef, User, UserSettings};

/// Result of a balance mutation. Debits never take the balance below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceChange {
    Applied { balance: i64 },
    Insufficient { balance: i64 },
}

/// Profile to issue for a user, trial or paid.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub tg_id: i64,
    pub user_id: i64,
    pub protocol: String,
    pub server_id: i64,
    pub plan_id: i64,
    pub price_minor: i64,
    pub duration_days: i32,
    pub now: DateTime<Utc>,
}

impl ProvisionRequest {
    pub fn access_until(&self) -> DateTime<Utc> {
        self.now + chrono::Duration::days(self.duration_days as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    Issued {
        config_uri: String,
        access_until: DateTime<Utc>,
    },
    AlreadyUsed,
    ServerUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseOutcome {
    Issued {
        config_uri: String,
        access_until: DateTime<Utc>,
        balance: i64,
    },
    Insufficient {
        balance: i64,
        price: i64,
    },
    /// The chosen server was disabled; nothing was debited.
    ServerUnavailable,
}

#[derive(Debug, Clone)]
pub struct RenewRequest {
    pub tg_id: i64,
    pub user_id: i64,
    pub profile_id: i64,
    pub plan_id: i64,
    pub price_minor: i64,
    pub duration_days: i32,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed {
        access_until: DateTime<Utc>,
        balance: i64,
    },
    Insufficient {
        balance: i64,
        price: i64,
    },
    /// The profile left the active set (expired, revoked, trial).
    ProfileGone,
}

#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    /// Already approved, rejected, or missing.
    NotPending,
    ToppedUp {
        order: Order,
        balance: i64,
    },
    Provisioned {
        order: Order,
        config_uri: String,
        access_until: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub enum WithdrawalRequestOutcome {
    Requested(Withdrawal),
    AlreadyPending(Withdrawal),
    BelowMinimum { balance: i64, minimum: i64 },
}

#[derive(Debug, Clone)]
pub enum WithdrawalDecision {
    NotPending,
    Approved { withdrawal: Withdrawal, balance: i64 },
    /// Wallet dropped under the minimum after the request was filed.
    BelowMinimum { withdrawal: Withdrawal, wallet: i64 },
    Rejected(Withdrawal),
}

#[derive(Debug, Clone)]
pub struct SupportSubmission {
    pub user_id: i64,
    pub chat_id: i64,
    pub username: Option<String>,
    pub text: String,
    pub force_new: bool,
    pub open_cap: i64,
}

#[derive(Debug, Clone)]
pub enum TicketOutcome {
    Attached(Ticket),
    Opened(Ticket),
    CapReached { open: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoOutcome {
    Redeemed { bonus: i64, balance: i64 },
    NotFound,
    Expired,
    Exhausted,
    AlreadyUsed,
}

#[async_trait]
pub trait Store: Send + Sync {
    // users and sessions
    async fn upsert_user(&self, contact: &Contact, referrer: Option<ReferrerRef>) -> Result<User>;
    async fn load_user_with_session(&self, tg_id: i64) -> Result<Option<Account>>;
    async fn user_by_id(&self, user_id: i64) -> Result<Option<User>>;
    async fn set_state_cleared(&self, tg_id: i64, state: FlowState) -> Result<()>;
    async fn set_state_payload(&self, tg_id: i64, state: FlowState, patch: PayloadPatch) -> Result<()>;
    async fn user_settings(&self, user_id: i64) -> Result<UserSettings>;
    async fn toggle_notifications(&self, user_id: i64) -> Result<UserSettings>;

    // catalog
    async fn list_servers(&self) -> Result<Vec<Server>>;
    async fn load_server(&self, server_id: i64) -> Result<Option<Server>>;
    async fn list_active_plans(&self) -> Result<Vec<Plan>>;
    async fn load_plan(&self, plan_id: i64) -> Result<Option<Plan>>;

    // balance
    async fn get_balance(&self, user_id: i64) -> Result<i64>;
    async fn apply_balance_delta(
        &self,
        user_id: i64,
        delta: i64,
        reason: &str,
        meta: Value,
    ) -> Result<BalanceChange>;

    // profiles
    async fn list_active_profiles(&self, user_id: i64) -> Result<Vec<Profile>>;
    async fn has_trial_used(&self, user_id: i64) -> Result<bool>;
    async fn update_profile_access_until(&self, profile_id: i64, until: DateTime<Utc>) -> Result<bool>;
    async fn create_profile_stub(
        &self,
        user_id: i64,
        protocol: &str,
        server_id: i64,
        source: ProfileSource,
        access_until: Option<DateTime<Utc>>,
    ) -> Result<String>;
    async fn issue_trial(&self, req: &ProvisionRequest) -> Result<TrialOutcome>;
    async fn purchase_profile(&self, req: &ProvisionRequest) -> Result<PurchaseOutcome>;
    async fn renew_profile(&self, req: &RenewRequest) -> Result<RenewOutcome>;

    // orders
    async fn create_order_with_proof(&self, tg_id: i64, order: &NewOrder, proof: &NewProof) -> Result<i64>;
    async fn load_order(&self, order_id: i64) -> Result<Option<Order>>;
    async fn load_proof_for_order(&self, order_id: i64) -> Result<Option<Proof>>;
    async fn payment_history(&self, user_id: i64, limit: i64) -> Result<Vec<PaymentRecord>>;
    async fn approve_order(&self, order_id: i64, bonus: BonusPolicy, now: DateTime<Utc>) -> Result<ApprovalOutcome>;
    async fn reject_order(&self, order_id: i64) -> Result<Option<Order>>;

    // referral
    async fn referral_summary(&self, user_id: i64) -> Result<ReferralSummary>;
    async fn mature_referral_bonuses(&self, now: DateTime<Utc>) -> Result<u64>;
    async fn request_withdrawal(&self, user_id: i64, minimum: i64) -> Result<WithdrawalRequestOutcome>;
    async fn approve_withdrawal(&self, withdrawal_id: i64, minimum: i64) -> Result<WithdrawalDecision>;
    async fn reject_withdrawal(&self, withdrawal_id: i64) -> Result<WithdrawalDecision>;

    // support
    async fn submit_support_message(&self, submission: &SupportSubmission) -> Result<TicketOutcome>;
    async fn add_admin_reply(&self, ticket_id: i64, text: &str) -> Result<Option<Ticket>>;
    async fn close_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>>;

    // promo
    async fn redeem_promo(&self, user_id: i64, code: &str, now: DateTime<Utc>) -> Result<PromoOutcome>;

    async fn log_event(&self, event: &Event) -> Result<()>;
}

/// Expiry after renewal: lapsed profiles restart from `now`, live ones
/// extend from their current expiry.
pub fn renewal_expiry(now: DateTime<Utc>, current: Option<DateTime<Utc>>, duration_days: i32) -> DateTime<Utc> {
    let base = match current {
        Some(until) if until > now => until,
        _ => now,
    };
    base + chrono::Duration::days(duration_days as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn renewal_extends_live_profile_from_expiry() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let until = now + Duration::days(10);
        assert_eq!(renewal_expiry(now, Some(until), 30), until + Duration::days(30));
    }

    #[test]
    fn renewal_of_lapsed_profile_starts_now() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let until = now - Duration::days(3);
        assert_eq!(renewal_expiry(now, Some(until), 30), now + Duration::days(30));
        assert_eq!(renewal_expiry(now, None, 7), now + Duration::days(7));
    }

    #[test]
    fn two_renewals_chain_from_post_first_expiry() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let until = now + Duration::days(5);
        let first = renewal_expiry(now, Some(until), 30);
        let second = renewal_expiry(now, Some(first), 60);
        assert_eq!(second, renewal_expiry(now, Some(until), 90));
    }
}
