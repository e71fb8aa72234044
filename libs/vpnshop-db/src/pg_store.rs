use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::models::activity::{Event, EventCategory};
use crate::models::catalog::{Plan, Profile, ProfileSource, Server};
use crate::models::order::{NewOrder, NewProof, Order, OrderKind, OrderStatus, PaymentRecord, Proof};
use crate::models::promo::PromoCode;
use crate::models::referral::{BonusPolicy, ReferralSummary, WithdrawalStatus};
use crate::models::session::{FlowState, PayloadPatch};
use crate::models::support::{Sender, Ticket};
use crate::models::user::{Account, Contact, ReferrerRef, User, UserSettings};
use crate::repositories::activity_repo::ActivityRepository;
use crate::repositories::catalog_repo::CatalogRepository;
use crate::repositories::ledger_repo::LedgerRepository;
use crate::repositories::order_repo::OrderRepository;
use crate::repositories::profile_repo::ProfileRepository;
use crate::repositories::promo_repo::PromoRepository;
use crate::repositories::referral_repo::ReferralRepository;
use crate::repositories::support_repo::SupportRepository;
use crate::repositories::user_repo::UserRepository;
use crate::store::{
    ApprovalOutcome, BalanceChange, PromoOutcome, ProvisionRequest, PurchaseOutcome, RenewOutcome,
    RenewRequest, Store, SupportSubmission, TicketOutcome, TrialOutcome, WithdrawalDecision,
    WithdrawalRequestOutcome, renewal_expiry,
};

/// PostgreSQL-backed [`Store`]. Composite operations open one transaction
/// and commit only after every paired effect succeeded.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_user(&self, contact: &Contact, referrer: Option<ReferrerRef>) -> Result<User> {
        let mut tx = self.pool.begin().await?;
        let user = UserRepository::upsert(&mut tx, contact, referrer).await?;
        tx.commit().await?;
        Ok(user)
    }

    async fn load_user_with_session(&self, tg_id: i64) -> Result<Option<Account>> {
        let mut conn = self.pool.acquire().await?;
        UserRepository::load_with_session(&mut conn, tg_id).await
    }

    async fn user_by_id(&self, user_id: i64) -> Result<Option<User>> {
        let mut conn = self.pool.acquire().await?;
        UserRepository::get_by_id(&mut conn, user_id).await
    }

    async fn set_state_cleared(&self, tg_id: i64, state: FlowState) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        UserRepository::set_state_cleared(&mut conn, tg_id, state).await
    }

    async fn set_state_payload(&self, tg_id: i64, state: FlowState, patch: PayloadPatch) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        UserRepository::set_state_payload(&mut conn, tg_id, state, &patch).await
    }

    async fn user_settings(&self, user_id: i64) -> Result<UserSettings> {
        let mut conn = self.pool.acquire().await?;
        UserRepository::settings(&mut conn, user_id).await
    }

    async fn toggle_notifications(&self, user_id: i64) -> Result<UserSettings> {
        let mut conn = self.pool.acquire().await?;
        UserRepository::toggle_notifications(&mut conn, user_id).await
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        let mut conn = self.pool.acquire().await?;
        CatalogRepository::list_servers(&mut conn).await
    }

    async fn load_server(&self, server_id: i64) -> Result<Option<Server>> {
        let mut conn = self.pool.acquire().await?;
        CatalogRepository::get_server(&mut conn, server_id).await
    }

    async fn list_active_plans(&self) -> Result<Vec<Plan>> {
        let mut conn = self.pool.acquire().await?;
        CatalogRepository::list_active_plans(&mut conn).await
    }

    async fn load_plan(&self, plan_id: i64) -> Result<Option<Plan>> {
        let mut conn = self.pool.acquire().await?;
        CatalogRepository::get_plan(&mut conn, plan_id).await
    }

    async fn get_balance(&self, user_id: i64) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        LedgerRepository::get_balance(&mut conn, user_id).await
    }

    async fn apply_balance_delta(&self, user_id: i64, delta: i64, reason: &str, meta: Value) -> Result<BalanceChange> {
        let mut tx = self.pool.begin().await?;
        let change = LedgerRepository::apply_delta(&mut tx, user_id, delta, reason, &meta).await?;
        tx.commit().await?;
        Ok(change)
    }

    async fn list_active_profiles(&self, user_id: i64) -> Result<Vec<Profile>> {
        let mut conn = self.pool.acquire().await?;
        ProfileRepository::list_active(&mut conn, user_id).await
    }

    async fn has_trial_used(&self, user_id: i64) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        ProfileRepository::has_trial(&mut conn, user_id).await
    }

    async fn update_profile_access_until(&self, profile_id: i64, until: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        ProfileRepository::set_access_until(&mut conn, profile_id, until).await
    }

    async fn create_profile_stub(
        &self,
        user_id: i64,
        protocol: &str,
        server_id: i64,
        source: ProfileSource,
        access_until: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let mut conn = self.pool.acquire().await?;
        ProfileRepository::create_stub(&mut conn, user_id, protocol, server_id, source, access_until)
            .await?
            .context("trial already issued for this user")
    }

    async fn issue_trial(&self, req: &ProvisionRequest) -> Result<TrialOutcome> {
        let mut tx = self.pool.begin().await?;
        if !CatalogRepository::lock_live_server(&mut tx, req.server_id).await? {
            debug!(server_id = req.server_id, "Trial refused, server disabled");
            return Ok(TrialOutcome::ServerUnavailable);
        }
        let access_until = req.access_until();
        let issued = ProfileRepository::create_stub(
            &mut tx,
            req.user_id,
            &req.protocol,
            req.server_id,
            ProfileSource::Trial,
            Some(access_until),
        )
        .await?;
        let Some(config_uri) = issued else {
            debug!(user_id = req.user_id, "Trial already used");
            return Ok(TrialOutcome::AlreadyUsed);
        };

        UserRepository::set_state_cleared(&mut tx, req.tg_id, FlowState::Menu).await?;
        let event = Event::info(EventCategory::UserActions, "trial_issued")
            .actor(req.tg_id, req.user_id)
            .context(json!({ "protocol": req.protocol, "server_id": req.server_id, "plan_id": req.plan_id }));
        ActivityRepository::insert(&mut tx, &event).await?;
        tx.commit().await?;

        info!(user_id = req.user_id, server_id = req.server_id, "Trial profile issued");
        Ok(TrialOutcome::Issued { config_uri, access_until })
    }

    async fn purchase_profile(&self, req: &ProvisionRequest) -> Result<PurchaseOutcome> {
        let mut tx = self.pool.begin().await?;
        if !CatalogRepository::lock_live_server(&mut tx, req.server_id).await? {
            debug!(server_id = req.server_id, "Purchase refused, server disabled");
            return Ok(PurchaseOutcome::ServerUnavailable);
        }
        let meta = json!({ "plan_id": req.plan_id, "protocol": req.protocol, "server_id": req.server_id });
        let balance =
            match LedgerRepository::apply_delta(&mut tx, req.user_id, -req.price_minor, "plan_purchase", &meta).await? {
                BalanceChange::Applied { balance } => balance,
                BalanceChange::Insufficient { balance } => {
                    return Ok(PurchaseOutcome::Insufficient {
                        balance,
                        price: req.price_minor,
                    });
                }
            };

        let access_until = req.access_until();
        let config_uri = ProfileRepository::create_stub(
            &mut tx,
            req.user_id,
            &req.protocol,
            req.server_id,
            ProfileSource::Paid,
            Some(access_until),
        )
        .await?
        .context("paid profile insert returned nothing")?;

        UserRepository::set_state_cleared(&mut tx, req.tg_id, FlowState::Menu).await?;
        let event = Event::info(EventCategory::Payments, "plan_purchased")
            .actor(req.tg_id, req.user_id)
            .context(meta);
        ActivityRepository::insert(&mut tx, &event).await?;
        tx.commit().await?;

        info!(user_id = req.user_id, plan_id = req.plan_id, balance, "Plan purchased from balance");
        Ok(PurchaseOutcome::Issued {
            config_uri,
            access_until,
            balance,
        })
    }

    async fn renew_profile(&self, req: &RenewRequest) -> Result<RenewOutcome> {
        let mut tx = self.pool.begin().await?;
        let Some(current) = ProfileRepository::lock_renewable(&mut tx, req.profile_id, req.user_id).await? else {
            return Ok(RenewOutcome::ProfileGone);
        };

        let meta = json!({ "profile_id": req.profile_id, "plan_id": req.plan_id });
        let balance =
            match LedgerRepository::apply_delta(&mut tx, req.user_id, -req.price_minor, "renewal", &meta).await? {
                BalanceChange::Applied { balance } => balance,
                BalanceChange::Insufficient { balance } => {
                    return Ok(RenewOutcome::Insufficient {
                        balance,
                        price: req.price_minor,
                    });
                }
            };

        let access_until = renewal_expiry(req.now, current, req.duration_days);
        ProfileRepository::set_access_until(&mut tx, req.profile_id, access_until).await?;
        UserRepository::set_state_cleared(&mut tx, req.tg_id, FlowState::Menu).await?;
        let event = Event::info(EventCategory::Payments, "profile_renewed")
            .actor(req.tg_id, req.user_id)
            .context(meta);
        ActivityRepository::insert(&mut tx, &event).await?;
        tx.commit().await?;

        info!(profile_id = req.profile_id, %access_until, "Profile renewed");
        Ok(RenewOutcome::Renewed { access_until, balance })
    }

    async fn create_order_with_proof(&self, tg_id: i64, order: &NewOrder, proof: &NewProof) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let order_id = OrderRepository::insert_with_proof(&mut tx, order, proof).await?;
        UserRepository::set_state_cleared(&mut tx, tg_id, FlowState::Menu).await?;
        let event = Event::info(EventCategory::Payments, "proof_uploaded")
            .actor(tg_id, order.user_id)
            .context(json!({ "order_id": order_id, "kind": order.kind.as_str(), "amount": order.amount_minor }));
        ActivityRepository::insert(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(order_id)
    }

    async fn load_order(&self, order_id: i64) -> Result<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        OrderRepository::get(&mut conn, order_id).await
    }

    async fn load_proof_for_order(&self, order_id: i64) -> Result<Option<Proof>> {
        let mut conn = self.pool.acquire().await?;
        OrderRepository::proof_for(&mut conn, order_id).await
    }

    async fn payment_history(&self, user_id: i64, limit: i64) -> Result<Vec<PaymentRecord>> {
        let mut conn = self.pool.acquire().await?;
        OrderRepository::history(&mut conn, user_id, limit).await
    }

    async fn approve_order(&self, order_id: i64, bonus: BonusPolicy, now: DateTime<Utc>) -> Result<ApprovalOutcome> {
        let mut tx = self.pool.begin().await?;
        let Some(order) = OrderRepository::decide(&mut tx, order_id, OrderStatus::Paid).await? else {
            return Ok(ApprovalOutcome::NotPending);
        };

        let plan = match (order.kind, order.plan_id) {
            (OrderKind::Plan, Some(plan_id)) => CatalogRepository::get_plan(&mut tx, plan_id).await?,
            _ => None,
        };

        let server_live = match order.server_id {
            Some(server_id) => CatalogRepository::lock_live_server(&mut tx, server_id).await?,
            None => false,
        };

        let outcome = match (plan, order.protocol.clone(), order.server_id) {
            (Some(plan), Some(protocol), Some(server_id)) if server_live => {
                let access_until = now + chrono::Duration::days(plan.duration_days as i64);
                let config_uri = ProfileRepository::create_stub(
                    &mut tx,
                    order.user_id,
                    &protocol,
                    server_id,
                    ProfileSource::Paid,
                    Some(access_until),
                )
                .await?
                .context("paid profile insert returned nothing")?;
                ApprovalOutcome::Provisioned {
                    order: order.clone(),
                    config_uri,
                    access_until,
                }
            }
            _ => {
                // Top-ups, and plan orders whose selection can no longer be
                // provisioned, land on the main balance.
                let meta = json!({ "order_id": order.id });
                match LedgerRepository::apply_delta(&mut tx, order.user_id, order.amount_minor, "topup", &meta).await? {
                    BalanceChange::Applied { balance } | BalanceChange::Insufficient { balance } => {
                        ApprovalOutcome::ToppedUp {
                            order: order.clone(),
                            balance,
                        }
                    }
                }
            }
        };

        if let Some(user) = UserRepository::get_by_id(&mut tx, order.user_id).await? {
            if let Some(referrer_id) = user.referrer_id {
                ReferralRepository::schedule_bonus(&mut tx, &order, referrer_id, bonus, now).await?;
            }
        }

        let event = Event::info(EventCategory::AdminActions, "order_approved")
            .context(json!({ "order_id": order.id, "kind": order.kind.as_str(), "amount": order.amount_minor }));
        ActivityRepository::insert(&mut tx, &event).await?;
        tx.commit().await?;

        info!(order_id = order.id, "Order approved");
        Ok(outcome)
    }

    async fn reject_order(&self, order_id: i64) -> Result<Option<Order>> {
        let mut tx = self.pool.begin().await?;
        let order = OrderRepository::decide(&mut tx, order_id, OrderStatus::Failed).await?;
        if let Some(order) = &order {
            let event = Event::info(EventCategory::AdminActions, "order_rejected")
                .context(json!({ "order_id": order.id }));
            ActivityRepository::insert(&mut tx, &event).await?;
        }
        tx.commit().await?;
        Ok(order)
    }

    async fn referral_summary(&self, user_id: i64) -> Result<ReferralSummary> {
        let mut conn = self.pool.acquire().await?;
        ReferralRepository::summary(&mut conn, user_id).await
    }

    async fn mature_referral_bonuses(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let matured = ReferralRepository::mature_due(&mut tx, now).await?;
        tx.commit().await?;
        if matured > 0 {
            info!(matured, "Referral bonuses matured");
        }
        Ok(matured)
    }

    async fn request_withdrawal(&self, user_id: i64, minimum: i64) -> Result<WithdrawalRequestOutcome> {
        let mut tx = self.pool.begin().await?;
        if let Some(existing) = ReferralRepository::pending_withdrawal(&mut tx, user_id).await? {
            return Ok(WithdrawalRequestOutcome::AlreadyPending(existing));
        }
        let balance = ReferralRepository::lock_wallet(&mut tx, user_id).await?;
        if balance <= 0 || balance < minimum {
            return Ok(WithdrawalRequestOutcome::BelowMinimum { balance, minimum });
        }
        let outcome = match ReferralRepository::insert_withdrawal(&mut tx, user_id, balance).await? {
            Some(withdrawal) => WithdrawalRequestOutcome::Requested(withdrawal),
            None => match ReferralRepository::pending_withdrawal(&mut tx, user_id).await? {
                Some(existing) => WithdrawalRequestOutcome::AlreadyPending(existing),
                None => anyhow::bail!("withdrawal for user {} neither inserted nor pending", user_id),
            },
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn approve_withdrawal(&self, withdrawal_id: i64, minimum: i64) -> Result<WithdrawalDecision> {
        let mut tx = self.pool.begin().await?;
        let Some(pending) = ReferralRepository::lock_pending_withdrawal(&mut tx, withdrawal_id).await? else {
            return Ok(WithdrawalDecision::NotPending);
        };

        let wallet = ReferralRepository::lock_wallet(&mut tx, pending.user_id).await?;
        if wallet <= 0 || wallet < minimum {
            let withdrawal =
                ReferralRepository::decide_withdrawal(&mut tx, withdrawal_id, WithdrawalStatus::Rejected, None)
                    .await?
                    .unwrap_or(pending);
            tx.commit().await?;
            return Ok(WithdrawalDecision::BelowMinimum { withdrawal, wallet });
        }

        let meta = json!({ "withdrawal_id": withdrawal_id });
        let balance =
            match LedgerRepository::apply_delta(&mut tx, pending.user_id, wallet, "referral_withdrawal", &meta).await? {
                BalanceChange::Applied { balance } | BalanceChange::Insufficient { balance } => balance,
            };
        ReferralRepository::zero_wallet(&mut tx, pending.user_id).await?;
        let withdrawal =
            ReferralRepository::decide_withdrawal(&mut tx, withdrawal_id, WithdrawalStatus::Approved, Some(wallet))
                .await?
                .unwrap_or(pending);

        let event = Event::info(EventCategory::AdminActions, "withdrawal_approved")
            .context(json!({ "withdrawal_id": withdrawal_id, "amount": wallet }));
        ActivityRepository::insert(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(WithdrawalDecision::Approved { withdrawal, balance })
    }

    async fn reject_withdrawal(&self, withdrawal_id: i64) -> Result<WithdrawalDecision> {
        let mut tx = self.pool.begin().await?;
        let decided =
            ReferralRepository::decide_withdrawal(&mut tx, withdrawal_id, WithdrawalStatus::Rejected, None).await?;
        tx.commit().await?;
        Ok(match decided {
            Some(withdrawal) => WithdrawalDecision::Rejected(withdrawal),
            None => WithdrawalDecision::NotPending,
        })
    }

    async fn submit_support_message(&self, submission: &SupportSubmission) -> Result<TicketOutcome> {
        let mut tx = self.pool.begin().await?;
        SupportRepository::lock_user(&mut tx, submission.user_id).await?;

        if !submission.force_new {
            if let Some(open) = SupportRepository::latest_open(&mut tx, submission.user_id).await? {
                let ticket = SupportRepository::append_message(&mut tx, open.id, Sender::User, &submission.text)
                    .await?
                    .unwrap_or(open);
                tx.commit().await?;
                return Ok(TicketOutcome::Attached(ticket));
            }
        }

        let open = SupportRepository::count_open(&mut tx, submission.user_id).await?;
        if open >= submission.open_cap {
            return Ok(TicketOutcome::CapReached { open });
        }

        let created = SupportRepository::open_ticket(
            &mut tx,
            submission.user_id,
            submission.chat_id,
            submission.username.as_deref(),
        )
        .await?;
        let ticket = SupportRepository::append_message(&mut tx, created.id, Sender::User, &submission.text)
            .await?
            .unwrap_or(created);
        tx.commit().await?;

        info!(ticket_id = ticket.id, user_ticket_id = ticket.user_ticket_id, "Support ticket opened");
        Ok(TicketOutcome::Opened(ticket))
    }

    async fn add_admin_reply(&self, ticket_id: i64, text: &str) -> Result<Option<Ticket>> {
        let mut tx = self.pool.begin().await?;
        let ticket = SupportRepository::append_message(&mut tx, ticket_id, Sender::Admin, text).await?;
        tx.commit().await?;
        Ok(ticket)
    }

    async fn close_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>> {
        let mut conn = self.pool.acquire().await?;
        SupportRepository::close(&mut conn, ticket_id).await
    }

    async fn redeem_promo(&self, user_id: i64, code: &str, now: DateTime<Utc>) -> Result<PromoOutcome> {
        let code = PromoCode::normalize(code);
        let mut tx = self.pool.begin().await?;
        let Some(promo) = PromoRepository::lock_active(&mut tx, &code).await? else {
            return Ok(PromoOutcome::NotFound);
        };
        if promo.is_expired(now) {
            return Ok(PromoOutcome::Expired);
        }
        if promo.is_exhausted() {
            return Ok(PromoOutcome::Exhausted);
        }
        if !PromoRepository::record_usage(&mut tx, user_id, &promo.code).await? {
            return Ok(PromoOutcome::AlreadyUsed);
        }

        let meta = json!({ "code": promo.code });
        let balance =
            match LedgerRepository::apply_delta(&mut tx, user_id, promo.bonus_minor, "promo", &meta).await? {
                BalanceChange::Applied { balance } | BalanceChange::Insufficient { balance } => balance,
            };
        tx.commit().await?;

        info!(user_id, code = %promo.code, "Promo code redeemed");
        Ok(PromoOutcome::Redeemed {
            bonus: promo.bonus_minor,
            balance,
        })
    }

    async fn log_event(&self, event: &Event) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        ActivityRepository::insert(&mut conn, event).await
    }
}
