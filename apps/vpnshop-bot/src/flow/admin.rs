//! Administrator decisions on payments, withdrawals and support tickets.
//!
//! Decisions are idempotent at the store level: a second press finds the
//! row already decided and gets an alert. The customer is told about the
//! outcome on their own screen; a failed notification never undoes the
//! decision.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use vpnshop_db::models::order::{Order, OrderKind};
use vpnshop_db::models::session::{FlowState, PayloadPatch, SupportStep};
use vpnshop_db::store::{ApprovalOutcome, WithdrawalDecision};

use super::Ctx;
use super::action::Decision;
use crate::bot::keyboards;
use crate::bot::utils::{escape_html, format_dt, format_money};
use crate::guard::{Ack, best_effort};
use crate::screen::render_for_user;
use crate::transport::Screen;

const ALREADY_HANDLED: &str = "Order not found or already handled.";

/// Shows `screen` to the owner of `user_id`, logging instead of failing.
async fn tell_customer(ctx: &Ctx<'_>, user_id: i64, screen: Screen) {
    let user = match ctx.store().user_by_id(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(user_id, "customer to notify is gone");
            return;
        }
        Err(e) => {
            warn!(user_id, "customer lookup failed: {:#}", e);
            return;
        }
    };
    if let Err(e) = render_for_user(ctx.store(), ctx.app.transport.as_ref(), &user, &screen).await {
        warn!(user_id, tg_id = user.tg_id, "customer notification failed: {:#}", e);
    }
}

fn money(order: &Order) -> String {
    format_money(order.amount_minor, &order.currency)
}

pub(super) async fn payment(ctx: &mut Ctx<'_>, decision: Decision, order_id: i64) -> Result<Ack> {
    match decision {
        Decision::Approve => {
            let outcome = ctx
                .store()
                .approve_order(order_id, ctx.app.config.bonus_policy(), Utc::now())
                .await?;
            match outcome {
                ApprovalOutcome::NotPending => Ok(Ack::alert(ALREADY_HANDLED)),
                ApprovalOutcome::ToppedUp { order, balance } => {
                    info!(admin = ctx.actor.tg_id, order_id, user_id = order.user_id, "payment approved");
                    let text = match order.kind {
                        OrderKind::Topup => format!(
                            "✅ Payment #{} confirmed. Your balance was topped up by {}.\nBalance: {}",
                            order.id,
                            money(&order),
                            format_money(balance, &order.currency)
                        ),
                        OrderKind::Plan => format!(
                            "✅ Payment #{} confirmed. The key could not be issued automatically, \
                             so {} was credited to your balance.\nBalance: {}",
                            order.id,
                            money(&order),
                            format_money(balance, &order.currency)
                        ),
                    };
                    tell_customer(ctx, order.user_id, Screen::text(text).keyboard(keyboards::back_to_menu()))
                        .await;
                    Ok(Ack::text(format!("Payment #{} approved", order.id)))
                }
                ApprovalOutcome::Provisioned {
                    order,
                    config_uri,
                    access_until,
                } => {
                    info!(admin = ctx.actor.tg_id, order_id, user_id = order.user_id, "plan payment approved");
                    let screen = Screen::html(format!(
                        "✅ Payment #{} confirmed. Your key is ready.\nValid until: {}\n\n<code>{}</code>",
                        order.id,
                        format_dt(Some(access_until)),
                        escape_html(&config_uri)
                    ))
                    .keyboard(keyboards::instructions());
                    tell_customer(ctx, order.user_id, screen).await;
                    Ok(Ack::text(format!("Payment #{} approved, key issued", order.id)))
                }
            }
        }
        Decision::Reject => {
            let Some(order) = ctx.store().reject_order(order_id).await? else {
                return Ok(Ack::alert(ALREADY_HANDLED));
            };
            info!(admin = ctx.actor.tg_id, order_id, user_id = order.user_id, "payment rejected");
            let screen = Screen::text(format!(
                "❌ Payment #{} for {} was rejected.\nIf this is a mistake, please contact support.",
                order.id,
                money(&order)
            ))
            .keyboard(keyboards::back_to_menu());
            tell_customer(ctx, order.user_id, screen).await;
            Ok(Ack::text(format!("Payment #{} rejected", order.id)))
        }
    }
}

pub(super) async fn withdrawal(ctx: &mut Ctx<'_>, decision: Decision, withdrawal_id: i64) -> Result<Ack> {
    let minimum = ctx.app.config.min_withdraw_minor();
    let currency = ctx.currency().to_string();
    let outcome = match decision {
        Decision::Approve => ctx.store().approve_withdrawal(withdrawal_id, minimum).await?,
        Decision::Reject => ctx.store().reject_withdrawal(withdrawal_id).await?,
    };

    let (user_id, text, ack) = match outcome {
        WithdrawalDecision::NotPending => {
            return Ok(Ack::alert("Request not found or already handled."));
        }
        WithdrawalDecision::Approved { withdrawal, balance } => (
            withdrawal.user_id,
            format!(
                "✅ Withdrawal approved: {} moved to your balance.\nBalance: {}",
                format_money(withdrawal.amount, &currency),
                format_money(balance, &currency)
            ),
            format!("Withdrawal #{} approved", withdrawal.id),
        ),
        WithdrawalDecision::BelowMinimum { withdrawal, wallet } => (
            withdrawal.user_id,
            format!(
                "❌ Withdrawal rejected: your wallet ({}) is below the minimum of {}.",
                format_money(wallet, &currency),
                format_money(minimum, &currency)
            ),
            format!("Withdrawal #{} rejected: wallet below minimum", withdrawal.id),
        ),
        WithdrawalDecision::Rejected(withdrawal) => (
            withdrawal.user_id,
            "❌ Your withdrawal request was rejected.".to_string(),
            format!("Withdrawal #{} rejected", withdrawal.id),
        ),
    };
    info!(admin = ctx.actor.tg_id, withdrawal_id, user_id, "{}", ack);
    tell_customer(ctx, user_id, Screen::text(text).keyboard(keyboards::back_to_menu())).await;
    Ok(Ack::text(ack))
}

/// Puts the admin into reply mode for `ticket_id`; the next text message is
/// the answer.
pub(super) async fn ticket_reply(ctx: &mut Ctx<'_>, ticket_id: i64) -> Result<Ack> {
    ctx.forget_origin();
    ctx.patch(
        FlowState::SupportReply,
        PayloadPatch::Support(SupportStep {
            ticket_id: Some(ticket_id),
            new_ticket: None,
        }),
    )
    .await?;
    ctx.show(
        Screen::text(format!("Write the reply to ticket #{}:", ticket_id))
            .keyboard(keyboards::back_to_menu()),
    )
    .await?;
    Ok(Ack::Silent)
}

pub(super) async fn reply_text(ctx: &mut Ctx<'_>, text: &str) -> Result<()> {
    let Some(ticket_id) = ctx.payload().support.ticket_id else {
        ctx.clear(FlowState::Menu).await?;
        return ctx
            .show(Screen::text("⚠️ No ticket selected.").keyboard(keyboards::back_to_menu()))
            .await;
    };
    let Some(ticket) = ctx.store().add_admin_reply(ticket_id, text).await? else {
        ctx.clear(FlowState::Menu).await?;
        return ctx
            .show(Screen::text("⚠️ Ticket not found.").keyboard(keyboards::back_to_menu()))
            .await;
    };
    ctx.clear(FlowState::Menu).await?;
    info!(admin = ctx.actor.tg_id, ticket_id, "support reply sent");

    let answer = Screen::html(format!(
        "💬 Support reply (ticket #{}):\n\n{}",
        ticket.user_ticket_id,
        escape_html(text)
    ))
    .keyboard(keyboards::support());
    let delivered = best_effort("support reply", ctx.app.transport.send_message(ticket.chat_id, &answer))
        .await
        .is_some();

    let status = if delivered {
        format!("✅ Reply to ticket #{} sent.", ticket.id)
    } else {
        format!("⚠️ Reply to ticket #{} saved, but the user could not be reached.", ticket.id)
    };
    ctx.show(Screen::text(status).keyboard(keyboards::back_to_menu()))
        .await
}

pub(super) async fn ticket_close(ctx: &mut Ctx<'_>, ticket_id: i64) -> Result<Ack> {
    let Some(ticket) = ctx.store().close_ticket(ticket_id).await? else {
        return Ok(Ack::alert("Ticket not found or already closed."));
    };
    info!(admin = ctx.actor.tg_id, ticket_id, "ticket closed");
    let note = Screen::text(format!("✔️ Ticket #{} was closed.", ticket.user_ticket_id))
        .keyboard(keyboards::back_to_menu());
    best_effort("ticket closed note", ctx.app.transport.send_message(ticket.chat_id, &note)).await;
    Ok(Ack::text(format!("Ticket #{} closed", ticket.id)))
}
