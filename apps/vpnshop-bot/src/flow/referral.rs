use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use vpnshop_db::models::session::FlowState;
use vpnshop_db::store::WithdrawalRequestOutcome;

use super::Ctx;
use crate::bot::keyboards;
use crate::bot::utils::{format_dt, format_money};
use crate::guard::Ack;
use crate::transport::Screen;

/// Referral screen. Bonuses that are already due are moved into the wallet
/// first so the numbers shown are current.
pub(super) async fn show(ctx: &mut Ctx<'_>, notice: Option<&str>) -> Result<Ack> {
    match ctx.store().mature_referral_bonuses(Utc::now()).await {
        Ok(0) => {}
        Ok(n) => info!(credited = n, "referral bonuses matured on view"),
        Err(e) => warn!(tg_id = ctx.actor.tg_id, "referral sweep failed: {:#}", e),
    }

    ctx.clear(FlowState::Menu).await?;
    let summary = ctx.store().referral_summary(ctx.user().id).await?;
    let currency = ctx.currency().to_string();
    let minimum = ctx.app.config.min_withdraw_minor();

    let mut text = String::new();
    if let Some(notice) = notice {
        text.push_str(notice);
        text.push_str("\n\n");
    }
    text.push_str(&format!(
        "🤝 Invite a friend\n\n\
         Your link: {}\n\n\
         You get {}% of every payment your friends make. \
         A bonus reaches the wallet {} days after the payment.\n\n\
         Invited: {}\n\
         Wallet: {}\n\
         Pending bonuses: {}\n\
         Minimum withdrawal: {}",
        ctx.app.referral_link(ctx.user()),
        ctx.app.config.referral_percent,
        ctx.app.config.referral_delay_days,
        summary.invited,
        format_money(summary.wallet_balance, &currency),
        format_money(summary.pending_bonus, &currency),
        format_money(minimum, &currency)
    ));
    if let Some(w) = &summary.pending_withdrawal {
        text.push_str(&format!(
            "\n\n⏳ Withdrawal of {} requested {} is waiting for review.",
            format_money(w.amount, &currency),
            format_dt(Some(w.created_at))
        ));
    }

    let can_withdraw = summary.pending_withdrawal.is_none() && summary.wallet_balance >= minimum;
    ctx.show(
        Screen::text(text)
            .keyboard(keyboards::referral(can_withdraw))
            .no_preview(),
    )
    .await?;
    Ok(Ack::Silent)
}

/// Files a request to move the wallet into the main balance.
pub(super) async fn withdraw(ctx: &mut Ctx<'_>) -> Result<Ack> {
    let minimum = ctx.app.config.min_withdraw_minor();
    let currency = ctx.currency().to_string();
    let outcome = ctx.store().request_withdrawal(ctx.user().id, minimum).await?;
    match outcome {
        WithdrawalRequestOutcome::Requested(w) => {
            info!(tg_id = ctx.actor.tg_id, withdrawal_id = w.id, amount = w.amount, "withdrawal requested");
            let note = Screen::text(format!(
                "💰 Withdrawal request #{}\nFrom: {}\nAmount: {}",
                w.id,
                ctx.user().display_name(),
                format_money(w.amount, &currency)
            ))
            .keyboard(keyboards::admin_withdrawal(w.id));
            ctx.notify_admins(&note).await;
            show(ctx, Some("✅ Withdrawal request sent. An administrator will review it.")).await
        }
        WithdrawalRequestOutcome::AlreadyPending(_) => {
            Ok(Ack::alert("You already have a pending withdrawal request."))
        }
        WithdrawalRequestOutcome::BelowMinimum { balance, minimum } => Ok(Ack::alert(format!(
            "The minimum withdrawal is {}. Your wallet: {}.",
            format_money(minimum, &currency),
            format_money(balance, &currency)
        ))),
    }
}
