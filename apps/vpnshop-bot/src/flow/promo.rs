use anyhow::Result;
use chrono::Utc;
use tracing::info;

use vpnshop_db::models::session::FlowState;
use vpnshop_db::store::PromoOutcome;

use super::Ctx;
use crate::bot::keyboards;
use crate::bot::utils::format_money;
use crate::guard::Ack;
use crate::transport::Screen;

pub(super) async fn start(ctx: &mut Ctx<'_>) -> Result<Ack> {
    ctx.clear(FlowState::PromoWait).await?;
    ctx.show(Screen::text("🏷️ Send your promo code:").keyboard(keyboards::back_to_menu()))
        .await?;
    Ok(Ack::Silent)
}

/// Failed attempts keep the user in `promo_wait` so they can retype.
pub(super) async fn redeem(ctx: &mut Ctx<'_>, code: &str) -> Result<()> {
    let outcome = ctx
        .store()
        .redeem_promo(ctx.user().id, code, Utc::now())
        .await?;
    let currency = ctx.currency().to_string();
    let retry = |text: &str| {
        Screen::text(format!("{}\nTry another code or go back to the menu.", text))
            .keyboard(keyboards::back_to_menu())
    };

    let screen = match outcome {
        PromoOutcome::Redeemed { bonus, balance } => {
            info!(tg_id = ctx.actor.tg_id, bonus, "promo code redeemed");
            ctx.clear(FlowState::Menu).await?;
            Screen::text(format!(
                "✅ Promo code applied: +{}.\nYour balance: {}",
                format_money(bonus, &currency),
                format_money(balance, &currency)
            ))
            .keyboard(keyboards::back_to_menu())
        }
        PromoOutcome::NotFound => retry("⚠️ Promo code not found."),
        PromoOutcome::Expired => retry("⚠️ This promo code has expired."),
        PromoOutcome::Exhausted => retry("⚠️ This promo code has been used up."),
        PromoOutcome::AlreadyUsed => retry("⚠️ You have already used this promo code."),
    };
    ctx.show(screen).await
}
