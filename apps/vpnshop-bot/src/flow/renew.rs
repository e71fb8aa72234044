//! Key renewal: page through active keys, pick one, pay a plan from the
//! balance.

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use vpnshop_db::models::catalog::Profile;
use vpnshop_db::models::session::{FlowState, PayloadPatch, RenewStep};
use vpnshop_db::store::{RenewOutcome, RenewRequest};

use super::Ctx;
use super::cursor::{self, Direction};
use crate::bot::keyboards;
use crate::bot::utils::{escape_html, format_dt, format_money};
use crate::guard::Ack;
use crate::transport::Screen;

const TRIAL_NOT_RENEWABLE: &str = "⚠️ Trial keys cannot be renewed. Buy a plan to get a renewable key.";

/// HTML card for one key, shared with the profile key list.
pub(super) fn profile_card(profile: &Profile, total: usize) -> String {
    format!(
        "Found {} active key(s).\n\n\
         🔑 {}\n\
         Protocol: {}\n\
         Server: {}\n\
         Created: {}\n\
         Valid until: {}\n\
         Status: {}\n\n\
         <code>{}</code>",
        total,
        escape_html(&profile.key_name()),
        escape_html(&keyboards::protocol_label(&profile.protocol)),
        escape_html(
            profile
                .server_name
                .as_deref()
                .unwrap_or("-")
        ),
        format_dt(Some(profile.created_at)),
        format_dt(profile.access_until),
        escape_html(&profile.status),
        escape_html(profile.config_uri.as_deref().unwrap_or("-"))
    )
}

async fn no_keys(ctx: &mut Ctx<'_>) -> Result<Ack> {
    ctx.clear(FlowState::Menu).await?;
    ctx.show(Screen::text("You have no active keys.").keyboard(keyboards::pay_menu()))
        .await?;
    Ok(Ack::Silent)
}

async fn show_list(ctx: &mut Ctx<'_>, profiles: &[Profile], index: usize, notice: Option<&str>) -> Result<()> {
    ctx.patch(
        FlowState::Renew,
        PayloadPatch::Renew(RenewStep {
            index: Some(index),
            profile_id: None,
        }),
    )
    .await?;
    let card = profile_card(&profiles[index], profiles.len());
    let text = match notice {
        Some(notice) => format!("{}\n\n{}", escape_html(notice), card),
        None => card,
    };
    let screen = Screen::html(text)
        .keyboard(keyboards::renew_nav(index, profiles.len()));
    ctx.show(screen).await
}

pub(super) async fn start(ctx: &mut Ctx<'_>) -> Result<Ack> {
    let profiles = ctx.store().list_active_profiles(ctx.user().id).await?;
    if profiles.is_empty() {
        return no_keys(ctx).await;
    }
    ctx.clear(FlowState::Renew).await?;
    show_list(ctx, &profiles, 0, None).await?;
    Ok(Ack::Silent)
}

pub(super) async fn step(ctx: &mut Ctx<'_>, direction: Direction) -> Result<Ack> {
    if ctx.state != FlowState::Renew {
        return Ok(Ack::Silent);
    }
    let profiles = ctx.store().list_active_profiles(ctx.user().id).await?;
    let Some(index) = cursor::step(ctx.payload().renew.index, profiles.len(), direction) else {
        return no_keys(ctx).await;
    };
    show_list(ctx, &profiles, index, None).await?;
    Ok(Ack::Silent)
}

pub(super) async fn pick(ctx: &mut Ctx<'_>) -> Result<Ack> {
    if ctx.state != FlowState::Renew {
        return Ok(Ack::Silent);
    }
    let profiles = ctx.store().list_active_profiles(ctx.user().id).await?;
    let Some(index) = cursor::clamp(ctx.payload().renew.index, profiles.len()) else {
        return no_keys(ctx).await;
    };
    let profile = &profiles[index];
    if profile.is_trial() {
        show_list(ctx, &profiles, index, Some(TRIAL_NOT_RENEWABLE)).await?;
        return Ok(Ack::Silent);
    }

    ctx.patch(
        FlowState::RenewPlan,
        PayloadPatch::Renew(RenewStep {
            index: Some(index),
            profile_id: Some(profile.id),
        }),
    )
    .await?;

    let plans = ctx.store().list_active_plans().await?;
    let screen = if plans.iter().any(|p| !p.is_trial()) {
        Screen::text(format!(
            "Renewing key {}.\nChoose a plan:",
            profile.key_name()
        ))
        .keyboard(keyboards::renew_plans(&plans))
    } else {
        Screen::text("No plans found.").keyboard(keyboards::renew_plans(&[]))
    };
    ctx.show(screen).await?;
    Ok(Ack::Silent)
}

pub(super) async fn plan(ctx: &mut Ctx<'_>, plan_id: i64) -> Result<Ack> {
    if ctx.state != FlowState::RenewPlan {
        return Ok(Ack::Silent);
    }
    let plan = ctx
        .store()
        .load_plan(plan_id)
        .await?
        .filter(|p| p.enabled && !p.is_trial());
    let Some(plan) = plan else {
        let plans = ctx.store().list_active_plans().await?;
        ctx.show(
            Screen::text("⚠️ Plan not found. Choose another plan:").keyboard(keyboards::renew_plans(&plans)),
        )
        .await?;
        return Ok(Ack::Silent);
    };
    let Some(profile_id) = ctx.payload().renew.profile_id else {
        return start(ctx).await;
    };

    let req = RenewRequest {
        tg_id: ctx.actor.tg_id,
        user_id: ctx.user().id,
        profile_id,
        plan_id: plan.id,
        price_minor: plan.price_minor,
        duration_days: plan.duration_days,
        now: Utc::now(),
    };
    let outcome = ctx.store().renew_profile(&req).await?;
    match outcome {
        RenewOutcome::Renewed {
            access_until,
            balance,
        } => {
            ctx.assume(FlowState::Menu);
            info!(tg_id = ctx.actor.tg_id, profile_id, plan_id = plan.id, "profile renewed");
            let text = format!(
                "✅ Key renewed.\nValid until: {}\nRemaining balance: {}",
                format_dt(Some(access_until)),
                format_money(balance, &plan.currency)
            );
            let admin = ctx.is_admin();
            ctx.show(Screen::text(text).keyboard(keyboards::main_menu(admin)))
                .await?;
        }
        RenewOutcome::Insufficient { balance, price } => {
            let text = format!(
                "Insufficient funds. The plan costs {}, your balance is {}.\nMissing: {}.",
                format_money(price, &plan.currency),
                format_money(balance, &plan.currency),
                format_money(price - balance, &plan.currency)
            );
            ctx.show(Screen::text(text).keyboard(keyboards::pay_menu()))
                .await?;
        }
        RenewOutcome::ProfileGone => {
            ctx.clear(FlowState::Menu).await?;
            ctx.show(
                Screen::text("⚠️ This key is no longer active and cannot be renewed.")
                    .keyboard(keyboards::pay_menu()),
            )
            .await?;
        }
    }
    Ok(Ack::Silent)
}

/// From the plan list back to the key list, from the key list to the pay
/// menu.
pub(super) async fn back(ctx: &mut Ctx<'_>) -> Result<Ack> {
    match ctx.state {
        FlowState::RenewPlan => {
            let profiles = ctx.store().list_active_profiles(ctx.user().id).await?;
            let Some(index) = cursor::clamp(ctx.payload().renew.index, profiles.len()) else {
                return no_keys(ctx).await;
            };
            show_list(ctx, &profiles, index, None).await?;
            Ok(Ack::Silent)
        }
        FlowState::Renew => super::topup::pay_menu(ctx).await,
        _ => Ok(Ack::Silent),
    }
}
