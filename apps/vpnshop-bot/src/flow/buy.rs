//! Protocol → server → plan purchase, paid from the balance or by a manual
//! transfer with proof.

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use vpnshop_db::models::catalog::Plan;
use vpnshop_db::models::session::{BuyStep, ConnectStep, FlowState, PayloadPatch, TopupStep};
use vpnshop_db::store::{ProvisionRequest, PurchaseOutcome, TrialOutcome};

use super::Ctx;
use super::action::Action;
use crate::bot::keyboards;
use crate::bot::utils::{escape_html, format_dt, format_money, payment_code};
use crate::guard::Ack;
use crate::transport::Screen;

const STEP_PROTOCOL: &str = "STEP 1. Choose a connection protocol\n\n\
    VLESS is recommended: it runs the DOUBLEVPN mode, which rotates between several servers \
    on every connect without changing the key.\n\n\
    The other protocols are kept as fallbacks. Changing protocol or server issues a new key.";

const STEP_SERVER: &str = "STEP 2. Choose a server\n\n\
    The number in brackets is the server load: lower is better.";

const STEP_PLAN: &str = "STEP 3. Choose a plan";

const SERVER_GONE: &str = "⚠️ This server is no longer available. Please choose another one.";

fn protocol_screen(ctx: &Ctx<'_>, notice: Option<&str>) -> Screen {
    let text = match notice {
        Some(notice) => format!("{}\n\n{}", notice, STEP_PROTOCOL),
        None => STEP_PROTOCOL.to_string(),
    };
    Screen::text(text).keyboard(keyboards::protocols(&ctx.app.config.protocols))
}

pub(super) async fn start(ctx: &mut Ctx<'_>) -> Result<Ack> {
    ctx.clear(FlowState::BuyProtocol).await?;
    let screen = protocol_screen(ctx, None);
    ctx.show(screen).await?;
    Ok(Ack::Silent)
}

/// The selection in the payload went stale; restart from step one.
async fn restart(ctx: &mut Ctx<'_>, notice: &str) -> Result<Ack> {
    ctx.clear(FlowState::BuyProtocol).await?;
    let screen = protocol_screen(ctx, Some(notice));
    ctx.show(screen).await?;
    Ok(Ack::Silent)
}

async fn show_servers(ctx: &mut Ctx<'_>, notice: Option<&str>) -> Result<()> {
    let servers = ctx.store().list_servers().await?;
    if servers.is_empty() {
        ctx.show(
            Screen::text("⚠️ No servers available yet.\nPlease contact support.")
                .keyboard(keyboards::buy_cancel_only()),
        )
        .await?;
        return Ok(());
    }
    let text = match notice {
        Some(notice) => format!("{}\n\n{}", notice, STEP_SERVER),
        None => STEP_SERVER.to_string(),
    };
    ctx.show(Screen::text(text).keyboard(keyboards::servers(&servers)))
        .await
}

async fn show_plans(ctx: &mut Ctx<'_>, notice: Option<&str>) -> Result<()> {
    let plans = ctx.store().list_active_plans().await?;
    if plans.is_empty() {
        ctx.show(
            Screen::text("⚠️ No plans available yet.\nPlease contact support.")
                .keyboard(keyboards::buy_cancel_only()),
        )
        .await?;
        return Ok(());
    }
    let text = match notice {
        Some(notice) => format!("{}\n\n{}", notice, STEP_PLAN),
        None => STEP_PLAN.to_string(),
    };
    ctx.show(Screen::text(text).keyboard(keyboards::plans(&plans)))
        .await
}

pub(super) async fn protocol(ctx: &mut Ctx<'_>, protocol: &str) -> Result<Ack> {
    if ctx.state != FlowState::BuyProtocol {
        return Ok(Ack::Silent);
    }
    if !ctx.app.config.supports_protocol(protocol) {
        let screen = protocol_screen(ctx, Some("⚠️ This protocol is not available."));
        ctx.show(screen).await?;
        return Ok(Ack::Silent);
    }

    ctx.patch(
        FlowState::BuyServer,
        PayloadPatch::Connect(ConnectStep {
            protocol: Some(protocol.to_string()),
            server_id: None,
        }),
    )
    .await?;
    show_servers(ctx, None).await?;
    Ok(Ack::Silent)
}

pub(super) async fn server(ctx: &mut Ctx<'_>, server_id: i64) -> Result<Ack> {
    if ctx.state != FlowState::BuyServer {
        return Ok(Ack::Silent);
    }
    if ctx.store().load_server(server_id).await?.is_none() {
        show_servers(ctx, Some(SERVER_GONE)).await?;
        return Ok(Ack::Silent);
    }

    ctx.patch(
        FlowState::BuyPlan,
        PayloadPatch::Connect(ConnectStep {
            protocol: None,
            server_id: Some(server_id),
        }),
    )
    .await?;
    show_plans(ctx, None).await?;
    Ok(Ack::Silent)
}

/// The picked server was disabled; back to the server list with nothing
/// charged.
async fn server_gone(ctx: &mut Ctx<'_>) -> Result<Ack> {
    ctx.patch(FlowState::BuyServer, PayloadPatch::Connect(ConnectStep::default()))
        .await?;
    show_servers(ctx, Some(SERVER_GONE)).await?;
    Ok(Ack::Silent)
}

async fn active_plan(ctx: &Ctx<'_>, plan_id: i64) -> Result<Option<Plan>> {
    Ok(ctx
        .store()
        .load_plan(plan_id)
        .await?
        .filter(|plan| plan.enabled))
}

pub(super) async fn plan(ctx: &mut Ctx<'_>, plan_id: i64) -> Result<Ack> {
    if ctx.state != FlowState::BuyPlan {
        return Ok(Ack::Silent);
    }
    let Some(plan) = active_plan(ctx, plan_id).await? else {
        show_plans(ctx, Some("⚠️ Plan not found.")).await?;
        return Ok(Ack::Silent);
    };
    let connect = ctx.payload().connect.clone();
    let (Some(protocol), Some(server_id)) = (connect.protocol, connect.server_id) else {
        return restart(ctx, "⚠️ Your selection was lost, please start again.").await;
    };
    if ctx.store().load_server(server_id).await?.is_none() {
        return server_gone(ctx).await;
    }

    ctx.patch(
        FlowState::BuyPlan,
        PayloadPatch::Buy(BuyStep {
            plan_id: Some(plan.id),
        }),
    )
    .await?;

    let req = ProvisionRequest {
        tg_id: ctx.actor.tg_id,
        user_id: ctx.user().id,
        protocol,
        server_id,
        plan_id: plan.id,
        price_minor: plan.price_minor,
        duration_days: plan.duration_days,
        now: Utc::now(),
    };

    if plan.is_trial() {
        let outcome = ctx.store().issue_trial(&req).await?;
        match outcome {
            TrialOutcome::Issued {
                config_uri,
                access_until,
            } => {
                ctx.assume(FlowState::Menu);
                info!(tg_id = ctx.actor.tg_id, plan_id = plan.id, "trial issued");
                ctx.show(
                    Screen::html(format!(
                        "✅ Trial access activated.\nValid until: {}\n\nYour key:\n<code>{}</code>",
                        format_dt(Some(access_until)),
                        escape_html(&config_uri)
                    ))
                    .keyboard(keyboards::instructions()),
                )
                .await?;
            }
            TrialOutcome::AlreadyUsed => {
                let plans = ctx.store().list_active_plans().await?;
                ctx.show(
                    Screen::text("Trial access was already activated earlier.")
                        .keyboard(keyboards::plans(&plans)),
                )
                .await?;
            }
            TrialOutcome::ServerUnavailable => return server_gone(ctx).await,
        }
        return Ok(Ack::Silent);
    }

    let currency = plan.currency.clone();
    let outcome = ctx.store().purchase_profile(&req).await?;
    match outcome {
        PurchaseOutcome::Issued {
            config_uri,
            access_until,
            balance,
        } => {
            ctx.assume(FlowState::Menu);
            info!(tg_id = ctx.actor.tg_id, plan_id = plan.id, balance, "profile purchased");
            ctx.show(
                Screen::html(format!(
                    "✅ Key issued.\nValid until: {}\n\nYour key:\n<code>{}</code>\n\nRemaining balance: {}",
                    format_dt(Some(access_until)),
                    escape_html(&config_uri),
                    format_money(balance, &currency)
                ))
                .keyboard(keyboards::instructions()),
            )
            .await?;
        }
        PurchaseOutcome::Insufficient { balance, price } => {
            ctx.show(
                Screen::text(format!(
                    "Insufficient funds. The plan costs {}, your balance is {}.\n\
                     Missing: {}.\n\nTop up the balance or pay this plan by transfer.",
                    format_money(price, &currency),
                    format_money(balance, &currency),
                    format_money(price - balance, &currency)
                ))
                .keyboard(keyboards::insufficient_funds()),
            )
            .await?;
        }
        PurchaseOutcome::ServerUnavailable => return server_gone(ctx).await,
    }
    Ok(Ack::Silent)
}

/// Pays the selected plan by manual transfer; the proof upload creates the
/// order.
pub(super) async fn transfer(ctx: &mut Ctx<'_>) -> Result<Ack> {
    if ctx.state != FlowState::BuyPlan {
        return Ok(Ack::Silent);
    }
    let Some(plan_id) = ctx.payload().buy.plan_id else {
        return restart(ctx, "⚠️ Your selection was lost, please start again.").await;
    };
    let Some(plan) = active_plan(ctx, plan_id).await? else {
        return restart(ctx, "⚠️ This plan is no longer available.").await;
    };

    let code = payment_code();
    ctx.patch(
        FlowState::PayProof,
        PayloadPatch::Topup(TopupStep {
            method: Some("transfer".to_string()),
            amount: Some(plan.price_minor),
            code: Some(code.clone()),
        }),
    )
    .await?;

    let link = ctx.app.config.transfer_link(plan.price_minor, &code);
    let screen = super::topup::transfer_screen(
        link.as_deref(),
        &format_money(plan.price_minor, &plan.currency),
        &code,
        Action::BuyCancel,
    );
    ctx.show(screen).await?;
    Ok(Ack::Silent)
}

/// One step back: plan list → server list → protocol list → menu.
pub(super) async fn back(ctx: &mut Ctx<'_>) -> Result<Ack> {
    match ctx.state {
        FlowState::BuyPlan => {
            ctx.patch(FlowState::BuyServer, PayloadPatch::Connect(ConnectStep::default()))
                .await?;
            show_servers(ctx, None).await?;
            Ok(Ack::Silent)
        }
        FlowState::BuyServer => start(ctx).await,
        FlowState::BuyProtocol => super::menu::home(ctx).await,
        _ => Ok(Ack::Silent),
    }
}
