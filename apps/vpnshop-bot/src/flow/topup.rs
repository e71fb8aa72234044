//! Pay menu, balance top-up and the proof upload shared with manual plan
//! payment.

use anyhow::Result;
use tracing::{info, warn};

use vpnshop_db::models::order::{NewOrder, NewProof, OrderKind};
use vpnshop_db::models::session::{FlowState, PayloadPatch, TopupStep};

use super::action::Action;
use super::{Ctx, Media};
use crate::bot::keyboards;
use crate::bot::utils::{escape_html, format_money, payment_code};
use crate::guard::{Ack, best_effort};
use crate::transport::{FileKind, OutgoingFile, Screen};

const HOW_TO_BUY: &str = "How to buy access:\n\
    1. Top up the balance.\n\
    2. Open \"Connect VPN\" and choose a protocol, server and plan.\n\
    3. The plan price is taken from the balance and the key is issued at once.";

pub(super) async fn pay_menu(ctx: &mut Ctx<'_>) -> Result<Ack> {
    ctx.clear(FlowState::Menu).await?;
    let plans = ctx.store().list_active_plans().await?;
    let balance = ctx.store().get_balance(ctx.user().id).await?;

    let mut text = String::from("💳 Pricing\n\n");
    let paid: Vec<_> = plans.iter().filter(|p| !p.is_trial()).collect();
    if paid.is_empty() {
        text.push_str("No plans available yet.\n");
    }
    for plan in paid {
        text.push_str(&format!(
            "• {}: {} for {} days\n",
            plan.title,
            format_money(plan.price_minor, &plan.currency),
            plan.duration_days
        ));
    }
    text.push_str(&format!(
        "\n{}\n\nYour balance: {}",
        HOW_TO_BUY,
        format_money(balance, ctx.currency())
    ));

    ctx.show(Screen::text(text).keyboard(keyboards::pay_menu()))
        .await?;
    Ok(Ack::Silent)
}

pub(super) async fn balance(ctx: &mut Ctx<'_>) -> Result<Ack> {
    ctx.clear(FlowState::Menu).await?;
    let balance = ctx.store().get_balance(ctx.user().id).await?;
    let label = format_money(balance, ctx.currency());
    ctx.show(
        Screen::text(
            "💰 Balance\n\n\
             Plans and renewals are paid from the balance. \
             Top it up by transfer and send a receipt; an administrator confirms the payment.",
        )
        .keyboard(keyboards::balance(&label)),
    )
    .await?;
    Ok(Ack::Silent)
}

pub(super) async fn start(ctx: &mut Ctx<'_>) -> Result<Ack> {
    ctx.clear(FlowState::TopupMethod).await?;
    ctx.show(Screen::text("Choose a payment method:").keyboard(keyboards::topup_methods()))
        .await?;
    Ok(Ack::Silent)
}

pub(super) async fn method(ctx: &mut Ctx<'_>, method: &str) -> Result<Ack> {
    if ctx.state != FlowState::TopupMethod {
        return Ok(Ack::Silent);
    }
    ctx.patch(
        FlowState::TopupAmount,
        PayloadPatch::Topup(TopupStep {
            method: Some(method.to_string()),
            ..TopupStep::default()
        }),
    )
    .await?;
    let keyboard = keyboards::topup_amounts(&ctx.app.config.topup_amounts_minor(), ctx.currency());
    ctx.show(Screen::text("Choose the top-up amount:").keyboard(keyboard))
        .await?;
    Ok(Ack::Silent)
}

/// `amount` arrives in whole currency units.
pub(super) async fn amount(ctx: &mut Ctx<'_>, amount: i64) -> Result<Ack> {
    if ctx.state != FlowState::TopupAmount {
        return Ok(Ack::Silent);
    }
    let Some(method) = ctx.payload().topup.method.clone() else {
        ctx.clear(FlowState::TopupMethod).await?;
        ctx.show(
            Screen::text("⚠️ No payment method selected. Choose a payment method:")
                .keyboard(keyboards::topup_methods()),
        )
        .await?;
        return Ok(Ack::Silent);
    };
    let amount_minor = amount.saturating_mul(100);
    let offered = ctx.app.config.topup_amounts_minor();
    if !offered.contains(&amount_minor) {
        let keyboard = keyboards::topup_amounts(&offered, ctx.currency());
        ctx.show(Screen::text("⚠️ This amount is not available. Choose the top-up amount:").keyboard(keyboard))
            .await?;
        return Ok(Ack::Silent);
    }

    if method != "transfer" && method != "transfer_link" {
        ctx.clear(FlowState::Menu).await?;
        ctx.show(
            Screen::text("This payment method is temporarily unavailable.")
                .keyboard(keyboards::pay_menu()),
        )
        .await?;
        return Ok(Ack::Silent);
    }

    let code = payment_code();
    ctx.patch(
        FlowState::TopupProof,
        PayloadPatch::Topup(TopupStep {
            method: Some("transfer".to_string()),
            amount: Some(amount_minor),
            code: Some(code.clone()),
        }),
    )
    .await?;

    let link = if method == "transfer_link" {
        ctx.app.config.transfer_link(amount_minor, &code)
    } else {
        None
    };
    let screen = transfer_screen(
        link.as_deref(),
        &format_money(amount_minor, ctx.currency()),
        &code,
        Action::TopupCancel,
    );
    ctx.show(screen).await?;
    Ok(Ack::Silent)
}

pub(super) async fn back(ctx: &mut Ctx<'_>) -> Result<Ack> {
    ctx.clear(FlowState::Menu).await?;
    let balance = ctx.store().get_balance(ctx.user().id).await?;
    let text = format!("Your balance: {}", format_money(balance, ctx.currency()));
    ctx.show(Screen::text(text).keyboard(keyboards::pay_menu()))
        .await?;
    Ok(Ack::Silent)
}

/// Instructions shown while waiting for a payment receipt.
pub(super) fn transfer_screen(link: Option<&str>, amount_label: &str, code: &str, cancel: Action) -> Screen {
    let mut text = String::from("💸 Payment by transfer\n\n");
    if let Some(url) = link {
        text.push_str(&format!("Transfer link: {}\n", url));
    }
    text.push_str(&format!(
        "Amount: {}\nPayment code: {}\n\n\
         Put the code in the transfer comment, then send a photo, screenshot or PDF \
         of the receipt to this chat.",
        amount_label, code
    ));
    Screen::text(text)
        .keyboard(keyboards::transfer_wait(link, cancel))
        .no_preview()
}

/// Turns an uploaded receipt into a pending order and forwards it to the
/// administrators.
pub(super) async fn proof(ctx: &mut Ctx<'_>, media: Media) -> Result<()> {
    let payload = ctx.payload().clone();
    let currency = ctx.currency().to_string();
    let order = match ctx.state {
        FlowState::TopupProof => {
            let Some(amount) = payload.topup.amount else {
                return lost_selection(ctx).await;
            };
            NewOrder {
                user_id: ctx.user().id,
                plan_id: None,
                amount_minor: amount,
                currency,
                kind: OrderKind::Topup,
                protocol: None,
                server_id: None,
                payment_code: payload.topup.code.clone(),
            }
        }
        FlowState::PayProof => {
            let (Some(plan_id), Some(protocol), Some(server_id)) = (
                payload.buy.plan_id,
                payload.connect.protocol.clone(),
                payload.connect.server_id,
            ) else {
                return lost_selection(ctx).await;
            };
            let Some(plan) = ctx.store().load_plan(plan_id).await? else {
                return lost_selection(ctx).await;
            };
            NewOrder {
                user_id: ctx.user().id,
                plan_id: Some(plan.id),
                amount_minor: plan.price_minor,
                currency: plan.currency,
                kind: OrderKind::Plan,
                protocol: Some(protocol),
                server_id: Some(server_id),
                payment_code: payload.topup.code.clone(),
            }
        }
        _ => return Ok(()),
    };

    let data = match ctx.app.transport.download_file(&media.file_id).await {
        Ok(data) => data,
        Err(e) => {
            warn!(tg_id = ctx.actor.tg_id, "receipt download failed: {}", e);
            ctx.show(
                Screen::text("⚠️ Could not read the file. Please send it again.")
                    .keyboard(keyboards::back_to_menu()),
            )
            .await?;
            return Ok(());
        }
    };
    let new_proof = NewProof {
        file_id: media.file_id.clone(),
        file_name: media.file_name.clone(),
        mime_type: media.mime_type.clone(),
        file_size: media.file_size,
        data,
    };

    let order_id = ctx
        .store()
        .create_order_with_proof(ctx.actor.tg_id, &order, &new_proof)
        .await?;
    ctx.assume(FlowState::Menu);
    info!(
        tg_id = ctx.actor.tg_id,
        order_id,
        kind = order.kind.as_str(),
        amount = order.amount_minor,
        "payment proof received"
    );

    ctx.show(
        Screen::text(format!(
            "✅ Thank you! Payment #{} for {} was sent for review.\n\
             You will get a message once an administrator checks it.",
            order_id,
            format_money(order.amount_minor, &order.currency)
        ))
        .keyboard(keyboards::back_to_menu()),
    )
    .await?;

    forward_to_admins(ctx, order_id, &order, &media).await;
    Ok(())
}

async fn lost_selection(ctx: &mut Ctx<'_>) -> Result<()> {
    ctx.clear(FlowState::Menu).await?;
    ctx.show(
        Screen::text("⚠️ Your payment details were lost, please start again.")
            .keyboard(keyboards::pay_menu()),
    )
    .await
}

async fn forward_to_admins(ctx: &Ctx<'_>, order_id: i64, order: &NewOrder, media: &Media) {
    let what = match order.kind {
        OrderKind::Topup => "Balance top-up".to_string(),
        OrderKind::Plan => format!(
            "Plan payment ({} / server {})",
            order.protocol.as_deref().unwrap_or("-"),
            order.server_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
        ),
    };
    let caption = format!(
        "🧾 Payment #{}\n{}\nFrom: {}\nAmount: {}\nCode: {}",
        order_id,
        escape_html(&what),
        escape_html(&ctx.user().display_name()),
        format_money(order.amount_minor, &order.currency),
        escape_html(order.payment_code.as_deref().unwrap_or("-"))
    );
    let is_image = match media.mime_type.as_deref() {
        Some(mime) => mime.is_empty() || mime.to_ascii_lowercase().starts_with("image/"),
        None => true,
    };
    let kind = if is_image { FileKind::Photo } else { FileKind::Document };

    for admin in &ctx.app.config.admin_tg_ids {
        let file = OutgoingFile {
            file_id: media.file_id.clone(),
            kind,
            caption: Some(caption.clone()),
            keyboard: Some(keyboards::admin_payment(order_id)),
        };
        if ctx.app.transport.send_file(*admin, &file).await.is_ok() {
            continue;
        }
        if kind == FileKind::Photo {
            let fallback = OutgoingFile {
                kind: FileKind::Document,
                ..file
            };
            best_effort("forward receipt", ctx.app.transport.send_file(*admin, &fallback)).await;
        } else {
            warn!(admin, order_id, "could not forward receipt");
        }
    }
}
