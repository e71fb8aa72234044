use anyhow::Result;

use vpnshop_db::models::order::{OrderKind, OrderStatus, PaymentRecord};
use vpnshop_db::models::session::{CursorStep, FlowState, PayloadPatch};

use super::Ctx;
use super::action::ProfileItem;
use super::cursor::{self, Direction};
use crate::bot::keyboards;
use crate::bot::utils::{format_dt, format_money};
use crate::guard::{Ack, best_effort};
use crate::transport::{FileKind, OutgoingFile, Screen};

/// Profile overview; `notice` is prepended when an action reports back here.
pub(super) async fn show(ctx: &mut Ctx<'_>, notice: Option<&str>) -> Result<Ack> {
    ctx.clear(FlowState::Profile).await?;
    let user_id = ctx.user().id;
    let profiles = ctx.store().list_active_profiles(user_id).await?;
    let balance = ctx.store().get_balance(user_id).await?;
    let settings = ctx.store().user_settings(user_id).await?;

    let latest = profiles.iter().filter_map(|p| p.access_until).max();
    let status = if profiles.is_empty() { "no active access" } else { "active" };

    let mut text = String::new();
    if let Some(notice) = notice {
        text.push_str(notice);
        text.push_str("\n\n");
    }
    text.push_str(&format!(
        "👤 Profile\n\n\
         ID: {}\n\
         Username: {}\n\
         Subscription: {}\n\
         Valid until: {}\n\
         Balance: {}\n\
         Active keys: {}\n\
         Notifications: {}",
        ctx.actor.tg_id,
        ctx.user().display_name(),
        status,
        format_dt(latest),
        format_money(balance, ctx.currency()),
        profiles.len(),
        if settings.notifications_enabled { "on" } else { "off" }
    ));

    ctx.show(Screen::text(text).keyboard(keyboards::profile()))
        .await?;
    Ok(Ack::Silent)
}

pub(super) async fn item(ctx: &mut Ctx<'_>, item: ProfileItem) -> Result<Ack> {
    if ctx.state != FlowState::Profile {
        return Ok(Ack::Silent);
    }
    match item {
        ProfileItem::Referral => super::referral::show(ctx, None).await,
        ProfileItem::Payments => {
            let records = payment_records(ctx).await?;
            if records.is_empty() {
                return show(ctx, Some("No payments yet.")).await;
            }
            show_payment(ctx, &records, 0).await?;
            Ok(Ack::Silent)
        }
        ProfileItem::Notify => {
            let settings = ctx.store().toggle_notifications(ctx.user().id).await?;
            let notice = if settings.notifications_enabled {
                "🔔 Notifications enabled."
            } else {
                "🔕 Notifications disabled."
            };
            show(ctx, Some(notice)).await
        }
        ProfileItem::Keys => {
            let profiles = ctx.store().list_active_profiles(ctx.user().id).await?;
            if profiles.is_empty() {
                return show(ctx, Some("You have no active keys.")).await;
            }
            show_key(ctx, 0).await
        }
    }
}

async fn payment_records(ctx: &Ctx<'_>) -> Result<Vec<PaymentRecord>> {
    let limit = ctx.app.config.payment_history_limit;
    ctx.store().payment_history(ctx.user().id, limit).await
}

fn kind_label(kind: OrderKind) -> &'static str {
    match kind {
        OrderKind::Topup => "balance top-up",
        OrderKind::Plan => "plan payment",
    }
}

fn status_label(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "⏳ pending",
        OrderStatus::Paid => "✅ paid",
        OrderStatus::Failed => "❌ rejected",
    }
}

async fn show_payment(ctx: &mut Ctx<'_>, records: &[PaymentRecord], index: usize) -> Result<()> {
    ctx.patch(
        FlowState::Payhist,
        PayloadPatch::Payhist(CursorStep { index: Some(index) }),
    )
    .await?;
    let record = &records[index];
    let text = format!(
        "🧾 Payment #{}\n\nAmount: {}\nType: {}\nStatus: {}\nUpdated: {}",
        record.id,
        format_money(record.amount_minor, &record.currency),
        kind_label(record.kind),
        status_label(record.status),
        format_dt(Some(record.updated_at))
    );
    let keyboard = keyboards::payment_history(index, records.len(), record.proof_file_id.is_some());
    ctx.show(Screen::text(text).keyboard(keyboard)).await
}

pub(super) async fn payhist_step(ctx: &mut Ctx<'_>, direction: Direction) -> Result<Ack> {
    if ctx.state != FlowState::Payhist {
        return Ok(Ack::Silent);
    }
    let records = payment_records(ctx).await?;
    let Some(index) = cursor::step(ctx.payload().payhist.index, records.len(), direction) else {
        return show(ctx, Some("No payments yet.")).await;
    };
    show_payment(ctx, &records, index).await?;
    Ok(Ack::Silent)
}

/// Re-sends the receipt attached to the payment on screen.
pub(super) async fn payhist_file(ctx: &mut Ctx<'_>) -> Result<Ack> {
    if ctx.state != FlowState::Payhist {
        return Ok(Ack::Silent);
    }
    let records = payment_records(ctx).await?;
    let Some(index) = cursor::clamp(ctx.payload().payhist.index, records.len()) else {
        return Ok(Ack::alert("File not found"));
    };
    let order_id = records[index].id;
    let Some(proof) = ctx.store().load_proof_for_order(order_id).await? else {
        return Ok(Ack::alert("File not found"));
    };
    let file = OutgoingFile {
        kind: if proof.is_image() { FileKind::Photo } else { FileKind::Document },
        file_id: proof.file_id,
        caption: Some(format!("🧾 Payment #{}", order_id)),
        keyboard: None,
    };
    match best_effort("send receipt", ctx.app.transport.send_file(ctx.actor.chat_id, &file)).await {
        Some(_) => Ok(Ack::Silent),
        None => Ok(Ack::alert("File not found")),
    }
}

async fn show_key(ctx: &mut Ctx<'_>, index: usize) -> Result<Ack> {
    let profiles = ctx.store().list_active_profiles(ctx.user().id).await?;
    let Some(index) = cursor::clamp(Some(index), profiles.len()) else {
        return show(ctx, Some("You have no active keys.")).await;
    };
    ctx.patch(
        FlowState::Pkeys,
        PayloadPatch::Pkeys(CursorStep { index: Some(index) }),
    )
    .await?;
    let text = super::renew::profile_card(&profiles[index], profiles.len());
    ctx.show(Screen::html(text).keyboard(keyboards::keys(index, profiles.len())))
        .await?;
    Ok(Ack::Silent)
}

pub(super) async fn keys_step(ctx: &mut Ctx<'_>, direction: Direction) -> Result<Ack> {
    if ctx.state != FlowState::Pkeys {
        return Ok(Ack::Silent);
    }
    let total = ctx.store().list_active_profiles(ctx.user().id).await?.len();
    let Some(index) = cursor::step(ctx.payload().pkeys.index, total, direction) else {
        return show(ctx, Some("You have no active keys.")).await;
    };
    show_key(ctx, index).await
}

pub(super) async fn back(ctx: &mut Ctx<'_>) -> Result<Ack> {
    match ctx.state {
        FlowState::Payhist | FlowState::Pkeys => show(ctx, None).await,
        _ => Ok(Ack::Silent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_orders_read_as_rejected() {
        assert_eq!(status_label(OrderStatus::Failed), "❌ rejected");
        assert_eq!(kind_label(OrderKind::Plan), "plan payment");
    }
}
