use anyhow::Result;
use tracing::info;

use vpnshop_db::models::session::{FlowState, PayloadPatch, SupportStep};
use vpnshop_db::store::{SupportSubmission, TicketOutcome};

use super::Ctx;
use crate::bot::keyboards;
use crate::bot::utils::escape_html;
use crate::guard::Ack;
use crate::transport::Screen;

pub(super) async fn show(ctx: &mut Ctx<'_>) -> Result<Ack> {
    ctx.clear(FlowState::Menu).await?;
    ctx.show(
        Screen::text(
            "✉️ Support\n\n\
             \"Write\" adds your message to the latest open ticket. \
             \"New ticket\" opens a separate conversation.",
        )
        .keyboard(keyboards::support()),
    )
    .await?;
    Ok(Ack::Silent)
}

pub(super) async fn write(ctx: &mut Ctx<'_>, force_new: bool) -> Result<Ack> {
    ctx.patch(
        FlowState::SupportWait,
        PayloadPatch::Support(SupportStep {
            ticket_id: None,
            new_ticket: Some(force_new),
        }),
    )
    .await?;
    ctx.show(Screen::text("Describe your question in one message:").keyboard(keyboards::support_wait()))
        .await?;
    Ok(Ack::Silent)
}

pub(super) async fn submit(ctx: &mut Ctx<'_>, text: &str) -> Result<()> {
    let submission = SupportSubmission {
        user_id: ctx.user().id,
        chat_id: ctx.actor.chat_id,
        username: ctx.actor.username.clone(),
        text: text.to_string(),
        force_new: ctx.payload().support.new_ticket.unwrap_or(false),
        open_cap: ctx.app.config.support_open_ticket_cap,
    };
    let outcome = ctx.store().submit_support_message(&submission).await?;
    let (ticket, opened) = match outcome {
        TicketOutcome::Attached(ticket) => (ticket, false),
        TicketOutcome::Opened(ticket) => (ticket, true),
        TicketOutcome::CapReached { open } => {
            ctx.clear(FlowState::Menu).await?;
            ctx.show(
                Screen::text(format!(
                    "⚠️ You already have {} open tickets. \
                     Please wait for an answer or write into an existing ticket.",
                    open
                ))
                .keyboard(keyboards::support()),
            )
            .await?;
            return Ok(());
        }
    };

    ctx.clear(FlowState::Menu).await?;
    info!(tg_id = ctx.actor.tg_id, ticket_id = ticket.id, opened, "support message stored");
    let confirmation = if opened {
        format!("✅ Ticket #{} opened. We will answer here soon.", ticket.user_ticket_id)
    } else {
        format!("✅ Message added to ticket #{}.", ticket.user_ticket_id)
    };
    ctx.show(Screen::text(confirmation).keyboard(keyboards::back_to_menu()))
        .await?;

    let note = Screen::html(format!(
        "✉️ {} #{} (user ticket #{})\nFrom: {}\n\n{}",
        if opened { "New ticket" } else { "Ticket" },
        ticket.id,
        ticket.user_ticket_id,
        escape_html(&ctx.user().display_name()),
        escape_html(text)
    ))
    .keyboard(keyboards::admin_ticket(ticket.id));
    ctx.notify_admins(&note).await;
    Ok(())
}
