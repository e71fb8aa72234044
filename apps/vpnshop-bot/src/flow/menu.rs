use anyhow::Result;

use vpnshop_db::models::session::FlowState;

use super::Ctx;
use crate::bot::keyboards;
use crate::guard::Ack;
use crate::transport::Screen;

pub(super) fn main_menu(ctx: &Ctx<'_>) -> Screen {
    let admin = ctx.is_admin();
    let text = if admin { "✅ Admin menu" } else { "✅ Menu" };
    Screen::text(text).keyboard(keyboards::main_menu(admin))
}

/// Resets the session to the menu and shows it.
pub(super) async fn home(ctx: &mut Ctx<'_>) -> Result<Ack> {
    ctx.clear(FlowState::Menu).await?;
    let screen = main_menu(ctx);
    ctx.show(screen).await?;
    Ok(Ack::Silent)
}

pub(super) async fn admin_panel(ctx: &mut Ctx<'_>) -> Result<Ack> {
    ctx.clear(FlowState::Menu).await?;
    ctx.show(
        Screen::text(
            "🛠 Admin panel\n\n\
             Payment proofs, withdrawal requests and support tickets arrive in this chat \
             as separate messages with action buttons.",
        )
        .keyboard(keyboards::back_to_menu()),
    )
    .await?;
    Ok(Ack::Silent)
}
