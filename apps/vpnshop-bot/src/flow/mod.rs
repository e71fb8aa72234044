//! Per-user conversation state machine.
//!
//! Each inbound update is handled as: load the account, check the action
//! against the stored state, run the effect, persist the new state, render one
//! screen. Callback queries are acknowledged exactly once on every path.

use anyhow::Result;
use tracing::{debug, error, info};

use vpnshop_db::Store;
use vpnshop_db::models::session::{FlowState, Payload, PayloadPatch};
use vpnshop_db::models::user::{Account, Contact, ReferrerRef, User};

use crate::bot::keyboards;
use crate::guard::{Ack, acknowledge, best_effort};
use crate::screen::{self, Target};
use crate::state::AppState;
use crate::transport::{FileKind, Screen, TransportError};

pub mod action;
pub mod cursor;

mod admin;
mod buy;
mod menu;
mod profile;
mod promo;
mod referral;
mod renew;
mod support;
mod topup;

use action::{Action, MenuItem};

pub const TRY_AGAIN: &str = "Something went wrong. Please try again later.";
pub const NO_SESSION: &str = "Session not found. Press /start";
pub const UNKNOWN_TEXT: &str = "Command not recognized. Open the menu: /start";

/// Identity of whoever sent the update.
#[derive(Debug, Clone)]
pub struct Actor {
    pub tg_id: i64,
    pub chat_id: i64,
    pub username: Option<String>,
}

impl Actor {
    fn contact(&self) -> Contact {
        Contact {
            tg_id: self.tg_id,
            chat_id: self.chat_id,
            username: self.username.clone(),
        }
    }
}

/// An uploaded photo or document.
#[derive(Debug, Clone)]
pub struct Media {
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
    pub kind: FileKind,
}

#[derive(Debug, Clone)]
pub enum Inbound {
    Start { arg: Option<String> },
    Text(String),
    Media(Media),
    Callback {
        id: String,
        data: String,
        message_id: Option<i32>,
    },
}

/// Everything a transition needs. `state` tracks what has been persisted so
/// far in this update, so a later screen-id write keeps it.
pub struct Ctx<'a> {
    pub app: &'a AppState,
    pub actor: &'a Actor,
    pub account: Account,
    pub state: FlowState,
    screen_id: Option<i32>,
    origin_id: Option<i32>,
}

impl<'a> Ctx<'a> {
    fn new(app: &'a AppState, actor: &'a Actor, account: Account, origin_id: Option<i32>) -> Self {
        let state = account.session.state;
        let screen_id = account.session.payload.ui.screen_message_id;
        Self {
            app,
            actor,
            account,
            state,
            screen_id,
            origin_id,
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.app.store.as_ref()
    }

    pub fn user(&self) -> &User {
        &self.account.user
    }

    pub fn payload(&self) -> &Payload {
        &self.account.session.payload
    }

    pub fn is_admin(&self) -> bool {
        self.app.is_admin(&self.account.user)
    }

    pub fn currency(&self) -> &str {
        &self.app.config.currency
    }

    /// Moves to `state` and drops every flow key except `ui`.
    pub async fn clear(&mut self, state: FlowState) -> Result<()> {
        self.store().set_state_cleared(self.actor.tg_id, state).await?;
        self.state = state;
        Ok(())
    }

    /// Moves to `state` and merges `patch` into the payload.
    pub async fn patch(&mut self, state: FlowState, patch: PayloadPatch) -> Result<()> {
        self.store()
            .set_state_payload(self.actor.tg_id, state, patch)
            .await?;
        self.state = state;
        Ok(())
    }

    /// Records a state already written by a composite store operation.
    pub fn assume(&mut self, state: FlowState) {
        self.state = state;
    }

    /// Admin notifications are not screens; never draw over them.
    pub fn forget_origin(&mut self) {
        self.origin_id = None;
    }

    pub async fn show(&mut self, screen: Screen) -> Result<()> {
        let target = Target {
            tg_id: self.actor.tg_id,
            chat_id: self.actor.chat_id,
            state: self.state,
            stored_id: self.screen_id,
            origin_id: self.origin_id,
        };
        let id = screen::render(self.store(), self.app.transport.as_ref(), target, &screen).await?;
        self.screen_id = Some(id);
        Ok(())
    }

    /// Sends a plain message to the admin chats, best-effort.
    pub async fn notify_admins(&self, screen: &Screen) {
        for admin in &self.app.config.admin_tg_ids {
            best_effort(
                "notify admin",
                self.app.transport.send_message(*admin, screen),
            )
            .await;
        }
    }
}

/// Entry point for one update.
pub async fn handle(app: &AppState, actor: &Actor, inbound: Inbound) {
    match inbound {
        Inbound::Callback {
            id,
            data,
            message_id,
        } => {
            let ack = match on_callback(app, actor, &data, message_id).await {
                Ok(ack) => ack,
                Err(e) => {
                    let state = current_state(app, actor.tg_id).await;
                    error!(
                        tg_id = actor.tg_id,
                        action = %data,
                        state = %state,
                        "callback failed: {:#}",
                        e
                    );
                    fallback_screen(app, actor, message_id, TRY_AGAIN).await;
                    Ack::text(TRY_AGAIN)
                }
            };
            acknowledge(app.transport.as_ref(), &id, ack).await;
        }
        other => {
            let kind = match &other {
                Inbound::Start { .. } => "start",
                Inbound::Text(_) => "text",
                Inbound::Media(_) => "media",
                Inbound::Callback { .. } => "callback",
            };
            if let Err(e) = on_message(app, actor, other).await {
                let state = current_state(app, actor.tg_id).await;
                error!(
                    tg_id = actor.tg_id,
                    action = kind,
                    state = %state,
                    "message handling failed: {:#}",
                    e
                );
                fallback_screen(app, actor, None, TRY_AGAIN).await;
            }
        }
    }
}

async fn current_state(app: &AppState, tg_id: i64) -> String {
    match app.store.load_user_with_session(tg_id).await {
        Ok(Some(account)) => account.session.state.to_string(),
        Ok(None) => "absent".to_string(),
        Err(_) => "unknown".to_string(),
    }
}

/// Last-resort screen when the normal path failed or there is no session.
/// Never persists anything.
async fn fallback_screen(app: &AppState, actor: &Actor, origin_id: Option<i32>, text: &str) {
    let screen = Screen::text(text).keyboard(keyboards::back_to_menu());
    let stored = match app.store.load_user_with_session(actor.tg_id).await {
        Ok(Some(account)) => account.session.payload.ui.screen_message_id,
        _ => None,
    };
    for id in [stored, origin_id].into_iter().flatten() {
        match app.transport.edit_message(actor.chat_id, id, &screen).await {
            Ok(()) | Err(TransportError::NotModified) => return,
            Err(e) => debug!(tg_id = actor.tg_id, "fallback edit failed: {}", e),
        }
    }
    best_effort("fallback send", app.transport.send_message(actor.chat_id, &screen)).await;
}

async fn load(app: &AppState, actor: &Actor) -> Result<Option<Account>> {
    app.store.load_user_with_session(actor.tg_id).await
}

async fn on_callback(app: &AppState, actor: &Actor, data: &str, origin_id: Option<i32>) -> Result<Ack> {
    let action = match data.parse::<Action>() {
        Ok(action) => action,
        Err(e) => {
            debug!(tg_id = actor.tg_id, "{}", e);
            return Ok(Ack::text("Unknown command"));
        }
    };
    if action == Action::Noop {
        return Ok(Ack::Silent);
    }
    if action == Action::Help {
        return Ok(Ack::alert("❓ Instructions are coming soon."));
    }

    let Some(account) = load(app, actor).await? else {
        fallback_screen(app, actor, origin_id, NO_SESSION).await;
        return Ok(Ack::Silent);
    };
    if account.user.is_blocked {
        return Ok(Ack::alert("Access is blocked."));
    }

    let mut ctx = Ctx::new(app, actor, account, origin_id);
    if action.requires_admin() && !ctx.is_admin() {
        return Ok(Ack::alert("Insufficient rights"));
    }

    info!(tg_id = actor.tg_id, action = %action, state = %ctx.state, "callback");

    match action {
        Action::Noop | Action::Help => Ok(Ack::Silent),
        Action::Home | Action::PayHome => menu::home(&mut ctx).await,
        Action::Menu(MenuItem::Profile) => profile::show(&mut ctx, None).await,
        Action::Menu(MenuItem::Pay) => topup::pay_menu(&mut ctx).await,
        Action::Menu(MenuItem::Connect) => buy::start(&mut ctx).await,
        Action::Menu(MenuItem::Referral) | Action::RefRefresh => referral::show(&mut ctx, None).await,
        Action::Menu(MenuItem::Promo) => promo::start(&mut ctx).await,
        Action::Menu(MenuItem::Support) => support::show(&mut ctx).await,
        Action::Menu(MenuItem::Admin) => menu::admin_panel(&mut ctx).await,

        Action::BuyProtocol(protocol) => buy::protocol(&mut ctx, &protocol).await,
        Action::BuyServer(id) => buy::server(&mut ctx, id).await,
        Action::BuyPlan(id) => buy::plan(&mut ctx, id).await,
        Action::BuyTransfer => buy::transfer(&mut ctx).await,
        Action::BuyBack => buy::back(&mut ctx).await,
        Action::BuyCancel | Action::TopupCancel | Action::SupportCancel => menu::home(&mut ctx).await,

        Action::PayBalance => topup::balance(&mut ctx).await,
        Action::PayRenew => renew::start(&mut ctx).await,
        Action::TopupStart => topup::start(&mut ctx).await,
        Action::TopupMethod(method) => topup::method(&mut ctx, &method).await,
        Action::TopupAmount(amount) => topup::amount(&mut ctx, amount).await,
        Action::TopupBack => topup::back(&mut ctx).await,

        Action::RenewStep(direction) => renew::step(&mut ctx, direction).await,
        Action::RenewPick => renew::pick(&mut ctx).await,
        Action::RenewBack => renew::back(&mut ctx).await,
        Action::RenewPlan(id) => renew::plan(&mut ctx, id).await,

        Action::Profile(item) => profile::item(&mut ctx, item).await,
        Action::PayhistStep(direction) => profile::payhist_step(&mut ctx, direction).await,
        Action::PayhistFile => profile::payhist_file(&mut ctx).await,
        Action::PayhistBack | Action::PkeysBack => profile::back(&mut ctx).await,
        Action::PkeysStep(direction) => profile::keys_step(&mut ctx, direction).await,

        Action::RefWithdraw => referral::withdraw(&mut ctx).await,

        Action::SupportWrite => support::write(&mut ctx, false).await,
        Action::SupportNew => support::write(&mut ctx, true).await,

        Action::Payment(decision, id) => admin::payment(&mut ctx, decision, id).await,
        Action::Withdrawal(decision, id) => admin::withdrawal(&mut ctx, decision, id).await,
        Action::TicketReply(id) => admin::ticket_reply(&mut ctx, id).await,
        Action::TicketClose(id) => admin::ticket_close(&mut ctx, id).await,
    }
}

async fn on_message(app: &AppState, actor: &Actor, inbound: Inbound) -> Result<()> {
    if let Inbound::Start { arg } = &inbound {
        let referrer = arg.as_deref().and_then(ReferrerRef::parse_start_arg);
        let user = app.store.upsert_user(&actor.contact(), referrer).await?;
        info!(tg_id = actor.tg_id, user_id = user.id, "start");
    }

    let Some(account) = load(app, actor).await? else {
        fallback_screen(app, actor, None, NO_SESSION).await;
        return Ok(());
    };
    if account.user.is_blocked {
        debug!(tg_id = actor.tg_id, "ignoring message from blocked user");
        return Ok(());
    }

    let mut ctx = Ctx::new(app, actor, account, None);
    let state = ctx.state;
    match inbound {
        Inbound::Start { .. } => {
            menu::home(&mut ctx).await?;
        }
        Inbound::Text(text) => match state {
            FlowState::SupportWait => support::submit(&mut ctx, &text).await?,
            FlowState::SupportReply if ctx.is_admin() => admin::reply_text(&mut ctx, &text).await?,
            FlowState::PromoWait => promo::redeem(&mut ctx, &text).await?,
            FlowState::TopupProof | FlowState::PayProof => {
                ctx.show(
                    Screen::text("Please send a photo or PDF of the payment.")
                        .keyboard(keyboards::back_to_menu()),
                )
                .await?
            }
            _ => {
                ctx.show(Screen::text(UNKNOWN_TEXT).keyboard(keyboards::back_to_menu()))
                    .await?
            }
        },
        Inbound::Media(media) => match state {
            FlowState::TopupProof | FlowState::PayProof => topup::proof(&mut ctx, media).await?,
            _ => debug!(tg_id = actor.tg_id, state = %state, "ignoring upload outside proof states"),
        },
        Inbound::Callback { .. } => {}
    }
    Ok(())
}
