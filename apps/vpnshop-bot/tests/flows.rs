use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{Duration, Utc};
use serde_json::json;

use vpnshop_bot::config::BotConfig;
use vpnshop_bot::flow::{self, Actor, Inbound, Media, NO_SESSION};
use vpnshop_bot::state::AppState;
use vpnshop_bot::transport::recording::{Answer, Delivery, RecordingTransport};
use vpnshop_bot::transport::{FileKind, Screen};
use vpnshop_db::MemoryStore;
use vpnshop_db::Store;
use vpnshop_db::models::catalog::{Plan, ProfileSource};
use vpnshop_db::models::promo::PromoCode;
use vpnshop_db::models::session::FlowState;
use vpnshop_db::models::support::Sender;
use vpnshop_db::models::user::User;
use vpnshop_db::store::{ProvisionRequest, PurchaseOutcome, TrialOutcome};

const ADMIN: i64 = 900;

struct Harness {
    store: Arc<MemoryStore>,
    transport: Arc<RecordingTransport>,
    app: AppState,
    callbacks: AtomicU32,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(BotConfig::default())
    }

    fn with_config(config: BotConfig) -> Self {
        let config = BotConfig {
            admin_tg_ids: vec![ADMIN],
            ..config
        };
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let app = AppState::new(store.clone(), transport.clone(), config, "vpnshop_test_bot");
        Self {
            store,
            transport,
            app,
            callbacks: AtomicU32::new(0),
        }
    }

    fn actor(tg_id: i64) -> Actor {
        Actor {
            tg_id,
            chat_id: tg_id,
            username: Some(format!("user{}", tg_id)),
        }
    }

    async fn start(&self, tg_id: i64) {
        self.start_with(tg_id, None).await;
    }

    async fn start_with(&self, tg_id: i64, arg: Option<&str>) {
        let inbound = Inbound::Start {
            arg: arg.map(str::to_string),
        };
        flow::handle(&self.app, &Self::actor(tg_id), inbound).await;
    }

    /// Presses a button on the user's current screen and returns the single
    /// acknowledgment it produced.
    async fn press(&self, tg_id: i64, data: &str) -> Answer {
        let id = format!("cb{}", self.callbacks.fetch_add(1, Ordering::SeqCst));
        let message_id = self.screen_id(tg_id).await;
        let inbound = Inbound::Callback {
            id: id.clone(),
            data: data.to_string(),
            message_id,
        };
        flow::handle(&self.app, &Self::actor(tg_id), inbound).await;
        let answers = self.transport.answers_for(&id);
        assert_eq!(answers.len(), 1, "callback {} answered {} times", data, answers.len());
        answers[0].clone()
    }

    async fn text(&self, tg_id: i64, text: &str) {
        flow::handle(&self.app, &Self::actor(tg_id), Inbound::Text(text.to_string())).await;
    }

    async fn upload(&self, tg_id: i64, file_id: &str) {
        self.transport.add_file(file_id, vec![0xFF, 0xD8, 0xFF]);
        let media = Media {
            file_id: file_id.to_string(),
            file_name: None,
            mime_type: Some("image/jpeg".to_string()),
            file_size: Some(3),
            kind: FileKind::Photo,
        };
        flow::handle(&self.app, &Self::actor(tg_id), Inbound::Media(media)).await;
    }

    async fn screen_id(&self, tg_id: i64) -> Option<i32> {
        self.store
            .load_user_with_session(tg_id)
            .await
            .unwrap()
            .and_then(|a| a.session.payload.ui.screen_message_id)
    }

    async fn state(&self, tg_id: i64) -> FlowState {
        self.store
            .load_user_with_session(tg_id)
            .await
            .unwrap()
            .map(|a| a.session.state)
            .unwrap()
    }

    async fn user(&self, tg_id: i64) -> User {
        self.store.load_user_with_session(tg_id).await.unwrap().unwrap().user
    }

    async fn balance(&self, tg_id: i64) -> i64 {
        let user = self.user(tg_id).await;
        self.store.get_balance(user.id).await.unwrap()
    }

    async fn fund(&self, tg_id: i64, amount: i64) {
        let user = self.user(tg_id).await;
        self.store
            .apply_balance_delta(user.id, amount, "test", json!({}))
            .await
            .unwrap();
    }

    fn screen(&self, tg_id: i64) -> Screen {
        self.transport.last_screen(tg_id).expect("no screen rendered")
    }

    /// Top-up of `amount` whole units, from the menu to an uploaded receipt.
    async fn topup_with_proof(&self, tg_id: i64, amount: i64, file_id: &str) {
        self.press(tg_id, "menu:pay").await;
        self.press(tg_id, "paymenu:balance").await;
        self.press(tg_id, "topup:start").await;
        self.press(tg_id, "topup:method:transfer_link").await;
        self.press(tg_id, &format!("topup:amount:{}", amount)).await;
        assert_eq!(self.state(tg_id).await, FlowState::TopupProof);
        self.upload(tg_id, file_id).await;
    }
}

async fn month_plan(store: &MemoryStore) -> Plan {
    store.add_plan("month", "1 month", 30, 15000).await
}

#[tokio::test]
async fn scenario_a_start_opens_menu() {
    let h = Harness::new();
    h.start(1).await;

    assert_eq!(h.state(1).await, FlowState::Menu);
    let screen = h.screen(1);
    assert_eq!(screen.text, "✅ Menu");
    let keyboard = screen.keyboard.unwrap();
    assert!(keyboard.callbacks().contains(&"menu:connect"));
    assert!(!keyboard.callbacks().contains(&"menu:admin"));
    assert_eq!(h.transport.sends(1), 1);
}

#[tokio::test]
async fn scenario_b_purchase_from_balance() {
    let h = Harness::new();
    for n in 1..=7 {
        h.store.add_server(&format!("node-{}", n), Some(100)).await;
    }
    let plan = month_plan(&h.store).await;
    h.start(1).await;
    h.fund(1, 20000).await;

    for data in ["menu:connect", "buy:proto:vless", "buy:srv:7"] {
        assert_eq!(h.press(1, data).await.text, None);
    }
    assert_eq!(h.state(1).await, FlowState::BuyPlan);
    h.press(1, &format!("buy:plan:{}", plan.id)).await;

    assert_eq!(h.balance(1).await, 5000);
    assert_eq!(h.state(1).await, FlowState::Menu);
    let user = h.user(1).await;
    let profiles = h.store.list_active_profiles(user.id).await.unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].server_id, 7);
    assert_eq!(profiles[0].protocol, "vless");
    let expected = Utc::now() + Duration::days(30);
    let until = profiles[0].access_until.unwrap();
    assert!((expected - until).num_seconds().abs() < 60);
    assert!(h.screen(1).text.contains("Remaining balance: 50.00 RUB"));
}

#[tokio::test]
async fn scenario_c_renewal_shortfall_changes_nothing() {
    let h = Harness::new();
    let server = h.store.add_server("node-1", None).await;
    let plan = month_plan(&h.store).await;
    h.start(1).await;
    let user = h.user(1).await;
    for _ in 0..3 {
        h.store
            .create_profile_stub(
                user.id,
                "vless",
                server.id,
                ProfileSource::Paid,
                Some(Utc::now() + Duration::days(3)),
            )
            .await
            .unwrap();
    }
    h.fund(1, 1000).await;
    let before = h.store.list_active_profiles(user.id).await.unwrap();

    h.press(1, "menu:pay").await;
    h.press(1, "paymenu:renew").await;
    h.press(1, "renew:next").await;
    h.press(1, "renew:next").await;
    assert!(h.screen(1).keyboard.unwrap().rows[0][1].text() == "3/3");
    h.press(1, "renew:pick").await;
    assert_eq!(h.state(1).await, FlowState::RenewPlan);

    h.press(1, &format!("renew:plan:{}", plan.id)).await;

    assert!(h.screen(1).text.contains("Missing: 140.00 RUB"));
    assert_eq!(h.state(1).await, FlowState::RenewPlan);
    assert_eq!(h.balance(1).await, 1000);
    let after = h.store.list_active_profiles(user.id).await.unwrap();
    let until = |p: &[vpnshop_db::models::catalog::Profile]| -> Vec<_> { p.iter().map(|x| x.access_until).collect() };
    assert_eq!(until(&before), until(&after));
    let payload = h.store.raw_payload(1).await.unwrap();
    assert_eq!(payload["renew"]["index"], json!(2));
    assert_eq!(payload["renew"]["profile_id"], json!(before[2].id));
}

#[tokio::test]
async fn scenario_d_double_approval_credits_once() {
    let h = Harness::new();
    h.start(1).await;
    h.start(ADMIN).await;
    h.topup_with_proof(1, 500, "receipt-1").await;
    assert_eq!(h.state(1).await, FlowState::Menu);
    assert!(h.screen(1).text.contains("Payment #1"));

    let forwarded = h.transport.deliveries(ADMIN).into_iter().any(|d| match d {
        Delivery::File { file, .. } => {
            file.kind == FileKind::Photo
                && file.caption.as_deref().is_some_and(|c| c.contains("Payment #1"))
                && file.keyboard.is_some_and(|k| k.callbacks() == vec!["pay:approve:1", "pay:reject:1"])
        }
        _ => false,
    });
    assert!(forwarded);
    assert_eq!(h.store.proof_bytes(1).await, Some(vec![0xFF, 0xD8, 0xFF]));

    let first = h.press(ADMIN, "pay:approve:1").await;
    assert!(!first.alert);
    let second = h.press(ADMIN, "pay:approve:1").await;
    assert!(second.alert);
    assert_eq!(second.text.as_deref(), Some("Order not found or already handled."));

    assert_eq!(h.balance(1).await, 50000);
    assert!(h.screen(1).text.contains("topped up by 500.00 RUB"));
}

#[tokio::test]
async fn cursor_survives_a_shrinking_list() {
    let h = Harness::new();
    let server = h.store.add_server("node-1", None).await;
    h.start(1).await;
    let user = h.user(1).await;
    for _ in 0..3 {
        h.store
            .create_profile_stub(user.id, "vless", server.id, ProfileSource::Paid, Some(Utc::now() + Duration::days(5)))
            .await
            .unwrap();
    }
    h.press(1, "menu:pay").await;
    h.press(1, "paymenu:renew").await;
    h.press(1, "renew:prev").await;
    assert_eq!(h.store.raw_payload(1).await.unwrap()["renew"]["index"], json!(2));

    let profiles = h.store.list_active_profiles(user.id).await.unwrap();
    h.store.revoke_profile(profiles[0].id).await;
    h.press(1, "renew:next").await;

    assert_eq!(h.store.raw_payload(1).await.unwrap()["renew"]["index"], json!(0));
    assert_eq!(h.screen(1).keyboard.unwrap().rows[0][1].text(), "1/2");
}

#[tokio::test]
async fn racing_purchases_cannot_overdraw() {
    let h = Harness::new();
    let server = h.store.add_server("node-1", None).await;
    let plan = month_plan(&h.store).await;
    h.start(1).await;
    h.fund(1, 20000).await;
    h.press(1, "menu:connect").await;
    h.press(1, "buy:proto:vless").await;
    h.press(1, &format!("buy:srv:{}", server.id)).await;

    let data = format!("buy:plan:{}", plan.id);
    let actor = Harness::actor(1);
    let press = |id: &'static str| {
        flow::handle(
            &h.app,
            &actor,
            Inbound::Callback {
                id: id.to_string(),
                data: data.clone(),
                message_id: None,
            },
        )
    };
    tokio::join!(press("race-a"), press("race-b"));

    assert_eq!(h.balance(1).await, 5000);
    let user = h.user(1).await;
    assert_eq!(h.store.list_active_profiles(user.id).await.unwrap().len(), 1);
    assert_eq!(h.transport.answers_for("race-a").len(), 1);
    assert_eq!(h.transport.answers_for("race-b").len(), 1);
}

#[tokio::test]
async fn trial_is_issued_once() {
    let h = Harness::new();
    let server = h.store.add_server("node-1", None).await;
    let trial = h.store.add_plan("trial", "Trial", 3, 0).await;
    h.start(1).await;

    for _ in 0..2 {
        h.press(1, "menu:connect").await;
        h.press(1, "buy:proto:vless").await;
        h.press(1, &format!("buy:srv:{}", server.id)).await;
        h.press(1, &format!("buy:plan:{}", trial.id)).await;
    }

    assert_eq!(h.screen(1).text, "Trial access was already activated earlier.");
    let user = h.user(1).await;
    let profiles = h.store.list_active_profiles(user.id).await.unwrap();
    assert_eq!(profiles.len(), 1);
    assert!(profiles[0].is_trial());
}

#[tokio::test]
async fn trial_keys_cannot_be_renewed() {
    let h = Harness::new();
    let server = h.store.add_server("node-1", None).await;
    h.start(1).await;
    let user = h.user(1).await;
    h.store
        .create_profile_stub(user.id, "vless", server.id, ProfileSource::Trial, Some(Utc::now() + Duration::days(3)))
        .await
        .unwrap();

    h.press(1, "menu:pay").await;
    h.press(1, "paymenu:renew").await;
    let answer = h.press(1, "renew:pick").await;

    assert_eq!(answer.text, None);
    assert_eq!(h.state(1).await, FlowState::Renew);
    let screen = h.screen(1);
    assert!(screen.text.starts_with("⚠️ Trial keys cannot be renewed."));
    assert!(screen.keyboard.unwrap().callbacks().contains(&"renew:pick"));
}

#[tokio::test]
async fn disabled_plan_redraws_the_renewal_plan_list() {
    let h = Harness::new();
    let server = h.store.add_server("node-1", None).await;
    let month = month_plan(&h.store).await;
    let year = h.store.add_plan("year", "1 year", 365, 90000).await;
    h.start(1).await;
    let user = h.user(1).await;
    h.store
        .create_profile_stub(user.id, "vless", server.id, ProfileSource::Paid, Some(Utc::now() + Duration::days(3)))
        .await
        .unwrap();
    h.fund(1, 20000).await;

    h.press(1, "menu:pay").await;
    h.press(1, "paymenu:renew").await;
    h.press(1, "renew:pick").await;
    h.store.disable_plan(month.id).await;
    let answer = h.press(1, &format!("renew:plan:{}", month.id)).await;

    assert_eq!(answer.text, None);
    assert_eq!(h.state(1).await, FlowState::RenewPlan);
    let screen = h.screen(1);
    assert!(screen.text.starts_with("⚠️ Plan not found."));
    let keyboard = screen.keyboard.unwrap();
    let callbacks = keyboard.callbacks();
    assert!(callbacks.contains(&format!("renew:plan:{}", year.id).as_str()));
    assert!(!callbacks.contains(&format!("renew:plan:{}", month.id).as_str()));
    assert_eq!(h.balance(1).await, 20000);
}

#[tokio::test]
async fn leaving_renewal_returns_to_the_menu() {
    let h = Harness::new();
    let server = h.store.add_server("node-1", None).await;
    h.start(1).await;
    let user = h.user(1).await;
    h.store
        .create_profile_stub(user.id, "vless", server.id, ProfileSource::Paid, Some(Utc::now() + Duration::days(3)))
        .await
        .unwrap();

    h.press(1, "menu:pay").await;
    h.press(1, "paymenu:renew").await;
    h.press(1, "renew:exit").await;

    assert_eq!(h.state(1).await, FlowState::Menu);
    assert_eq!(h.screen(1).text, "✅ Menu");
}

#[tokio::test]
async fn server_disabled_after_pick_is_not_sold() {
    let h = Harness::new();
    let server = h.store.add_server("node-1", None).await;
    let spare = h.store.add_server("node-2", None).await;
    let plan = month_plan(&h.store).await;
    h.start(1).await;
    h.fund(1, 20000).await;

    h.press(1, "menu:connect").await;
    h.press(1, "buy:proto:vless").await;
    h.press(1, &format!("buy:srv:{}", server.id)).await;
    h.store.disable_server(server.id).await;
    let answer = h.press(1, &format!("buy:plan:{}", plan.id)).await;

    assert_eq!(answer.text, None);
    assert_eq!(h.balance(1).await, 20000);
    let user = h.user(1).await;
    assert!(h.store.list_active_profiles(user.id).await.unwrap().is_empty());
    assert_eq!(h.state(1).await, FlowState::BuyServer);
    let screen = h.screen(1);
    assert!(screen.text.starts_with("⚠️ This server is no longer available."));
    let keyboard = screen.keyboard.unwrap();
    let callbacks = keyboard.callbacks();
    assert!(callbacks.contains(&format!("buy:srv:{}", spare.id).as_str()));
    assert!(!callbacks.contains(&format!("buy:srv:{}", server.id).as_str()));
}

#[tokio::test]
async fn store_refuses_purchase_on_a_disabled_server() {
    let h = Harness::new();
    let server = h.store.add_server("node-1", None).await;
    let plan = month_plan(&h.store).await;
    h.start(1).await;
    h.fund(1, 20000).await;
    let user = h.user(1).await;
    h.store.disable_server(server.id).await;

    let req = ProvisionRequest {
        tg_id: 1,
        user_id: user.id,
        protocol: "vless".to_string(),
        server_id: server.id,
        plan_id: plan.id,
        price_minor: plan.price_minor,
        duration_days: plan.duration_days,
        now: Utc::now(),
    };
    assert_eq!(h.store.purchase_profile(&req).await.unwrap(), PurchaseOutcome::ServerUnavailable);
    assert_eq!(h.store.issue_trial(&req).await.unwrap(), TrialOutcome::ServerUnavailable);
    assert_eq!(h.balance(1).await, 20000);
    assert!(h.store.list_active_profiles(user.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn plan_order_for_a_disabled_server_is_credited() {
    let h = Harness::new();
    let server = h.store.add_server("node-1", None).await;
    let plan = month_plan(&h.store).await;
    h.start(1).await;
    h.start(ADMIN).await;

    h.press(1, "menu:connect").await;
    h.press(1, "buy:proto:vless").await;
    h.press(1, &format!("buy:srv:{}", server.id)).await;
    h.press(1, &format!("buy:plan:{}", plan.id)).await;
    h.press(1, "buy:transfer").await;
    h.upload(1, "receipt-plan").await;
    h.store.disable_server(server.id).await;

    h.press(ADMIN, "pay:approve:1").await;

    let user = h.user(1).await;
    assert!(h.store.list_active_profiles(user.id).await.unwrap().is_empty());
    assert_eq!(h.balance(1).await, 15000);
    assert!(h.screen(1).text.contains("credited to your balance"));
}

#[tokio::test]
async fn unoffered_topup_amount_redraws_the_amounts() {
    let h = Harness::new();
    h.start(1).await;
    h.press(1, "menu:pay").await;
    h.press(1, "paymenu:balance").await;
    h.press(1, "topup:start").await;
    h.press(1, "topup:method:transfer").await;

    let answer = h.press(1, "topup:amount:777").await;

    assert_eq!(answer.text, None);
    assert_eq!(h.state(1).await, FlowState::TopupAmount);
    let screen = h.screen(1);
    assert!(screen.text.starts_with("⚠️ This amount is not available."));
    assert!(screen.keyboard.unwrap().callbacks().contains(&"topup:amount:1000"));
}

#[tokio::test]
async fn topup_amount_without_method_asks_for_a_method() {
    let h = Harness::new();
    h.start(1).await;
    h.press(1, "menu:pay").await;
    h.press(1, "paymenu:balance").await;
    h.press(1, "topup:start").await;
    h.press(1, "topup:method:transfer").await;
    let mut payload = h.store.raw_payload(1).await.unwrap();
    payload["topup"] = json!({});
    h.store.put_raw_payload(1, payload).await;

    let answer = h.press(1, "topup:amount:1000").await;

    assert_eq!(answer.text, None);
    assert_eq!(h.state(1).await, FlowState::TopupMethod);
    assert!(h.screen(1).text.starts_with("⚠️ No payment method selected."));
}

#[tokio::test]
async fn repeated_render_reuses_one_message() {
    let h = Harness::new();
    h.start(1).await;
    h.press(1, "menu:profile").await;
    h.press(1, "profile:keys").await;
    h.press(1, "nav:menu").await;
    h.press(1, "nav:menu").await;

    assert_eq!(h.transport.sends(1), 1);
    assert_eq!(h.transport.live_messages(1).len(), 1);

    let id = h.screen_id(1).await.unwrap();
    h.transport.forget(1, id);
    h.press(1, "menu:profile").await;
    let replacement = h.screen_id(1).await.unwrap();
    assert_ne!(replacement, id);
    assert_eq!(h.transport.sends(1), 2);
}

#[tokio::test]
async fn stale_button_is_acked_silently() {
    let h = Harness::new();
    h.store.add_server("node-1", None).await;
    h.start(1).await;
    let payload = h.store.raw_payload(1).await;

    let answer = h.press(1, "buy:srv:1").await;

    assert_eq!(answer.text, None);
    assert!(!answer.alert);
    assert_eq!(h.state(1).await, FlowState::Menu);
    assert_eq!(h.store.raw_payload(1).await, payload);
}

#[tokio::test]
async fn unknown_and_sessionless_presses_are_acked_once() {
    let h = Harness::new();
    let unknown = h.press(5, "bogus:data").await;
    assert_eq!(unknown.text.as_deref(), Some("Unknown command"));

    let sessionless = h.press(5, "menu:profile").await;
    assert_eq!(sessionless.text, None);
    assert_eq!(h.screen(5).text, NO_SESSION);
}

#[tokio::test]
async fn admin_actions_need_rights() {
    let h = Harness::new();
    h.start(1).await;
    let answer = h.press(1, "pay:approve:1").await;
    assert!(answer.alert);
    assert_eq!(answer.text.as_deref(), Some("Insufficient rights"));
}

#[tokio::test]
async fn plan_paid_by_transfer_is_provisioned_on_approval() {
    let h = Harness::new();
    let server = h.store.add_server("node-1", None).await;
    let plan = month_plan(&h.store).await;
    h.start(1).await;
    h.start(ADMIN).await;

    h.press(1, "menu:connect").await;
    h.press(1, "buy:proto:wireguard").await;
    h.press(1, &format!("buy:srv:{}", server.id)).await;
    h.press(1, &format!("buy:plan:{}", plan.id)).await;
    assert!(h.screen(1).text.contains("Missing: 150.00 RUB"));
    h.press(1, "buy:transfer").await;
    assert_eq!(h.state(1).await, FlowState::PayProof);
    assert!(h.screen(1).text.contains("PAY-"));

    h.upload(1, "receipt-plan").await;
    let order = h.store.load_order(1).await.unwrap().unwrap();
    assert_eq!(order.amount_minor, 15000);
    assert_eq!(order.protocol.as_deref(), Some("wireguard"));

    h.press(ADMIN, "pay:approve:1").await;
    let user = h.user(1).await;
    let profiles = h.store.list_active_profiles(user.id).await.unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].protocol, "wireguard");
    assert_eq!(h.balance(1).await, 0);
    assert!(h.screen(1).text.contains("Your key is ready"));
}

#[tokio::test]
async fn rejected_payment_shows_in_history() {
    let h = Harness::new();
    h.start(1).await;
    h.start(ADMIN).await;
    h.topup_with_proof(1, 1000, "receipt-2").await;
    h.press(ADMIN, "pay:reject:1").await;
    assert!(h.screen(1).text.contains("was rejected"));

    h.press(1, "menu:profile").await;
    h.press(1, "profile:payments").await;
    assert_eq!(h.state(1).await, FlowState::Payhist);
    assert!(h.screen(1).text.contains("❌ rejected"));
    assert_eq!(h.balance(1).await, 0);

    h.press(1, "payhist:file").await;
    let resent = h
        .transport
        .deliveries(1)
        .into_iter()
        .any(|d| matches!(d, Delivery::File { file, .. } if file.file_id == "receipt-2"));
    assert!(resent);
}

#[tokio::test]
async fn referral_bonus_matures_and_is_withdrawn() {
    let h = Harness::with_config(BotConfig {
        referral_min_withdraw: 10,
        ..BotConfig::default()
    });
    h.start(1).await;
    h.start(ADMIN).await;
    h.start_with(2, Some("refREF1")).await;
    assert_eq!(h.user(2).await.referrer_id, Some(h.user(1).await.id));

    h.topup_with_proof(2, 500, "receipt-3").await;
    h.press(ADMIN, "pay:approve:1").await;
    h.press(ADMIN, "pay:approve:1").await;
    assert_eq!(h.store.pending_bonus_count().await, 1);

    let referrer = h.user(1).await;
    h.press(1, "menu:ref").await;
    assert_eq!(h.store.wallet_balance(referrer.id).await, 0);

    let credited = h
        .store
        .mature_referral_bonuses(Utc::now() + Duration::days(8))
        .await
        .unwrap();
    assert_eq!(credited, 1);
    assert_eq!(h.store.wallet_balance(referrer.id).await, 5000);

    h.press(1, "ref:refresh").await;
    assert!(h.screen(1).text.contains("Wallet: 50.00 RUB"));
    h.press(1, "ref:withdraw").await;
    let again = h.press(1, "ref:withdraw").await;
    assert!(again.alert);

    h.press(ADMIN, "wd:approve:1").await;
    assert_eq!(h.balance(1).await, 5000);
    assert_eq!(h.store.wallet_balance(referrer.id).await, 0);
    assert!(h.screen(1).text.contains("Withdrawal approved"));
}

#[tokio::test]
async fn withdrawal_below_minimum_is_refused() {
    let h = Harness::new();
    h.start(1).await;
    let user = h.user(1).await;
    h.store.credit_wallet(user.id, 1000).await;

    h.press(1, "menu:ref").await;
    let answer = h.press(1, "ref:withdraw").await;

    assert!(answer.alert);
    assert!(answer.text.unwrap().contains("minimum withdrawal is 500.00 RUB"));
    assert_eq!(h.store.wallet_balance(user.id).await, 1000);
}

#[tokio::test]
async fn support_tickets_respect_the_cap() {
    let h = Harness::with_config(BotConfig {
        support_open_ticket_cap: 2,
        ..BotConfig::default()
    });
    h.start(1).await;
    h.start(ADMIN).await;

    for n in 1..=2 {
        h.press(1, "menu:support").await;
        h.press(1, "support:new").await;
        h.text(1, &format!("problem {}", n)).await;
        assert!(h.screen(1).text.contains(&format!("Ticket #{} opened", n)));
    }
    h.press(1, "menu:support").await;
    h.press(1, "support:new").await;
    h.text(1, "problem 3").await;
    assert!(h.screen(1).text.contains("2 open tickets"));

    h.press(1, "menu:support").await;
    h.press(1, "support:write").await;
    h.text(1, "more details").await;
    assert!(h.screen(1).text.contains("added to ticket #2"));
    assert_eq!(h.store.ticket_messages(2).await.len(), 2);

    h.press(ADMIN, "ticket:reply:2").await;
    assert_eq!(h.state(ADMIN).await, FlowState::SupportReply);
    h.text(ADMIN, "fixed").await;
    assert_eq!(h.state(ADMIN).await, FlowState::Menu);
    let messages = h.store.ticket_messages(2).await;
    assert_eq!(messages.last(), Some(&(Sender::Admin, "fixed".to_string())));
    assert!(h.screen(1).text.contains("Support reply"));
}

#[tokio::test]
async fn promo_code_applies_once() {
    let h = Harness::new();
    h.store
        .add_promo(PromoCode {
            code: "WELCOME".to_string(),
            bonus_minor: 10000,
            active: true,
            max_uses: None,
            used_count: 0,
            expires_at: None,
        })
        .await;
    h.start(1).await;

    h.press(1, "menu:promo").await;
    assert_eq!(h.state(1).await, FlowState::PromoWait);
    h.text(1, " welcome ").await;
    assert_eq!(h.balance(1).await, 10000);
    assert_eq!(h.state(1).await, FlowState::Menu);

    h.press(1, "menu:promo").await;
    h.text(1, "WELCOME").await;
    assert!(h.screen(1).text.contains("already used"));
    assert_eq!(h.state(1).await, FlowState::PromoWait);
    assert_eq!(h.balance(1).await, 10000);
}

#[tokio::test]
async fn text_outside_input_states_is_not_recognized() {
    let h = Harness::new();
    h.start(1).await;
    h.text(1, "hello?").await;
    assert_eq!(h.screen(1).text, flow::UNKNOWN_TEXT);
    assert_eq!(h.state(1).await, FlowState::Menu);
}
