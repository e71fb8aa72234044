use vpnshop_db::models::catalog::{Plan, Server};

use crate::bot::utils::format_money;
use crate::flow::action::{Action, Decision, MenuItem, ProfileItem};
use crate::flow::cursor::Direction;
use crate::transport::{Button, Keyboard};

fn cb(text: impl Into<String>, action: Action) -> Button {
    Button::callback(text, action)
}

pub fn main_menu(is_admin: bool) -> Keyboard {
    let kb = Keyboard::new()
        .button(cb("👤 Profile", Action::Menu(MenuItem::Profile)))
        .row(vec![
            cb("💳 Pay for access", Action::Menu(MenuItem::Pay)),
            cb("🌐 Connect VPN", Action::Menu(MenuItem::Connect)),
        ])
        .row(vec![
            cb("🤝 Invite a friend", Action::Menu(MenuItem::Referral)),
            cb("🏷️ Promo code", Action::Menu(MenuItem::Promo)),
        ])
        .button(cb("✉️ Support", Action::Menu(MenuItem::Support)));
    if is_admin {
        kb.button(cb("🛠 Admin panel", Action::Menu(MenuItem::Admin)))
    } else {
        kb
    }
}

pub fn back_to_menu() -> Keyboard {
    Keyboard::new().button(cb("↩️ Menu", Action::Home))
}

pub fn instructions() -> Keyboard {
    Keyboard::new()
        .button(cb("📘 Instructions", Action::Help))
        .button(cb("↩️ Menu", Action::Home))
}

pub fn protocols(protocols: &[String]) -> Keyboard {
    let mut kb = Keyboard::new();
    for pair in protocols.chunks(2) {
        kb = kb.row(
            pair.iter()
                .map(|p| cb(protocol_label(p), Action::BuyProtocol(p.clone())))
                .collect(),
        );
    }
    kb.button(cb("❌ Cancel", Action::BuyCancel))
}

pub fn protocol_label(protocol: &str) -> String {
    match protocol {
        "wireguard" => "WireGuard".to_string(),
        "shadowsocks" => "Shadowsocks".to_string(),
        "vless" => "VLESS".to_string(),
        "outline" => "Outline".to_string(),
        other => other.to_uppercase(),
    }
}

fn back_cancel() -> Vec<Button> {
    vec![
        cb("⬅️ Back", Action::BuyBack),
        cb("❌ Cancel", Action::BuyCancel),
    ]
}

pub fn servers(servers: &[Server]) -> Keyboard {
    let mut kb = Keyboard::new();
    for s in servers {
        let country = s
            .country
            .as_deref()
            .map(|c| format!(" ({})", c))
            .unwrap_or_default();
        let label = format!("{}{} {}", s.name, country, s.load_label());
        kb = kb.button(cb(label, Action::BuyServer(s.id)));
    }
    kb.row(back_cancel())
}

pub fn plans(plans: &[Plan]) -> Keyboard {
    let mut kb = Keyboard::new();
    for p in plans {
        let label = format!(
            "{} · {} / {} d.",
            p.title,
            format_money(p.price_minor, &p.currency),
            p.duration_days
        );
        kb = kb.button(cb(label, Action::BuyPlan(p.id)));
    }
    kb.row(back_cancel())
}

pub fn buy_cancel_only() -> Keyboard {
    Keyboard::new().button(cb("❌ Cancel", Action::BuyCancel))
}

pub fn insufficient_funds() -> Keyboard {
    Keyboard::new()
        .button(cb("💸 Pay by transfer", Action::BuyTransfer))
        .button(cb("💳 Top up balance", Action::PayBalance))
        .row(back_cancel())
        .button(cb("↩️ Menu", Action::Home))
}

pub fn pay_menu() -> Keyboard {
    Keyboard::new()
        .row(vec![
            cb("Balance", Action::PayBalance),
            cb("Renewal", Action::PayRenew),
        ])
        .button(cb("↩️ Menu", Action::PayHome))
}

pub fn balance(balance_label: &str) -> Keyboard {
    Keyboard::new()
        .button(cb(format!("Your balance: {}", balance_label), Action::Noop))
        .button(cb("➕ Top up", Action::TopupStart))
        .button(cb("↩️ Back", Action::TopupBack))
}

fn topup_back_cancel() -> Vec<Button> {
    vec![
        cb("↩️ Back", Action::TopupBack),
        cb("❌ Cancel", Action::TopupCancel),
    ]
}

pub fn topup_methods() -> Keyboard {
    Keyboard::new()
        .button(cb("Bank transfer", Action::TopupMethod("transfer_link".to_string())))
        .button(cb("Crypto", Action::TopupMethod("crypto".to_string())))
        .button(cb("SBP", Action::TopupMethod("sbp_stub".to_string())))
        .row(topup_back_cancel())
}

/// Amounts are whole currency units on the wire.
pub fn topup_amounts(amounts_minor: &[i64], currency: &str) -> Keyboard {
    let mut kb = Keyboard::new();
    for pair in amounts_minor.chunks(2) {
        kb = kb.row(
            pair.iter()
                .map(|a| cb(format_money(*a, currency), Action::TopupAmount(a / 100)))
                .collect(),
        );
    }
    kb.row(topup_back_cancel())
}

pub fn transfer_wait(link: Option<&str>, cancel: Action) -> Keyboard {
    let kb = match link {
        Some(url) => Keyboard::new().button(Button::url("🔗 Open transfer link", url)),
        None => Keyboard::new(),
    };
    kb.button(cb("❌ Cancel", cancel))
}

fn pager(
    position: usize,
    total: usize,
    step: impl Fn(Direction) -> Action,
) -> Vec<Button> {
    vec![
        cb("⬅️", step(Direction::Prev)),
        cb(format!("{}/{}", position + 1, total), Action::Noop),
        cb("➡️", step(Direction::Next)),
    ]
}

pub fn renew_nav(index: usize, total: usize) -> Keyboard {
    Keyboard::new()
        .row(pager(index, total, Action::RenewStep))
        .button(cb("✅ Renew", Action::RenewPick))
        .button(cb("↩️ Menu", Action::PayHome))
}

/// Trial plans cannot be bought as a renewal.
pub fn renew_plans(plans: &[Plan]) -> Keyboard {
    let mut kb = Keyboard::new();
    for p in plans.iter().filter(|p| !p.is_trial()) {
        let label = format!(
            "{} · {}",
            p.title,
            format_money(p.price_minor, &p.currency)
        );
        kb = kb.button(cb(label, Action::RenewPlan(p.id)));
    }
    kb.button(cb("↩️ Back", Action::RenewBack))
}

pub fn profile() -> Keyboard {
    Keyboard::new()
        .button(cb("Referral link", Action::Profile(ProfileItem::Referral)))
        .row(vec![
            cb("Payment history", Action::Profile(ProfileItem::Payments)),
            cb("Notifications", Action::Profile(ProfileItem::Notify)),
        ])
        .button(cb("Active keys", Action::Profile(ProfileItem::Keys)))
        .button(cb("↩️ Menu", Action::Home))
}

pub fn payment_history(index: usize, total: usize, has_file: bool) -> Keyboard {
    let kb = Keyboard::new().row(pager(index, total, Action::PayhistStep));
    let kb = if has_file {
        kb.button(cb("📎 Open receipt", Action::PayhistFile))
    } else {
        kb
    };
    kb.button(cb("↩️ Back", Action::PayhistBack))
}

pub fn keys(index: usize, total: usize) -> Keyboard {
    Keyboard::new()
        .row(pager(index, total, Action::PkeysStep))
        .button(cb("↩️ Back", Action::PkeysBack))
}

pub fn referral(can_withdraw: bool) -> Keyboard {
    let kb = if can_withdraw {
        Keyboard::new().button(cb("💰 Withdraw to balance", Action::RefWithdraw))
    } else {
        Keyboard::new()
    };
    kb.button(cb("🔄 Refresh", Action::RefRefresh))
        .button(cb("↩️ Menu", Action::Home))
}

pub fn support() -> Keyboard {
    Keyboard::new()
        .button(cb("✍️ Write", Action::SupportWrite))
        .button(cb("🆕 New ticket", Action::SupportNew))
        .button(cb("↩️ Menu", Action::Home))
}

pub fn support_wait() -> Keyboard {
    Keyboard::new().button(cb("❌ Cancel", Action::SupportCancel))
}

pub fn admin_payment(order_id: i64) -> Keyboard {
    Keyboard::new().row(vec![
        cb("✅ Approve", Action::Payment(Decision::Approve, order_id)),
        cb("❌ Reject", Action::Payment(Decision::Reject, order_id)),
    ])
}

pub fn admin_withdrawal(withdrawal_id: i64) -> Keyboard {
    Keyboard::new().row(vec![
        cb("✅ Approve", Action::Withdrawal(Decision::Approve, withdrawal_id)),
        cb("❌ Reject", Action::Withdrawal(Decision::Reject, withdrawal_id)),
    ])
}

pub fn admin_ticket(ticket_id: i64) -> Keyboard {
    Keyboard::new().row(vec![
        cb("↩️ Reply", Action::TicketReply(ticket_id)),
        cb("✔️ Close", Action::TicketClose(ticket_id)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_button_only_for_admins() {
        assert!(!main_menu(false).callbacks().contains(&"menu:admin"));
        assert!(main_menu(true).callbacks().contains(&"menu:admin"));
    }

    #[test]
    fn renew_plans_skip_trials() {
        let plan = |id: i64, code: &str, price: i64| Plan {
            id,
            code: code.to_string(),
            title: code.to_string(),
            duration_days: 30,
            price_minor: price,
            currency: "RUB".to_string(),
            enabled: true,
        };
        let kb = renew_plans(&[plan(1, "trial", 0), plan(2, "month", 15000)]);
        assert_eq!(kb.callbacks(), vec!["renew:plan:2", "renew:back"]);
    }

    #[test]
    fn pager_shows_one_based_position() {
        let kb = renew_nav(1, 3);
        assert_eq!(kb.rows[0][1].text(), "2/3");
        assert_eq!(kb.callbacks()[0], "renew:prev");
    }

    #[test]
    fn topup_amount_buttons_carry_whole_units() {
        let kb = topup_amounts(&[50_000, 100_000, 200_000], "RUB");
        assert_eq!(
            kb.callbacks(),
            vec!["topup:amount:500", "topup:amount:1000", "topup:amount:2000", "topup:back", "topup:cancel"]
        );
    }
}
