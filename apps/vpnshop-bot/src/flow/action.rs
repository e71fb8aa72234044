//! Callback payloads. Every button the bot renders carries one of these, and
//! every payload the dispatcher receives is parsed back into one.

use std::fmt;
use std::str::FromStr;

use super::cursor::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuItem {
    Profile,
    Pay,
    Connect,
    Referral,
    Promo,
    Support,
    Admin,
}

impl MenuItem {
    fn as_str(&self) -> &'static str {
        match self {
            MenuItem::Profile => "profile",
            MenuItem::Pay => "pay",
            MenuItem::Connect => "connect",
            MenuItem::Referral => "ref",
            MenuItem::Promo => "promo",
            MenuItem::Support => "support",
            MenuItem::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileItem {
    Referral,
    Payments,
    Notify,
    Keys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Home,
    Noop,
    Help,
    Menu(MenuItem),

    BuyProtocol(String),
    BuyServer(i64),
    BuyPlan(i64),
    BuyTransfer,
    BuyBack,
    BuyCancel,

    PayBalance,
    PayRenew,
    PayHome,

    TopupStart,
    TopupMethod(String),
    TopupAmount(i64),
    TopupBack,
    TopupCancel,

    RenewStep(Direction),
    RenewPick,
    RenewBack,
    RenewPlan(i64),

    Profile(ProfileItem),
    PayhistStep(Direction),
    PayhistFile,
    PayhistBack,
    PkeysStep(Direction),
    PkeysBack,

    RefWithdraw,
    RefRefresh,

    SupportWrite,
    SupportNew,
    SupportCancel,

    Payment(Decision, i64),
    Withdrawal(Decision, i64),
    TicketReply(i64),
    TicketClose(i64),
}

impl Action {
    /// Admin-only actions; everything else is open to any user.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Action::Menu(MenuItem::Admin)
                | Action::Payment(..)
                | Action::Withdrawal(..)
                | Action::TicketReply(_)
                | Action::TicketClose(_)
        )
    }

    /// Short name for logs.
    pub fn name(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown callback data: {0}")]
pub struct UnknownAction(pub String);

fn id(raw: &str, data: &str) -> Result<i64, UnknownAction> {
    raw.parse().map_err(|_| UnknownAction(data.to_string()))
}

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let unknown = || UnknownAction(data.to_string());
        let parts: Vec<&str> = data.split(':').collect();

        let action = match parts.as_slice() {
            ["nav", "menu"] => Action::Home,
            ["noop"] | [_, "noop"] => Action::Noop,
            ["help"] | ["help", _] => Action::Help,

            ["menu", "profile"] => Action::Menu(MenuItem::Profile),
            ["menu", "pay"] => Action::Menu(MenuItem::Pay),
            ["menu", "connect"] => Action::Menu(MenuItem::Connect),
            ["menu", "ref"] => Action::Menu(MenuItem::Referral),
            ["menu", "promo"] => Action::Menu(MenuItem::Promo),
            ["menu", "support"] => Action::Menu(MenuItem::Support),
            ["menu", "admin"] => Action::Menu(MenuItem::Admin),

            ["buy", "proto", p] if !p.is_empty() => Action::BuyProtocol(p.to_string()),
            ["buy", "srv", raw] => Action::BuyServer(id(raw, data)?),
            ["buy", "plan", raw] => Action::BuyPlan(id(raw, data)?),
            ["buy", "transfer"] => Action::BuyTransfer,
            ["buy", "back"] => Action::BuyBack,
            ["buy", "cancel"] => Action::BuyCancel,

            ["paymenu", "balance"] => Action::PayBalance,
            ["paymenu", "renew"] => Action::PayRenew,
            ["paymenu", "menu"] => Action::PayHome,

            ["topup", "start"] => Action::TopupStart,
            ["topup", "method", m] if !m.is_empty() => Action::TopupMethod(m.to_string()),
            ["topup", "amount", raw] => Action::TopupAmount(id(raw, data)?),
            ["topup", "back"] => Action::TopupBack,
            ["topup", "cancel"] => Action::TopupCancel,

            ["renew", "prev"] => Action::RenewStep(Direction::Prev),
            ["renew", "next"] => Action::RenewStep(Direction::Next),
            ["renew", "pick"] => Action::RenewPick,
            ["renew", "back"] => Action::RenewBack,
            ["renew", "exit"] => Action::Home,
            ["renew", "plan", raw] => Action::RenewPlan(id(raw, data)?),

            ["profile", "ref"] => Action::Profile(ProfileItem::Referral),
            ["profile", "payments"] => Action::Profile(ProfileItem::Payments),
            ["profile", "notify"] => Action::Profile(ProfileItem::Notify),
            ["profile", "keys"] => Action::Profile(ProfileItem::Keys),

            ["payhist", "prev"] => Action::PayhistStep(Direction::Prev),
            ["payhist", "next"] => Action::PayhistStep(Direction::Next),
            ["payhist", "file"] => Action::PayhistFile,
            ["payhist", "back"] => Action::PayhistBack,

            ["pkeys", "prev"] => Action::PkeysStep(Direction::Prev),
            ["pkeys", "next"] => Action::PkeysStep(Direction::Next),
            ["pkeys", "back"] => Action::PkeysBack,

            ["ref", "withdraw"] => Action::RefWithdraw,
            ["ref", "refresh"] => Action::RefRefresh,

            ["support", "write"] => Action::SupportWrite,
            ["support", "new"] => Action::SupportNew,
            ["support", "cancel"] => Action::SupportCancel,

            ["pay", "approve", raw] => Action::Payment(Decision::Approve, id(raw, data)?),
            ["pay", "reject", raw] => Action::Payment(Decision::Reject, id(raw, data)?),
            ["wd", "approve", raw] => Action::Withdrawal(Decision::Approve, id(raw, data)?),
            ["wd", "reject", raw] => Action::Withdrawal(Decision::Reject, id(raw, data)?),
            ["ticket", "reply", raw] => Action::TicketReply(id(raw, data)?),
            ["ticket", "close", raw] => Action::TicketClose(id(raw, data)?),

            _ => return Err(unknown()),
        };
        Ok(action)
    }
}

fn dir(direction: &Direction) -> &'static str {
    match direction {
        Direction::Prev => "prev",
        Direction::Next => "next",
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Home => write!(f, "nav:menu"),
            Action::Noop => write!(f, "noop"),
            Action::Help => write!(f, "help"),
            Action::Menu(item) => write!(f, "menu:{}", item.as_str()),

            Action::BuyProtocol(p) => write!(f, "buy:proto:{}", p),
            Action::BuyServer(id) => write!(f, "buy:srv:{}", id),
            Action::BuyPlan(id) => write!(f, "buy:plan:{}", id),
            Action::BuyTransfer => write!(f, "buy:transfer"),
            Action::BuyBack => write!(f, "buy:back"),
            Action::BuyCancel => write!(f, "buy:cancel"),

            Action::PayBalance => write!(f, "paymenu:balance"),
            Action::PayRenew => write!(f, "paymenu:renew"),
            Action::PayHome => write!(f, "paymenu:menu"),

            Action::TopupStart => write!(f, "topup:start"),
            Action::TopupMethod(m) => write!(f, "topup:method:{}", m),
            Action::TopupAmount(n) => write!(f, "topup:amount:{}", n),
            Action::TopupBack => write!(f, "topup:back"),
            Action::TopupCancel => write!(f, "topup:cancel"),

            Action::RenewStep(d) => write!(f, "renew:{}", dir(d)),
            Action::RenewPick => write!(f, "renew:pick"),
            Action::RenewBack => write!(f, "renew:back"),
            Action::RenewPlan(id) => write!(f, "renew:plan:{}", id),

            Action::Profile(item) => {
                let name = match item {
                    ProfileItem::Referral => "ref",
                    ProfileItem::Payments => "payments",
                    ProfileItem::Notify => "notify",
                    ProfileItem::Keys => "keys",
                };
                write!(f, "profile:{}", name)
            }
            Action::PayhistStep(d) => write!(f, "payhist:{}", dir(d)),
            Action::PayhistFile => write!(f, "payhist:file"),
            Action::PayhistBack => write!(f, "payhist:back"),
            Action::PkeysStep(d) => write!(f, "pkeys:{}", dir(d)),
            Action::PkeysBack => write!(f, "pkeys:back"),

            Action::RefWithdraw => write!(f, "ref:withdraw"),
            Action::RefRefresh => write!(f, "ref:refresh"),

            Action::SupportWrite => write!(f, "support:write"),
            Action::SupportNew => write!(f, "support:new"),
            Action::SupportCancel => write!(f, "support:cancel"),

            Action::Payment(d, id) => write!(f, "pay:{}:{}", d.as_str(), id),
            Action::Withdrawal(d, id) => write!(f, "wd:{}:{}", d.as_str(), id),
            Action::TicketReply(id) => write!(f, "ticket:reply:{}", id),
            Action::TicketClose(id) => write!(f, "ticket:close:{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_parameterised_actions() {
        assert_eq!("buy:srv:7".parse::<Action>(), Ok(Action::BuyServer(7)));
        assert_eq!(
            "buy:proto:vless".parse::<Action>(),
            Ok(Action::BuyProtocol("vless".to_string()))
        );
        assert_eq!(
            "wd:approve:12".parse::<Action>(),
            Ok(Action::Withdrawal(Decision::Approve, 12))
        );
        assert_eq!(
            "renew:next".parse::<Action>(),
            Ok(Action::RenewStep(Direction::Next))
        );
    }

    #[test]
    fn leaving_renewal_goes_home() {
        assert_eq!("renew:exit".parse::<Action>(), Ok(Action::Home));
        assert_eq!("renew:back".parse::<Action>(), Ok(Action::RenewBack));
    }

    #[test]
    fn counter_buttons_are_noops() {
        for data in ["noop", "renew:noop", "payhist:noop", "paymenu:noop"] {
            assert_eq!(data.parse::<Action>(), Ok(Action::Noop), "{}", data);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!("buy:srv:abc".parse::<Action>().is_err());
        assert!("menu:lang".parse::<Action>().is_err());
        assert!("".parse::<Action>().is_err());
        assert!("pay:approve".parse::<Action>().is_err());
    }

    #[test]
    fn rendered_payloads_parse_back() {
        let actions = [
            Action::Home,
            Action::Menu(MenuItem::Referral),
            Action::BuyPlan(3),
            Action::TopupAmount(500),
            Action::PkeysStep(Direction::Prev),
            Action::Payment(Decision::Reject, 41),
            Action::TicketClose(2),
        ];
        for action in actions {
            assert_eq!(action.to_string().parse::<Action>(), Ok(action.clone()));
        }
    }

    #[test]
    fn admin_actions_are_marked() {
        assert!(Action::Payment(Decision::Approve, 1).requires_admin());
        assert!(Action::Menu(MenuItem::Admin).requires_admin());
        assert!(!Action::Menu(MenuItem::Pay).requires_admin());
    }
}
