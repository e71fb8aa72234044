use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferralSummary {
    pub invited: i64,
    pub wallet_balance: i64,
    pub pending_bonus: i64,
    pub pending_withdrawal: Option<Withdrawal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::Rejected => "rejected",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "approved" => WithdrawalStatus::Approved,
            "rejected" => WithdrawalStatus::Rejected,
            _ => WithdrawalStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
}

/// Bonus parameters applied when an approved order has a referrer.
#[derive(Debug, Clone, Copy)]
pub struct BonusPolicy {
    pub percent: i64,
    pub delay_days: i64,
}

impl BonusPolicy {
    pub fn bonus_for(&self, amount_minor: i64) -> i64 {
        amount_minor * self.percent / 100
    }
}
