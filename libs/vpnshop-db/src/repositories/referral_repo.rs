use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, Row, postgres::PgRow};

use crate::models::order::Order;
use crate::models::referral::{BonusPolicy, ReferralSummary, Withdrawal, WithdrawalStatus};

const WITHDRAWAL_COLUMNS: &str = "id, user_id, amount, status, created_at";

pub struct ReferralRepository;

impl ReferralRepository {
    fn row_to_withdrawal(row: &PgRow) -> Withdrawal {
        Withdrawal {
            id: row.try_get::<i64, _>("id").unwrap_or_default(),
            user_id: row.try_get::<i64, _>("user_id").unwrap_or_default(),
            amount: row.try_get::<i64, _>("amount").unwrap_or_default(),
            status: row
                .try_get::<String, _>("status")
                .map(|s| WithdrawalStatus::from_db(&s))
                .unwrap_or(WithdrawalStatus::Pending),
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .unwrap_or_else(|_| Utc::now()),
        }
    }

    pub async fn summary(conn: &mut PgConnection, user_id: i64) -> Result<ReferralSummary> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM tg_users WHERE referrer_id = $1)::BIGINT AS invited,
                COALESCE((SELECT balance FROM referral_wallets WHERE user_id = $1), 0)::BIGINT AS wallet,
                COALESCE((SELECT SUM(bonus_minor) FROM referral_pending
                          WHERE referrer_user_id = $1 AND matured_at IS NULL), 0)::BIGINT AS pending
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to load referral summary")?;

        Ok(ReferralSummary {
            invited: row.try_get::<i64, _>("invited").unwrap_or_default(),
            wallet_balance: row.try_get::<i64, _>("wallet").unwrap_or_default(),
            pending_bonus: row.try_get::<i64, _>("pending").unwrap_or_default(),
            pending_withdrawal: Self::pending_withdrawal(conn, user_id).await?,
        })
    }

    pub async fn pending_withdrawal(conn: &mut PgConnection, user_id: i64) -> Result<Option<Withdrawal>> {
        let sql = format!(
            "SELECT {} FROM referral_withdrawals WHERE user_id = $1 AND status = 'pending' LIMIT 1",
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to load pending withdrawal")?;
        Ok(row.map(|r| Self::row_to_withdrawal(&r)))
    }

    /// Schedules the referrer's bonus for a paid order. Idempotent per order.
    pub async fn schedule_bonus(
        conn: &mut PgConnection,
        order: &Order,
        referrer_id: i64,
        policy: BonusPolicy,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let bonus = policy.bonus_for(order.amount_minor);
        if bonus <= 0 {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            INSERT INTO referral_pending
                (order_id, referrer_user_id, referred_user_id, amount_minor, bonus_minor, percent, due_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order.id)
        .bind(referrer_id)
        .bind(order.user_id)
        .bind(order.amount_minor)
        .bind(bonus)
        .bind(policy.percent as i32)
        .bind(now + Duration::days(policy.delay_days))
        .execute(&mut *conn)
        .await
        .context("Failed to schedule referral bonus")?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks every due bonus matured and credits the referrers' wallets.
    pub async fn mature_due(conn: &mut PgConnection, now: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query(
            r#"
            UPDATE referral_pending
            SET matured_at = $1
            WHERE matured_at IS NULL AND due_at <= $1
            RETURNING referrer_user_id, bonus_minor
            "#,
        )
        .bind(now)
        .fetch_all(&mut *conn)
        .await
        .context("Failed to mature referral bonuses")?;

        let mut totals: BTreeMap<i64, i64> = BTreeMap::new();
        for row in &rows {
            let referrer = row.try_get::<i64, _>("referrer_user_id").unwrap_or_default();
            let bonus = row.try_get::<i64, _>("bonus_minor").unwrap_or_default();
            *totals.entry(referrer).or_default() += bonus;
        }

        for (referrer, total) in totals {
            sqlx::query(
                r#"
                INSERT INTO referral_wallets (user_id, balance, updated_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (user_id) DO UPDATE
                    SET balance = referral_wallets.balance + EXCLUDED.balance,
                        updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(referrer)
            .bind(total)
            .bind(now)
            .execute(&mut *conn)
            .await
            .context("Failed to credit referral wallet")?;
        }

        Ok(rows.len() as u64)
    }

    pub async fn lock_wallet(conn: &mut PgConnection, user_id: i64) -> Result<i64> {
        let balance = sqlx::query_scalar::<_, i64>(
            "SELECT balance FROM referral_wallets WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to lock referral wallet")?;
        Ok(balance.unwrap_or(0))
    }

    pub async fn zero_wallet(conn: &mut PgConnection, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE referral_wallets SET balance = 0, updated_at = NOW() WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *conn)
            .await
            .context("Failed to zero referral wallet")?;
        Ok(())
    }

    /// Returns `None` when another pending request already exists.
    pub async fn insert_withdrawal(conn: &mut PgConnection, user_id: i64, amount: i64) -> Result<Option<Withdrawal>> {
        let sql = format!(
            "INSERT INTO referral_withdrawals (user_id, amount, status) VALUES ($1, $2, 'pending') \
             ON CONFLICT (user_id) WHERE status = 'pending' DO NOTHING RETURNING {}",
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(amount)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to create withdrawal request")?;
        Ok(row.map(|r| Self::row_to_withdrawal(&r)))
    }

    pub async fn lock_pending_withdrawal(conn: &mut PgConnection, withdrawal_id: i64) -> Result<Option<Withdrawal>> {
        let sql = format!(
            "SELECT {} FROM referral_withdrawals WHERE id = $1 AND status = 'pending' FOR UPDATE",
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(withdrawal_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to lock withdrawal")?;
        Ok(row.map(|r| Self::row_to_withdrawal(&r)))
    }

    pub async fn decide_withdrawal(
        conn: &mut PgConnection,
        withdrawal_id: i64,
        status: WithdrawalStatus,
        amount: Option<i64>,
    ) -> Result<Option<Withdrawal>> {
        let sql = format!(
            "UPDATE referral_withdrawals SET status = $1, amount = COALESCE($2, amount), updated_at = NOW() \
             WHERE id = $3 AND status = 'pending' RETURNING {}",
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(amount)
            .bind(withdrawal_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to update withdrawal")?;
        Ok(row.map(|r| Self::row_to_withdrawal(&r)))
    }
}
