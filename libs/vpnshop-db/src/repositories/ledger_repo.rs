use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgConnection;

use crate::store::BalanceChange;

pub struct LedgerRepository;

impl LedgerRepository {
    pub async fn get_balance(conn: &mut PgConnection, user_id: i64) -> Result<i64> {
        let balance = sqlx::query_scalar::<_, i64>("SELECT balance FROM user_balance WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to read balance")?;
        Ok(balance.unwrap_or(0))
    }

    /// Credits always apply. Debits are conditional on the current balance,
    /// so two racing debits can never both succeed past zero.
    pub async fn apply_delta(
        conn: &mut PgConnection,
        user_id: i64,
        delta: i64,
        reason: &str,
        meta: &Value,
    ) -> Result<BalanceChange> {
        let balance = if delta >= 0 {
            let balance = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO user_balance (user_id, balance)
                VALUES ($1, $2)
                ON CONFLICT (user_id) DO UPDATE SET balance = user_balance.balance + EXCLUDED.balance
                RETURNING balance
                "#,
            )
            .bind(user_id)
            .bind(delta)
            .fetch_one(&mut *conn)
            .await
            .context("Failed to credit balance")?;
            Some(balance)
        } else {
            sqlx::query_scalar::<_, i64>(
                r#"
                UPDATE user_balance
                SET balance = balance - $1
                WHERE user_id = $2 AND balance >= $1
                RETURNING balance
                "#,
            )
            .bind(-delta)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to debit balance")?
        };

        let Some(balance) = balance else {
            let current = Self::get_balance(conn, user_id).await?;
            return Ok(BalanceChange::Insufficient { balance: current });
        };

        if delta != 0 {
            sqlx::query(
                r#"
                INSERT INTO balance_transactions (user_id, amount, kind, reason, meta)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(user_id)
            .bind(delta)
            .bind(if delta > 0 { "credit" } else { "debit" })
            .bind(reason)
            .bind(sqlx::types::Json(meta))
            .execute(&mut *conn)
            .await
            .context("Failed to record balance transaction")?;
        }

        Ok(BalanceChange::Applied { balance })
    }
}
