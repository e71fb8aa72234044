use anyhow::{Context, Result};
use sqlx::PgConnection;

use crate::models::promo::PromoCode;

pub struct PromoRepository;

impl PromoRepository {
    pub async fn lock_active(conn: &mut PgConnection, code: &str) -> Result<Option<PromoCode>> {
        sqlx::query_as::<_, PromoCode>(
            r#"
            SELECT code, bonus_minor, active, max_uses, used_count, expires_at
            FROM promo_codes
            WHERE code = $1 AND active = TRUE
            FOR UPDATE
            "#,
        )
        .bind(code)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to load promo code")
    }

    /// Records the usage; `false` when this user already redeemed the code.
    pub async fn record_usage(conn: &mut PgConnection, user_id: i64, code: &str) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO promo_usages (user_id, code) VALUES ($1, $2) ON CONFLICT (user_id, code) DO NOTHING",
        )
        .bind(user_id)
        .bind(code)
        .execute(&mut *conn)
        .await
        .context("Failed to record promo usage")?;
        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE promo_codes SET used_count = used_count + 1 WHERE code = $1")
            .bind(code)
            .execute(&mut *conn)
            .await
            .context("Failed to bump promo usage count")?;
        Ok(true)
    }
}
