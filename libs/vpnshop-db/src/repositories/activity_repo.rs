use anyhow::{Context, Result};
use sqlx::PgConnection;

use crate::models::activity::Event;

pub struct ActivityRepository;

impl ActivityRepository {
    pub async fn insert(conn: &mut PgConnection, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO logs (category, level, tg_user_id, user_id, action, message, context)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.category.as_str())
        .bind(&event.level)
        .bind(event.tg_id)
        .bind(event.user_id)
        .bind(&event.action)
        .bind(event.message.as_deref())
        .bind(sqlx::types::Json(&event.context))
        .execute(&mut *conn)
        .await
        .context("Failed to write activity log")?;
        Ok(())
    }
}
