use anyhow::{Context, Result};
use sqlx::PgConnection;

use crate::models::catalog::{Plan, Server};

const SERVER_SELECT: &str = r#"
    SELECT s.id, s.name, s.country, s.capacity,
           COALESCE(COUNT(p.id) FILTER (WHERE p.status = 'active'), 0)::BIGINT AS active_keys
    FROM vpn_servers s
    LEFT JOIN vpn_profiles p ON p.server_id = s.id
"#;

pub struct CatalogRepository;

impl CatalogRepository {
    pub async fn list_servers(conn: &mut PgConnection) -> Result<Vec<Server>> {
        let sql = format!(
            "{} WHERE s.enabled = TRUE GROUP BY s.id ORDER BY s.weight DESC, s.name ASC",
            SERVER_SELECT
        );
        sqlx::query_as::<_, Server>(&sql)
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list servers")
    }

    pub async fn get_server(conn: &mut PgConnection, server_id: i64) -> Result<Option<Server>> {
        let sql = format!(
            "{} WHERE s.id = $1 AND s.enabled = TRUE GROUP BY s.id",
            SERVER_SELECT
        );
        sqlx::query_as::<_, Server>(&sql)
            .bind(server_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to load server")
    }

    /// Share-locks an enabled server row so it cannot be disabled until the
    /// surrounding transaction ends. `false` when the server is gone.
    pub async fn lock_live_server(conn: &mut PgConnection, server_id: i64) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM vpn_servers WHERE id = $1 AND enabled = TRUE FOR SHARE",
        )
        .bind(server_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to lock server")?;
        Ok(found.is_some())
    }

    pub async fn list_active_plans(conn: &mut PgConnection) -> Result<Vec<Plan>> {
        sqlx::query_as::<_, Plan>(
            r#"
            SELECT id, code, title, duration_days, price_minor, currency, enabled
            FROM plans
            WHERE enabled = TRUE
            ORDER BY price_minor ASC, duration_days ASC, id ASC
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .context("Failed to list plans")
    }

    pub async fn get_plan(conn: &mut PgConnection, plan_id: i64) -> Result<Option<Plan>> {
        sqlx::query_as::<_, Plan>(
            "SELECT id, code, title, duration_days, price_minor, currency, enabled FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to load plan")
    }
}
