use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::models::catalog::{Profile, ProfileSource, stub_config_uri};

pub struct ProfileRepository;

impl ProfileRepository {
    pub async fn list_active(conn: &mut PgConnection, user_id: i64) -> Result<Vec<Profile>> {
        sqlx::query_as::<_, Profile>(
            r#"
            SELECT p.id, p.user_id, p.protocol, p.server_id, s.name AS server_name,
                   p.status, p.source, p.config_uri, p.created_at, p.access_until
            FROM vpn_profiles p
            LEFT JOIN vpn_servers s ON s.id = p.server_id
            WHERE p.user_id = $1 AND p.status = 'active' AND p.revoked_at IS NULL
            ORDER BY p.created_at DESC, p.id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await
        .context("Failed to list active profiles")
    }

    pub async fn has_trial(conn: &mut PgConnection, user_id: i64) -> Result<bool> {
        let used = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM vpn_profiles WHERE user_id = $1 AND source = 'trial')",
        )
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to check trial usage")?;
        Ok(used)
    }

    pub async fn set_access_until(conn: &mut PgConnection, profile_id: i64, until: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE vpn_profiles SET access_until = $1 WHERE id = $2")
            .bind(until)
            .bind(profile_id)
            .execute(&mut *conn)
            .await
            .context("Failed to update profile access")?;
        Ok(result.rows_affected() > 0)
    }

    /// Locks a renewable profile (active, paid) owned by `user_id` and
    /// returns its current expiry.
    pub async fn lock_renewable(
        conn: &mut PgConnection,
        profile_id: i64,
        user_id: i64,
    ) -> Result<Option<Option<DateTime<Utc>>>> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            r#"
            SELECT access_until FROM vpn_profiles
            WHERE id = $1 AND user_id = $2 AND status = 'active'
              AND revoked_at IS NULL AND source <> 'trial'
            FOR UPDATE
            "#,
        )
        .bind(profile_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to lock profile for renewal")
    }

    /// Inserts a stub profile. Returns `None` when the user already holds a
    /// trial and a second one was requested.
    pub async fn create_stub(
        conn: &mut PgConnection,
        user_id: i64,
        protocol: &str,
        server_id: i64,
        source: ProfileSource,
        access_until: Option<DateTime<Utc>>,
    ) -> Result<Option<String>> {
        let config_uri = stub_config_uri(protocol, source, user_id, server_id);
        let client_id = format!("{}-{}-{}", source.as_str(), user_id, Utc::now().timestamp_millis());
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO vpn_profiles
                (user_id, protocol, server_id, status, source, provider_client_id, config_uri, access_until)
            VALUES ($1, $2, $3, 'active', $4, $5, $6, $7)
            ON CONFLICT (user_id) WHERE source = 'trial' DO NOTHING
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(protocol)
        .bind(server_id)
        .bind(source.as_str())
        .bind(&client_id)
        .bind(&config_uri)
        .bind(access_until)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to create profile")?;
        Ok(id.map(|_| config_uri))
    }
}
