use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, Row, postgres::PgRow};

use crate::models::session::{FlowState, Payload, PayloadPatch, Session};
use crate::models::user::{Account, Contact, ReferrerRef, Role, User, UserSettings};

const USER_COLUMNS: &str = "u.id, u.tg_user_id, u.chat_id, u.username, u.role, u.is_blocked, \
     u.referral_code, u.referrer_id, u.created_at, u.last_seen_at";

pub struct UserRepository;

impl UserRepository {
    fn row_to_user(row: &PgRow) -> User {
        User {
            id: row.try_get::<i64, _>("id").unwrap_or_default(),
            tg_id: row.try_get::<i64, _>("tg_user_id").unwrap_or_default(),
            chat_id: row.try_get::<i64, _>("chat_id").unwrap_or_default(),
            username: row.try_get::<Option<String>, _>("username").ok().flatten(),
            role: row
                .try_get::<String, _>("role")
                .map(|r| Role::from_db(&r))
                .unwrap_or_default(),
            is_blocked: row.try_get::<bool, _>("is_blocked").unwrap_or(false),
            referral_code: row.try_get::<Option<String>, _>("referral_code").ok().flatten(),
            referrer_id: row.try_get::<Option<i64>, _>("referrer_id").ok().flatten(),
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .unwrap_or_else(|_| Utc::now()),
            last_seen_at: row
                .try_get::<DateTime<Utc>, _>("last_seen_at")
                .unwrap_or_else(|_| Utc::now()),
        }
    }

    fn row_to_session(row: &PgRow) -> Session {
        let state = row
            .try_get::<Option<String>, _>("state")
            .ok()
            .flatten()
            .map(|s| FlowState::from_db(&s))
            .unwrap_or_default();
        let payload = row
            .try_get::<Option<sqlx::types::Json<Value>>, _>("payload")
            .ok()
            .flatten()
            .map(|json| Payload::from_value(&json.0))
            .unwrap_or_default();
        Session { state, payload }
    }

    pub async fn get_by_id(conn: &mut PgConnection, id: i64) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM tg_users u WHERE u.id = $1", USER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch user by ID")?;
        Ok(row.map(|r| Self::row_to_user(&r)))
    }

    async fn resolve_referrer(conn: &mut PgConnection, referrer: &ReferrerRef) -> Result<Option<i64>> {
        let id = match referrer {
            ReferrerRef::UserId(id) => {
                sqlx::query_scalar::<_, i64>("SELECT id FROM tg_users WHERE id = $1")
                    .bind(*id)
                    .fetch_optional(&mut *conn)
                    .await
                    .context("Failed to resolve referrer by ID")?
            }
            ReferrerRef::Code(code) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM tg_users WHERE UPPER(referral_code) = UPPER($1)",
                )
                .bind(code)
                .fetch_optional(&mut *conn)
                .await
                .context("Failed to resolve referrer by code")?
            }
        };
        Ok(id)
    }

    /// Creates or refreshes the user, assigns a referral code on first
    /// contact and makes sure a session row exists.
    pub async fn upsert(
        conn: &mut PgConnection,
        contact: &Contact,
        referrer: Option<ReferrerRef>,
    ) -> Result<User> {
        let user_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO tg_users (tg_user_id, chat_id, username, role, last_seen_at)
            VALUES ($1, $2, $3, 'user', NOW())
            ON CONFLICT (tg_user_id) DO UPDATE SET
                chat_id = EXCLUDED.chat_id,
                username = EXCLUDED.username,
                last_seen_at = NOW()
            RETURNING id
            "#,
        )
        .bind(contact.tg_id)
        .bind(contact.chat_id)
        .bind(contact.username.as_deref())
        .fetch_one(&mut *conn)
        .await
        .context("Failed to upsert user")?;

        sqlx::query(
            "UPDATE tg_users SET referral_code = 'REF' || id::TEXT WHERE id = $1 AND referral_code IS NULL",
        )
        .bind(user_id)
        .execute(&mut *conn)
        .await
        .context("Failed to assign referral code")?;

        if let Some(referrer) = referrer {
            if let Some(referrer_id) = Self::resolve_referrer(conn, &referrer).await? {
                // First write wins; a user never refers themselves.
                sqlx::query(
                    "UPDATE tg_users SET referrer_id = $1 WHERE id = $2 AND referrer_id IS NULL AND id <> $1",
                )
                .bind(referrer_id)
                .bind(user_id)
                .execute(&mut *conn)
                .await
                .context("Failed to set referrer")?;
            }
        }

        sqlx::query(
            r#"
            INSERT INTO tg_sessions (tg_user_id, state, payload, updated_at)
            VALUES ($1, 'menu', '{}'::jsonb, NOW())
            ON CONFLICT (tg_user_id) DO UPDATE SET updated_at = NOW()
            "#,
        )
        .bind(contact.tg_id)
        .execute(&mut *conn)
        .await
        .context("Failed to ensure session")?;

        Self::get_by_id(conn, user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user {} vanished after upsert", user_id))
    }

    pub async fn load_with_session(conn: &mut PgConnection, tg_id: i64) -> Result<Option<Account>> {
        let sql = format!(
            "SELECT {}, s.state, s.payload FROM tg_users u \
             LEFT JOIN tg_sessions s ON s.tg_user_id = u.tg_user_id \
             WHERE u.tg_user_id = $1 LIMIT 1",
            USER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(tg_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to load user with session")?;
        Ok(row.map(|r| Account {
            user: Self::row_to_user(&r),
            session: Self::row_to_session(&r),
        }))
    }

    pub async fn set_state_cleared(conn: &mut PgConnection, tg_id: i64, state: FlowState) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tg_sessions
            SET state = $2,
                payload = jsonb_build_object('ui', COALESCE(payload->'ui', '{}'::jsonb)),
                updated_at = NOW()
            WHERE tg_user_id = $1
            "#,
        )
        .bind(tg_id)
        .bind(state.as_str())
        .execute(&mut *conn)
        .await
        .context("Failed to clear session state")?;
        Ok(())
    }

    /// Single-statement merge so concurrent writers for the same user never
    /// lose each other's keys.
    pub async fn set_state_payload(
        conn: &mut PgConnection,
        tg_id: i64,
        state: FlowState,
        patch: &PayloadPatch,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tg_sessions
            SET payload = COALESCE(payload, '{}'::jsonb)
                    || jsonb_build_object(
                        CAST($2 AS TEXT),
                        COALESCE(payload->CAST($2 AS TEXT), '{}'::jsonb) || CAST($3 AS JSONB)
                    ),
                state = $4,
                updated_at = NOW()
            WHERE tg_user_id = $1
            "#,
        )
        .bind(tg_id)
        .bind(patch.key())
        .bind(sqlx::types::Json(Value::Object(patch.fields())))
        .bind(state.as_str())
        .execute(&mut *conn)
        .await
        .context("Failed to merge session payload")?;
        Ok(())
    }

    pub async fn settings(conn: &mut PgConnection, user_id: i64) -> Result<UserSettings> {
        let enabled = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO user_settings (user_id, notifications_enabled)
            VALUES ($1, TRUE)
            ON CONFLICT (user_id) DO UPDATE SET user_id = user_settings.user_id
            RETURNING notifications_enabled
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to load user settings")?;
        Ok(UserSettings {
            user_id,
            notifications_enabled: enabled,
        })
    }

    pub async fn toggle_notifications(conn: &mut PgConnection, user_id: i64) -> Result<UserSettings> {
        let enabled = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO user_settings (user_id, notifications_enabled)
            VALUES ($1, FALSE)
            ON CONFLICT (user_id) DO UPDATE
                SET notifications_enabled = NOT user_settings.notifications_enabled
            RETURNING notifications_enabled
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to toggle notifications")?;
        Ok(UserSettings {
            user_id,
            notifications_enabled: enabled,
        })
    }
}
