use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row, postgres::PgRow};

use crate::models::support::{Sender, Ticket, TicketStatus};

const TICKET_COLUMNS: &str =
    "id, user_id, chat_id, username, user_ticket_id, status, message_count, created_at, updated_at";

pub struct SupportRepository;

impl SupportRepository {
    fn row_to_ticket(row: &PgRow) -> Ticket {
        Ticket {
            id: row.try_get::<i64, _>("id").unwrap_or_default(),
            user_id: row.try_get::<i64, _>("user_id").unwrap_or_default(),
            chat_id: row.try_get::<i64, _>("chat_id").unwrap_or_default(),
            username: row.try_get::<Option<String>, _>("username").ok().flatten(),
            user_ticket_id: row.try_get::<i32, _>("user_ticket_id").unwrap_or_default(),
            status: row
                .try_get::<String, _>("status")
                .map(|s| TicketStatus::from_db(&s))
                .unwrap_or(TicketStatus::Open),
            message_count: row.try_get::<i32, _>("message_count").unwrap_or_default(),
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .unwrap_or_else(|_| Utc::now()),
            updated_at: row
                .try_get::<DateTime<Utc>, _>("updated_at")
                .unwrap_or_else(|_| Utc::now()),
        }
    }

    /// Serializes ticket numbering for one user.
    pub async fn lock_user(conn: &mut PgConnection, user_id: i64) -> Result<()> {
        sqlx::query("SELECT id FROM tg_users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to lock user for support")?;
        Ok(())
    }

    pub async fn latest_open(conn: &mut PgConnection, user_id: i64) -> Result<Option<Ticket>> {
        let sql = format!(
            "SELECT {} FROM support_tickets WHERE user_id = $1 AND status = 'open' \
             ORDER BY user_ticket_id DESC LIMIT 1",
            TICKET_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to load open ticket")?;
        Ok(row.map(|r| Self::row_to_ticket(&r)))
    }

    pub async fn count_open(conn: &mut PgConnection, user_id: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*)::BIGINT FROM support_tickets WHERE user_id = $1 AND status = 'open'",
        )
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to count open tickets")
    }

    pub async fn open_ticket(
        conn: &mut PgConnection,
        user_id: i64,
        chat_id: i64,
        username: Option<&str>,
    ) -> Result<Ticket> {
        let sql = format!(
            r#"
            INSERT INTO support_tickets (user_id, chat_id, username, status, user_ticket_id, message_count)
            VALUES ($1, $2, $3, 'open',
                    COALESCE((SELECT MAX(user_ticket_id) FROM support_tickets WHERE user_id = $1), 0) + 1,
                    0)
            RETURNING {}
            "#,
            TICKET_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(chat_id)
            .bind(username)
            .fetch_one(&mut *conn)
            .await
            .context("Failed to open support ticket")?;
        Ok(Self::row_to_ticket(&row))
    }

    /// Appends a message to an open ticket. `None` when the ticket is closed
    /// or missing.
    pub async fn append_message(
        conn: &mut PgConnection,
        ticket_id: i64,
        sender: Sender,
        text: &str,
    ) -> Result<Option<Ticket>> {
        let sql = format!(
            "UPDATE support_tickets SET message_count = message_count + 1, updated_at = NOW() \
             WHERE id = $1 AND status = 'open' RETURNING {}",
            TICKET_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(ticket_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to touch support ticket")?;
        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query("INSERT INTO support_messages (ticket_id, sender, text) VALUES ($1, $2, $3)")
            .bind(ticket_id)
            .bind(sender.as_str())
            .bind(text)
            .execute(&mut *conn)
            .await
            .context("Failed to store support message")?;

        Ok(Some(Self::row_to_ticket(&row)))
    }

    pub async fn close(conn: &mut PgConnection, ticket_id: i64) -> Result<Option<Ticket>> {
        let sql = format!(
            "UPDATE support_tickets SET status = 'closed', updated_at = NOW() \
             WHERE id = $1 AND status = 'open' RETURNING {}",
            TICKET_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(ticket_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to close support ticket")?;
        Ok(row.map(|r| Self::row_to_ticket(&r)))
    }
}
