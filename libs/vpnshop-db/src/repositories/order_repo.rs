use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, Row, postgres::PgRow};

use crate::models::order::{NewOrder, NewProof, Order, OrderKind, OrderStatus, PaymentRecord, Proof};

const ORDER_COLUMNS: &str =
    "id, user_id, plan_id, amount_minor, currency, kind, status, meta, created_at, updated_at";

pub struct OrderRepository;

impl OrderRepository {
    fn row_to_order(row: &PgRow) -> Order {
        let meta = row
            .try_get::<sqlx::types::Json<Value>, _>("meta")
            .map(|j| j.0)
            .unwrap_or(Value::Null);
        Order {
            id: row.try_get::<i64, _>("id").unwrap_or_default(),
            user_id: row.try_get::<i64, _>("user_id").unwrap_or_default(),
            plan_id: row.try_get::<Option<i64>, _>("plan_id").ok().flatten(),
            amount_minor: row.try_get::<i64, _>("amount_minor").unwrap_or_default(),
            currency: row.try_get::<String, _>("currency").unwrap_or_default(),
            kind: row
                .try_get::<String, _>("kind")
                .map(|k| OrderKind::from_db(&k))
                .unwrap_or(OrderKind::Topup),
            status: row
                .try_get::<String, _>("status")
                .map(|s| OrderStatus::from_db(&s))
                .unwrap_or(OrderStatus::Pending),
            protocol: meta.get("protocol").and_then(Value::as_str).map(str::to_string),
            server_id: meta.get("server_id").and_then(Value::as_i64),
            payment_code: meta.get("code").and_then(Value::as_str).map(str::to_string),
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .unwrap_or_else(|_| Utc::now()),
            updated_at: row
                .try_get::<DateTime<Utc>, _>("updated_at")
                .unwrap_or_else(|_| Utc::now()),
        }
    }

    pub async fn insert_with_proof(conn: &mut PgConnection, order: &NewOrder, proof: &NewProof) -> Result<i64> {
        let order_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO payment_orders (user_id, plan_id, amount_minor, currency, kind, provider, status, meta)
            VALUES ($1, $2, $3, $4, $5, 'manual', 'pending', $6)
            RETURNING id
            "#,
        )
        .bind(order.user_id)
        .bind(order.plan_id)
        .bind(order.amount_minor)
        .bind(&order.currency)
        .bind(order.kind.as_str())
        .bind(sqlx::types::Json(order.meta()))
        .fetch_one(&mut *conn)
        .await
        .context("Failed to create payment order")?;

        sqlx::query(
            r#"
            INSERT INTO payment_proofs (order_id, tg_file_id, file_name, mime_type, file_size, file_data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(order_id)
        .bind(&proof.file_id)
        .bind(proof.file_name.as_deref())
        .bind(proof.mime_type.as_deref())
        .bind(proof.file_size)
        .bind(&proof.data)
        .execute(&mut *conn)
        .await
        .context("Failed to store payment proof")?;

        Ok(order_id)
    }

    pub async fn get(conn: &mut PgConnection, order_id: i64) -> Result<Option<Order>> {
        let sql = format!("SELECT {} FROM payment_orders WHERE id = $1", ORDER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(order_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to load order")?;
        Ok(row.map(|r| Self::row_to_order(&r)))
    }

    /// Moves a pending order to `status`. Returns `None` when the order was
    /// already decided, so a second admin click is a no-op.
    pub async fn decide(conn: &mut PgConnection, order_id: i64, status: OrderStatus) -> Result<Option<Order>> {
        let sql = format!(
            "UPDATE payment_orders SET status = $1, updated_at = NOW() \
             WHERE id = $2 AND status = 'pending' RETURNING {}",
            ORDER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(order_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to update order status")?;
        Ok(row.map(|r| Self::row_to_order(&r)))
    }

    pub async fn proof_for(conn: &mut PgConnection, order_id: i64) -> Result<Option<Proof>> {
        let row = sqlx::query(
            r#"
            SELECT order_id, tg_file_id, file_name, mime_type
            FROM payment_proofs
            WHERE order_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to load payment proof")?;
        Ok(row.map(|r| Proof {
            order_id: r.try_get::<i64, _>("order_id").unwrap_or(order_id),
            file_id: r.try_get::<String, _>("tg_file_id").unwrap_or_default(),
            file_name: r.try_get::<Option<String>, _>("file_name").ok().flatten(),
            mime_type: r.try_get::<Option<String>, _>("mime_type").ok().flatten(),
        }))
    }

    /// Most recent orders first, each with its latest proof if any.
    pub async fn history(conn: &mut PgConnection, user_id: i64, limit: i64) -> Result<Vec<PaymentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT o.id, o.amount_minor, o.currency, o.kind, o.status, o.updated_at,
                   pp.tg_file_id, pp.mime_type
            FROM payment_orders o
            LEFT JOIN LATERAL (
                SELECT tg_file_id, mime_type FROM payment_proofs
                WHERE order_id = o.id ORDER BY id DESC LIMIT 1
            ) pp ON TRUE
            WHERE o.user_id = $1
            ORDER BY o.updated_at DESC, o.id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .context("Failed to load payment history")?;

        Ok(rows
            .iter()
            .map(|r| PaymentRecord {
                id: r.try_get::<i64, _>("id").unwrap_or_default(),
                amount_minor: r.try_get::<i64, _>("amount_minor").unwrap_or_default(),
                currency: r.try_get::<String, _>("currency").unwrap_or_default(),
                kind: r
                    .try_get::<String, _>("kind")
                    .map(|k| OrderKind::from_db(&k))
                    .unwrap_or(OrderKind::Topup),
                status: r
                    .try_get::<String, _>("status")
                    .map(|s| OrderStatus::from_db(&s))
                    .unwrap_or(OrderStatus::Pending),
                updated_at: r
                    .try_get::<DateTime<Utc>, _>("updated_at")
                    .unwrap_or_else(|_| Utc::now()),
                proof_file_id: r.try_get::<Option<String>, _>("tg_file_id").ok().flatten(),
                proof_mime: r.try_get::<Option<String>, _>("mime_type").ok().flatten(),
            })
            .collect())
    }
}
