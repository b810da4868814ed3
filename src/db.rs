// src/db.rs

//! Postgres implementation of [`Store`].
//!
//! Runtime queries with `.bind()` so the build does not depend on a live
//! database. The write-path guarantees live in the SQL: conditional updates
//! carry their precondition in the WHERE clause, slot uniqueness is a
//! partial unique index (see migrations), and webhook binding claims its
//! row with `FOR UPDATE SKIP LOCKED`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::models::{
    BookingContacts, Channel, NewPayment, Party, Payment, PaymentPurpose, PaymentStatus, Plan,
    RequestStatus, RequestType, RetryOperation, ServiceRequest, Subscription, SubscriptionStatus,
};
use crate::store::{ScheduleWrite, Store, StoreError};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const REQUEST_COLUMNS: &str = "id, client_id, provider_id, service_id, request_type, status, \
     scheduled_date, scheduled_time, estimated_price, final_price, expires_at, description, \
     review_rating, review_comment, reviewed_at, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, user_id, service_request_id, subscription_id, amount, \
     currency, gateway, gateway_payment_id, purpose, status, created_at, updated_at";

fn map_request(row: &PgRow) -> Result<ServiceRequest, StoreError> {
    let request_type: String = row.get("request_type");
    let status: String = row.get("status");
    Ok(ServiceRequest {
        id: row.get("id"),
        client_id: row.get("client_id"),
        provider_id: row.get("provider_id"),
        service_id: row.get("service_id"),
        request_type: RequestType::from_db_str(&request_type)
            .ok_or(StoreError::Corrupt("request_type"))?,
        status: RequestStatus::from_db_str(&status).ok_or(StoreError::Corrupt("status"))?,
        scheduled_date: row.get("scheduled_date"),
        scheduled_time: row.get("scheduled_time"),
        estimated_price: row.get("estimated_price"),
        final_price: row.get("final_price"),
        expires_at: row.get("expires_at"),
        description: row.get("description"),
        review_rating: row.get("review_rating"),
        review_comment: row.get("review_comment"),
        reviewed_at: row.get("reviewed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_payment(row: &PgRow) -> Result<Payment, StoreError> {
    let purpose: String = row.get("purpose");
    let status: String = row.get("status");
    Ok(Payment {
        id: row.get("id"),
        user_id: row.get("user_id"),
        service_request_id: row.get("service_request_id"),
        subscription_id: row.get("subscription_id"),
        amount: row.get("amount"),
        currency: row.get("currency"),
        gateway: row.get("gateway"),
        gateway_payment_id: row.get("gateway_payment_id"),
        purpose: PaymentPurpose::from_db_str(&purpose).ok_or(StoreError::Corrupt("purpose"))?,
        status: PaymentStatus::from_db_str(&status).ok_or(StoreError::Corrupt("status"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_subscription(row: &PgRow) -> Result<Subscription, StoreError> {
    let plan: String = row.get("plan");
    let status: String = row.get("status");
    Ok(Subscription {
        id: row.get("id"),
        provider_id: row.get("provider_id"),
        plan: Plan::from_db_str(&plan).ok_or(StoreError::Corrupt("plan"))?,
        status: SubscriptionStatus::from_db_str(&status).ok_or(StoreError::Corrupt("status"))?,
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        canceled_at: row.get("canceled_at"),
        created_at: row.get("created_at"),
    })
}

fn map_retry_operation(row: &PgRow) -> Result<RetryOperation, StoreError> {
    let channel: String = row.get("channel");
    Ok(RetryOperation {
        key: row.get("key"),
        channel: Channel::from_db_str(&channel).ok_or(StoreError::Corrupt("channel"))?,
        payload: row.get("payload"),
        retries: row.get("retries"),
        max_retries: row.get("max_retries"),
        next_retry_at: row.get("next_retry_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl Store for PgStore {
    async fn service_request(&self, id: i32) -> Result<Option<ServiceRequest>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM service_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_request).transpose()
    }

    async fn update_request_status(
        &self,
        id: i32,
        expected: RequestStatus,
        target: RequestStatus,
        notes: Option<&str>,
        clear_expires: bool,
    ) -> Result<Option<ServiceRequest>, StoreError> {
        let row = sqlx::query(&format!(
            r#"UPDATE service_requests
               SET status = $3,
                   description = COALESCE($4, description),
                   expires_at = CASE WHEN $5 THEN NULL ELSE expires_at END,
                   updated_at = NOW()
               WHERE id = $1 AND status = $2
               RETURNING {REQUEST_COLUMNS}"#
        ))
        .bind(id)
        .bind(expected.as_db_str())
        .bind(target.as_db_str())
        .bind(notes)
        .bind(clear_expires)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_request).transpose()
    }

    async fn assign_schedule(
        &self,
        id: i32,
        date: NaiveDate,
        time: &str,
    ) -> Result<ScheduleWrite, StoreError> {
        let result = sqlx::query(&format!(
            r#"UPDATE service_requests
               SET request_type = 'scheduling',
                   status = 'accepted',
                   scheduled_date = $2,
                   scheduled_time = $3,
                   expires_at = NULL,
                   updated_at = NOW()
               WHERE id = $1 AND status IN ('pending', 'accepted')
               RETURNING {REQUEST_COLUMNS}"#
        ))
        .bind(id)
        .bind(date)
        .bind(time)
        .fetch_optional(&self.pool)
        .await;
        match result {
            Ok(Some(row)) => Ok(ScheduleWrite::Updated(map_request(&row)?)),
            Ok(None) => Ok(ScheduleWrite::Missing),
            Err(e) if is_unique_violation(&e) => Ok(ScheduleWrite::SlotTaken),
            Err(e) => Err(e.into()),
        }
    }

    async fn active_requests_at(
        &self,
        provider_id: i32,
        date: NaiveDate,
        time: &str,
    ) -> Result<Vec<ServiceRequest>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {REQUEST_COLUMNS}
               FROM service_requests
               WHERE provider_id = $1
                 AND scheduled_date = $2
                 AND scheduled_time = $3
                 AND status IN ('pending', 'accepted', 'completed')"#
        ))
        .bind(provider_id)
        .bind(date)
        .bind(time)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_request).collect()
    }

    async fn set_review(
        &self,
        id: i32,
        rating: i16,
        comment: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE service_requests
               SET review_rating = $2, review_comment = $3, reviewed_at = $4, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(rating)
        .bind(comment)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_payment(&self, new: NewPayment) -> Result<Payment, StoreError> {
        let row = sqlx::query(&format!(
            r#"INSERT INTO payments
                   (user_id, service_request_id, amount, currency, gateway,
                    gateway_payment_id, purpose, status, payload)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               RETURNING {PAYMENT_COLUMNS}"#
        ))
        .bind(new.user_id)
        .bind(new.service_request_id)
        .bind(new.amount)
        .bind(&new.currency)
        .bind(&new.gateway)
        .bind(&new.gateway_payment_id)
        .bind(new.purpose.as_db_str())
        .bind(new.status.as_db_str())
        .bind(&new.payload)
        .fetch_one(&self.pool)
        .await?;
        map_payment(&row)
    }

    async fn payment_by_gateway_id(
        &self,
        gateway: &str,
        gateway_payment_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(&format!(
            r#"SELECT {PAYMENT_COLUMNS} FROM payments
               WHERE gateway = $1 AND gateway_payment_id = $2"#
        ))
        .bind(gateway)
        .bind(gateway_payment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_payment).transpose()
    }

    async fn update_payment_status(
        &self,
        id: i32,
        status: PaymentStatus,
        snapshot: &serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE payments
               SET status = $2,
                   payload = COALESCE(payload, '{}'::jsonb) || $3::jsonb,
                   updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(status.as_db_str())
        .bind(snapshot)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_unbound_payment(
        &self,
        service_request_id: Option<i32>,
        user_id: i32,
        gateway: &str,
        gateway_payment_id: &str,
        status: PaymentStatus,
        snapshot: &serde_json::Value,
    ) -> Result<Option<Payment>, StoreError> {
        // Single-statement claim: the subquery picks the newest unbound
        // intent and SKIP LOCKED keeps two concurrent webhooks from racing
        // for the same candidate row.
        let row = sqlx::query(&format!(
            r#"UPDATE payments
               SET gateway_payment_id = $1,
                   status = $2,
                   payload = COALESCE(payload, '{{}}'::jsonb) || $3::jsonb,
                   updated_at = NOW()
               WHERE id = (
                   SELECT id FROM payments
                   WHERE user_id = $4
                     AND gateway = $5
                     AND gateway_payment_id IS NULL
                     AND status IN ('pending', 'processing')
                     AND service_request_id IS NOT DISTINCT FROM $6
                   ORDER BY created_at DESC, id DESC
                   LIMIT 1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING {PAYMENT_COLUMNS}"#
        ))
        .bind(gateway_payment_id)
        .bind(status.as_db_str())
        .bind(snapshot)
        .bind(user_id)
        .bind(gateway)
        .bind(service_request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_payment).transpose()
    }

    async fn has_approved_unlock(
        &self,
        service_request_id: i32,
        provider_id: i32,
    ) -> Result<bool, StoreError> {
        // Only the latest row for the pair is authoritative.
        let row = sqlx::query(
            r#"SELECT status FROM payments
               WHERE service_request_id = $1 AND user_id = $2 AND purpose = 'unlock'
               ORDER BY created_at DESC, id DESC
               LIMIT 1"#,
        )
        .bind(service_request_id)
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(matches!(row, Some(r) if r.get::<String, _>("status") == "approved"))
    }

    async fn link_payment_to_subscription(
        &self,
        payment_id: i32,
        subscription_id: i32,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE payments SET subscription_id = $1, updated_at = NOW() WHERE id = $2")
            .bind(subscription_id)
            .bind(payment_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn active_subscription(
        &self,
        provider_id: i32,
    ) -> Result<Option<Subscription>, StoreError> {
        let row = sqlx::query(
            r#"SELECT id, provider_id, plan, status, start_date, end_date, canceled_at, created_at
               FROM subscriptions
               WHERE provider_id = $1 AND status = 'active'"#,
        )
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_subscription).transpose()
    }

    async fn insert_subscription(
        &self,
        provider_id: i32,
        plan: Plan,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Subscription, StoreError> {
        let row = sqlx::query(
            r#"INSERT INTO subscriptions (provider_id, plan, status, start_date, end_date)
               VALUES ($1, $2, 'active', $3, $4)
               RETURNING id, provider_id, plan, status, start_date, end_date, canceled_at, created_at"#,
        )
        .bind(provider_id)
        .bind(plan.as_db_str())
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        map_subscription(&row)
    }

    async fn extend_subscription(&self, id: i32, end: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE subscriptions SET end_date = $1, updated_at = NOW() WHERE id = $2")
            .bind(end)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cancel_subscription(&self, id: i32, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE subscriptions
               SET status = 'cancelled', canceled_at = $1, updated_at = NOW()
               WHERE id = $2"#,
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn party(&self, id: i32) -> Result<Option<Party>, StoreError> {
        let row = sqlx::query("SELECT id, name, email, phone FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Party {
            id: r.get("id"),
            name: r.get("name"),
            email: r.get("email"),
            phone: r.get("phone"),
        }))
    }

    async fn booking_contacts(
        &self,
        request: &ServiceRequest,
    ) -> Result<BookingContacts, StoreError> {
        let row = sqlx::query(
            r#"SELECT c.id AS client_id, c.name AS client_name,
                      c.email AS client_email, c.phone AS client_phone,
                      p.id AS provider_id, p.name AS provider_name,
                      p.email AS provider_email, p.phone AS provider_phone,
                      s.title AS service_title
               FROM users c, users p, services s
               WHERE c.id = $1 AND p.id = $2 AND s.id = $3"#,
        )
        .bind(request.client_id)
        .bind(request.provider_id)
        .bind(request.service_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::MissingRow("users/services"))?;
        Ok(BookingContacts {
            client: Party {
                id: row.get("client_id"),
                name: row.get("client_name"),
                email: row.get("client_email"),
                phone: row.get("client_phone"),
            },
            provider: Party {
                id: row.get("provider_id"),
                name: row.get("provider_name"),
                email: row.get("provider_email"),
                phone: row.get("provider_phone"),
            },
            service_title: row.get("service_title"),
        })
    }

    async fn upsert_retry_operation(&self, op: &RetryOperation) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO retry_operations
                   (key, channel, payload, retries, max_retries, next_retry_at, last_error)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (key)
               DO UPDATE SET
                   retries = EXCLUDED.retries,
                   next_retry_at = EXCLUDED.next_retry_at,
                   last_error = EXCLUDED.last_error"#,
        )
        .bind(&op.key)
        .bind(op.channel.as_db_str())
        .bind(&op.payload)
        .bind(op.retries)
        .bind(op.max_retries)
        .bind(op.next_retry_at)
        .bind(&op.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_retry_operations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RetryOperation>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT key, channel, payload, retries, max_retries, next_retry_at, last_error, created_at
               FROM retry_operations
               WHERE next_retry_at <= $1
               ORDER BY next_retry_at ASC
               LIMIT $2"#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_retry_operation).collect()
    }

    async fn remove_retry_operation(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM retry_operations WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule_retry_operation(
        &self,
        key: &str,
        retries: i32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE retry_operations
               SET retries = $2, next_retry_at = $3, last_error = $4
               WHERE key = $1"#,
        )
        .bind(key)
        .bind(retries)
        .bind(next_retry_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
