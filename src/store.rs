// src/store.rs

//! Storage seam for the fulfillment engine.
//!
//! The engine talks to a [`Store`] rather than a pool so the write-path
//! guarantees it depends on (conditional status updates, atomic slot
//! assignment, compare-and-swap webhook binding) are named operations with
//! two implementations: [`crate::db::PgStore`] for production and
//! [`MemStore`] for the test suite.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{
    BookingContacts, NewPayment, Party, Payment, PaymentPurpose, PaymentStatus, Plan,
    RequestStatus, RequestType, RetryOperation, ServiceRequest, Subscription, SubscriptionStatus,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("referenced row missing: {0}")]
    MissingRow(&'static str),

    #[error("unexpected value in column {0}")]
    Corrupt(&'static str),
}

/// Outcome of the atomic schedule write.
#[derive(Debug)]
pub enum ScheduleWrite {
    Updated(ServiceRequest),
    /// The slot uniqueness guarantee fired: another active request holds it.
    SlotTaken,
    /// The request vanished or changed state between the guard read and the
    /// write.
    Missing,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- service requests ---------------------------------------------------

    async fn service_request(&self, id: i32) -> Result<Option<ServiceRequest>, StoreError>;

    /// Conditional status update: writes only if the row still carries
    /// `expected`. Returns `None` when a concurrent caller won the race.
    async fn update_request_status(
        &self,
        id: i32,
        expected: RequestStatus,
        target: RequestStatus,
        notes: Option<&str>,
        clear_expires: bool,
    ) -> Result<Option<ServiceRequest>, StoreError>;

    /// Converts a request to SCHEDULING/ACCEPTED with the given slot, in one
    /// atomic step against the slot uniqueness constraint.
    async fn assign_schedule(
        &self,
        id: i32,
        date: NaiveDate,
        time: &str,
    ) -> Result<ScheduleWrite, StoreError>;

    /// Requests of the provider occupying the given calendar day + exact
    /// time string in a slot-blocking status.
    async fn active_requests_at(
        &self,
        provider_id: i32,
        date: NaiveDate,
        time: &str,
    ) -> Result<Vec<ServiceRequest>, StoreError>;

    async fn set_review(
        &self,
        id: i32,
        rating: i16,
        comment: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // -- payments -----------------------------------------------------------

    async fn insert_payment(&self, new: NewPayment) -> Result<Payment, StoreError>;

    async fn payment_by_gateway_id(
        &self,
        gateway: &str,
        gateway_payment_id: &str,
    ) -> Result<Option<Payment>, StoreError>;

    async fn update_payment_status(
        &self,
        id: i32,
        status: PaymentStatus,
        snapshot: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Claims the newest intent row still waiting for a gateway id, binding
    /// it in a single compare-and-swap so concurrent webhooks cannot grab
    /// the same candidate.
    async fn claim_unbound_payment(
        &self,
        service_request_id: Option<i32>,
        user_id: i32,
        gateway: &str,
        gateway_payment_id: &str,
        status: PaymentStatus,
        snapshot: &serde_json::Value,
    ) -> Result<Option<Payment>, StoreError>;

    /// Whether the latest unlock payment for the pair is APPROVED. Only the
    /// most recent row is authoritative (a refund after approval revokes
    /// the unlock).
    async fn has_approved_unlock(
        &self,
        service_request_id: i32,
        provider_id: i32,
    ) -> Result<bool, StoreError>;

    async fn link_payment_to_subscription(
        &self,
        payment_id: i32,
        subscription_id: i32,
    ) -> Result<(), StoreError>;

    // -- subscriptions ------------------------------------------------------

    async fn active_subscription(&self, provider_id: i32)
        -> Result<Option<Subscription>, StoreError>;

    async fn insert_subscription(
        &self,
        provider_id: i32,
        plan: Plan,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Subscription, StoreError>;

    async fn extend_subscription(&self, id: i32, end: DateTime<Utc>) -> Result<(), StoreError>;

    async fn cancel_subscription(&self, id: i32, at: DateTime<Utc>) -> Result<(), StoreError>;

    // -- contacts -----------------------------------------------------------

    async fn party(&self, id: i32) -> Result<Option<Party>, StoreError>;

    async fn booking_contacts(
        &self,
        request: &ServiceRequest,
    ) -> Result<BookingContacts, StoreError>;

    // -- retry operations ---------------------------------------------------

    async fn upsert_retry_operation(&self, op: &RetryOperation) -> Result<(), StoreError>;

    async fn due_retry_operations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RetryOperation>, StoreError>;

    async fn remove_retry_operation(&self, key: &str) -> Result<(), StoreError>;

    async fn reschedule_retry_operation(
        &self,
        key: &str,
        retries: i32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Seed data for a service request; bookings themselves are created by the
/// client-facing request flow, which is outside this crate.
#[derive(Debug, Clone)]
pub struct RequestSeed {
    pub client_id: i32,
    pub provider_id: i32,
    pub service_id: i32,
    pub request_type: RequestType,
    pub status: RequestStatus,
    pub scheduled_date: Option<NaiveDate>,
    pub scheduled_time: Option<String>,
    pub estimated_price: Option<rust_decimal::Decimal>,
    pub final_price: Option<rust_decimal::Decimal>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RequestSeed {
    pub fn new(client_id: i32, provider_id: i32, service_id: i32) -> Self {
        Self {
            client_id,
            provider_id,
            service_id,
            request_type: RequestType::Quote,
            status: RequestStatus::Pending,
            scheduled_date: None,
            scheduled_time: None,
            estimated_price: None,
            final_price: None,
            expires_at: None,
        }
    }
}

#[derive(Default)]
struct MemInner {
    requests: HashMap<i32, ServiceRequest>,
    payments: Vec<Payment>,
    subscriptions: Vec<Subscription>,
    retry_ops: HashMap<String, RetryOperation>,
    parties: HashMap<i32, Party>,
    services: HashMap<i32, (i32, String)>,
    next_request_id: i32,
    next_payment_id: i32,
    next_subscription_id: i32,
    next_party_id: i32,
    next_service_id: i32,
}

/// All operations run under one mutex, which is what makes the conditional
/// writes atomic here.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_party(&self, name: &str, email: Option<&str>, phone: Option<&str>) -> i32 {
        let mut inner = self.inner.lock();
        inner.next_party_id += 1;
        let id = inner.next_party_id;
        inner.parties.insert(
            id,
            Party {
                id,
                name: name.to_string(),
                email: email.map(str::to_string),
                phone: phone.map(str::to_string),
            },
        );
        id
    }

    pub fn add_service(&self, provider_id: i32, title: &str) -> i32 {
        let mut inner = self.inner.lock();
        inner.next_service_id += 1;
        let id = inner.next_service_id;
        inner.services.insert(id, (provider_id, title.to_string()));
        id
    }

    pub fn add_request(&self, seed: RequestSeed) -> ServiceRequest {
        let mut inner = self.inner.lock();
        inner.next_request_id += 1;
        let id = inner.next_request_id;
        let now = Utc::now();
        let request = ServiceRequest {
            id,
            client_id: seed.client_id,
            provider_id: seed.provider_id,
            service_id: seed.service_id,
            request_type: seed.request_type,
            status: seed.status,
            scheduled_date: seed.scheduled_date,
            scheduled_time: seed.scheduled_time,
            estimated_price: seed.estimated_price,
            final_price: seed.final_price,
            expires_at: seed.expires_at,
            description: None,
            review_rating: None,
            review_comment: None,
            reviewed_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.requests.insert(id, request.clone());
        request
    }

    pub fn payments_snapshot(&self) -> Vec<Payment> {
        self.inner.lock().payments.clone()
    }

    pub fn subscriptions_snapshot(&self) -> Vec<Subscription> {
        self.inner.lock().subscriptions.clone()
    }

    pub fn retry_operations_snapshot(&self) -> Vec<RetryOperation> {
        self.inner.lock().retry_ops.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn service_request(&self, id: i32) -> Result<Option<ServiceRequest>, StoreError> {
        Ok(self.inner.lock().requests.get(&id).cloned())
    }

    async fn update_request_status(
        &self,
        id: i32,
        expected: RequestStatus,
        target: RequestStatus,
        notes: Option<&str>,
        clear_expires: bool,
    ) -> Result<Option<ServiceRequest>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(request) = inner.requests.get_mut(&id) else {
            return Ok(None);
        };
        if request.status != expected {
            return Ok(None);
        }
        request.status = target;
        if let Some(notes) = notes {
            request.description = Some(notes.to_string());
        }
        if clear_expires {
            request.expires_at = None;
        }
        request.updated_at = Utc::now();
        Ok(Some(request.clone()))
    }

    async fn assign_schedule(
        &self,
        id: i32,
        date: NaiveDate,
        time: &str,
    ) -> Result<ScheduleWrite, StoreError> {
        let mut inner = self.inner.lock();
        let provider_id = match inner.requests.get(&id) {
            Some(r) if matches!(r.status, RequestStatus::Pending | RequestStatus::Accepted) => {
                r.provider_id
            }
            _ => return Ok(ScheduleWrite::Missing),
        };
        let taken = inner.requests.values().any(|r| {
            r.id != id
                && r.provider_id == provider_id
                && r.status.blocks_slot()
                && r.scheduled_date == Some(date)
                && r.scheduled_time.as_deref() == Some(time)
        });
        if taken {
            return Ok(ScheduleWrite::SlotTaken);
        }
        let Some(request) = inner.requests.get_mut(&id) else {
            return Ok(ScheduleWrite::Missing);
        };
        request.request_type = RequestType::Scheduling;
        request.status = RequestStatus::Accepted;
        request.scheduled_date = Some(date);
        request.scheduled_time = Some(time.to_string());
        request.expires_at = None;
        request.updated_at = Utc::now();
        Ok(ScheduleWrite::Updated(request.clone()))
    }

    async fn active_requests_at(
        &self,
        provider_id: i32,
        date: NaiveDate,
        time: &str,
    ) -> Result<Vec<ServiceRequest>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .requests
            .values()
            .filter(|r| {
                r.provider_id == provider_id
                    && r.status.blocks_slot()
                    && r.scheduled_date == Some(date)
                    && r.scheduled_time.as_deref() == Some(time)
            })
            .cloned()
            .collect())
    }

    async fn set_review(
        &self,
        id: i32,
        rating: i16,
        comment: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or(StoreError::MissingRow("service_requests"))?;
        request.review_rating = Some(rating);
        request.review_comment = comment.map(str::to_string);
        request.reviewed_at = Some(at);
        request.updated_at = at;
        Ok(())
    }

    async fn insert_payment(&self, new: NewPayment) -> Result<Payment, StoreError> {
        let mut inner = self.inner.lock();
        inner.next_payment_id += 1;
        let now = Utc::now();
        let payment = Payment {
            id: inner.next_payment_id,
            user_id: new.user_id,
            service_request_id: new.service_request_id,
            subscription_id: None,
            amount: new.amount,
            currency: new.currency,
            gateway: new.gateway,
            gateway_payment_id: new.gateway_payment_id,
            purpose: new.purpose,
            status: new.status,
            created_at: now,
            updated_at: now,
        };
        inner.payments.push(payment.clone());
        Ok(payment)
    }

    async fn payment_by_gateway_id(
        &self,
        gateway: &str,
        gateway_payment_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .payments
            .iter()
            .find(|p| {
                p.gateway == gateway && p.gateway_payment_id.as_deref() == Some(gateway_payment_id)
            })
            .cloned())
    }

    async fn update_payment_status(
        &self,
        id: i32,
        status: PaymentStatus,
        _snapshot: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let payment = inner
            .payments
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(StoreError::MissingRow("payments"))?;
        payment.status = status;
        payment.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_unbound_payment(
        &self,
        service_request_id: Option<i32>,
        user_id: i32,
        gateway: &str,
        gateway_payment_id: &str,
        status: PaymentStatus,
        _snapshot: &serde_json::Value,
    ) -> Result<Option<Payment>, StoreError> {
        let mut inner = self.inner.lock();
        let candidate = inner
            .payments
            .iter_mut()
            .filter(|p| {
                p.user_id == user_id
                    && p.gateway == gateway
                    && p.gateway_payment_id.is_none()
                    && p.service_request_id == service_request_id
                    && matches!(p.status, PaymentStatus::Pending | PaymentStatus::Processing)
            })
            .max_by_key(|p| (p.created_at, p.id));
        Ok(candidate.map(|p| {
            p.gateway_payment_id = Some(gateway_payment_id.to_string());
            p.status = status;
            p.updated_at = Utc::now();
            p.clone()
        }))
    }

    async fn has_approved_unlock(
        &self,
        service_request_id: i32,
        provider_id: i32,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.lock();
        let latest = inner
            .payments
            .iter()
            .filter(|p| {
                p.service_request_id == Some(service_request_id)
                    && p.user_id == provider_id
                    && p.purpose == PaymentPurpose::Unlock
            })
            .max_by_key(|p| (p.created_at, p.id));
        Ok(matches!(latest, Some(p) if p.status == PaymentStatus::Approved))
    }

    async fn link_payment_to_subscription(
        &self,
        payment_id: i32,
        subscription_id: i32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let payment = inner
            .payments
            .iter_mut()
            .find(|p| p.id == payment_id)
            .ok_or(StoreError::MissingRow("payments"))?;
        payment.subscription_id = Some(subscription_id);
        Ok(())
    }

    async fn active_subscription(
        &self,
        provider_id: i32,
    ) -> Result<Option<Subscription>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .subscriptions
            .iter()
            .find(|s| s.provider_id == provider_id && s.status == SubscriptionStatus::Active)
            .cloned())
    }

    async fn insert_subscription(
        &self,
        provider_id: i32,
        plan: Plan,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Subscription, StoreError> {
        let mut inner = self.inner.lock();
        inner.next_subscription_id += 1;
        let subscription = Subscription {
            id: inner.next_subscription_id,
            provider_id,
            plan,
            status: SubscriptionStatus::Active,
            start_date: start,
            end_date: end,
            canceled_at: None,
            created_at: start,
        };
        inner.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    async fn extend_subscription(&self, id: i32, end: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let subscription = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::MissingRow("subscriptions"))?;
        subscription.end_date = Some(end);
        Ok(())
    }

    async fn cancel_subscription(&self, id: i32, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let subscription = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::MissingRow("subscriptions"))?;
        subscription.status = SubscriptionStatus::Cancelled;
        subscription.canceled_at = Some(at);
        Ok(())
    }

    async fn party(&self, id: i32) -> Result<Option<Party>, StoreError> {
        Ok(self.inner.lock().parties.get(&id).cloned())
    }

    async fn booking_contacts(
        &self,
        request: &ServiceRequest,
    ) -> Result<BookingContacts, StoreError> {
        let inner = self.inner.lock();
        let client = inner
            .parties
            .get(&request.client_id)
            .cloned()
            .ok_or(StoreError::MissingRow("users"))?;
        let provider = inner
            .parties
            .get(&request.provider_id)
            .cloned()
            .ok_or(StoreError::MissingRow("users"))?;
        let service_title = inner
            .services
            .get(&request.service_id)
            .map(|(_, title)| title.clone())
            .ok_or(StoreError::MissingRow("services"))?;
        Ok(BookingContacts {
            client,
            provider,
            service_title,
        })
    }

    async fn upsert_retry_operation(&self, op: &RetryOperation) -> Result<(), StoreError> {
        self.inner
            .lock()
            .retry_ops
            .insert(op.key.clone(), op.clone());
        Ok(())
    }

    async fn due_retry_operations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RetryOperation>, StoreError> {
        let inner = self.inner.lock();
        let mut due: Vec<RetryOperation> = inner
            .retry_ops
            .values()
            .filter(|op| op.next_retry_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|op| op.next_retry_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn remove_retry_operation(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().retry_ops.remove(key);
        Ok(())
    }

    async fn reschedule_retry_operation(
        &self,
        key: &str,
        retries: i32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let op = inner
            .retry_ops
            .get_mut(key)
            .ok_or(StoreError::MissingRow("retry_operations"))?;
        op.retries = retries;
        op.next_retry_at = next_retry_at;
        op.last_error = Some(last_error.to_string());
        Ok(())
    }
}
