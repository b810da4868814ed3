// src/ledger.rs

//! The booking state machine. Single writer for request status.
//!
//! Every successful transition fans out notifications on a detached task:
//! the state change commits first and delivery failures can never roll it
//! back or delay the response.

use chrono::{NaiveDate, NaiveTime, Utc};
use std::sync::Arc;

use crate::error::ApiError;
use crate::models::{RequestStatus, RequestType, ServiceRequest};
use crate::notify::NotificationDispatcher;
use crate::slots;
use crate::store::{ScheduleWrite, Store};

pub struct TransitionOutcome {
    pub request: ServiceRequest,
    pub message: &'static str,
}

pub struct RequestLedger {
    store: Arc<dyn Store>,
    notifier: Arc<NotificationDispatcher>,
}

impl RequestLedger {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<NotificationDispatcher>) -> Self {
        Self { store, notifier }
    }

    /// Moves a request along the transition table.
    ///
    /// The write is conditional on the status observed here, so of two
    /// concurrent callers exactly one succeeds; the other gets a conflict,
    /// never a silent overwrite.
    pub async fn transition(
        &self,
        id: i32,
        target: RequestStatus,
        notes: Option<&str>,
    ) -> Result<TransitionOutcome, ApiError> {
        let current = self
            .store
            .service_request(id)
            .await?
            .ok_or(ApiError::NotFound("service request"))?;

        if current.status.is_terminal() || !current.status.permits(target) {
            return Err(ApiError::invalid_transition(current.status, target));
        }

        // Accepting or rejecting resolves the hold.
        let clear_expires = matches!(target, RequestStatus::Accepted | RequestStatus::Rejected);

        let updated = self
            .store
            .update_request_status(id, current.status, target, notes, clear_expires)
            .await?
            .ok_or_else(|| ApiError::invalid_transition(current.status, target))?;

        log::info!(
            "service request {} moved {} -> {}",
            id,
            current.status.as_api_str(),
            target.as_api_str()
        );
        self.notify(updated.clone(), target);

        Ok(TransitionOutcome {
            request: updated,
            message: target.message(),
        })
    }

    /// Converts a QUOTE into a scheduled visit and accepts it in one step.
    pub async fn schedule_from_quote(
        &self,
        id: i32,
        date: NaiveDate,
        time: &str,
    ) -> Result<TransitionOutcome, ApiError> {
        if NaiveTime::parse_from_str(time, "%H:%M").is_err() {
            return Err(ApiError::Validation(format!(
                "scheduled_time must be HH:MM, got '{time}'"
            )));
        }

        let current = self
            .store
            .service_request(id)
            .await?
            .ok_or(ApiError::NotFound("service request"))?;

        if current.status.is_terminal() {
            return Err(ApiError::Validation(format!(
                "request is already resolved ({})",
                current.status.as_api_str()
            )));
        }
        // No silent reschedule: once a non-quote request carries a slot it
        // keeps it.
        if current.request_type != RequestType::Quote
            && (current.scheduled_date.is_some() || current.scheduled_time.is_some())
        {
            return Err(ApiError::Validation(
                "request is already scheduled".to_string(),
            ));
        }

        if slots::check_conflict(self.store.as_ref(), current.provider_id, date, time, Some(id))
            .await?
        {
            return Err(ApiError::Conflict("slot unavailable".to_string()));
        }

        match self.store.assign_schedule(id, date, time).await? {
            ScheduleWrite::Updated(updated) => {
                log::info!(
                    "service request {} scheduled for {} {} and accepted",
                    id,
                    date,
                    time
                );
                self.notify(updated.clone(), RequestStatus::Accepted);
                Ok(TransitionOutcome {
                    request: updated,
                    message: "Service request scheduled and accepted",
                })
            }
            ScheduleWrite::SlotTaken => Err(ApiError::Conflict("slot unavailable".to_string())),
            ScheduleWrite::Missing => Err(ApiError::Conflict(
                "request changed concurrently".to_string(),
            )),
        }
    }

    /// Client review of a completed request. Independent of the status
    /// machine: a review never changes the lifecycle state.
    pub async fn submit_review(
        &self,
        id: i32,
        acting_client_id: i32,
        rating: i16,
        comment: Option<&str>,
    ) -> Result<ServiceRequest, ApiError> {
        if !(1..=5).contains(&rating) {
            return Err(ApiError::Validation("rating must be between 1 and 5".to_string()));
        }

        let current = self
            .store
            .service_request(id)
            .await?
            .ok_or(ApiError::NotFound("service request"))?;

        if current.client_id != acting_client_id {
            return Err(ApiError::Forbidden(
                "only the request's client can review it".to_string(),
            ));
        }
        if current.status != RequestStatus::Completed {
            return Err(ApiError::Conflict(
                "only completed requests can be reviewed".to_string(),
            ));
        }
        if current.reviewed_at.is_some() {
            return Err(ApiError::Conflict("request is already reviewed".to_string()));
        }

        self.store.set_review(id, rating, comment, Utc::now()).await?;
        self.store
            .service_request(id)
            .await?
            .ok_or(ApiError::NotFound("service request"))
    }

    fn notify(&self, request: ServiceRequest, status: RequestStatus) {
        let store = self.store.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            match store.booking_contacts(&request).await {
                Ok(contacts) => {
                    notifier
                        .booking_status_changed(&request, status, &contacts)
                        .await;
                }
                Err(e) => {
                    log::warn!("contact lookup failed for request {}: {e}", request.id);
                }
            }
        });
    }
}
