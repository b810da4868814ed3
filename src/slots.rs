// src/slots.rs

//! Conflict detection for schedule slots.
//!
//! A slot is (provider, calendar date, exact time string). The check here is
//! advisory and feeds the friendly 409; the partial unique index in the
//! migrations is what actually prevents a double-booking under concurrency.

use chrono::NaiveDate;

use crate::store::{Store, StoreError};

/// True when another request of the provider already occupies the slot in a
/// slot-blocking status (PENDING, ACCEPTED or COMPLETED).
pub async fn check_conflict(
    store: &dyn Store,
    provider_id: i32,
    date: NaiveDate,
    time: &str,
    excluding: Option<i32>,
) -> Result<bool, StoreError> {
    let occupied = store.active_requests_at(provider_id, date, time).await?;
    Ok(occupied.iter().any(|r| Some(r.id) != excluding))
}
