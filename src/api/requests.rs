// src/api/requests.rs

use actix_web::web::ReqData;
use actix_web::{post, put, web, HttpResponse};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::gate::Decision;
use crate::models::{RequestStatus, ServiceRequest};
use crate::store::Store;
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateStatusRequest {
    /// ACCEPTED, REJECTED, COMPLETED or CANCELLED.
    pub status: String,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UpdatedRequestResponse {
    pub request: ServiceRequest,
    pub message: String,
}

/// Statuses a caller may request directly; PENDING is the initial state and
/// EXPIRED is time-driven.
fn parse_target_status(raw: &str) -> Result<RequestStatus, ApiError> {
    let status = RequestStatus::from_api_str(raw)
        .ok_or_else(|| ApiError::Validation(format!("unknown status '{raw}'")))?;
    if matches!(status, RequestStatus::Pending | RequestStatus::Expired) {
        return Err(ApiError::Validation(format!(
            "status {raw} cannot be set directly"
        )));
    }
    Ok(status)
}

#[utoipa::path(
    put,
    path = "/api/requests/{id}/status",
    tag = "requests",
    request_body = UpdateStatusRequest,
    params(("id" = i32, Path, description = "Service request id")),
    responses(
        (status = 200, description = "Request updated", body = UpdatedRequestResponse),
        (status = 400, description = "Unknown status value"),
        (status = 402, description = "Unlock payment or subscription required"),
        (status = 403, description = "Caller is not the request's provider"),
        (status = 404, description = "Request not found"),
        (status = 409, description = "Invalid transition from the current state"),
    )
)]
#[put("/requests/{id}/status")]
pub async fn update_status(
    state: web::Data<AppState>,
    user_id: ReqData<i32>,
    path: web::Path<i32>,
    payload: web::Json<UpdateStatusRequest>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let user_id = user_id.into_inner();
    let target = parse_target_status(&payload.status)?;

    let request = state
        .store
        .service_request(id)
        .await?
        .ok_or(ApiError::NotFound("service request"))?;
    if request.provider_id != user_id {
        return Err(ApiError::Forbidden(
            "only the request's provider can update its status".to_string(),
        ));
    }

    // Accepting is payment-gated.
    if target == RequestStatus::Accepted {
        match state.gate.authorize(&request, user_id).await? {
            Decision::Allow => {}
            Decision::Deny(reason) => return Err(reason.into_error()),
        }
    }

    let outcome = state
        .ledger
        .transition(id, target, payload.notes.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(UpdatedRequestResponse {
        request: outcome.request,
        message: outcome.message.to_string(),
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ScheduleRequest {
    /// ISO date of the visit.
    pub scheduled_date: NaiveDate,
    /// "HH:MM"; matched exactly against other bookings of the provider.
    pub scheduled_time: String,
}

#[utoipa::path(
    post,
    path = "/api/requests/{id}/schedule",
    tag = "requests",
    request_body = ScheduleRequest,
    params(("id" = i32, Path, description = "Service request id")),
    responses(
        (status = 200, description = "Request scheduled and accepted", body = UpdatedRequestResponse),
        (status = 400, description = "Already scheduled, terminal, or bad time format"),
        (status = 404, description = "Request not found"),
        (status = 409, description = "Slot unavailable"),
    )
)]
#[post("/requests/{id}/schedule")]
pub async fn schedule_request(
    state: web::Data<AppState>,
    user_id: ReqData<i32>,
    path: web::Path<i32>,
    payload: web::Json<ScheduleRequest>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let user_id = user_id.into_inner();

    let request = state
        .store
        .service_request(id)
        .await?
        .ok_or(ApiError::NotFound("service request"))?;
    // either party of the request can settle the slot
    if request.provider_id != user_id && request.client_id != user_id {
        return Err(ApiError::Forbidden(
            "only the request's parties can schedule it".to_string(),
        ));
    }

    let outcome = state
        .ledger
        .schedule_from_quote(id, payload.scheduled_date, &payload.scheduled_time)
        .await?;
    Ok(HttpResponse::Ok().json(UpdatedRequestResponse {
        request: outcome.request,
        message: outcome.message.to_string(),
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReviewRequest {
    /// 1 to 5.
    pub rating: i16,
    pub comment: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/requests/{id}/review",
    tag = "requests",
    request_body = ReviewRequest,
    params(("id" = i32, Path, description = "Service request id")),
    responses(
        (status = 200, description = "Review recorded", body = ServiceRequest),
        (status = 400, description = "Rating out of range"),
        (status = 403, description = "Caller is not the request's client"),
        (status = 404, description = "Request not found"),
        (status = 409, description = "Request not completed or already reviewed"),
    )
)]
#[post("/requests/{id}/review")]
pub async fn submit_review(
    state: web::Data<AppState>,
    user_id: ReqData<i32>,
    path: web::Path<i32>,
    payload: web::Json<ReviewRequest>,
) -> Result<HttpResponse, ApiError> {
    let request = state
        .ledger
        .submit_review(
            path.into_inner(),
            user_id.into_inner(),
            payload.rating,
            payload.comment.as_deref(),
        )
        .await?;
    Ok(HttpResponse::Ok().json(request))
}
