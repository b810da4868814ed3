// src/api/payments.rs

use actix_web::web::ReqData;
use actix_web::{post, web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use crate::api::mp_client::{
    BackUrls, PaymentGateway, PreferenceItem, PreferencePayer, PreferenceRequest, GATEWAY,
};
use crate::error::ApiError;
use crate::models::{ExternalRef, NewPayment, PaymentPurpose, PaymentStatus, Plan};
use crate::store::Store;
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePaymentRequest {
    /// BOOKING (client pays for the service), UNLOCK (provider pays the
    /// acceptance fee) or SUBSCRIPTION (provider pays for a plan).
    pub purpose: PaymentPurpose,
    pub service_request_id: Option<i32>,
    pub plan: Option<Plan>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreatePaymentResponse {
    pub payment_id: i32,
    pub preference_id: String,
    pub checkout_url: Option<String>,
}

/// Creates a checkout preference at the gateway and a local PENDING payment
/// row, then hands the checkout URL back. The gateway id stays null until
/// the webhook binds it.
#[utoipa::path(
    post,
    path = "/api/payments",
    tag = "payments",
    request_body = CreatePaymentRequest,
    responses(
        (status = 200, description = "Checkout created", body = CreatePaymentResponse),
        (status = 400, description = "Missing or inconsistent fields"),
        (status = 403, description = "Caller is not the payer for this purpose"),
        (status = 404, description = "Service request not found"),
        (status = 503, description = "Payment gateway unreachable"),
    )
)]
#[post("/payments")]
pub async fn create_payment(
    state: web::Data<AppState>,
    user_id: ReqData<i32>,
    payload: web::Json<CreatePaymentRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_id = user_id.into_inner();

    let (external, amount, title) = match payload.purpose {
        PaymentPurpose::Unlock => {
            let service_request_id = payload.service_request_id.ok_or_else(|| {
                ApiError::Validation("service_request_id is required for unlock payments".into())
            })?;
            let request = state
                .store
                .service_request(service_request_id)
                .await?
                .ok_or(ApiError::NotFound("service request"))?;
            if request.provider_id != user_id {
                return Err(ApiError::Forbidden(
                    "only the request's provider can pay the unlock fee".to_string(),
                ));
            }
            (
                ExternalRef::Unlock {
                    service_request_id,
                    provider_id: user_id,
                },
                state.pricing.unlock_price,
                format!("Acceptance unlock for request #{service_request_id}"),
            )
        }
        PaymentPurpose::Subscription => {
            let plan = payload.plan.unwrap_or(Plan::MonthlyProfessional);
            (
                ExternalRef::Subscription {
                    provider_id: user_id,
                    plan,
                },
                state.pricing.plan_price(plan),
                format!("Monthly plan {}", plan.as_db_str()),
            )
        }
        PaymentPurpose::Booking => {
            let service_request_id = payload.service_request_id.ok_or_else(|| {
                ApiError::Validation("service_request_id is required for booking payments".into())
            })?;
            let request = state
                .store
                .service_request(service_request_id)
                .await?
                .ok_or(ApiError::NotFound("service request"))?;
            if request.client_id != user_id {
                return Err(ApiError::Forbidden(
                    "only the request's client can pay for the service".to_string(),
                ));
            }
            let amount = request
                .final_price
                .or(request.estimated_price)
                .ok_or_else(|| ApiError::Validation("request has no price yet".into()))?;
            (
                ExternalRef::Booking {
                    service_request_id,
                    client_id: user_id,
                },
                amount,
                format!("Service request #{service_request_id}"),
            )
        }
    };

    let payer = state
        .store
        .party(user_id)
        .await?
        .and_then(|p| p.email)
        .map(|email| PreferencePayer { email });

    let preference_request = PreferenceRequest {
        items: vec![PreferenceItem {
            title,
            quantity: 1,
            unit_price: amount,
            currency_id: state.pricing.currency.clone(),
        }],
        payer,
        external_reference: external.encode(),
        notification_url: Some(format!("{}/webhooks/mercadopago", state.callback_base_url)),
        back_urls: state.frontend_base_url.as_ref().map(|base| BackUrls {
            success: format!("{base}/payments/success"),
            failure: format!("{base}/payments/failure"),
            pending: format!("{base}/payments/pending"),
        }),
    };

    let preference = state
        .gateway
        .create_preference(&preference_request)
        .await
        .map_err(|e| {
            log::error!("preference creation failed for user {user_id}: {e}");
            ApiError::GatewayUnavailable(e.to_string())
        })?;

    let payment = state
        .store
        .insert_payment(NewPayment {
            user_id,
            service_request_id: external.service_request_id(),
            amount,
            currency: state.pricing.currency.clone(),
            gateway: GATEWAY.to_string(),
            gateway_payment_id: None,
            purpose: external.purpose(),
            status: PaymentStatus::Pending,
            payload: json!({
                "preference_id": preference.id,
                "external_reference": external.encode(),
            }),
        })
        .await?;

    log::info!(
        "payment intent {} created: purpose={} user={} preference={}",
        payment.id,
        external.purpose().as_db_str(),
        user_id,
        preference.id
    );

    Ok(HttpResponse::Ok().json(CreatePaymentResponse {
        payment_id: payment.id,
        checkout_url: preference.checkout_url(),
        preference_id: preference.id,
    }))
}
