// src/api/webhooks_mp.rs

use actix_web::{post, web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::api::mp_client::{PaymentGateway, GATEWAY};
use crate::api::signature;
use crate::AppState;

/// Envelope Mercado Pago posts to the notification URL. Only `type` and
/// `data.id` are trusted; everything else is re-fetched from the gateway.
#[derive(Debug, Deserialize, ToSchema)]
pub struct WebhookEnvelope {
    #[serde(rename = "type")]
    pub event_type: Option<String>,

    pub action: Option<String>,

    #[serde(default)]
    pub data: Option<WebhookData>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct WebhookData {
    /// Arrives as a string or a number depending on the event source.
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub id: Option<serde_json::Value>,
}

pub fn data_id(envelope: &WebhookEnvelope) -> Option<String> {
    match envelope.data.as_ref()?.id.as_ref()? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[utoipa::path(
    post,
    path = "/webhooks/mercadopago",
    tag = "webhooks",
    request_body = WebhookEnvelope,
    responses(
        (status = 200, description = "Event handled or deliberately ignored"),
        (status = 401, description = "Signature mismatch"),
        (status = 503, description = "Gateway unreachable; redeliver"),
    )
)]
#[post("/webhooks/mercadopago")]
pub async fn mercadopago_webhook(
    req: HttpRequest,
    payload: web::Json<WebhookEnvelope>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let payload = payload.into_inner();

    // Только события о платежах; остальное подтверждаем и игнорируем.
    if payload.event_type.as_deref() != Some("payment") {
        return HttpResponse::Ok().json(json!({"ok": true, "ignored": true}));
    }

    let Some(payment_id) = data_id(&payload) else {
        log::warn!("payment webhook without data.id, acknowledging");
        return HttpResponse::Ok().json(json!({"ok": true, "ignored": true}));
    };

    if let Some(secret) = state.webhook_secret.as_deref() {
        let signature_header = req
            .headers()
            .get("x-signature")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");
        let request_id = req
            .headers()
            .get("x-request-id")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");
        if !signature::verify_webhook_signature(secret, signature_header, request_id, &payment_id)
        {
            log::warn!("webhook signature mismatch for payment {payment_id}");
            return HttpResponse::Unauthorized().json(json!({"error": "invalid signature"}));
        }
    }

    // Вебхуку не верим: перечитываем платёж из шлюза.
    let fetched = match state.gateway.fetch_payment(&payment_id).await {
        Ok(p) => p,
        Err(e) if e.is_retryable() => {
            // surface a 5xx so the gateway's own retry redelivers
            log::error!("gateway fetch failed for payment {payment_id}: {e}");
            return HttpResponse::ServiceUnavailable()
                .json(json!({"error": "gateway unavailable"}));
        }
        Err(e) => {
            // permanent data problem; acknowledge so the gateway stops
            // redelivering
            log::warn!("payment {payment_id} not retrievable ({e}), acknowledging");
            return HttpResponse::Ok().json(json!({"ok": true, "ignored": true}));
        }
    };

    match state.reconciler.apply(GATEWAY, &fetched, Utc::now()).await {
        Ok(outcome) => HttpResponse::Ok().json(json!({"ok": true, "outcome": outcome.as_str()})),
        Err(e) => {
            log::error!("webhook reconciliation error for payment {payment_id}: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}
