// src/api/mp_client.rs
//
// Minimal client for the Mercado Pago REST API.
// Authorization: Bearer access token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const GATEWAY: &str = "mercadopago";

const MP_API_BASE: &str = "https://api.mercadopago.com";

#[derive(Debug)]
pub enum GatewayError {
    Http(reqwest::Error),
    Api { status: u16, body: String },
    InvalidResponse(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Http(e) => write!(f, "http error: {e}"),
            GatewayError::Api { status, body } => {
                write!(f, "mercadopago api error status={status} body={body}")
            }
            GatewayError::InvalidResponse(e) => write!(f, "invalid response: {e}"),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

impl GatewayError {
    /// Transport failures and gateway 5xx are worth a redelivery; 4xx from
    /// the gateway is a data problem that will not improve by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::InvalidResponse(_) => false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PreferenceItem {
    pub title: String,
    pub quantity: u32,
    // the gateway wants a JSON number, not the default string rendering
    #[serde(with = "rust_decimal::serde::float")]
    pub unit_price: Decimal,
    pub currency_id: String,
}

#[derive(Debug, Serialize)]
pub struct PreferencePayer {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct BackUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

#[derive(Debug, Serialize)]
pub struct PreferenceRequest {
    pub items: Vec<PreferenceItem>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<PreferencePayer>,

    /// Carries our correlation data (see [`crate::models::ExternalRef`]);
    /// the webhook classifies the event from it.
    pub external_reference: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub back_urls: Option<BackUrls>,
}

#[derive(Debug, Deserialize)]
pub struct PreferenceResponse {
    pub id: String,

    #[serde(default)]
    pub init_point: Option<String>,

    #[serde(default)]
    pub sandbox_init_point: Option<String>,
}

impl PreferenceResponse {
    pub fn checkout_url(&self) -> Option<String> {
        self.init_point
            .clone()
            .or_else(|| self.sandbox_init_point.clone())
    }
}

/// The authoritative payment object as re-fetched from the gateway. Never
/// built from webhook bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayment {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub transaction_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_created: Option<DateTime<Utc>>,
}

// Mercado Pago sends payment ids as numbers; normalize to a string.
#[derive(Debug, Deserialize)]
struct MpPaymentResponse {
    id: serde_json::Value,
    status: String,
    status_detail: Option<String>,
    external_reference: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    transaction_amount: Decimal,
    currency_id: Option<String>,
    date_created: Option<DateTime<Utc>>,
}

fn id_to_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<PreferenceResponse, GatewayError>;

    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError>;
}

pub struct MercadoPagoClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl MercadoPagoClient {
    /// Base URL and timeout are env-overridable (`MP_API_BASE_URL`,
    /// `MP_TIMEOUT_SECS`).
    pub fn from_env(access_token: String) -> Self {
        let base_url =
            std::env::var("MP_API_BASE_URL").unwrap_or_else(|_| MP_API_BASE.to_string());
        let timeout = std::env::var("MP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            access_token,
        }
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoClient {
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<PreferenceResponse, GatewayError> {
        let resp = self
            .http
            .post(format!("{}/checkout/preferences", self.base_url))
            .bearer_auth(&self.access_token)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str::<PreferenceResponse>(&body)
            .map_err(|e| GatewayError::InvalidResponse(format!("{e}; body={body}")))
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError> {
        let resp = self
            .http
            .get(format!("{}/v1/payments/{payment_id}", self.base_url))
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed = serde_json::from_str::<MpPaymentResponse>(&body)
            .map_err(|e| GatewayError::InvalidResponse(format!("{e}; body={body}")))?;
        let id = id_to_string(&parsed.id)
            .ok_or_else(|| GatewayError::InvalidResponse(format!("missing payment id; body={body}")))?;
        Ok(GatewayPayment {
            id,
            status: parsed.status,
            status_detail: parsed.status_detail,
            external_reference: parsed.external_reference,
            transaction_amount: parsed.transaction_amount,
            currency_id: parsed.currency_id,
            date_created: parsed.date_created,
        })
    }
}
