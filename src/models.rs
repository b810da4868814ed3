// src/models.rs

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Lifecycle of a service request.
///
/// PENDING -> ACCEPTED | REJECTED | EXPIRED
/// ACCEPTED -> COMPLETED | CANCELLED
///
/// REJECTED, COMPLETED, CANCELLED and EXPIRED are terminal. EXPIRED is
/// reached when the hold deadline elapses; nothing in the HTTP surface sets
/// it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
    Completed,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn as_api_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn from_api_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "ACCEPTED" => Some(Self::Accepted),
            "REJECTED" => Some(Self::Rejected),
            "COMPLETED" => Some(Self::Completed),
            "CANCELLED" => Some(Self::Cancelled),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Completed | Self::Cancelled | Self::Expired
        )
    }

    /// Statuses that keep a schedule slot occupied.
    pub fn blocks_slot(&self) -> bool {
        matches!(self, Self::Pending | Self::Accepted | Self::Completed)
    }

    pub fn permits(&self, target: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, target),
            (Pending, Accepted)
                | (Pending, Rejected)
                | (Pending, Expired)
                | (Accepted, Completed)
                | (Accepted, Cancelled)
        )
    }

    /// Message returned to the caller alongside the updated record.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Pending => "Service request is awaiting the provider",
            Self::Accepted => "Service request accepted",
            Self::Rejected => "Service request rejected",
            Self::Completed => "Service request completed",
            Self::Cancelled => "Service request cancelled",
            Self::Expired => "Service request expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestType {
    Quote,
    Scheduling,
}

impl RequestType {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::Scheduling => "scheduling",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "quote" => Some(Self::Quote),
            "scheduling" => Some(Self::Scheduling),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Approved,
    Rejected,
    Refunded,
}

impl PaymentStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Refunded => "refunded",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }

    /// Maps the gateway status vocabulary onto ours. Unrecognized values
    /// stay PENDING rather than failing the webhook.
    pub fn from_gateway(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "pending" => Self::Pending,
            "in_process" | "in_mediation" | "authorized" => Self::Processing,
            "rejected" | "cancelled" => Self::Rejected,
            "refunded" | "charged_back" => Self::Refunded,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentPurpose {
    Booking,
    Unlock,
    Subscription,
}

impl PaymentPurpose {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Booking => "booking",
            Self::Unlock => "unlock",
            Self::Subscription => "subscription",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "booking" => Some(Self::Booking),
            "unlock" => Some(Self::Unlock),
            "subscription" => Some(Self::Subscription),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Plan {
    MonthlyProfessional,
    Basic,
}

impl Plan {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::MonthlyProfessional => "monthly_professional",
            Self::Basic => "basic",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "monthly_professional" => Some(Self::MonthlyProfessional),
            "basic" => Some(Self::Basic),
            _ => None,
        }
    }

    /// Whether the plan lets a provider accept requests without per-request
    /// unlock payments.
    pub fn unlimited_acceptance(&self) -> bool {
        matches!(self, Self::MonthlyProfessional)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    Email,
    Whatsapp,
}

impl Channel {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Whatsapp => "whatsapp",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Self::Email),
            "whatsapp" => Some(Self::Whatsapp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ServiceRequest {
    pub id: i32,
    pub client_id: i32,
    pub provider_id: i32,
    pub service_id: i32,
    pub request_type: RequestType,
    pub status: RequestStatus,
    pub scheduled_date: Option<NaiveDate>,
    pub scheduled_time: Option<String>,
    pub estimated_price: Option<Decimal>,
    pub final_price: Option<Decimal>,
    pub expires_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub review_rating: Option<i16>,
    pub review_comment: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Payment {
    pub id: i32,
    pub user_id: i32,
    pub service_request_id: Option<i32>,
    pub subscription_id: Option<i32>,
    pub amount: Decimal,
    pub currency: String,
    pub gateway: String,
    pub gateway_payment_id: Option<String>,
    pub purpose: PaymentPurpose,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a payment row; id and timestamps come from the store.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub user_id: i32,
    pub service_request_id: Option<i32>,
    pub amount: Decimal,
    pub currency: String,
    pub gateway: String,
    pub gateway_payment_id: Option<String>,
    pub purpose: PaymentPurpose,
    pub status: PaymentStatus,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Subscription {
    pub id: i32,
    pub provider_id: i32,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One pending redelivery of a notification. Durable: the sweeper picks
/// these up by `next_retry_at`, so they survive restarts.
#[derive(Debug, Clone)]
pub struct RetryOperation {
    pub key: String,
    pub channel: Channel,
    pub payload: serde_json::Value,
    pub retries: i32,
    pub max_retries: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Party {
    pub id: i32,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BookingContacts {
    pub client: Party,
    pub provider: Party,
    pub service_title: String,
}

/// Correlation data embedded in the gateway `external_reference` when an
/// intent is created, so a webhook can be classified without a separate
/// lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalRef {
    /// Client paying for the service itself.
    Booking { service_request_id: i32, client_id: i32 },
    /// Provider paying the one-off fee to accept one request.
    Unlock { service_request_id: i32, provider_id: i32 },
    /// Provider paying for a recurring plan.
    Subscription { provider_id: i32, plan: Plan },
}

impl ExternalRef {
    pub fn encode(&self) -> String {
        match self {
            Self::Booking {
                service_request_id,
                client_id,
            } => format!("booking:{service_request_id}:{client_id}"),
            Self::Unlock {
                service_request_id,
                provider_id,
            } => format!("unlock:{service_request_id}:{provider_id}"),
            Self::Subscription { provider_id, plan } => {
                format!("sub:{provider_id}:{}", plan.as_db_str())
            }
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let kind = parts.next()?;
        let a = parts.next()?;
        let b = parts.next()?;
        match kind {
            "booking" => Some(Self::Booking {
                service_request_id: a.parse().ok()?,
                client_id: b.parse().ok()?,
            }),
            "unlock" => Some(Self::Unlock {
                service_request_id: a.parse().ok()?,
                provider_id: b.parse().ok()?,
            }),
            "sub" => Some(Self::Subscription {
                provider_id: a.parse().ok()?,
                plan: Plan::from_db_str(b)?,
            }),
            _ => None,
        }
    }

    pub fn purpose(&self) -> PaymentPurpose {
        match self {
            Self::Booking { .. } => PaymentPurpose::Booking,
            Self::Unlock { .. } => PaymentPurpose::Unlock,
            Self::Subscription { .. } => PaymentPurpose::Subscription,
        }
    }

    /// The local user who owes the payment.
    pub fn payer_id(&self) -> i32 {
        match self {
            Self::Booking { client_id, .. } => *client_id,
            Self::Unlock { provider_id, .. } => *provider_id,
            Self::Subscription { provider_id, .. } => *provider_id,
        }
    }

    pub fn service_request_id(&self) -> Option<i32> {
        match self {
            Self::Booking {
                service_request_id, ..
            }
            | Self::Unlock {
                service_request_id, ..
            } => Some(*service_request_id),
            Self::Subscription { .. } => None,
        }
    }
}
