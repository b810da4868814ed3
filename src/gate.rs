// src/gate.rs

//! Payment-gated authorization of PENDING -> ACCEPTED.
//!
//! Two independent, substitutable conditions unlock acceptance: an active
//! subscription on a plan with unlimited acceptance, or an approved one-off
//! unlock payment scoped to the request. The gate runs a short-circuit
//! chain of named checks so further unlock mechanisms slot in without
//! touching the existing ones.

use chrono::Utc;
use rust_decimal::Decimal;
use std::env;
use std::sync::Arc;

use crate::error::ApiError;
use crate::models::{Plan, RequestStatus, ServiceRequest};
use crate::store::{Store, StoreError};

/// Prices come from the platform pricing settings, owned elsewhere; env
/// vars are the contract.
#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub currency: String,
    pub unlock_price: Decimal,
    pub monthly_professional_price: Decimal,
    pub basic_price: Decimal,
}

fn decimal_var(name: &str, default: &str) -> Decimal {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| default.parse().expect("default price"))
}

impl PricingConfig {
    pub fn from_env() -> Self {
        Self {
            currency: env::var("CURRENCY").unwrap_or_else(|_| "BRL".to_string()),
            unlock_price: decimal_var("UNLOCK_PRICE", "9.90"),
            monthly_professional_price: decimal_var("PLAN_MONTHLY_PROFESSIONAL_PRICE", "49.90"),
            basic_price: decimal_var("PLAN_BASIC_PRICE", "19.90"),
        }
    }

    pub fn plan_price(&self, plan: Plan) -> Decimal {
        match plan {
            Plan::MonthlyProfessional => self.monthly_professional_price,
            Plan::Basic => self.basic_price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NotTheProvider,
    AlreadyResolved(RequestStatus),
    PaymentRequired(Decimal),
}

impl DenyReason {
    pub fn into_error(self) -> ApiError {
        match self {
            Self::NotTheProvider => {
                ApiError::Forbidden("acting provider does not own this request".to_string())
            }
            Self::AlreadyResolved(status) => {
                ApiError::invalid_transition(status, RequestStatus::Accepted)
            }
            Self::PaymentRequired(unlock_price) => ApiError::PaymentRequired { unlock_price },
        }
    }
}

/// One step of the chain. `Continue` hands over to the next check.
enum CheckResult {
    Allow,
    Deny(DenyReason),
    Continue,
}

#[derive(Debug, Clone, Copy)]
enum Check {
    Ownership,
    Liveness,
    Subscription,
    UnlockPayment,
}

const CHAIN: [Check; 4] = [
    Check::Ownership,
    Check::Liveness,
    Check::Subscription,
    Check::UnlockPayment,
];

pub struct AcceptanceGate {
    store: Arc<dyn Store>,
    pricing: PricingConfig,
}

impl AcceptanceGate {
    pub fn new(store: Arc<dyn Store>, pricing: PricingConfig) -> Self {
        Self { store, pricing }
    }

    pub async fn authorize(
        &self,
        request: &ServiceRequest,
        acting_provider_id: i32,
    ) -> Result<Decision, StoreError> {
        for check in CHAIN {
            match self.eval(check, request, acting_provider_id).await? {
                CheckResult::Allow => return Ok(Decision::Allow),
                CheckResult::Deny(reason) => return Ok(Decision::Deny(reason)),
                CheckResult::Continue => {}
            }
        }
        Ok(Decision::Deny(DenyReason::PaymentRequired(
            self.pricing.unlock_price,
        )))
    }

    async fn eval(
        &self,
        check: Check,
        request: &ServiceRequest,
        acting_provider_id: i32,
    ) -> Result<CheckResult, StoreError> {
        match check {
            Check::Ownership => {
                if request.provider_id != acting_provider_id {
                    Ok(CheckResult::Deny(DenyReason::NotTheProvider))
                } else {
                    Ok(CheckResult::Continue)
                }
            }
            Check::Liveness => {
                if request.status.is_terminal() {
                    Ok(CheckResult::Deny(DenyReason::AlreadyResolved(request.status)))
                } else {
                    Ok(CheckResult::Continue)
                }
            }
            Check::Subscription => {
                let subscription = self.store.active_subscription(acting_provider_id).await?;
                match subscription {
                    Some(sub)
                        if sub.plan.unlimited_acceptance()
                            && sub.end_date.map_or(true, |end| end > Utc::now()) =>
                    {
                        Ok(CheckResult::Allow)
                    }
                    _ => Ok(CheckResult::Continue),
                }
            }
            Check::UnlockPayment => {
                if self
                    .store
                    .has_approved_unlock(request.id, acting_provider_id)
                    .await?
                {
                    Ok(CheckResult::Allow)
                } else {
                    Ok(CheckResult::Continue)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewPayment, PaymentPurpose, PaymentStatus};
    use crate::store::{MemStore, RequestSeed};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn pricing() -> PricingConfig {
        PricingConfig {
            currency: "BRL".to_string(),
            unlock_price: dec!(9.90),
            monthly_professional_price: dec!(49.90),
            basic_price: dec!(19.90),
        }
    }

    fn unlock_payment(request_id: i32, provider_id: i32, status: PaymentStatus) -> NewPayment {
        NewPayment {
            user_id: provider_id,
            service_request_id: Some(request_id),
            amount: dec!(9.90),
            currency: "BRL".to_string(),
            gateway: "mercadopago".to_string(),
            gateway_payment_id: Some(format!("gw-{request_id}-{provider_id}")),
            purpose: PaymentPurpose::Unlock,
            status,
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn denies_with_neither_condition() {
        let store = Arc::new(MemStore::new());
        let request = store.add_request(RequestSeed::new(1, 2, 1));
        let gate = AcceptanceGate::new(store, pricing());
        let decision = gate.authorize(&request, 2).await.unwrap();
        assert_eq!(
            decision,
            Decision::Deny(DenyReason::PaymentRequired(dec!(9.90)))
        );
    }

    #[tokio::test]
    async fn denies_foreign_provider() {
        let store = Arc::new(MemStore::new());
        let request = store.add_request(RequestSeed::new(1, 2, 1));
        let gate = AcceptanceGate::new(store, pricing());
        let decision = gate.authorize(&request, 99).await.unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::NotTheProvider));
    }

    #[tokio::test]
    async fn allows_with_unlimited_subscription() {
        let store = Arc::new(MemStore::new());
        let request = store.add_request(RequestSeed::new(1, 2, 1));
        let now = Utc::now();
        store
            .insert_subscription(2, Plan::MonthlyProfessional, now, Some(now + Duration::days(30)))
            .await
            .unwrap();
        let gate = AcceptanceGate::new(store, pricing());
        assert_eq!(gate.authorize(&request, 2).await.unwrap(), Decision::Allow);
    }

    #[tokio::test]
    async fn lapsed_subscription_does_not_allow() {
        let store = Arc::new(MemStore::new());
        let request = store.add_request(RequestSeed::new(1, 2, 1));
        let now = Utc::now();
        store
            .insert_subscription(2, Plan::MonthlyProfessional, now - Duration::days(60), Some(now - Duration::days(30)))
            .await
            .unwrap();
        let gate = AcceptanceGate::new(store, pricing());
        assert_eq!(
            gate.authorize(&request, 2).await.unwrap(),
            Decision::Deny(DenyReason::PaymentRequired(dec!(9.90)))
        );
    }

    #[tokio::test]
    async fn basic_plan_does_not_allow() {
        let store = Arc::new(MemStore::new());
        let request = store.add_request(RequestSeed::new(1, 2, 1));
        let now = Utc::now();
        store
            .insert_subscription(2, Plan::Basic, now, Some(now + Duration::days(30)))
            .await
            .unwrap();
        let gate = AcceptanceGate::new(store, pricing());
        assert_eq!(
            gate.authorize(&request, 2).await.unwrap(),
            Decision::Deny(DenyReason::PaymentRequired(dec!(9.90)))
        );
    }

    #[tokio::test]
    async fn allows_with_approved_unlock_payment() {
        let store = Arc::new(MemStore::new());
        let request = store.add_request(RequestSeed::new(1, 2, 1));
        store
            .insert_payment(unlock_payment(request.id, 2, PaymentStatus::Approved))
            .await
            .unwrap();
        let gate = AcceptanceGate::new(store, pricing());
        assert_eq!(gate.authorize(&request, 2).await.unwrap(), Decision::Allow);
    }

    #[tokio::test]
    async fn pending_unlock_payment_does_not_allow() {
        let store = Arc::new(MemStore::new());
        let request = store.add_request(RequestSeed::new(1, 2, 1));
        store
            .insert_payment(unlock_payment(request.id, 2, PaymentStatus::Pending))
            .await
            .unwrap();
        let gate = AcceptanceGate::new(store, pricing());
        assert_eq!(
            gate.authorize(&request, 2).await.unwrap(),
            Decision::Deny(DenyReason::PaymentRequired(dec!(9.90)))
        );
    }

    #[tokio::test]
    async fn allows_with_both_conditions() {
        let store = Arc::new(MemStore::new());
        let request = store.add_request(RequestSeed::new(1, 2, 1));
        let now = Utc::now();
        store
            .insert_subscription(2, Plan::MonthlyProfessional, now, Some(now + Duration::days(30)))
            .await
            .unwrap();
        store
            .insert_payment(unlock_payment(request.id, 2, PaymentStatus::Approved))
            .await
            .unwrap();
        let gate = AcceptanceGate::new(store, pricing());
        assert_eq!(gate.authorize(&request, 2).await.unwrap(), Decision::Allow);
    }

    #[tokio::test]
    async fn denies_terminal_request() {
        let store = Arc::new(MemStore::new());
        let mut seed = RequestSeed::new(1, 2, 1);
        seed.status = RequestStatus::Rejected;
        let request = store.add_request(seed);
        let gate = AcceptanceGate::new(store, pricing());
        assert_eq!(
            gate.authorize(&request, 2).await.unwrap(),
            Decision::Deny(DenyReason::AlreadyResolved(RequestStatus::Rejected))
        );
    }
}
