// src/reconcile.rs

//! Maps asynchronous gateway notifications onto authoritative local state.
//!
//! The caller has already re-fetched the payment from the gateway; this
//! module binds it to a local row in three steps, each idempotent under
//! duplicate and out-of-order delivery:
//!
//! 1. exact match by gateway payment id — replays update in place;
//! 2. claim of the newest in-flight intent that has no gateway id yet
//!    (single compare-and-swap, see [`Store::claim_unbound_payment`]);
//! 3. a fresh row from the fetched data, for intents created out-of-band.
//!
//! Approved subscription payments additionally provision the provider's
//! subscription.

use chrono::{DateTime, Duration, Months, Utc};
use std::sync::Arc;

use crate::api::mp_client::GatewayPayment;
use crate::error::ApiError;
use crate::models::{ExternalRef, NewPayment, PaymentStatus, Plan};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Replay of a status we already hold.
    Unchanged,
    /// Existing row updated in place.
    Updated,
    /// An in-flight intent was bound to its gateway id.
    Bound,
    /// No local row existed; one was created from the gateway data.
    Created,
    /// Nothing to bind to and no usable correlation data; acknowledged.
    Unmatched,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Updated => "updated",
            Self::Bound => "bound",
            Self::Created => "created",
            Self::Unmatched => "unmatched",
        }
    }
}

fn one_month_after(t: DateTime<Utc>) -> DateTime<Utc> {
    t.checked_add_months(Months::new(1))
        .unwrap_or_else(|| t + Duration::days(30))
}

pub struct Reconciler {
    store: Arc<dyn Store>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn apply(
        &self,
        gateway: &str,
        fetched: &GatewayPayment,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ApiError> {
        let status = PaymentStatus::from_gateway(&fetched.status);
        let snapshot = serde_json::to_value(fetched)?;
        let external = fetched
            .external_reference
            .as_deref()
            .and_then(ExternalRef::decode);

        // Step 1: exact match. Duplicate deliveries land here and stop.
        if let Some(existing) = self
            .store
            .payment_by_gateway_id(gateway, &fetched.id)
            .await?
        {
            if existing.status == status {
                return Ok(ReconcileOutcome::Unchanged);
            }
            self.store
                .update_payment_status(existing.id, status, &snapshot)
                .await?;
            if status == PaymentStatus::Approved {
                self.maybe_provision(external, existing.id, now).await?;
            }
            return Ok(ReconcileOutcome::Updated);
        }

        // Steps 2 and 3 need the correlation data from external_reference.
        let Some(external) = external else {
            log::warn!(
                "gateway payment {} has no usable external reference, acknowledging unmatched",
                fetched.id
            );
            return Ok(ReconcileOutcome::Unmatched);
        };

        let (payment_id, outcome) = match self
            .store
            .claim_unbound_payment(
                external.service_request_id(),
                external.payer_id(),
                gateway,
                &fetched.id,
                status,
                &snapshot,
            )
            .await?
        {
            Some(claimed) => (claimed.id, ReconcileOutcome::Bound),
            None => {
                let created = self
                    .store
                    .insert_payment(NewPayment {
                        user_id: external.payer_id(),
                        service_request_id: external.service_request_id(),
                        amount: fetched.transaction_amount,
                        currency: fetched
                            .currency_id
                            .clone()
                            .unwrap_or_else(|| "BRL".to_string()),
                        gateway: gateway.to_string(),
                        gateway_payment_id: Some(fetched.id.clone()),
                        purpose: external.purpose(),
                        status,
                        payload: snapshot.clone(),
                    })
                    .await?;
                (created.id, ReconcileOutcome::Created)
            }
        };

        if status == PaymentStatus::Approved {
            self.maybe_provision(Some(external), payment_id, now).await?;
        }
        Ok(outcome)
    }

    async fn maybe_provision(
        &self,
        external: Option<ExternalRef>,
        payment_id: i32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(ExternalRef::Subscription { provider_id, plan }) = external {
            self.provision_subscription(provider_id, plan, payment_id, now)
                .await?;
        }
        Ok(())
    }

    /// No active subscription: start one for a month. Same plan: extend a
    /// month past the later of now and the current end. Different plan:
    /// cancel, then start the new one.
    async fn provision_subscription(
        &self,
        provider_id: i32,
        plan: Plan,
        payment_id: i32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let subscription_id = match self.store.active_subscription(provider_id).await? {
            None => {
                let created = self
                    .store
                    .insert_subscription(provider_id, plan, now, Some(one_month_after(now)))
                    .await?;
                created.id
            }
            Some(current) if current.plan == plan => {
                let base = current.end_date.map_or(now, |end| end.max(now));
                self.store
                    .extend_subscription(current.id, one_month_after(base))
                    .await?;
                current.id
            }
            Some(current) => {
                self.store.cancel_subscription(current.id, now).await?;
                let created = self
                    .store
                    .insert_subscription(provider_id, plan, now, Some(one_month_after(now)))
                    .await?;
                created.id
            }
        };
        self.store
            .link_payment_to_subscription(payment_id, subscription_id)
            .await?;
        log::info!(
            "provider {} subscription {} active on plan {}",
            provider_id,
            subscription_id,
            plan.as_db_str()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubscriptionStatus;
    use crate::store::MemStore;
    use rust_decimal_macros::dec;

    const GW: &str = "mercadopago";

    fn approved_subscription_payment(provider_id: i32, id: &str) -> GatewayPayment {
        GatewayPayment {
            id: id.to_string(),
            status: "approved".to_string(),
            status_detail: None,
            external_reference: Some(
                ExternalRef::Subscription {
                    provider_id,
                    plan: Plan::MonthlyProfessional,
                }
                .encode(),
            ),
            transaction_amount: dec!(49.90),
            currency_id: Some("BRL".to_string()),
            date_created: None,
        }
    }

    #[tokio::test]
    async fn first_approved_subscription_payment_creates_one() {
        let store = Arc::new(MemStore::new());
        let reconciler = Reconciler::new(store.clone());
        let now = Utc::now();

        let outcome = reconciler
            .apply(GW, &approved_subscription_payment(7, "mp-1"), now)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);

        let subs = store.subscriptions_snapshot();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].provider_id, 7);
        assert_eq!(subs[0].status, SubscriptionStatus::Active);
        assert_eq!(subs[0].end_date, Some(one_month_after(now)));

        let payments = store.payments_snapshot();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].subscription_id, Some(subs[0].id));
    }

    #[tokio::test]
    async fn renewal_extends_from_the_current_end() {
        let store = Arc::new(MemStore::new());
        let reconciler = Reconciler::new(store.clone());
        let now = Utc::now();

        reconciler
            .apply(GW, &approved_subscription_payment(7, "mp-1"), now)
            .await
            .unwrap();
        let first_end = store.subscriptions_snapshot()[0].end_date.unwrap();

        // renewal arrives before the period runs out
        reconciler
            .apply(GW, &approved_subscription_payment(7, "mp-2"), now)
            .await
            .unwrap();
        let subs = store.subscriptions_snapshot();
        assert_eq!(subs.len(), 1, "same plan renews in place");
        assert_eq!(subs[0].end_date, Some(one_month_after(first_end)));
    }

    #[tokio::test]
    async fn plan_change_cancels_and_replaces() {
        let store = Arc::new(MemStore::new());
        let reconciler = Reconciler::new(store.clone());
        let now = Utc::now();

        reconciler
            .apply(GW, &approved_subscription_payment(7, "mp-1"), now)
            .await
            .unwrap();

        let mut downgrade = approved_subscription_payment(7, "mp-2");
        downgrade.external_reference = Some(
            ExternalRef::Subscription {
                provider_id: 7,
                plan: Plan::Basic,
            }
            .encode(),
        );
        reconciler.apply(GW, &downgrade, now).await.unwrap();

        let subs = store.subscriptions_snapshot();
        assert_eq!(subs.len(), 2);
        let cancelled = subs.iter().find(|s| s.plan == Plan::MonthlyProfessional).unwrap();
        let active = subs.iter().find(|s| s.plan == Plan::Basic).unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert_eq!(active.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn replayed_webhook_is_unchanged_and_does_not_reprovision() {
        let store = Arc::new(MemStore::new());
        let reconciler = Reconciler::new(store.clone());
        let now = Utc::now();
        let payment = approved_subscription_payment(7, "mp-1");

        assert_eq!(
            reconciler.apply(GW, &payment, now).await.unwrap(),
            ReconcileOutcome::Created
        );
        let end_after_first = store.subscriptions_snapshot()[0].end_date;

        assert_eq!(
            reconciler.apply(GW, &payment, now).await.unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(store.payments_snapshot().len(), 1);
        assert_eq!(store.subscriptions_snapshot().len(), 1);
        assert_eq!(store.subscriptions_snapshot()[0].end_date, end_after_first);
    }

    #[tokio::test]
    async fn undecodable_reference_is_acknowledged_unmatched() {
        let store = Arc::new(MemStore::new());
        let reconciler = Reconciler::new(store.clone());
        let mut payment = approved_subscription_payment(7, "mp-1");
        payment.external_reference = Some("order-1234".to_string());

        let outcome = reconciler.apply(GW, &payment, Utc::now()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unmatched);
        assert!(store.payments_snapshot().is_empty());
    }
}
