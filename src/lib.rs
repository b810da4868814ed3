pub mod api;
pub mod db;
pub mod docs;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod reconcile;
pub mod retry;
pub mod slots;
pub mod store;

use std::sync::Arc;

use crate::api::mp_client::PaymentGateway;
use crate::gate::{AcceptanceGate, PricingConfig};
use crate::ledger::RequestLedger;
use crate::reconcile::Reconciler;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub ledger: Arc<RequestLedger>,
    pub gate: Arc<AcceptanceGate>,
    pub reconciler: Arc<Reconciler>,
    pub pricing: PricingConfig,
    pub webhook_secret: Option<String>,
    pub callback_base_url: String,
    pub frontend_base_url: Option<String>,
}
