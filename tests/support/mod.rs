use actix_web::web;
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use servi_market::api::mp_client::{
    GatewayError, GatewayPayment, PaymentGateway, PreferenceRequest, PreferenceResponse,
};
use servi_market::gate::{AcceptanceGate, PricingConfig};
use servi_market::ledger::RequestLedger;
use servi_market::notify::{EmailSender, NotificationDispatcher, NotifyError, WhatsAppSender};
use servi_market::reconcile::Reconciler;
use servi_market::retry::RetryConfig;
use servi_market::store::{MemStore, RequestSeed, Store};
use servi_market::AppState;

/// Scripted gateway: payments are whatever the test puts in, and fetches
/// can be switched to fail to exercise the 503 path.
#[derive(Default)]
pub struct FakeGateway {
    payments: Mutex<HashMap<String, GatewayPayment>>,
    pub fail_fetch: AtomicBool,
    next_preference: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_payment(&self, payment: GatewayPayment) {
        self.payments.lock().insert(payment.id.clone(), payment);
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_preference(
        &self,
        _request: &PreferenceRequest,
    ) -> Result<PreferenceResponse, GatewayError> {
        let n = self.next_preference.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PreferenceResponse {
            id: format!("pref-{n}"),
            init_point: Some(format!("https://checkout.test/pref-{n}")),
            sandbox_init_point: None,
        })
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(GatewayError::Api {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        self.payments
            .lock()
            .get(payment_id)
            .cloned()
            .ok_or(GatewayError::Api {
                status: 404,
                body: "payment not found".to_string(),
            })
    }
}

/// Sender that fails its first `fail_first` calls, then delivers.
pub struct ScriptedSender {
    fail_first: usize,
    pub attempts: AtomicUsize,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl ScriptedSender {
    pub fn reliable() -> Self {
        Self::failing(0)
    }

    pub fn failing(fail_first: usize) -> Self {
        Self {
            fail_first,
            attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn deliver(&self, to: &str, body: &str) -> Result<(), NotifyError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(NotifyError(format!("scripted failure #{attempt}")));
        }
        self.sent.lock().push((to.to_string(), body.to_string()));
        Ok(())
    }
}

#[async_trait]
impl EmailSender for ScriptedSender {
    async fn send(&self, to: &str, _subject: &str, body: &str) -> Result<(), NotifyError> {
        self.deliver(to, body)
    }
}

#[async_trait]
impl WhatsAppSender for ScriptedSender {
    async fn send(&self, to: &str, message: &str) -> Result<(), NotifyError> {
        self.deliver(to, message)
    }
}

pub fn pricing() -> PricingConfig {
    PricingConfig {
        currency: "BRL".to_string(),
        unlock_price: dec!(9.90),
        monthly_professional_price: dec!(49.90),
        basic_price: dec!(19.90),
    }
}

pub struct TestApp {
    pub state: web::Data<AppState>,
    pub store: Arc<MemStore>,
    pub gateway: Arc<FakeGateway>,
    pub email: Arc<ScriptedSender>,
    pub whatsapp: Arc<ScriptedSender>,
}

pub fn build_app() -> TestApp {
    build_app_with_secret(None)
}

pub fn build_app_with_secret(webhook_secret: Option<&str>) -> TestApp {
    let store = Arc::new(MemStore::new());
    let gateway = Arc::new(FakeGateway::new());
    let email = Arc::new(ScriptedSender::reliable());
    let whatsapp = Arc::new(ScriptedSender::reliable());

    let store_dyn: Arc<dyn Store> = store.clone();
    let dispatcher = Arc::new(NotificationDispatcher::new(
        store_dyn.clone(),
        email.clone(),
        whatsapp.clone(),
        RetryConfig::default(),
    ));
    let pricing = pricing();
    let state = web::Data::new(AppState {
        store: store_dyn.clone(),
        gateway: gateway.clone(),
        ledger: Arc::new(RequestLedger::new(store_dyn.clone(), dispatcher)),
        gate: Arc::new(AcceptanceGate::new(store_dyn.clone(), pricing.clone())),
        reconciler: Arc::new(Reconciler::new(store_dyn)),
        pricing,
        webhook_secret: webhook_secret.map(str::to_string),
        callback_base_url: "http://localhost:8080".to_string(),
        frontend_base_url: None,
    });

    TestApp {
        state,
        store,
        gateway,
        email,
        whatsapp,
    }
}

/// Client, provider and a service owned by the provider, all with full
/// contact details.
pub fn seed_parties(store: &MemStore) -> (i32, i32, i32) {
    let client_id = store.add_party("Ana", Some("ana@example.com"), Some("+5511999990001"));
    let provider_id = store.add_party("Bruno", Some("bruno@example.com"), Some("+5511999990002"));
    let service_id = store.add_service(provider_id, "Wiring repair");
    (client_id, provider_id, service_id)
}

pub fn pending_quote(store: &MemStore, client_id: i32, provider_id: i32, service_id: i32) -> i32 {
    store
        .add_request(RequestSeed::new(client_id, provider_id, service_id))
        .id
}
