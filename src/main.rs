// src/main.rs
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use dotenvy::dotenv;
use sqlx::PgPool;
use std::env;
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use servi_market::api::mp_client::{MercadoPagoClient, PaymentGateway};
use servi_market::db::PgStore;
use servi_market::gate::{AcceptanceGate, PricingConfig};
use servi_market::ledger::RequestLedger;
use servi_market::notify::{
    EmailSender, HttpEmailSender, NotificationDispatcher, WhatsAppApiSender, WhatsAppSender,
};
use servi_market::reconcile::Reconciler;
use servi_market::retry::{RetryConfig, RetryQueue};
use servi_market::store::Store;
use servi_market::{api, docs, AppState};

async fn index() -> impl Responder {
    HttpResponse::Ok().body("Service ready!")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let mp_access_token = env::var("MP_ACCESS_TOKEN").expect("MP_ACCESS_TOKEN required");
    let webhook_secret = env::var("MP_WEBHOOK_SECRET").ok();
    let callback_base_url =
        env::var("CALLBACK_BASE_URL").unwrap_or_else(|_| "https://your-domain.com".to_string());
    let frontend_base_url = env::var("FRONTEND_BASE_URL").ok();
    let port = env::var("HTTP_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let gateway: Arc<dyn PaymentGateway> = Arc::new(MercadoPagoClient::from_env(mp_access_token));
    let email: Arc<dyn EmailSender> = Arc::new(HttpEmailSender::from_env());
    let whatsapp: Arc<dyn WhatsAppSender> = Arc::new(WhatsAppApiSender::from_env());

    let retry_config = RetryConfig::from_env();
    let dispatcher = Arc::new(NotificationDispatcher::new(
        store.clone(),
        email,
        whatsapp,
        retry_config.clone(),
    ));
    let pricing = PricingConfig::from_env();

    let ledger = Arc::new(RequestLedger::new(store.clone(), dispatcher.clone()));
    let gate = Arc::new(AcceptanceGate::new(store.clone(), pricing.clone()));
    let reconciler = Arc::new(Reconciler::new(store.clone()));

    // failed notifications are swept in the background until delivered or
    // dropped at the cap
    RetryQueue::new(store.clone(), dispatcher, retry_config).spawn();

    let state = web::Data::new(AppState {
        store,
        gateway,
        ledger,
        gate,
        reconciler,
        pricing,
        webhook_secret,
        callback_base_url,
        frontend_base_url,
    });

    log::info!("listening on 0.0.0.0:{port}");
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/", web::get().to(index))
            .route("/healthz", web::get().to(index))
            .service(
                SwaggerUi::new("/docs/{_:.*}")
                    .url("/api-docs/openapi.json", docs::ApiDoc::openapi()),
            )
            // Защищённые роуты: идентификатор пользователя приходит от
            // шлюза аккаунтов в X-User-Id.
            .service(
                web::scope("/api")
                    .wrap(api::identity::RequireUser)
                    .service(api::requests::update_status)
                    .service(api::requests::schedule_request)
                    .service(api::requests::submit_review)
                    .service(api::payments::create_payment),
            )
            // Вебхуки (публичные)
            .service(api::webhooks_mp::mercadopago_webhook)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
