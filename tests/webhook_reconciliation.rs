use actix_web::{test, web, App};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::atomic::Ordering;

use servi_market::api::identity::RequireUser;
use servi_market::api::mp_client::GatewayPayment;
use servi_market::api::payments::create_payment;
use servi_market::api::requests::update_status;
use servi_market::api::signature::sign_hmac_sha256_hex;
use servi_market::api::webhooks_mp::mercadopago_webhook;
use servi_market::models::{ExternalRef, PaymentStatus, Plan, SubscriptionStatus};

mod support;

macro_rules! webhook_app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data($state.clone())
                .service(mercadopago_webhook)
                .service(
                    web::scope("/api")
                        .wrap(RequireUser)
                        .service(create_payment)
                        .service(update_status),
                ),
        )
        .await
    };
}

fn unlock_payment(id: &str, service_request_id: i32, provider_id: i32) -> GatewayPayment {
    GatewayPayment {
        id: id.to_string(),
        status: "approved".to_string(),
        status_detail: Some("accredited".to_string()),
        external_reference: Some(
            ExternalRef::Unlock {
                service_request_id,
                provider_id,
            }
            .encode(),
        ),
        transaction_amount: dec!(9.90),
        currency_id: Some("BRL".to_string()),
        date_created: None,
    }
}

#[actix_web::test]
async fn duplicate_webhook_delivery_is_idempotent() {
    let test_app = support::build_app();
    let (client_id, provider_id, service_id) = support::seed_parties(&test_app.store);
    let request_id = support::pending_quote(&test_app.store, client_id, provider_id, service_id);
    test_app
        .gateway
        .put_payment(unlock_payment("mp-100", request_id, provider_id));

    let app = webhook_app!(test_app.state);
    let envelope = json!({"type": "payment", "data": {"id": "mp-100"}});

    for expected_outcome in ["created", "unchanged"] {
        let req = test::TestRequest::post()
            .uri("/webhooks/mercadopago")
            .set_json(&envelope)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 200);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["outcome"], expected_outcome);
    }

    let payments = test_app.store.payments_snapshot();
    assert_eq!(payments.len(), 1, "replay must not duplicate the row");
    assert_eq!(payments[0].status, PaymentStatus::Approved);
    assert_eq!(payments[0].gateway_payment_id.as_deref(), Some("mp-100"));
}

#[actix_web::test]
async fn webhook_binds_the_pending_intent_instead_of_duplicating() {
    let test_app = support::build_app();
    let (client_id, provider_id, service_id) = support::seed_parties(&test_app.store);
    let request_id = support::pending_quote(&test_app.store, client_id, provider_id, service_id);
    let app = webhook_app!(test_app.state);

    // provider starts checkout: local PENDING row, gateway id still null
    let req = test::TestRequest::post()
        .uri("/api/payments")
        .insert_header(("X-User-Id", provider_id.to_string()))
        .set_json(json!({"purpose": "UNLOCK", "service_request_id": request_id}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["preference_id"], "pref-1");
    assert!(body["checkout_url"].as_str().unwrap().contains("pref-1"));
    let local_id = body["payment_id"].as_i64().unwrap() as i32;

    let payments = test_app.store.payments_snapshot();
    assert_eq!(payments.len(), 1);
    assert!(payments[0].gateway_payment_id.is_none());

    // the gateway assigns a numeric id; the webhook is the first
    // correlation point
    test_app
        .gateway
        .put_payment(unlock_payment("777001", request_id, provider_id));
    let req = test::TestRequest::post()
        .uri("/webhooks/mercadopago")
        .set_json(json!({"type": "payment", "data": {"id": 777001}}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["outcome"], "bound");

    let payments = test_app.store.payments_snapshot();
    assert_eq!(payments.len(), 1, "the intent row is updated, not duplicated");
    assert_eq!(payments[0].id, local_id);
    assert_eq!(payments[0].gateway_payment_id.as_deref(), Some("777001"));
    assert_eq!(payments[0].status, PaymentStatus::Approved);

    // the bound approval unlocks acceptance end to end
    let req = test::TestRequest::put()
        .uri(&format!("/api/requests/{request_id}/status"))
        .insert_header(("X-User-Id", provider_id.to_string()))
        .set_json(json!({"status": "ACCEPTED"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 200);
}

#[actix_web::test]
async fn non_payment_events_are_acknowledged_untouched() {
    let test_app = support::build_app();
    // even with a broken gateway nothing is fetched for these
    test_app.gateway.fail_fetch.store(true, Ordering::SeqCst);
    let app = webhook_app!(test_app.state);

    for envelope in [
        json!({"type": "plan", "data": {"id": "p-1"}}),
        json!({"type": "payment", "data": {}}),
        json!({"type": "payment"}),
    ] {
        let req = test::TestRequest::post()
            .uri("/webhooks/mercadopago")
            .set_json(&envelope)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 200);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["ignored"], true);
    }
    assert!(test_app.store.payments_snapshot().is_empty());
}

#[actix_web::test]
async fn gateway_outage_asks_for_redelivery() {
    let test_app = support::build_app();
    test_app.gateway.fail_fetch.store(true, Ordering::SeqCst);
    let app = webhook_app!(test_app.state);

    let req = test::TestRequest::post()
        .uri("/webhooks/mercadopago")
        .set_json(json!({"type": "payment", "data": {"id": "mp-1"}}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 503);
}

#[actix_web::test]
async fn unknown_payment_is_acknowledged_to_stop_redelivery() {
    let test_app = support::build_app();
    let app = webhook_app!(test_app.state);

    // the fake gateway answers 404 for ids it does not know
    let req = test::TestRequest::post()
        .uri("/webhooks/mercadopago")
        .set_json(json!({"type": "payment", "data": {"id": "mp-nope"}}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["ignored"], true);
}

#[actix_web::test]
async fn approved_subscription_payment_unlocks_acceptance() {
    let test_app = support::build_app();
    let (client_id, provider_id, service_id) = support::seed_parties(&test_app.store);
    let request_id = support::pending_quote(&test_app.store, client_id, provider_id, service_id);
    let app = webhook_app!(test_app.state);

    test_app.gateway.put_payment(GatewayPayment {
        id: "mp-sub-1".to_string(),
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
    });
    let req = test::TestRequest::post()
        .uri("/webhooks/mercadopago")
        .set_json(json!({"type": "payment", "data": {"id": "mp-sub-1"}}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 200);

    let subs = test_app.store.subscriptions_snapshot();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].status, SubscriptionStatus::Active);
    assert_eq!(subs[0].plan, Plan::MonthlyProfessional);
    let payments = test_app.store.payments_snapshot();
    assert_eq!(payments[0].subscription_id, Some(subs[0].id));

    // no unlock payment, but the plan covers acceptance
    let req = test::TestRequest::put()
        .uri(&format!("/api/requests/{request_id}/status"))
        .insert_header(("X-User-Id", provider_id.to_string()))
        .set_json(json!({"status": "ACCEPTED"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 200);
}

#[actix_web::test]
async fn refund_revokes_the_unlock() {
    let test_app = support::build_app();
    let (client_id, provider_id, service_id) = support::seed_parties(&test_app.store);
    let request_id = support::pending_quote(&test_app.store, client_id, provider_id, service_id);
    let app = webhook_app!(test_app.state);

    test_app
        .gateway
        .put_payment(unlock_payment("mp-200", request_id, provider_id));
    let req = test::TestRequest::post()
        .uri("/webhooks/mercadopago")
        .set_json(json!({"type": "payment", "data": {"id": "mp-200"}}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 200);

    // the money comes back; the same row flips to refunded
    let mut refunded = unlock_payment("mp-200", request_id, provider_id);
    refunded.status = "refunded".to_string();
    test_app.gateway.put_payment(refunded);
    let req = test::TestRequest::post()
        .uri("/webhooks/mercadopago")
        .set_json(json!({"type": "payment", "data": {"id": "mp-200"}}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["outcome"], "updated");

    let payments = test_app.store.payments_snapshot();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Refunded);

    // the latest row is authoritative: acceptance is gated again
    let req = test::TestRequest::put()
        .uri(&format!("/api/requests/{request_id}/status"))
        .insert_header(("X-User-Id", provider_id.to_string()))
        .set_json(json!({"status": "ACCEPTED"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 402);
}

#[actix_web::test]
async fn signature_is_enforced_when_a_secret_is_configured() {
    let test_app = support::build_app_with_secret(Some("hook-secret"));
    let (client_id, provider_id, service_id) = support::seed_parties(&test_app.store);
    let request_id = support::pending_quote(&test_app.store, client_id, provider_id, service_id);
    test_app
        .gateway
        .put_payment(unlock_payment("mp-300", request_id, provider_id));
    let app = webhook_app!(test_app.state);
    let envelope = json!({"type": "payment", "data": {"id": "mp-300"}});

    // wrong signature
    let req = test::TestRequest::post()
        .uri("/webhooks/mercadopago")
        .insert_header(("x-signature", "ts=1700000000,v1=deadbeef"))
        .insert_header(("x-request-id", "req-1"))
        .set_json(&envelope)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 401);

    // correct signature
    let v1 = sign_hmac_sha256_hex("hook-secret", "id:mp-300;request-id:req-1;ts:1700000000;");
    let req = test::TestRequest::post()
        .uri("/webhooks/mercadopago")
        .insert_header(("x-signature", format!("ts=1700000000,v1={v1}")))
        .insert_header(("x-request-id", "req-1"))
        .set_json(&envelope)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 200);
}
