use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::requests::update_status,
        crate::api::requests::schedule_request,
        crate::api::requests::submit_review,
        crate::api::payments::create_payment,
        crate::api::webhooks_mp::mercadopago_webhook
    ),
    components(
        schemas(
            crate::api::requests::UpdateStatusRequest,
            crate::api::requests::ScheduleRequest,
            crate::api::requests::ReviewRequest,
            crate::api::requests::UpdatedRequestResponse,
            crate::api::payments::CreatePaymentRequest,
            crate::api::payments::CreatePaymentResponse,
            crate::api::webhooks_mp::WebhookEnvelope,
            crate::api::webhooks_mp::WebhookData,
            crate::models::ServiceRequest,
            crate::models::Payment,
            crate::models::Subscription,
            crate::models::RequestStatus,
            crate::models::RequestType,
            crate::models::PaymentStatus,
            crate::models::PaymentPurpose,
            crate::models::SubscriptionStatus,
            crate::models::Plan,
            crate::models::Channel
        )
    ),
    tags(
        (name = "requests", description = "Service request lifecycle"),
        (name = "payments", description = "Checkout intents"),
        (name = "webhooks", description = "Callbacks from Mercado Pago")
    )
)]
pub struct ApiDoc;
