// src/notify.rs

//! Notification fan-out for booking lifecycle events.
//!
//! Delivery is best-effort relative to the state change: one synchronous
//! attempt, and on failure the notification becomes a durable
//! [`RetryOperation`](crate::models::RetryOperation) picked up by the
//! sweeper in [`crate::retry`]. Senders are black boxes that may fail.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{BookingContacts, Channel, RequestStatus, RetryOperation, ServiceRequest};
use crate::retry::RetryConfig;
use crate::store::Store;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait WhatsAppSender: Send + Sync {
    async fn send(&self, to: &str, message: &str) -> Result<(), NotifyError>;
}

/// One deliverable message. Serializable because failed sends are persisted
/// for retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub channel: Channel,
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
}

impl Notification {
    pub fn email(to: &str, subject: &str, body: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: Channel::Email,
            to: to.to_string(),
            subject: Some(subject.to_string()),
            body: body.to_string(),
        }
    }

    pub fn whatsapp(to: &str, message: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: Channel::Whatsapp,
            to: to.to_string(),
            subject: None,
            body: message.to_string(),
        }
    }

    /// Stable key for the retry table.
    pub fn retry_key(&self) -> String {
        format!("{}-{}", self.channel.as_db_str(), self.id)
    }
}

/// Messages for one status change: the client hears on every channel we
/// have a contact for, the provider by email.
pub fn booking_status_notifications(
    request: &ServiceRequest,
    status: RequestStatus,
    contacts: &BookingContacts,
) -> Vec<Notification> {
    let summary = format!(
        "Service request #{} ({}) is now {}",
        request.id,
        contacts.service_title,
        status.as_api_str()
    );
    let mut out = Vec::new();
    if let Some(email) = &contacts.client.email {
        out.push(Notification::email(
            email,
            &format!("Update on your service request #{}", request.id),
            &format!("Hello {},\n\n{}.", contacts.client.name, summary),
        ));
    }
    if let Some(phone) = &contacts.client.phone {
        out.push(Notification::whatsapp(phone, &summary));
    }
    if let Some(email) = &contacts.provider.email {
        out.push(Notification::email(
            email,
            &format!("Service request #{} {}", request.id, status.as_api_str()),
            &format!("Hello {},\n\n{}.", contacts.provider.name, summary),
        ));
    }
    out
}

pub struct NotificationDispatcher {
    store: Arc<dyn Store>,
    email: Arc<dyn EmailSender>,
    whatsapp: Arc<dyn WhatsAppSender>,
    config: RetryConfig,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        email: Arc<dyn EmailSender>,
        whatsapp: Arc<dyn WhatsAppSender>,
        config: RetryConfig,
    ) -> Self {
        Self {
            store,
            email,
            whatsapp,
            config,
        }
    }

    pub async fn booking_status_changed(
        &self,
        request: &ServiceRequest,
        status: RequestStatus,
        contacts: &BookingContacts,
    ) {
        for notification in booking_status_notifications(request, status, contacts) {
            self.send(notification).await;
        }
    }

    /// One synchronous attempt; a failure registers the retry operation and
    /// never surfaces to the caller.
    pub async fn send(&self, notification: Notification) {
        if let Err(e) = self.attempt(&notification).await {
            log::warn!(
                "notification {} failed, scheduling retry: {e}",
                notification.retry_key()
            );
            self.register_retry(notification, &e).await;
        }
    }

    pub async fn attempt(&self, notification: &Notification) -> Result<(), NotifyError> {
        match notification.channel {
            Channel::Email => {
                let subject = notification.subject.as_deref().unwrap_or("Notification");
                self.email
                    .send(&notification.to, subject, &notification.body)
                    .await
            }
            Channel::Whatsapp => self.whatsapp.send(&notification.to, &notification.body).await,
        }
    }

    async fn register_retry(&self, notification: Notification, error: &NotifyError) {
        let policy = self.config.policy(notification.channel);
        let now = Utc::now();
        let payload = match serde_json::to_value(&notification) {
            Ok(v) => v,
            Err(e) => {
                log::error!("cannot serialize notification for retry: {e}");
                return;
            }
        };
        let op = RetryOperation {
            key: notification.retry_key(),
            channel: notification.channel,
            payload,
            retries: 0,
            max_retries: policy.max_retries,
            next_retry_at: now + policy.delay_after(0),
            last_error: Some(error.to_string()),
            created_at: now,
        };
        if let Err(e) = self.store.upsert_retry_operation(&op).await {
            log::error!("cannot persist retry operation {}: {e}", op.key);
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP senders
// ---------------------------------------------------------------------------

/// Posts to the transactional e-mail service.
pub struct HttpEmailSender {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpEmailSender {
    pub fn from_env() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: env::var("EMAIL_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8025".to_string()),
            token: env::var("EMAIL_SERVICE_TOKEN").unwrap_or_default(),
        }
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        let resp = self
            .http
            .post(format!("{}/send", self.base_url))
            .bearer_auth(&self.token)
            .json(&json!({ "to": to, "subject": subject, "body": body }))
            .send()
            .await
            .map_err(|e| NotifyError(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(NotifyError(format!("email service status={status} body={text}")));
        }
        Ok(())
    }
}

/// Posts to the WhatsApp Business API bridge.
pub struct WhatsAppApiSender {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl WhatsAppApiSender {
    pub fn from_env() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: env::var("WHATSAPP_API_URL")
                .unwrap_or_else(|_| "http://localhost:8030".to_string()),
            token: env::var("WHATSAPP_API_TOKEN").unwrap_or_default(),
        }
    }
}

#[async_trait]
impl WhatsAppSender for WhatsAppApiSender {
    async fn send(&self, to: &str, message: &str) -> Result<(), NotifyError> {
        let resp = self
            .http
            .post(format!("{}/messages", self.base_url))
            .bearer_auth(&self.token)
            .json(&json!({ "to": to, "text": message }))
            .send()
            .await
            .map_err(|e| NotifyError(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(NotifyError(format!("whatsapp api status={status} body={text}")));
        }
        Ok(())
    }
}
