use crate::ports::notification_service::{
    Notification, NotificationService as NotificationServiceTrait, Result,
};
use async_trait::async_trait;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP implementation of NotificationService
///
/// POSTs the notification as JSON to a hosted email function.
pub struct NotificationService {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl NotificationService {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl NotificationServiceTrait for NotificationService {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut request = self.http.post(&self.endpoint).json(notification);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("notification endpoint returned {}: {}", status, body).into());
        }

        tracing::debug!(
            kind = ?notification.notification_type,
            "Notification delivered"
        );
        Ok(())
    }
}
