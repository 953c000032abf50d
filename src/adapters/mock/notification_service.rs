use crate::ports::notification_service::{
    Notification, NotificationService as NotificationServiceTrait, Result,
};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};

/// Mock implementation of NotificationService
///
/// Records every notification instead of delivering it.
/// Can be switched to fail so callers' best-effort handling can be tested.
pub struct NotificationService {
    sent: Mutex<Vec<Notification>>,
    failing: Mutex<bool>,
}

impl NotificationService {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(false),
        }
    }

    /// Make subsequent sends fail
    pub fn fail(&self) {
        *lock(&self.failing) = true;
    }

    /// Notifications delivered so far
    pub fn sent(&self) -> Vec<Notification> {
        lock(&self.sent).clone()
    }
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl NotificationServiceTrait for NotificationService {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if *lock(&self.failing) {
            return Err("notification delivery failed".into());
        }
        lock(&self.sent).push(notification.clone());
        Ok(())
    }
}
