//! Notifier that writes notifications to the log.

use tracing::warn;

use super::{Notification, Notifier, NotifyError};

/// Emits each notification as a `WARN` event. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        warn!(
            key = %notification.key,
            reason = %notification.reason,
            raised_at = %notification.raised_at,
            "{}",
            notification.message
        );
        Ok(())
    }
}
