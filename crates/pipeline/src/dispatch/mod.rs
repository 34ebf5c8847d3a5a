mod log;

pub use log::LogDispatcher;

use async_trait::async_trait;

use crate::store::Alert;

/// Delivery attempt result for a single channel.
#[derive(Debug, Clone)]
pub struct ChannelDelivery {
    pub channel: String,
    /// `None` on success.
    pub error: Option<String>,
}

impl ChannelDelivery {
    pub fn ok(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            error: None,
        }
    }

    pub fn failed(channel: &str, error: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            error: Some(error.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Delivers finalized alerts to their configured channels. One result per
/// channel; a failed channel never fails the alert as a whole.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Vec<ChannelDelivery>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_delivery_reports_success() {
        assert!(ChannelDelivery::ok("log").succeeded());
        assert!(!ChannelDelivery::failed("webhook", "connection refused").succeeded());
    }

    #[test]
    fn dispatcher_is_dyn_compatible() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn NotificationDispatcher>();
    }
}
