use async_trait::async_trait;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("connector {0} is not available")]
    Unavailable(String),
    #[error("delivery to {channel} failed: {reason}")]
    Delivery { channel: String, reason: String },
}

/// Delivers a single formatted line to a previously configured channel.
#[async_trait]
pub trait AlertConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, channel: &str, text: &str) -> Result<(), ConnectorError>;
}

/// Writes alerts to the log. Used when no connector is configured.
#[derive(Debug, Default)]
pub struct LogOnlyConnector;

#[async_trait]
impl AlertConnector for LogOnlyConnector {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, channel: &str, text: &str) -> Result<(), ConnectorError> {
        warn!(channel, alert = %text, "alert");
        Ok(())
    }
}

/// Where alerts go: a connector plus the channel it delivers to.
pub struct AlertRoute {
    connector: Box<dyn AlertConnector>,
    channel: String,
}

impl AlertRoute {
    pub fn new(connector: Box<dyn AlertConnector>, channel: impl Into<String>) -> Self {
        Self {
            connector,
            channel: channel.into(),
        }
    }

    pub fn log_only() -> Self {
        Self::new(Box::new(LogOnlyConnector), "log")
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Best-effort delivery. Returns whether the line was delivered.
    pub async fn deliver(&self, text: &str) -> bool {
        match self.connector.send(&self.channel, text).await {
            Ok(()) => {
                info!(
                    connector = self.connector.name(),
                    channel = %self.channel,
                    "alert delivered"
                );
                true
            }
            Err(e) => {
                warn!(
                    connector = self.connector.name(),
                    channel = %self.channel,
                    error = %e,
                    "alert delivery failed"
                );
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
