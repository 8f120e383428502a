//! Outbound delivery: message gateway and rendering collaborators.

pub mod render;
pub mod telegram;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

pub use render::{CatalogRenderer, MessageRenderer};
pub use telegram::TelegramGateway;

/// An inline button attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
}

/// Fully rendered payload. The gateway treats it as opaque apart from layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub text: String,
    /// Rows of buttons.
    #[serde(default)]
    pub buttons: Vec<Vec<Button>>,
}

impl RenderedMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
        }
    }
}

/// Proof of delivery returned by a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Gateway-native id of the delivered message, if it reports one.
    pub gateway_message_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

/// Something that can put a rendered message in front of a user.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Short name for logs and error messages.
    fn name(&self) -> &str;

    async fn send(
        &self,
        destination: &str,
        message: &RenderedMessage,
    ) -> Result<DeliveryReceipt, DeliveryError>;
}
