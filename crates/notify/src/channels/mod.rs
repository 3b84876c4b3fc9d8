//! Notification channel implementations.

pub mod feishu;

use async_trait::async_trait;

use crate::card::CardMessage;
use crate::error::ChannelError;

/// Identifiers the messaging platform hands back for a delivered card.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Platform message ID, used later to update the card in place
    pub message_id: Option<String>,
}

/// Trait for notification channels (Feishu, etc.).
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Deliver a template card to the recipient named in the message.
    async fn deliver(&self, message: &CardMessage) -> Result<DeliveryReceipt, ChannelError>;
}
