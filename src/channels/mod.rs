//! Messaging channel abstraction.

pub mod whatsapp;

use async_trait::async_trait;

use crate::error::ChannelError;

pub use whatsapp::TwilioWhatsApp;

/// Outbound messaging contract the delivery coordinator depends on.
#[async_trait]
pub trait MessagingChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Send a text (and optional media) to a normalized phone number.
    /// Returns the provider's delivery id.
    async fn send(
        &self,
        to: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<String, ChannelError>;

    async fn health_check(&self) -> Result<(), ChannelError>;
}
