use anyhow::Result;
use async_trait::async_trait;
use coachpay_core::{AcceptanceNotifier, NotifyError, OfferAcceptedEvent};
use redis::{AsyncCommands, Client};
use serde::Serialize;

pub const OFFERS_ACCEPTED_CHANNEL: &str = "offers.accepted";

#[derive(Clone)]
pub struct RedisBus {
    client: Client,
}

impl RedisBus {
    pub fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Returns the number of subscribers that received the payload.
    pub async fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) -> Result<i64> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(payload)?;
        let receivers: i64 = connection.publish(channel, serialized).await?;
        Ok(receivers)
    }
}

#[async_trait]
impl AcceptanceNotifier for RedisBus {
    async fn offer_accepted(&self, event: &OfferAcceptedEvent) -> Result<(), NotifyError> {
        let receivers = self
            .publish_json(OFFERS_ACCEPTED_CHANNEL, event)
            .await
            .map_err(|err| NotifyError(err.to_string()))?;
        tracing::debug!(offer_id = %event.offer_id, receivers, "acceptance published");
        Ok(())
    }
}
