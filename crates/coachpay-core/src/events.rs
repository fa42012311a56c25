use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::parse_offer_client_reference;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const CHECKOUT_ASYNC_PAYMENT_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

/// The gateway events this service consumes. Anything else parses to `Ignored`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    PaymentConfirmed {
        event_id: String,
        session_id: String,
        offer_id: Uuid,
    },
    SubscriptionCanceled {
        event_id: String,
        subscription_id: String,
        profile_id: Option<Uuid>,
    },
    Ignored {
        event_id: String,
        event_type: String,
        reason: String,
    },
}

impl GatewayEvent {
    pub fn event_id(&self) -> &str {
        match self {
            Self::PaymentConfirmed { event_id, .. }
            | Self::SubscriptionCanceled { event_id, .. }
            | Self::Ignored { event_id, .. } => event_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed gateway event: {0}")]
pub struct EventParseError(String);

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawData,
}

#[derive(Debug, Deserialize)]
struct RawData {
    object: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    pub client_reference_id: Option<String>,
    pub mode: Option<String>,
    pub payment_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl GatewayEvent {
    pub fn from_slice(body: &[u8]) -> Result<Self, EventParseError> {
        let envelope: RawEnvelope =
            serde_json::from_slice(body).map_err(|err| EventParseError(err.to_string()))?;

        match envelope.event_type.as_str() {
            CHECKOUT_COMPLETED | CHECKOUT_ASYNC_PAYMENT_SUCCEEDED => {
                let session: CheckoutSessionObject = data_object(envelope.data.object)?;
                Ok(payment_event(envelope.id, envelope.event_type, session))
            }
            SUBSCRIPTION_DELETED => {
                let subscription: SubscriptionObject = data_object(envelope.data.object)?;
                let profile_id = subscription
                    .metadata
                    .get("profile_id")
                    .and_then(|raw| Uuid::parse_str(raw).ok());
                Ok(Self::SubscriptionCanceled {
                    event_id: envelope.id,
                    subscription_id: subscription.id,
                    profile_id,
                })
            }
            _ => Ok(Self::Ignored {
                event_id: envelope.id,
                event_type: envelope.event_type,
                reason: "unhandled event type".to_string(),
            }),
        }
    }
}

fn data_object<T: DeserializeOwned>(object: serde_json::Value) -> Result<T, EventParseError> {
    serde_json::from_value(object).map_err(|err| EventParseError(err.to_string()))
}

fn payment_event(
    event_id: String,
    event_type: String,
    session: CheckoutSessionObject,
) -> GatewayEvent {
    let ignored = |reason: &str| GatewayEvent::Ignored {
        event_id: event_id.clone(),
        event_type: event_type.clone(),
        reason: reason.to_string(),
    };

    if session.mode.as_deref().is_some_and(|mode| mode != "payment") {
        return ignored("not a one-time payment");
    }
    if session.payment_status.as_deref() != Some("paid") {
        return ignored("payment not settled");
    }
    let Some(offer_id) = session
        .client_reference_id
        .as_deref()
        .and_then(parse_offer_client_reference)
    else {
        return ignored("client reference is not an offer");
    };

    GatewayEvent::PaymentConfirmed {
        event_id,
        session_id: session.id,
        offer_id,
    }
}
