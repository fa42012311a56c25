use chrono::{DateTime, Utc};
use coachpay_core::{Offer, OfferStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOfferRequest {
    pub coach_id: Uuid,
    pub customer_id: Uuid,
    pub price: Decimal,
    pub duration_months: u32,
    pub expires_in_hours: Option<i64>,
}

/// Offer as clients see it: `status` already accounts for lapsed validity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferView {
    pub offer_id: Uuid,
    pub coach_id: Uuid,
    pub customer_id: Uuid,
    pub price: Decimal,
    pub duration_months: u32,
    pub status: OfferStatus,
    pub actionable: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OfferView {
    pub fn at(offer: &Offer, now: DateTime<Utc>) -> Self {
        Self {
            offer_id: offer.id,
            coach_id: offer.coach_id,
            customer_id: offer.customer_id,
            price: offer.price,
            duration_months: offer.duration_months,
            status: offer.effective_status(now),
            actionable: offer.is_actionable(now),
            expires_at: offer.expires_at,
            created_at: offer.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectOfferRequest {
    pub customer_id: Uuid,
}

// Checkout and sync bodies come from the browser client, which speaks camelCase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutRequest {
    #[serde(alias = "offer_id")]
    pub offer_id: Uuid,
    #[serde(alias = "return_url")]
    pub return_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(alias = "session_id")]
    pub session_id: String,
    /// Keep asking the gateway for a bounded time while payment is still settling.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: String,
}
