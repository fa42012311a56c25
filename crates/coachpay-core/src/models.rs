use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl OfferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OfferStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown offer status {other}")),
        }
    }
}

/// A coach-issued, priced proposal embedded in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Offer {
    pub id: Uuid,
    pub coach_id: Uuid,
    pub customer_id: Uuid,
    pub originating_message_id: Uuid,
    pub price: Decimal,
    pub duration_months: u32,
    pub status: OfferStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Offer {
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Status as seen at `now`: a stored `pending` past `expires_at` reads as `expired`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> OfferStatus {
        match self.status {
            OfferStatus::Pending if self.is_past_expiry(now) => OfferStatus::Expired,
            status => status,
        }
    }

    pub fn is_actionable(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == OfferStatus::Pending
    }

    pub fn client_reference(&self) -> String {
        offer_client_reference(self.id)
    }
}

/// Longest validity an offer may be given when it is created (30 days).
pub const MAX_OFFER_VALIDITY_HOURS: i64 = 24 * 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOffer {
    pub coach_id: Uuid,
    pub customer_id: Uuid,
    pub originating_message_id: Uuid,
    pub price: Decimal,
    pub duration_months: u32,
    pub expires_at: DateTime<Utc>,
}

const CLIENT_REFERENCE_PREFIX: &str = "offer:";

pub fn offer_client_reference(offer_id: Uuid) -> String {
    format!("{CLIENT_REFERENCE_PREFIX}{offer_id}")
}

/// Recovers the offer id from an `offer:<uuid>` client reference.
pub fn parse_offer_client_reference(reference: &str) -> Option<Uuid> {
    reference
        .trim()
        .strip_prefix(CLIENT_REFERENCE_PREFIX)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contract {
    pub id: Uuid,
    pub coach_id: Uuid,
    pub customer_id: Uuid,
    pub offer_id: Uuid,
    pub status: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub price_cents: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payout {
    pub id: Uuid,
    pub coach_id: Uuid,
    pub offer_id: Uuid,
    pub amount_cents: i64,
    pub platform_fee_cents: i64,
    pub net_amount_cents: i64,
    pub status: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomerProfile {
    pub id: Uuid,
    pub coach_id: Option<Uuid>,
    pub plan: Option<String>,
    pub plan_expiry: Option<DateTime<Utc>>,
    pub platform_plan: String,
    pub updated_at: DateTime<Utc>,
}

/// The write applied to a customer profile when an offer is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoachGrant {
    pub customer_id: Uuid,
    pub coach_id: Uuid,
    pub plan: String,
    pub plan_expiry: DateTime<Utc>,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub coach_id: Uuid,
    pub customer_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Offer,
    OfferAccepted,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::OfferAccepted => "offer_accepted",
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "offer" => Ok(Self::Offer),
            "offer_accepted" => Ok(Self::OfferAccepted),
            other => Err(format!("unknown message kind {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub kind: MessageKind,
    pub offer_id: Option<Uuid>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// How `duration_months` is turned into an entitlement window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntitlementUnit {
    #[default]
    Months,
    /// Legacy computation that treats the month count as weeks.
    Weeks,
}

impl EntitlementUnit {
    pub fn plan_expiry(self, now: DateTime<Utc>, duration_months: u32) -> Option<DateTime<Utc>> {
        match self {
            Self::Months => now.checked_add_months(Months::new(duration_months)),
            Self::Weeks => {
                now.checked_add_signed(chrono::Duration::weeks(i64::from(duration_months)))
            }
        }
    }
}

impl FromStr for EntitlementUnit {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "months" => Ok(Self::Months),
            "weeks" => Ok(Self::Weeks),
            other => Err(format!("unsupported entitlement unit {other}")),
        }
    }
}
