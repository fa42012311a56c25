use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hosted checkout sessions must stay open at least this long.
pub const MIN_CHECKOUT_WINDOW_MINUTES: i64 = 30;

/// Session ids are opaque provider tokens of ASCII letters, digits and underscores.
/// Anything else is refused before it reaches a gateway URL.
pub fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id.len() <= 255
        && session_id
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_')
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub client_reference: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub success_url: String,
    pub cancel_url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutSession {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionPaymentState {
    Paid,
    Unpaid,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutSessionStatus {
    pub session_id: String,
    pub client_reference: Option<String>,
    pub payment: SessionPaymentState,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    #[error("payment gateway rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unknown checkout session {0}")]
    UnknownSession(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::UnknownSession(_) => false,
        }
    }
}

/// The hosted-checkout provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, GatewayError>;

    async fn checkout_session_status(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSessionStatus, GatewayError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OfferAcceptedEvent {
    pub offer_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub coach_id: Uuid,
    pub customer_id: Uuid,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Fan-out of acceptance to realtime chat clients.
#[async_trait]
pub trait AcceptanceNotifier: Send + Sync {
    async fn offer_accepted(&self, event: &OfferAcceptedEvent) -> Result<(), NotifyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_plain_tokens() {
        assert!(is_valid_session_id("cs_test_a1B2c3"));
        assert!(is_valid_session_id("cs_mem_6d1f0c1e8c1a4a8e9a572a3c4f1d0b11"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("../../customers/cus_123"));
        assert!(!is_valid_session_id("cs_1?expand=customer"));
        assert!(!is_valid_session_id("cs_1%2F.."));
    }
}
