use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use coachpay_core::{
    CheckoutSession, CheckoutSessionRequest, GatewayError, MIN_CHECKOUT_WINDOW_MINUTES,
    PaymentGateway, ReconcileStore, StoreError, price_to_cents,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::expiry::{ExpiryMonitor, NotActionable};

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("offer {offer_id} cannot be paid: {reason}")]
    InvalidState { offer_id: Uuid, reason: String },
    #[error("invalid return url: {0}")]
    InvalidReturnUrl(String),
    #[error("payment gateway unavailable: {0}")]
    UpstreamUnavailable(#[source] GatewayError),
    #[error("payment gateway refused the session: {0}")]
    UpstreamRejected(#[source] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Opens a hosted checkout session for one pending offer. Holds no state of its own.
pub struct CheckoutSessionIssuer {
    store: Arc<dyn ReconcileStore>,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
}

impl CheckoutSessionIssuer {
    pub fn new(
        store: Arc<dyn ReconcileStore>,
        gateway: Arc<dyn PaymentGateway>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            gateway,
            currency: currency.into(),
        }
    }

    pub async fn create_session(
        &self,
        offer_id: Uuid,
        return_url: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckoutSession, CheckoutError> {
        let return_url = return_url.trim();
        if !(return_url.starts_with("https://") || return_url.starts_with("http://")) {
            return Err(CheckoutError::InvalidReturnUrl(return_url.to_string()));
        }

        let invalid = |reason: String| CheckoutError::InvalidState { offer_id, reason };

        let offer = self
            .store
            .get_offer(offer_id)
            .await?
            .ok_or_else(|| invalid("offer not found".to_string()))?;
        ExpiryMonitor::ensure_actionable(&offer, now).map_err(|NotActionable(status)| {
            invalid(format!("offer is {status}"))
        })?;
        // A hosted session cannot close sooner than the provider minimum, so it
        // would outlive an offer that lapses first.
        if offer.expires_at - now < Duration::minutes(MIN_CHECKOUT_WINDOW_MINUTES) {
            return Err(invalid(format!(
                "offer expires in less than {MIN_CHECKOUT_WINDOW_MINUTES} minutes"
            )));
        }

        let amount_cents = price_to_cents(offer.price)
            .filter(|cents| *cents > 0)
            .ok_or_else(|| invalid(format!("offer price {} is not payable", offer.price)))?;

        let request = CheckoutSessionRequest {
            client_reference: offer.client_reference(),
            amount_cents,
            currency: self.currency.clone(),
            description: format!(
                "Coaching, {} month{}",
                offer.duration_months,
                if offer.duration_months == 1 { "" } else { "s" }
            ),
            success_url: success_url(return_url),
            cancel_url: return_url.to_string(),
            expires_at: Some(offer.expires_at),
        };

        match self.gateway.create_checkout_session(&request).await {
            Ok(session) => {
                info!(
                    offer_id = %offer_id,
                    session_id = %session.session_id,
                    "checkout session created"
                );
                Ok(session)
            }
            Err(err) if err.is_retryable() => {
                warn!(offer_id = %offer_id, error = %err, "payment gateway unavailable");
                Err(CheckoutError::UpstreamUnavailable(err))
            }
            Err(err) => {
                warn!(
                    offer_id = %offer_id,
                    error = %err,
                    "payment gateway rejected checkout session"
                );
                Err(CheckoutError::UpstreamRejected(err))
            }
        }
    }
}

/// The gateway substitutes the placeholder with the session id on redirect.
fn success_url(return_url: &str) -> String {
    let separator = if return_url.contains('?') { '&' } else { '?' };
    format!("{return_url}{separator}session_id={{CHECKOUT_SESSION_ID}}")
}
