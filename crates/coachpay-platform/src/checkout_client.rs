use async_trait::async_trait;
use chrono::{Duration, Utc};
use coachpay_core::{
    CheckoutSession, CheckoutSessionRequest, CheckoutSessionStatus, GatewayError,
    MIN_CHECKOUT_WINDOW_MINUTES, PaymentGateway, SessionPaymentState, is_valid_session_id,
};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use crate::config::CheckoutConfig;

const MAX_SESSION_TTL_HOURS: i64 = 24;

/// REST client for the hosted checkout provider (form-encoded requests, JSON responses).
#[derive(Clone)]
pub struct HostedCheckoutClient {
    http: Client,
    api_base: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    id: String,
    url: Option<String>,
    status: Option<String>,
    payment_status: Option<String>,
    client_reference_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl HostedCheckoutClient {
    pub fn new(config: &CheckoutConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn read_session(
        &self,
        response: reqwest::Response,
    ) -> Result<SessionBody, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<SessionBody>()
                .await
                .map_err(|err| GatewayError::Unavailable(format!("unreadable session: {err}")));
        }

        let message = response
            .json::<ErrorEnvelope>()
            .await
            .ok()
            .and_then(|envelope| envelope.error.message)
            .unwrap_or_else(|| status.to_string());
        Err(GatewayError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

fn transport(err: reqwest::Error) -> GatewayError {
    GatewayError::Unavailable(err.to_string())
}

/// Builds `{api_base}/v1/checkout/sessions/{id}` with the id as a single path segment.
fn session_url(api_base: &str, session_id: &str) -> Result<Url, GatewayError> {
    if !is_valid_session_id(session_id) {
        return Err(GatewayError::UnknownSession(session_id.to_string()));
    }

    let mut url = Url::parse(api_base)
        .map_err(|err| GatewayError::Unavailable(format!("invalid checkout api base: {err}")))?;
    url.path_segments_mut()
        .map_err(|()| GatewayError::Unavailable(format!("{api_base} cannot hold a path")))?
        .pop_if_empty()
        .extend(["v1", "checkout", "sessions", session_id]);
    Ok(url)
}

fn session_form(request: &CheckoutSessionRequest) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("mode", "payment".to_string()),
        ("client_reference_id", request.client_reference.clone()),
        ("success_url", request.success_url.clone()),
        ("cancel_url", request.cancel_url.clone()),
        ("line_items[0][quantity]", "1".to_string()),
        ("line_items[0][price_data][currency]", request.currency.clone()),
        (
            "line_items[0][price_data][unit_amount]",
            request.amount_cents.to_string(),
        ),
        (
            "line_items[0][price_data][product_data][name]",
            request.description.clone(),
        ),
    ];

    if let Some(expires_at) = request.expires_at {
        let now = Utc::now();
        let earliest = now + Duration::minutes(MIN_CHECKOUT_WINDOW_MINUTES);
        let latest = now + Duration::hours(MAX_SESSION_TTL_HOURS);
        let clamped = expires_at.clamp(earliest, latest);
        form.push(("expires_at", clamped.timestamp().to_string()));
    }

    form
}

fn payment_state(body: &SessionBody) -> SessionPaymentState {
    match (body.payment_status.as_deref(), body.status.as_deref()) {
        (Some("paid"), _) => SessionPaymentState::Paid,
        (_, Some("expired")) => SessionPaymentState::Expired,
        _ => SessionPaymentState::Unpaid,
    }
}

#[async_trait]
impl PaymentGateway for HostedCheckoutClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let response = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.api_key)
            .form(&session_form(request))
            .send()
            .await
            .map_err(transport)?;

        let body = self.read_session(response).await?;
        debug!(session_id = %body.id, "hosted checkout session opened");
        Ok(CheckoutSession {
            session_id: body.id,
            url: body.url,
        })
    }

    async fn checkout_session_status(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSessionStatus, GatewayError> {
        let response = self
            .http
            .get(session_url(&self.api_base, session_id)?)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::UnknownSession(session_id.to_string()));
        }

        let body = self.read_session(response).await?;
        Ok(CheckoutSessionStatus {
            payment: payment_state(&body),
            session_id: body.id,
            client_reference: body.client_reference_id,
        })
    }
}
