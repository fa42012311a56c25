use std::sync::Arc;

use chrono::{DateTime, Utc};
use coachpay_core::{EventParseError, GatewayEvent, ReconcileStore, StoreError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::orchestrator::{ReconcileError, ReconcileOutcome, Reconciler};
use crate::signature::verify_signature;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Reconciled {
        event_id: String,
        offer_id: Uuid,
        outcome: ReconcileOutcome,
    },
    PlanDowngraded {
        event_id: String,
        profile_id: Uuid,
        found: bool,
    },
    Ignored {
        event_id: String,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("missing or invalid webhook signature")]
    BadSignature,
    #[error(transparent)]
    MalformedEvent(#[from] EventParseError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("plan downgrade failed: {0}")]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Whether the sender should redeliver. Signature and payload problems never heal on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Reconcile(_) | Self::Store(_))
    }
}

/// Webhook entry point: authenticate, classify, dispatch.
pub struct PaymentEventIngester {
    secret: Vec<u8>,
    reconciler: Arc<Reconciler>,
    store: Arc<dyn ReconcileStore>,
}

impl PaymentEventIngester {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        reconciler: Arc<Reconciler>,
        store: Arc<dyn ReconcileStore>,
    ) -> Self {
        Self {
            secret: secret.into(),
            reconciler,
            store,
        }
    }

    pub async fn ingest(
        &self,
        body: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        let authentic =
            signature.is_some_and(|header| verify_signature(body, header, &self.secret));
        if !authentic {
            warn!(
                security = true,
                signature_present = signature.is_some(),
                "rejected webhook with invalid signature"
            );
            return Err(IngestError::BadSignature);
        }

        match GatewayEvent::from_slice(body)? {
            GatewayEvent::PaymentConfirmed {
                event_id,
                session_id,
                offer_id,
            } => {
                info!(
                    event_id = %event_id,
                    session_id = %session_id,
                    offer_id = %offer_id,
                    "payment confirmed"
                );
                let outcome = self.reconciler.reconcile(offer_id, now).await?;
                if let ReconcileOutcome::Accepted { report, .. } = &outcome
                    && !report.is_complete()
                {
                    warn!(
                        event_id = %event_id,
                        offer_id = %offer_id,
                        failed_steps = report.failed.len(),
                        "offer accepted with outstanding provisioning"
                    );
                }
                Ok(IngestOutcome::Reconciled {
                    event_id,
                    offer_id,
                    outcome,
                })
            }
            GatewayEvent::SubscriptionCanceled {
                event_id,
                subscription_id,
                profile_id,
            } => {
                let Some(profile_id) = profile_id else {
                    warn!(
                        event_id = %event_id,
                        subscription_id = %subscription_id,
                        "subscription cancellation without profile id"
                    );
                    return Ok(IngestOutcome::Ignored {
                        event_id,
                        reason: "subscription has no profile id".to_string(),
                    });
                };
                let found = self.store.downgrade_platform_plan(profile_id, now).await?;
                info!(
                    event_id = %event_id,
                    profile_id = %profile_id,
                    found,
                    "platform plan downgraded"
                );
                Ok(IngestOutcome::PlanDowngraded {
                    event_id,
                    profile_id,
                    found,
                })
            }
            GatewayEvent::Ignored {
                event_id,
                event_type,
                reason,
            } => {
                info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    reason = %reason,
                    "gateway event ignored"
                );
                Ok(IngestOutcome::Ignored { event_id, reason })
            }
        }
    }
}
