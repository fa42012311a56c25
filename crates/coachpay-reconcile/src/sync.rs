use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use coachpay_core::{
    GatewayError, PaymentGateway, SessionPaymentState, is_valid_session_id,
    parse_offer_client_reference,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::orchestrator::{ReconcileError, ReconcileOutcome, Reconciler, SkipReason};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Accepted,
    Pending,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub status: SyncStatus,
    pub offer_id: Option<Uuid>,
    pub detail: Option<String>,
}

impl SyncReport {
    fn new(status: SyncStatus, offer_id: Option<Uuid>, detail: Option<&str>) -> Self {
        Self {
            status,
            offer_id,
            detail: detail.map(str::to_string),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Upstream(#[from] GatewayError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// Pull-based fallback for the webhook: asks the gateway about a session and
/// feeds a paid one into the same reconciler.
pub struct ClientSync {
    gateway: Arc<dyn PaymentGateway>,
    reconciler: Arc<Reconciler>,
}

impl ClientSync {
    pub fn new(gateway: Arc<dyn PaymentGateway>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            gateway,
            reconciler,
        }
    }

    /// `session_id` comes straight from the browser and is checked before the
    /// gateway sees it.
    pub async fn sync(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SyncReport, SyncError> {
        if !is_valid_session_id(session_id) {
            warn!(security = true, "client sync refused a malformed checkout session id");
            return Ok(SyncReport::new(
                SyncStatus::Error,
                None,
                Some("invalid checkout session id"),
            ));
        }

        let session = match self.gateway.checkout_session_status(session_id).await {
            Ok(session) => session,
            Err(GatewayError::UnknownSession(_)) => {
                return Ok(SyncReport::new(
                    SyncStatus::Error,
                    None,
                    Some("unknown checkout session"),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        let Some(offer_id) = session
            .client_reference
            .as_deref()
            .and_then(parse_offer_client_reference)
        else {
            warn!(session_id = %session_id, "checkout session carries no offer reference");
            return Ok(SyncReport::new(
                SyncStatus::Error,
                None,
                Some("session is not bound to an offer"),
            ));
        };

        match session.payment {
            SessionPaymentState::Unpaid => {
                debug!(session_id = %session_id, offer_id = %offer_id, "checkout not paid yet");
                Ok(SyncReport::new(SyncStatus::Pending, Some(offer_id), None))
            }
            SessionPaymentState::Expired => Ok(SyncReport::new(
                SyncStatus::Error,
                Some(offer_id),
                Some("checkout session expired"),
            )),
            SessionPaymentState::Paid => {
                let outcome = self.reconciler.reconcile(offer_id, now).await?;
                info!(
                    session_id = %session_id,
                    offer_id = %offer_id,
                    accepted = outcome.is_accepted(),
                    "client sync reconciled"
                );
                Ok(match outcome {
                    ReconcileOutcome::Accepted { .. } => {
                        SyncReport::new(SyncStatus::Accepted, Some(offer_id), None)
                    }
                    ReconcileOutcome::Skipped(SkipReason::Unsettled) => {
                        SyncReport::new(SyncStatus::Pending, Some(offer_id), None)
                    }
                    ReconcileOutcome::Skipped(SkipReason::NotFound) => {
                        SyncReport::new(SyncStatus::Error, Some(offer_id), Some("offer not found"))
                    }
                    ReconcileOutcome::Skipped(SkipReason::Terminal(status)) => SyncReport {
                        status: SyncStatus::Error,
                        offer_id: Some(offer_id),
                        detail: Some(format!("offer is {status}")),
                    },
                })
            }
        }
    }
}

/// Bounded repetition of [`ClientSync::sync`] while the outcome is still pending.
#[derive(Debug, Clone, Copy)]
pub struct SyncPoller {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for SyncPoller {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(2),
        }
    }
}

impl SyncPoller {
    /// Stops at the first settled answer. Transient gateway errors are retried;
    /// the last one is returned if no attempt succeeded.
    pub async fn poll(
        &self,
        sync: &ClientSync,
        session_id: &str,
    ) -> Result<SyncReport, SyncError> {
        let attempts = self.attempts.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            match sync.sync(session_id, Utc::now()).await {
                Ok(report) if report.status != SyncStatus::Pending => return Ok(report),
                Ok(report) => last = Some(Ok(report)),
                Err(SyncError::Upstream(err)) if err.is_retryable() => {
                    warn!(session_id = %session_id, attempt, error = %err, "sync attempt failed");
                    last = Some(Err(SyncError::Upstream(err)));
                }
                Err(err) => return Err(err),
            }

            if attempt < attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        last.unwrap_or_else(|| Ok(SyncReport::new(SyncStatus::Pending, None, None)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use coachpay_core::{
        CheckoutSessionRequest, CustomerProfile, NewOffer, OfferStatus, OfferStore,
        offer_client_reference,
    };
    use coachpay_store::{FaultPoint, InMemoryPaymentGateway, InMemoryStore};
    use rust_decimal::Decimal;

    use super::*;
    use crate::orchestrator::ReconcileSettings;

    struct Fixture {
        store: Arc<InMemoryStore>,
        gateway: Arc<InMemoryPaymentGateway>,
        reconciler: Arc<Reconciler>,
        sync: ClientSync,
        offer_id: Uuid,
    }

    async fn fixture(expires_in: ChronoDuration) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(InMemoryPaymentGateway::new());
        let customer_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .insert_profile(CustomerProfile {
                id: customer_id,
                coach_id: None,
                plan: None,
                plan_expiry: None,
                platform_plan: "free".to_string(),
                updated_at: now,
            })
            .await;
        let offer = store
            .create_offer(
                NewOffer {
                    coach_id: Uuid::new_v4(),
                    customer_id,
                    originating_message_id: Uuid::new_v4(),
                    price: Decimal::new(300, 0),
                    duration_months: 2,
                    expires_at: now + expires_in,
                },
                now,
            )
            .await
            .unwrap();
        gateway
            .insert_session(
                "cs_sync",
                CheckoutSessionRequest {
                    client_reference: offer_client_reference(offer.id),
                    amount_cents: 30000,
                    currency: "usd".to_string(),
                    description: "Coaching".to_string(),
                    success_url: "https://app.example/ok".to_string(),
                    cancel_url: "https://app.example/cancel".to_string(),
                    expires_at: None,
                },
                SessionPaymentState::Unpaid,
            )
            .await;
        let reconciler = Arc::new(Reconciler::new(store.clone(), ReconcileSettings::default()));
        Fixture {
            sync: ClientSync::new(gateway.clone(), reconciler.clone()),
            store,
            gateway,
            reconciler,
            offer_id: offer.id,
        }
    }

    #[tokio::test]
    async fn unpaid_session_reports_pending() {
        let fx = fixture(ChronoDuration::hours(48)).await;
        let report = fx.sync.sync("cs_sync", Utc::now()).await.unwrap();
        assert_eq!(report.status, SyncStatus::Pending);
        assert_eq!(report.offer_id, Some(fx.offer_id));
    }

    #[tokio::test]
    async fn paid_session_accepts_before_webhook() {
        let fx = fixture(ChronoDuration::hours(48)).await;
        fx.gateway.settle("cs_sync", SessionPaymentState::Paid).await;

        let report = fx.sync.sync("cs_sync", Utc::now()).await.unwrap();

        assert_eq!(report.status, SyncStatus::Accepted);
        assert_eq!(
            fx.store.get_offer(fx.offer_id).await.unwrap().unwrap().status,
            OfferStatus::Accepted
        );
        assert_eq!(fx.store.contract_count().await, 1);
    }

    #[tokio::test]
    async fn webhook_then_poll_and_poll_then_webhook_converge() {
        let webhook_first = fixture(ChronoDuration::hours(48)).await;
        webhook_first
            .gateway
            .settle("cs_sync", SessionPaymentState::Paid)
            .await;
        webhook_first
            .reconciler
            .reconcile_now(webhook_first.offer_id)
            .await
            .unwrap();
        let report = webhook_first.sync.sync("cs_sync", Utc::now()).await.unwrap();
        assert_eq!(report.status, SyncStatus::Accepted);

        let poll_first = fixture(ChronoDuration::hours(48)).await;
        poll_first.gateway.settle("cs_sync", SessionPaymentState::Paid).await;
        poll_first.sync.sync("cs_sync", Utc::now()).await.unwrap();
        let outcome = poll_first
            .reconciler
            .reconcile_now(poll_first.offer_id)
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Accepted { transitioned: false, .. }));

        for fx in [&webhook_first, &poll_first] {
            assert_eq!(fx.store.contract_count().await, 1);
            assert_eq!(fx.store.payout_count().await, 1);
            assert_eq!(fx.store.announcement_count(fx.offer_id).await, 1);
        }
    }

    #[tokio::test]
    async fn unknown_session_and_foreign_reference_report_error() {
        let fx = fixture(ChronoDuration::hours(48)).await;
        let report = fx.sync.sync("cs_missing", Utc::now()).await.unwrap();
        assert_eq!(report.status, SyncStatus::Error);

        fx.gateway
            .insert_session(
                "cs_plan",
                CheckoutSessionRequest {
                    client_reference: "plan:pro".to_string(),
                    amount_cents: 900,
                    currency: "usd".to_string(),
                    description: "Pro".to_string(),
                    success_url: "https://app.example/ok".to_string(),
                    cancel_url: "https://app.example/cancel".to_string(),
                    expires_at: None,
                },
                SessionPaymentState::Paid,
            )
            .await;
        let report = fx.sync.sync("cs_plan", Utc::now()).await.unwrap();
        assert_eq!(report.status, SyncStatus::Error);
        assert_eq!(report.offer_id, None);
    }

    #[tokio::test]
    async fn path_like_session_id_is_refused_before_the_gateway() {
        let fx = fixture(ChronoDuration::hours(48)).await;
        // An outage would surface as an upstream error if the gateway were asked.
        fx.gateway.set_unavailable(true);

        let report = fx
            .sync
            .sync("../../customers/cus_123", Utc::now())
            .await
            .unwrap();

        assert_eq!(report.status, SyncStatus::Error);
        assert_eq!(report.offer_id, None);
        assert_eq!(report.detail.as_deref(), Some("invalid checkout session id"));
    }

    #[tokio::test]
    async fn store_outage_during_paid_sync_is_a_reconcile_error() {
        let fx = fixture(ChronoDuration::hours(48)).await;
        fx.gateway.settle("cs_sync", SessionPaymentState::Paid).await;
        fx.store.set_fault(FaultPoint::TransitionOffer, true).await;

        let err = fx.sync.sync("cs_sync", Utc::now()).await.unwrap_err();
        assert!(matches!(err, SyncError::Reconcile(_)));

        fx.store.set_fault(FaultPoint::TransitionOffer, false).await;
        let report = fx.sync.sync("cs_sync", Utc::now()).await.unwrap();
        assert_eq!(report.status, SyncStatus::Accepted);
    }

    #[tokio::test]
    async fn paid_after_expiry_reports_error_without_acceptance() {
        let fx = fixture(ChronoDuration::milliseconds(1)).await;
        fx.gateway.settle("cs_sync", SessionPaymentState::Paid).await;

        let report = fx
            .sync
            .sync("cs_sync", Utc::now() + ChronoDuration::seconds(5))
            .await
            .unwrap();

        assert_eq!(report.status, SyncStatus::Error);
        assert_eq!(report.detail.as_deref(), Some("offer is expired"));
        assert_eq!(fx.store.contract_count().await, 0);
    }

    #[tokio::test]
    async fn gateway_outage_is_surfaced() {
        let fx = fixture(ChronoDuration::hours(48)).await;
        fx.gateway.set_unavailable(true);
        let err = fx.sync.sync("cs_sync", Utc::now()).await.unwrap_err();
        assert!(matches!(err, SyncError::Upstream(GatewayError::Unavailable(_))));
    }

    #[tokio::test]
    async fn poller_gives_up_after_bounded_attempts() {
        let fx = fixture(ChronoDuration::hours(48)).await;
        let poller = SyncPoller {
            attempts: 3,
            interval: Duration::from_millis(5),
        };

        let report = poller.poll(&fx.sync, "cs_sync").await.unwrap();
        assert_eq!(report.status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn poller_returns_once_settled() {
        let fx = fixture(ChronoDuration::hours(48)).await;
        fx.gateway.settle("cs_sync", SessionPaymentState::Paid).await;
        let report = SyncPoller {
            attempts: 5,
            interval: Duration::from_millis(5),
        }
        .poll(&fx.sync, "cs_sync")
        .await
        .unwrap();
        assert_eq!(report.status, SyncStatus::Accepted);
    }

    #[tokio::test]
    async fn poller_reports_persistent_outage() {
        let fx = fixture(ChronoDuration::hours(48)).await;
        fx.gateway.set_unavailable(true);
        let result = SyncPoller {
            attempts: 2,
            interval: Duration::from_millis(1),
        }
        .poll(&fx.sync, "cs_sync")
        .await;
        assert!(matches!(result, Err(SyncError::Upstream(_))));
    }
}
