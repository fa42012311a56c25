use std::sync::Arc;

use chrono::{DateTime, Utc};
use coachpay_core::{Offer, OfferStatus, ReconcileStore, StoreError, TransitionOutcome};
use tracing::{debug, info};

/// The offer's effective status at the time of the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotActionable(pub OfferStatus);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirySweep {
    pub expired: usize,
    pub raced: usize,
}

/// Expiry is decided at read time. The sweep only persists what reads already imply.
pub struct ExpiryMonitor {
    store: Arc<dyn ReconcileStore>,
}

impl ExpiryMonitor {
    pub fn new(store: Arc<dyn ReconcileStore>) -> Self {
        Self { store }
    }

    pub fn ensure_actionable(offer: &Offer, now: DateTime<Utc>) -> Result<(), NotActionable> {
        match offer.effective_status(now) {
            OfferStatus::Pending => Ok(()),
            status => Err(NotActionable(status)),
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>, limit: i64) -> Result<ExpirySweep, StoreError> {
        let mut sweep = ExpirySweep::default();
        for offer_id in self.store.pending_past_expiry(now, limit).await? {
            match self
                .store
                .transition_offer(offer_id, OfferStatus::Pending, OfferStatus::Expired, now)
                .await?
            {
                TransitionOutcome::Applied => sweep.expired += 1,
                TransitionOutcome::Conflict => {
                    debug!(offer_id = %offer_id, "offer left pending before expiry sweep");
                    sweep.raced += 1;
                }
            }
        }
        if sweep.expired > 0 {
            info!(expired = sweep.expired, "expired stale offers");
        }
        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use coachpay_core::{NewOffer, OfferStore};
    use coachpay_store::InMemoryStore;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::*;

    async fn offer_expiring(store: &InMemoryStore, expires_at: DateTime<Utc>) -> Offer {
        store
            .create_offer(
                NewOffer {
                    coach_id: Uuid::new_v4(),
                    customer_id: Uuid::new_v4(),
                    originating_message_id: Uuid::new_v4(),
                    price: Decimal::new(80, 0),
                    duration_months: 1,
                    expires_at,
                },
                expires_at - Duration::hours(48),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sweep_persists_only_stale_pending_offers() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let stale = offer_expiring(&store, now - Duration::minutes(5)).await;
        let fresh = offer_expiring(&store, now + Duration::minutes(5)).await;

        let sweep = ExpiryMonitor::new(store.clone()).sweep(now, 50).await.unwrap();

        assert_eq!(
            sweep,
            ExpirySweep {
                expired: 1,
                raced: 0
            }
        );
        let stale = store.get_offer(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, OfferStatus::Expired);
        let fresh = store.get_offer(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, OfferStatus::Pending);
    }

    #[test]
    fn actionable_only_while_pending_and_unexpired() {
        let now = Utc::now();
        let offer = Offer {
            id: Uuid::new_v4(),
            coach_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            originating_message_id: Uuid::new_v4(),
            price: Decimal::new(80, 0),
            duration_months: 1,
            status: OfferStatus::Pending,
            expires_at: now,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(ExpiryMonitor::ensure_actionable(&offer, now), Ok(()));
        assert_eq!(
            ExpiryMonitor::ensure_actionable(&offer, now + Duration::seconds(1)),
            Err(NotActionable(OfferStatus::Expired))
        );
    }
}
