use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use coachpay_core::{
    MAX_OFFER_VALIDITY_HOURS, Message, MessageKind, NewOffer, Offer, OfferStatus, ReconcileStore,
    StoreError, TransitionOutcome,
};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::expiry::{ExpiryMonitor, NotActionable};

const MAX_DURATION_MONTHS: u32 = 36;

#[derive(Debug, thiserror::Error)]
pub enum OfferError {
    #[error("{0}")]
    Invalid(String),
    #[error("offer {0} not found")]
    NotFound(Uuid),
    #[error("offer {0} belongs to another customer")]
    Forbidden(Uuid),
    #[error("offer {offer_id} is {status}")]
    InvalidState { offer_id: Uuid, status: OfferStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct OfferDraft {
    pub coach_id: Uuid,
    pub customer_id: Uuid,
    pub price: Decimal,
    pub duration_months: u32,
    pub expires_in: Option<Duration>,
}

/// Coach-side authoring and customer-side rejection of offers.
pub struct OfferDesk {
    store: Arc<dyn ReconcileStore>,
    default_ttl: Duration,
}

impl OfferDesk {
    pub fn new(store: Arc<dyn ReconcileStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    /// Posts the priced message into the pair's conversation and records the pending offer.
    pub async fn create(
        &self,
        draft: OfferDraft,
        now: DateTime<Utc>,
    ) -> Result<Offer, OfferError> {
        if draft.coach_id == draft.customer_id {
            return Err(OfferError::Invalid("coach and customer must differ".to_string()));
        }
        if draft.price <= Decimal::ZERO {
            return Err(OfferError::Invalid("price must be positive".to_string()));
        }
        let price = draft.price.normalize();
        if price.scale() > 2 {
            return Err(OfferError::Invalid("price supports at most 2 decimals".to_string()));
        }
        if !(1..=MAX_DURATION_MONTHS).contains(&draft.duration_months) {
            return Err(OfferError::Invalid(format!(
                "duration_months must be between 1 and {MAX_DURATION_MONTHS}"
            )));
        }
        let ttl = draft.expires_in.unwrap_or(self.default_ttl);
        if ttl <= Duration::zero() {
            return Err(OfferError::Invalid("offer validity must be positive".to_string()));
        }
        if ttl > Duration::hours(MAX_OFFER_VALIDITY_HOURS) {
            return Err(OfferError::Invalid(format!(
                "offer validity must not exceed {MAX_OFFER_VALIDITY_HOURS} hours"
            )));
        }
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| OfferError::Invalid("offer validity is out of range".to_string()))?;

        let conversation = self
            .store
            .find_or_create_conversation(draft.coach_id, draft.customer_id, now)
            .await?;
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            sender_id: Some(draft.coach_id),
            kind: MessageKind::Offer,
            offer_id: None,
            body: format!(
                "Coaching offer: {} month(s) for {}",
                draft.duration_months,
                price.round_dp(2)
            ),
            created_at: now,
        };
        self.store.append_message(&message).await?;

        let offer = self
            .store
            .create_offer(
                NewOffer {
                    coach_id: draft.coach_id,
                    customer_id: draft.customer_id,
                    originating_message_id: message.id,
                    price,
                    duration_months: draft.duration_months,
                    expires_at,
                },
                now,
            )
            .await?;
        info!(offer_id = %offer.id, conversation_id = %conversation.id, "offer created");
        Ok(offer)
    }

    pub async fn get(&self, offer_id: Uuid) -> Result<Offer, OfferError> {
        self.store
            .get_offer(offer_id)
            .await?
            .ok_or(OfferError::NotFound(offer_id))
    }

    pub async fn reject(
        &self,
        offer_id: Uuid,
        customer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Offer, OfferError> {
        let offer = self.get(offer_id).await?;
        if offer.customer_id != customer_id {
            return Err(OfferError::Forbidden(offer_id));
        }
        ExpiryMonitor::ensure_actionable(&offer, now)
            .map_err(|NotActionable(status)| OfferError::InvalidState { offer_id, status })?;

        match self
            .store
            .transition_offer(offer_id, OfferStatus::Pending, OfferStatus::Rejected, now)
            .await?
        {
            TransitionOutcome::Applied => {
                info!(offer_id = %offer_id, "offer rejected");
                Ok(Offer {
                    status: OfferStatus::Rejected,
                    updated_at: now,
                    ..offer
                })
            }
            TransitionOutcome::Conflict => {
                let current = self.get(offer_id).await?;
                Err(OfferError::InvalidState {
                    offer_id,
                    status: current.effective_status(now),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use coachpay_core::{ConversationStore, OfferStore};
    use coachpay_store::InMemoryStore;

    use super::*;

    fn desk(store: &Arc<InMemoryStore>) -> OfferDesk {
        OfferDesk::new(store.clone(), Duration::hours(48))
    }

    fn draft() -> OfferDraft {
        OfferDraft {
            coach_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            price: Decimal::new(30000, 2),
            duration_months: 2,
            expires_in: None,
        }
    }

    #[tokio::test]
    async fn create_posts_message_and_pending_offer() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let offer = desk(&store).create(draft(), now).await.unwrap();

        assert_eq!(offer.status, OfferStatus::Pending);
        assert_eq!(offer.expires_at, now + Duration::hours(48));
        assert_eq!(offer.price, Decimal::new(300, 0));

        let conversation = store
            .find_or_create_conversation(offer.coach_id, offer.customer_id, now)
            .await
            .unwrap();
        let messages = store.conversation_messages(conversation.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, offer.originating_message_id);
        assert_eq!(messages[0].kind, MessageKind::Offer);
    }

    #[tokio::test]
    async fn create_validates_terms() {
        let store = Arc::new(InMemoryStore::new());
        let desk = desk(&store);
        let now = Utc::now();

        let zero_months = OfferDraft {
            duration_months: 0,
            ..draft()
        };
        assert!(matches!(
            desk.create(zero_months, now).await,
            Err(OfferError::Invalid(_))
        ));

        let free = OfferDraft {
            price: Decimal::ZERO,
            ..draft()
        };
        assert!(matches!(desk.create(free, now).await, Err(OfferError::Invalid(_))));

        let sub_cent = OfferDraft {
            price: Decimal::new(10001, 3),
            ..draft()
        };
        assert!(matches!(
            desk.create(sub_cent, now).await,
            Err(OfferError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn validity_beyond_the_cap_is_refused_without_side_effects() {
        let store = Arc::new(InMemoryStore::new());
        let desk = desk(&store);
        let now = Utc::now();

        for expires_in in [
            Duration::hours(MAX_OFFER_VALIDITY_HOURS + 1),
            Duration::hours(2_600_000_000),
            Duration::MAX,
        ] {
            let long = OfferDraft {
                expires_in: Some(expires_in),
                ..draft()
            };
            assert!(matches!(desk.create(long, now).await, Err(OfferError::Invalid(_))));
        }
        assert_eq!(store.offer_count().await, 0);

        let longest = OfferDraft {
            expires_in: Some(Duration::hours(MAX_OFFER_VALIDITY_HOURS)),
            ..draft()
        };
        let offer = desk.create(longest, now).await.unwrap();
        assert_eq!(offer.expires_at, now + Duration::hours(MAX_OFFER_VALIDITY_HOURS));
    }

    #[tokio::test]
    async fn only_the_customer_can_reject_and_only_once() {
        let store = Arc::new(InMemoryStore::new());
        let desk = desk(&store);
        let now = Utc::now();
        let offer = desk.create(draft(), now).await.unwrap();

        let err = desk.reject(offer.id, Uuid::new_v4(), now).await.unwrap_err();
        assert!(matches!(err, OfferError::Forbidden(_)));

        let rejected = desk.reject(offer.id, offer.customer_id, now).await.unwrap();
        assert_eq!(rejected.status, OfferStatus::Rejected);

        let err = desk.reject(offer.id, offer.customer_id, now).await.unwrap_err();
        assert!(matches!(
            err,
            OfferError::InvalidState { status: OfferStatus::Rejected, .. }
        ));
    }

    #[tokio::test]
    async fn expired_offer_cannot_be_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let desk = desk(&store);
        let now = Utc::now();
        let offer = desk.create(draft(), now).await.unwrap();

        let err = desk
            .reject(offer.id, offer.customer_id, now + Duration::hours(49))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OfferError::InvalidState { status: OfferStatus::Expired, .. }
        ));
    }
}
