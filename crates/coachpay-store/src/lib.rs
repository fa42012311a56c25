mod checkout;

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coachpay_core::{
    CoachGrant, Contract, Conversation, ConversationStore, CustomerProfile, EngagementStore,
    InsertOutcome, Message, MessageKind, NewOffer, Offer, OfferStatus, OfferStore, Payout,
    ProfileStore, ProvisioningStep, StepLedger, StoreError, TransitionOutcome,
};
use tokio::sync::RwLock;
use uuid::Uuid;

pub use checkout::InMemoryPaymentGateway;

/// Operations that can be forced to fail, for exercising partial provisioning
/// and backend outages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    ReadOffer,
    TransitionOffer,
    GrantCoach,
    InsertPayout,
    InsertContract,
    AppendMessage,
}

#[derive(Default)]
struct Tables {
    offers: HashMap<Uuid, Offer>,
    profiles: HashMap<Uuid, CustomerProfile>,
    contracts: HashMap<Uuid, Contract>,
    payouts: HashMap<Uuid, Payout>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    steps: HashMap<Uuid, BTreeSet<ProvisioningStep>>,
    redrive_attempts: HashMap<Uuid, RedriveAttempts>,
}

#[derive(Debug, Clone, Copy)]
struct RedriveAttempts {
    count: u32,
    last_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    faults: RwLock<HashSet<FaultPoint>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_profile(&self, profile: CustomerProfile) {
        self.tables.write().await.profiles.insert(profile.id, profile);
    }

    /// Overwrites an offer row as-is, bypassing transition rules.
    pub async fn put_offer(&self, offer: Offer) {
        self.tables.write().await.offers.insert(offer.id, offer);
    }

    pub async fn set_fault(&self, point: FaultPoint, failing: bool) {
        let mut faults = self.faults.write().await;
        if failing {
            faults.insert(point);
        } else {
            faults.remove(&point);
        }
    }

    pub async fn offer_count(&self) -> usize {
        self.tables.read().await.offers.len()
    }

    pub async fn contract_count(&self) -> usize {
        self.tables.read().await.contracts.len()
    }

    pub async fn payout_count(&self) -> usize {
        self.tables.read().await.payouts.len()
    }

    pub async fn announcement_count(&self, offer_id: Uuid) -> usize {
        self.tables
            .read()
            .await
            .messages
            .iter()
            .filter(|message| {
                message.kind == MessageKind::OfferAccepted && message.offer_id == Some(offer_id)
            })
            .count()
    }

    async fn check_fault(&self, point: FaultPoint) -> Result<(), StoreError> {
        if self.faults.read().await.contains(&point) {
            return Err(StoreError::Backend(format!("injected fault at {point:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl OfferStore for InMemoryStore {
    async fn create_offer(&self, offer: NewOffer, now: DateTime<Utc>) -> Result<Offer, StoreError> {
        let offer = Offer {
            id: Uuid::new_v4(),
            coach_id: offer.coach_id,
            customer_id: offer.customer_id,
            originating_message_id: offer.originating_message_id,
            price: offer.price,
            duration_months: offer.duration_months,
            status: OfferStatus::Pending,
            expires_at: offer.expires_at,
            created_at: now,
            updated_at: now,
        };
        self.tables.write().await.offers.insert(offer.id, offer.clone());
        Ok(offer)
    }

    async fn get_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, StoreError> {
        self.check_fault(FaultPoint::ReadOffer).await?;
        Ok(self.tables.read().await.offers.get(&offer_id).cloned())
    }

    async fn transition_offer(
        &self,
        offer_id: Uuid,
        from: OfferStatus,
        to: OfferStatus,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        self.check_fault(FaultPoint::TransitionOffer).await?;
        let mut tables = self.tables.write().await;
        let Some(offer) = tables.offers.get_mut(&offer_id) else {
            return Err(StoreError::NotFound(format!("offer {offer_id}")));
        };

        if offer.status != from || (to == OfferStatus::Accepted && offer.is_past_expiry(now)) {
            return Ok(TransitionOutcome::Conflict);
        }

        offer.status = to;
        offer.updated_at = now;
        Ok(TransitionOutcome::Applied)
    }

    async fn pending_past_expiry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let tables = self.tables.read().await;
        let mut stale: Vec<&Offer> = tables
            .offers
            .values()
            .filter(|offer| offer.status == OfferStatus::Pending && offer.is_past_expiry(now))
            .collect();
        stale.sort_by_key(|offer| offer.expires_at);
        Ok(stale
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|offer| offer.id)
            .collect())
    }
}

#[async_trait]
impl ProfileStore for InMemoryStore {
    async fn get_profile(&self, profile_id: Uuid) -> Result<Option<CustomerProfile>, StoreError> {
        Ok(self.tables.read().await.profiles.get(&profile_id).cloned())
    }

    async fn grant_coach(&self, grant: &CoachGrant) -> Result<(), StoreError> {
        self.check_fault(FaultPoint::GrantCoach).await?;
        let mut tables = self.tables.write().await;
        let profile = tables
            .profiles
            .get_mut(&grant.customer_id)
            .ok_or_else(|| StoreError::NotFound(format!("profile {}", grant.customer_id)))?;
        profile.coach_id = Some(grant.coach_id);
        profile.plan = Some(grant.plan.clone());
        profile.plan_expiry = Some(grant.plan_expiry);
        profile.updated_at = grant.granted_at;
        Ok(())
    }

    async fn downgrade_platform_plan(
        &self,
        profile_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(profile) = tables.profiles.get_mut(&profile_id) else {
            return Ok(false);
        };
        profile.platform_plan = "free".to_string();
        profile.updated_at = now;
        Ok(true)
    }
}

#[async_trait]
impl EngagementStore for InMemoryStore {
    async fn insert_contract(&self, contract: &Contract) -> Result<InsertOutcome, StoreError> {
        self.check_fault(FaultPoint::InsertContract).await?;
        let mut tables = self.tables.write().await;
        if tables.contracts.contains_key(&contract.offer_id) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        tables.contracts.insert(contract.offer_id, contract.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn insert_payout(&self, payout: &Payout) -> Result<InsertOutcome, StoreError> {
        self.check_fault(FaultPoint::InsertPayout).await?;
        let mut tables = self.tables.write().await;
        if tables.payouts.contains_key(&payout.offer_id) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        tables.payouts.insert(payout.offer_id, payout.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn contract_for_offer(&self, offer_id: Uuid) -> Result<Option<Contract>, StoreError> {
        Ok(self.tables.read().await.contracts.get(&offer_id).cloned())
    }

    async fn payout_for_offer(&self, offer_id: Uuid) -> Result<Option<Payout>, StoreError> {
        Ok(self.tables.read().await.payouts.get(&offer_id).cloned())
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn find_or_create_conversation(
        &self,
        coach_id: Uuid,
        customer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Conversation, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .conversations
            .iter()
            .find(|conv| conv.coach_id == coach_id && conv.customer_id == customer_id)
        {
            return Ok(existing.clone());
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            coach_id,
            customer_id,
            created_at: now,
        };
        tables.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn append_message(&self, message: &Message) -> Result<InsertOutcome, StoreError> {
        self.check_fault(FaultPoint::AppendMessage).await?;
        let mut tables = self.tables.write().await;
        let duplicate_announcement = message.kind == MessageKind::OfferAccepted
            && tables.messages.iter().any(|existing| {
                existing.kind == MessageKind::OfferAccepted && existing.offer_id == message.offer_id
            });
        if duplicate_announcement {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        tables.messages.push(message.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn acceptance_announcement(&self, offer_id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .messages
            .iter()
            .find(|message| {
                message.kind == MessageKind::OfferAccepted && message.offer_id == Some(offer_id)
            })
            .cloned())
    }

    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StepLedger for InMemoryStore {
    async fn completed_steps(
        &self,
        offer_id: Uuid,
    ) -> Result<BTreeSet<ProvisioningStep>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .steps
            .get(&offer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_step_completed(
        &self,
        offer_id: Uuid,
        step: ProvisioningStep,
        _at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .steps
            .entry(offer_id)
            .or_default()
            .insert(step);
        Ok(())
    }

    async fn incomplete_accepted_offers(
        &self,
        max_attempts: u32,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let tables = self.tables.read().await;
        let mut due: Vec<(Option<DateTime<Utc>>, DateTime<Utc>, Uuid)> = tables
            .offers
            .values()
            .filter(|offer| offer.status == OfferStatus::Accepted)
            .filter(|offer| {
                tables
                    .steps
                    .get(&offer.id)
                    .is_none_or(|done| done.len() < ProvisioningStep::ALL.len())
            })
            .filter_map(|offer| match tables.redrive_attempts.get(&offer.id) {
                Some(attempts) if attempts.count >= max_attempts => None,
                Some(attempts) => Some((Some(attempts.last_at), offer.updated_at, offer.id)),
                None => Some((None, offer.updated_at, offer.id)),
            })
            .collect();
        due.sort();

        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|(_, _, offer_id)| offer_id)
            .collect())
    }

    async fn record_redrive_attempt(
        &self,
        offer_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut tables = self.tables.write().await;
        let attempts = tables
            .redrive_attempts
            .entry(offer_id)
            .and_modify(|attempts| {
                attempts.count += 1;
                attempts.last_at = at;
            })
            .or_insert(RedriveAttempts {
                count: 1,
                last_at: at,
            });
        Ok(attempts.count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal::Decimal;

    use super::*;

    fn new_offer(expires_at: DateTime<Utc>) -> NewOffer {
        NewOffer {
            coach_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            originating_message_id: Uuid::new_v4(),
            price: Decimal::new(120, 0),
            duration_months: 1,
            expires_at,
        }
    }

    #[tokio::test]
    async fn conditional_transition_only_applies_once() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let offer = store
            .create_offer(new_offer(now + Duration::hours(1)), now)
            .await
            .unwrap();

        let first = store
            .transition_offer(offer.id, OfferStatus::Pending, OfferStatus::Accepted, now)
            .await
            .unwrap();
        let second = store
            .transition_offer(offer.id, OfferStatus::Pending, OfferStatus::Accepted, now)
            .await
            .unwrap();

        assert_eq!(first, TransitionOutcome::Applied);
        assert_eq!(second, TransitionOutcome::Conflict);
    }

    #[tokio::test]
    async fn acceptance_refused_past_expiry() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let offer = store
            .create_offer(new_offer(now - Duration::minutes(1)), now)
            .await
            .unwrap();

        let outcome = store
            .transition_offer(offer.id, OfferStatus::Pending, OfferStatus::Accepted, now)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Conflict);
        assert_eq!(
            store.pending_past_expiry(now, 10).await.unwrap(),
            vec![offer.id]
        );
    }

    #[tokio::test]
    async fn conversation_is_reused_per_pair() {
        let store = InMemoryStore::new();
        let (coach, customer) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let first = store
            .find_or_create_conversation(coach, customer, now)
            .await
            .unwrap();
        let second = store
            .find_or_create_conversation(coach, customer, now)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn second_announcement_for_offer_is_fenced() {
        let store = InMemoryStore::new();
        let offer_id = Uuid::new_v4();
        let message = |id| Message {
            id,
            conversation_id: Uuid::new_v4(),
            sender_id: None,
            kind: MessageKind::OfferAccepted,
            offer_id: Some(offer_id),
            body: "activated".to_string(),
            created_at: Utc::now(),
        };

        assert_eq!(
            store.append_message(&message(Uuid::new_v4())).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.append_message(&message(Uuid::new_v4())).await.unwrap(),
            InsertOutcome::AlreadyPresent
        );
        assert_eq!(store.announcement_count(offer_id).await, 1);
    }

    #[tokio::test]
    async fn redrive_queue_rotates_and_parks_attempted_offers() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut accepted = Vec::new();
        for offset in 0..2 {
            let offer = store
                .create_offer(new_offer(now + Duration::hours(1)), now)
                .await
                .unwrap();
            store
                .transition_offer(
                    offer.id,
                    OfferStatus::Pending,
                    OfferStatus::Accepted,
                    now + Duration::seconds(offset),
                )
                .await
                .unwrap();
            accepted.push(offer.id);
        }

        assert_eq!(store.incomplete_accepted_offers(3, 1).await.unwrap(), vec![accepted[0]]);
        assert_eq!(store.record_redrive_attempt(accepted[0], now).await.unwrap(), 1);
        assert_eq!(store.incomplete_accepted_offers(3, 1).await.unwrap(), vec![accepted[1]]);

        assert_eq!(store.record_redrive_attempt(accepted[0], now).await.unwrap(), 2);
        assert_eq!(store.incomplete_accepted_offers(2, 10).await.unwrap(), vec![accepted[1]]);
    }

    #[tokio::test]
    async fn offer_reads_fail_while_faulted() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let offer = store
            .create_offer(new_offer(now + Duration::hours(1)), now)
            .await
            .unwrap();

        store.set_fault(FaultPoint::ReadOffer, true).await;
        assert!(matches!(
            store.get_offer(offer.id).await,
            Err(StoreError::Backend(_))
        ));
        store.set_fault(FaultPoint::ReadOffer, false).await;
        assert!(store.get_offer(offer.id).await.unwrap().is_some());
    }
}
