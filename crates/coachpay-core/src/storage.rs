use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    CoachGrant, Contract, Conversation, CustomerProfile, Message, NewOffer, Offer, OfferStatus,
    Payout,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("stored record is invalid: {0}")]
    Corrupt(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The stored status no longer matched `from`; another path got there first.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Dependent writes performed after an offer is accepted, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProvisioningStep {
    GrantRelationship,
    SchedulePayout,
    CreateContract,
    Announce,
}

impl ProvisioningStep {
    pub const ALL: [ProvisioningStep; 4] = [
        Self::GrantRelationship,
        Self::SchedulePayout,
        Self::CreateContract,
        Self::Announce,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GrantRelationship => "grant_relationship",
            Self::SchedulePayout => "schedule_payout",
            Self::CreateContract => "create_contract",
            Self::Announce => "announce",
        }
    }
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisioningStep {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == value)
            .ok_or_else(|| format!("unknown provisioning step {value}"))
    }
}

#[async_trait]
pub trait OfferStore: Send + Sync {
    async fn create_offer(&self, offer: NewOffer, now: DateTime<Utc>) -> Result<Offer, StoreError>;

    async fn get_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, StoreError>;

    /// Conditional write: succeeds only while the stored status still equals `from`.
    /// A move to `accepted` additionally requires `expires_at` to be at or after `now`.
    async fn transition_offer(
        &self,
        offer_id: Uuid,
        from: OfferStatus,
        to: OfferStatus,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Offers still stored as `pending` whose `expires_at` is before `now`.
    async fn pending_past_expiry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, profile_id: Uuid) -> Result<Option<CustomerProfile>, StoreError>;

    /// Fails with `NotFound` when the customer has no profile row.
    async fn grant_coach(&self, grant: &CoachGrant) -> Result<(), StoreError>;

    /// Returns false when no profile matched.
    async fn downgrade_platform_plan(
        &self,
        profile_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Contracts and payouts. Both are fenced by uniqueness on `offer_id`.
#[async_trait]
pub trait EngagementStore: Send + Sync {
    async fn insert_contract(&self, contract: &Contract) -> Result<InsertOutcome, StoreError>;

    async fn insert_payout(&self, payout: &Payout) -> Result<InsertOutcome, StoreError>;

    async fn contract_for_offer(&self, offer_id: Uuid) -> Result<Option<Contract>, StoreError>;

    async fn payout_for_offer(&self, offer_id: Uuid) -> Result<Option<Payout>, StoreError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_or_create_conversation(
        &self,
        coach_id: Uuid,
        customer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Conversation, StoreError>;

    /// Acceptance announcements are unique per offer; a second one reports `AlreadyPresent`.
    async fn append_message(&self, message: &Message) -> Result<InsertOutcome, StoreError>;

    async fn acceptance_announcement(&self, offer_id: Uuid) -> Result<Option<Message>, StoreError>;

    async fn conversation_messages(&self, conversation_id: Uuid)
    -> Result<Vec<Message>, StoreError>;
}

/// Durable record of which provisioning steps finished for an accepted offer.
#[async_trait]
pub trait StepLedger: Send + Sync {
    async fn completed_steps(&self, offer_id: Uuid)
    -> Result<BTreeSet<ProvisioningStep>, StoreError>;

    async fn mark_step_completed(
        &self,
        offer_id: Uuid,
        step: ProvisioningStep,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Accepted offers with at least one provisioning step outstanding and fewer than
    /// `max_attempts` recorded re-drive attempts. Offers never re-driven come first,
    /// then the least recently attempted.
    async fn incomplete_accepted_offers(
        &self,
        max_attempts: u32,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Counts one re-drive that left the offer incomplete and returns the new total.
    async fn record_redrive_attempt(
        &self,
        offer_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError>;
}

pub trait ReconcileStore:
    OfferStore + ProfileStore + EngagementStore + ConversationStore + StepLedger
{
}

impl<T> ReconcileStore for T where
    T: OfferStore + ProfileStore + EngagementStore + ConversationStore + StepLedger
{
}
