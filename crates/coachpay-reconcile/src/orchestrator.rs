//! Drives a paid offer to `accepted` and provisions everything hanging off it.
//!
//! Both the webhook and the client sync path call [`Reconciler::reconcile`].
//! The conditional `pending -> accepted` write is the only serialization point;
//! every later step is fenced by uniqueness on the offer id and recorded in the
//! step ledger, so a re-invocation resumes whatever a previous run left undone.
//! A failed step never reverts the transition.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use coachpay_core::{
    AcceptanceNotifier, CoachGrant, Contract, EngagementTerm, EntitlementUnit, InsertOutcome,
    Message, MessageKind, Offer, OfferAcceptedEvent, OfferStatus, Payout, ProvisioningStep,
    ReconcileStore, StoreError, TransitionOutcome, payout_split,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_COACHED_PLAN: &str = "coaching";
const CONTRACT_STATUS_ACTIVE: &str = "active";
const PAYOUT_STATUS_PENDING: &str = "pending";

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub entitlement_unit: EntitlementUnit,
    pub coached_plan: String,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            entitlement_unit: EntitlementUnit::Months,
            coached_plan: DEFAULT_COACHED_PLAN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    /// Rejected, or expired by stored status or by `expires_at`.
    Terminal(OfferStatus),
    /// Lost the conditional write but the offer is still not accepted.
    Unsettled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: ProvisioningStep,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningReport {
    pub completed: Vec<ProvisioningStep>,
    pub already_done: Vec<ProvisioningStep>,
    pub failed: Vec<StepFailure>,
}

impl ProvisioningReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The offer is accepted. `transitioned` is true only for the invocation that won the write.
    Accepted {
        transitioned: bool,
        report: ProvisioningReport,
    },
    Skipped(SkipReason),
}

impl ReconcileOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("offer {offer_id}: {source}")]
    Store {
        offer_id: Uuid,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0} overflowed")]
    Arithmetic(&'static str),
}

pub struct Reconciler {
    store: Arc<dyn ReconcileStore>,
    notifier: Option<Arc<dyn AcceptanceNotifier>>,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ReconcileStore>, settings: ReconcileSettings) -> Self {
        Self {
            store,
            notifier: None,
            settings,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AcceptanceNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub async fn reconcile_now(&self, offer_id: Uuid) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile(offer_id, Utc::now()).await
    }

    /// `now` is captured once by the caller and used for the expiry check and every derived date.
    pub async fn reconcile(
        &self,
        offer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let store_err = |source| ReconcileError::Store { offer_id, source };

        let Some(offer) = self.store.get_offer(offer_id).await.map_err(store_err)? else {
            info!(offer_id = %offer_id, "reconcile skipped: offer not found");
            return Ok(ReconcileOutcome::Skipped(SkipReason::NotFound));
        };

        let (offer, transitioned) = match offer.effective_status(now) {
            OfferStatus::Accepted => (offer, false),
            OfferStatus::Pending => {
                let outcome = self
                    .store
                    .transition_offer(offer_id, OfferStatus::Pending, OfferStatus::Accepted, now)
                    .await
                    .map_err(store_err)?;
                match outcome {
                    TransitionOutcome::Applied => {
                        info!(offer_id = %offer_id, "offer accepted");
                        (
                            Offer {
                                status: OfferStatus::Accepted,
                                updated_at: now,
                                ..offer
                            },
                            true,
                        )
                    }
                    TransitionOutcome::Conflict => {
                        match self.after_lost_accept(offer_id, now).await? {
                            Ok(current) => (current, false),
                            Err(reason) => return Ok(ReconcileOutcome::Skipped(reason)),
                        }
                    }
                }
            }
            terminal => {
                warn!(
                    offer_id = %offer_id,
                    status = %terminal,
                    "payment confirmed for an offer that can no longer be accepted"
                );
                return Ok(ReconcileOutcome::Skipped(SkipReason::Terminal(terminal)));
            }
        };

        // The acceptance write stamps updated_at; re-runs derive dates from it.
        let accepted_at = offer.updated_at;
        let report = self.provision(&offer, accepted_at, now).await;

        if transitioned {
            self.notify(&offer, accepted_at).await;
        }

        Ok(ReconcileOutcome::Accepted {
            transitioned,
            report,
        })
    }

    /// Re-reads an offer whose conditional accept matched no row.
    async fn after_lost_accept(
        &self,
        offer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Result<Offer, SkipReason>, ReconcileError> {
        let store_err = |source| ReconcileError::Store { offer_id, source };
        let current = self
            .store
            .get_offer(offer_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| store_err(StoreError::NotFound(format!("offer {offer_id}"))))?;

        Ok(match current.effective_status(now) {
            OfferStatus::Accepted => {
                debug!(offer_id = %offer_id, "offer accepted by a concurrent path");
                Ok(current)
            }
            OfferStatus::Pending => {
                warn!(offer_id = %offer_id, "conditional accept lost without a terminal status");
                Err(SkipReason::Unsettled)
            }
            terminal => {
                info!(
                    offer_id = %offer_id,
                    status = %terminal,
                    "reconcile skipped: offer became terminal"
                );
                Err(SkipReason::Terminal(terminal))
            }
        })
    }

    async fn provision(
        &self,
        offer: &Offer,
        accepted_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ProvisioningReport {
        let done = match self.store.completed_steps(offer.id).await {
            Ok(done) => done,
            Err(err) => {
                warn!(
                    offer_id = %offer.id,
                    error = %err,
                    "step ledger unavailable, relying on fences"
                );
                BTreeSet::new()
            }
        };

        let mut report = ProvisioningReport::default();
        for step in ProvisioningStep::ALL {
            if done.contains(&step) {
                report.already_done.push(step);
                continue;
            }

            match self.run_step(step, offer, accepted_at, now).await {
                Ok(()) => {
                    if let Err(err) = self.store.mark_step_completed(offer.id, step, now).await {
                        warn!(
                            offer_id = %offer.id,
                            step = %step,
                            error = %err,
                            "failed to record step completion"
                        );
                    }
                    report.completed.push(step);
                }
                Err(err) => {
                    error!(
                        offer_id = %offer.id,
                        step = %step,
                        error = %err,
                        "provisioning step failed"
                    );
                    report.failed.push(StepFailure {
                        step,
                        error: err.to_string(),
                    });
                }
            }
        }

        report
    }

    async fn run_step(
        &self,
        step: ProvisioningStep,
        offer: &Offer,
        accepted_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StepError> {
        match step {
            ProvisioningStep::GrantRelationship => {
                self.grant_relationship(offer, accepted_at).await
            }
            ProvisioningStep::SchedulePayout => self.schedule_payout(offer, accepted_at, now).await,
            ProvisioningStep::CreateContract => self.create_contract(offer, accepted_at, now).await,
            ProvisioningStep::Announce => self.announce(offer, now).await,
        }
    }

    async fn grant_relationship(
        &self,
        offer: &Offer,
        accepted_at: DateTime<Utc>,
    ) -> Result<(), StepError> {
        let plan_expiry = self
            .settings
            .entitlement_unit
            .plan_expiry(accepted_at, offer.duration_months)
            .ok_or(StepError::Arithmetic("plan expiry"))?;

        self.store
            .grant_coach(&CoachGrant {
                customer_id: offer.customer_id,
                coach_id: offer.coach_id,
                plan: self.settings.coached_plan.clone(),
                plan_expiry,
                granted_at: accepted_at,
            })
            .await?;
        Ok(())
    }

    async fn schedule_payout(
        &self,
        offer: &Offer,
        accepted_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StepError> {
        let split = payout_split(offer.price).ok_or(StepError::Arithmetic("payout amount"))?;
        let term = EngagementTerm::for_offer(offer, accepted_at)
            .ok_or(StepError::Arithmetic("payout period"))?;

        let outcome = self
            .store
            .insert_payout(&Payout {
                id: Uuid::new_v4(),
                coach_id: offer.coach_id,
                offer_id: offer.id,
                amount_cents: split.amount_cents,
                platform_fee_cents: split.platform_fee_cents,
                net_amount_cents: split.net_amount_cents,
                status: PAYOUT_STATUS_PENDING.to_string(),
                period_start: term.start_date,
                period_end: term.end_date,
                created_at: now,
            })
            .await?;
        if outcome == InsertOutcome::AlreadyPresent {
            debug!(offer_id = %offer.id, "payout already scheduled");
        }
        Ok(())
    }

    async fn create_contract(
        &self,
        offer: &Offer,
        accepted_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StepError> {
        let split = payout_split(offer.price).ok_or(StepError::Arithmetic("contract price"))?;
        let term = EngagementTerm::for_offer(offer, accepted_at)
            .ok_or(StepError::Arithmetic("contract end date"))?;

        let outcome = self
            .store
            .insert_contract(&Contract {
                id: Uuid::new_v4(),
                coach_id: offer.coach_id,
                customer_id: offer.customer_id,
                offer_id: offer.id,
                status: CONTRACT_STATUS_ACTIVE.to_string(),
                start_date: term.start_date,
                end_date: term.end_date,
                price_cents: split.amount_cents,
                created_at: now,
            })
            .await?;
        if outcome == InsertOutcome::AlreadyPresent {
            debug!(offer_id = %offer.id, "contract already exists");
        }
        Ok(())
    }

    async fn announce(&self, offer: &Offer, now: DateTime<Utc>) -> Result<(), StepError> {
        if self.store.acceptance_announcement(offer.id).await?.is_some() {
            debug!(offer_id = %offer.id, "acceptance already announced");
            return Ok(());
        }

        let conversation = self
            .store
            .find_or_create_conversation(offer.coach_id, offer.customer_id, now)
            .await?;
        self.store
            .append_message(&Message {
                id: Uuid::new_v4(),
                conversation_id: conversation.id,
                sender_id: None,
                kind: MessageKind::OfferAccepted,
                offer_id: Some(offer.id),
                body: acceptance_message_body(offer),
                created_at: now,
            })
            .await?;
        Ok(())
    }

    async fn notify(&self, offer: &Offer, accepted_at: DateTime<Utc>) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        let conversation_id = match self.store.acceptance_announcement(offer.id).await {
            Ok(message) => message.map(|message| message.conversation_id),
            Err(err) => {
                warn!(
                    offer_id = %offer.id,
                    error = %err,
                    "could not resolve conversation for notification"
                );
                None
            }
        };

        let event = OfferAcceptedEvent {
            offer_id: offer.id,
            conversation_id,
            coach_id: offer.coach_id,
            customer_id: offer.customer_id,
            accepted_at,
        };
        if let Err(err) = notifier.offer_accepted(&event).await {
            warn!(offer_id = %offer.id, error = %err, "acceptance notification failed");
        }
    }
}

fn acceptance_message_body(offer: &Offer) -> String {
    let months = if offer.duration_months == 1 { "month" } else { "months" };
    format!(
        "Coaching activated: {} {} at {}.",
        offer.duration_months,
        months,
        offer.price.round_dp(2)
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use coachpay_core::{
        ConversationStore, CustomerProfile, EngagementStore, NewOffer, NotifyError, OfferStore,
        ProfileStore, StepLedger,
    };
    use coachpay_store::{FaultPoint, InMemoryStore};
    use rust_decimal::Decimal;

    use super::*;

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<OfferAcceptedEvent>>,
    }

    #[async_trait]
    impl AcceptanceNotifier for RecordingNotifier {
        async fn offer_accepted(&self, event: &OfferAcceptedEvent) -> Result<(), NotifyError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 10, 9, 0, 0).unwrap()
    }

    async fn seeded(
        price: Decimal,
        months: u32,
        expires_in: Duration,
    ) -> (Arc<InMemoryStore>, Offer) {
        let store = Arc::new(InMemoryStore::new());
        let coach_id = Uuid::new_v4();
        let customer_id = Uuid::new_v4();
        store
            .insert_profile(CustomerProfile {
                id: customer_id,
                coach_id: None,
                plan: None,
                plan_expiry: None,
                platform_plan: "free".to_string(),
                updated_at: t0(),
            })
            .await;
        let offer = store
            .create_offer(
                NewOffer {
                    coach_id,
                    customer_id,
                    originating_message_id: Uuid::new_v4(),
                    price,
                    duration_months: months,
                    expires_at: t0() + expires_in,
                },
                t0(),
            )
            .await
            .unwrap();
        (store, offer)
    }

    fn reconciler(store: &Arc<InMemoryStore>) -> Reconciler {
        Reconciler::new(store.clone(), ReconcileSettings::default())
    }

    #[tokio::test]
    async fn accepts_and_provisions_scenario_offer() {
        let (store, offer) = seeded(Decimal::new(300, 0), 2, Duration::hours(48)).await;
        let notifier = Arc::new(RecordingNotifier::default());
        let reconciler = reconciler(&store).with_notifier(notifier.clone());
        let now = t0() + Duration::minutes(5);

        let outcome = reconciler.reconcile(offer.id, now).await.unwrap();
        let ReconcileOutcome::Accepted { transitioned, report } = outcome else {
            panic!("expected acceptance, got {outcome:?}");
        };
        assert!(transitioned);
        assert_eq!(report.completed, ProvisioningStep::ALL.to_vec());
        assert!(report.failed.is_empty());

        let stored = store.get_offer(offer.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OfferStatus::Accepted);

        let profile = store.get_profile(offer.customer_id).await.unwrap().unwrap();
        assert_eq!(profile.coach_id, Some(offer.coach_id));
        assert_eq!(profile.plan.as_deref(), Some(DEFAULT_COACHED_PLAN));
        assert_eq!(
            profile.plan_expiry,
            Some(Utc.with_ymd_and_hms(2026, 6, 10, 9, 5, 0).unwrap())
        );

        let contract = store.contract_for_offer(offer.id).await.unwrap().unwrap();
        assert_eq!(contract.price_cents, 30000);
        let two_months = contract.start_date.checked_add_months(chrono::Months::new(2));
        assert_eq!(Some(contract.end_date), two_months);

        let payout = store.payout_for_offer(offer.id).await.unwrap().unwrap();
        assert_eq!(
            (payout.amount_cents, payout.platform_fee_cents, payout.net_amount_cents),
            (30000, 4500, 25500)
        );
        assert_eq!(payout.status, "pending");

        assert_eq!(store.announcement_count(offer.id).await, 1);
        let events = notifier.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert!(events[0].conversation_id.is_some());
    }

    #[tokio::test]
    async fn replays_produce_single_rows() {
        let (store, offer) = seeded(Decimal::new(19900, 2), 1, Duration::hours(48)).await;
        let reconciler = reconciler(&store);
        let now = t0() + Duration::minutes(1);

        for _ in 0..5 {
            let outcome = reconciler.reconcile(offer.id, now).await.unwrap();
            assert!(outcome.is_accepted());
        }

        assert_eq!(store.contract_count().await, 1);
        assert_eq!(store.payout_count().await, 1);
        assert_eq!(store.announcement_count(offer.id).await, 1);
        let payout = store.payout_for_offer(offer.id).await.unwrap().unwrap();
        assert_eq!(payout.platform_fee_cents, 2985);
        assert_eq!(payout.net_amount_cents, 16915);
    }

    #[tokio::test]
    async fn second_invocation_reports_ledger_hits() {
        let (store, offer) = seeded(Decimal::new(50, 0), 1, Duration::hours(1)).await;
        let reconciler = reconciler(&store);
        reconciler.reconcile(offer.id, t0()).await.unwrap();

        let outcome = reconciler.reconcile(offer.id, t0()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Accepted {
                transitioned: false,
                report: ProvisioningReport {
                    completed: vec![],
                    already_done: ProvisioningStep::ALL.to_vec(),
                    failed: vec![],
                },
            }
        );
    }

    #[tokio::test]
    async fn concurrent_invocations_converge() {
        let (store, offer) = seeded(Decimal::new(300, 0), 2, Duration::hours(48)).await;
        let reconciler = Arc::new(reconciler(&store));
        let now = t0() + Duration::seconds(30);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reconciler = reconciler.clone();
                tokio::spawn(async move { reconciler.reconcile(offer.id, now).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            if let ReconcileOutcome::Accepted { transitioned, .. } = outcome {
                winners += usize::from(transitioned);
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(store.contract_count().await, 1);
        assert_eq!(store.payout_count().await, 1);
        assert_eq!(store.announcement_count(offer.id).await, 1);
    }

    #[tokio::test]
    async fn expired_offer_is_never_accepted() {
        let (store, offer) = seeded(Decimal::new(300, 0), 2, Duration::hours(1)).await;
        let reconciler = reconciler(&store);

        let outcome = reconciler
            .reconcile(offer.id, t0() + Duration::hours(2))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Skipped(SkipReason::Terminal(OfferStatus::Expired)));
        let stored = store.get_offer(offer.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OfferStatus::Pending);
        assert_eq!(store.contract_count().await, 0);
        assert_eq!(store.payout_count().await, 0);
    }

    #[tokio::test]
    async fn rejected_offer_stays_rejected() {
        let (store, offer) = seeded(Decimal::new(300, 0), 2, Duration::hours(48)).await;
        store
            .transition_offer(offer.id, OfferStatus::Pending, OfferStatus::Rejected, t0())
            .await
            .unwrap();

        let outcome = reconciler(&store).reconcile(offer.id, t0()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Skipped(SkipReason::Terminal(OfferStatus::Rejected)));
        let stored = store.get_offer(offer.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OfferStatus::Rejected);
        assert!(store.get_profile(offer.customer_id).await.unwrap().unwrap().coach_id.is_none());
    }

    #[tokio::test]
    async fn unknown_offer_is_a_noop() {
        let store = Arc::new(InMemoryStore::new());
        let outcome = reconciler(&store).reconcile(Uuid::new_v4(), t0()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped(SkipReason::NotFound));
    }

    #[tokio::test]
    async fn failed_step_keeps_acceptance_and_resumes_later() {
        let (store, offer) = seeded(Decimal::new(300, 0), 2, Duration::hours(48)).await;
        let reconciler = reconciler(&store);
        store.set_fault(FaultPoint::InsertPayout, true).await;

        let first = reconciler.reconcile(offer.id, t0()).await.unwrap();
        let ReconcileOutcome::Accepted { transitioned: true, report } = first else {
            panic!("expected acceptance, got {first:?}");
        };
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].step, ProvisioningStep::SchedulePayout);
        assert_eq!(
            store.get_offer(offer.id).await.unwrap().unwrap().status,
            OfferStatus::Accepted
        );
        assert_eq!(store.payout_count().await, 0);
        assert_eq!(store.contract_count().await, 1);
        assert_eq!(
            store.incomplete_accepted_offers(10, 10).await.unwrap(),
            vec![offer.id]
        );

        store.set_fault(FaultPoint::InsertPayout, false).await;
        let later = t0() + Duration::hours(72);
        let second = reconciler.reconcile(offer.id, later).await.unwrap();
        let ReconcileOutcome::Accepted { transitioned: false, report } = second else {
            panic!("expected resumed acceptance, got {second:?}");
        };
        assert_eq!(report.completed, vec![ProvisioningStep::SchedulePayout]);
        assert_eq!(store.payout_count().await, 1);
        assert_eq!(store.contract_count().await, 1);
        assert_eq!(store.announcement_count(offer.id).await, 1);
        assert!(
            store
                .incomplete_accepted_offers(10, 10)
                .await
                .unwrap()
                .is_empty()
        );

        // Period derives from the acceptance time, not the retry time.
        let payout = store.payout_for_offer(offer.id).await.unwrap().unwrap();
        assert_eq!(payout.period_start, t0().date_naive());
    }

    #[tokio::test]
    async fn missing_ledger_rows_still_fenced_by_uniqueness() {
        let (store, offer) = seeded(Decimal::new(300, 0), 2, Duration::hours(48)).await;
        store.put_offer(Offer { status: OfferStatus::Accepted, ..offer.clone() }).await;
        let conversation = store
            .find_or_create_conversation(offer.coach_id, offer.customer_id, t0())
            .await
            .unwrap();
        store
            .append_message(&Message {
                id: Uuid::new_v4(),
                conversation_id: conversation.id,
                sender_id: None,
                kind: MessageKind::OfferAccepted,
                offer_id: Some(offer.id),
                body: "earlier run".to_string(),
                created_at: t0(),
            })
            .await
            .unwrap();

        let outcome = reconciler(&store).reconcile(offer.id, t0()).await.unwrap();
        assert!(outcome.is_accepted());
        assert_eq!(store.announcement_count(offer.id).await, 1);
        assert_eq!(
            store.conversation_messages(conversation.id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn legacy_week_unit_is_honoured() {
        let (store, offer) = seeded(Decimal::new(300, 0), 2, Duration::hours(48)).await;
        let reconciler = Reconciler::new(
            store.clone(),
            ReconcileSettings {
                entitlement_unit: EntitlementUnit::Weeks,
                ..ReconcileSettings::default()
            },
        );
        reconciler.reconcile(offer.id, t0()).await.unwrap();
        let profile = store.get_profile(offer.customer_id).await.unwrap().unwrap();
        assert_eq!(profile.plan_expiry, Some(t0() + Duration::weeks(2)));
    }
}
