use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coachpay_core::{
    CoachGrant, Contract, Conversation, ConversationStore, CustomerProfile, EngagementStore,
    InsertOutcome, Message, MessageKind, NewOffer, Offer, OfferStatus, OfferStore, Payout,
    ProfileStore, ProvisioningStep, StepLedger, StoreError, TransitionOutcome,
};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

const OFFER_COLUMNS: &str = "id, coach_id, customer_id, originating_message_id, price, \
     duration_months, status, expires_at, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, kind, offer_id, body, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn inserted(rows_affected: u64) -> InsertOutcome {
    if rows_affected == 0 {
        InsertOutcome::AlreadyPresent
    } else {
        InsertOutcome::Inserted
    }
}

fn offer_from_row(row: &PgRow) -> Result<Offer, StoreError> {
    let status: String = row.try_get("status").map_err(backend)?;
    let duration_months: i32 = row.try_get("duration_months").map_err(backend)?;

    Ok(Offer {
        id: row.try_get("id").map_err(backend)?,
        coach_id: row.try_get("coach_id").map_err(backend)?,
        customer_id: row.try_get("customer_id").map_err(backend)?,
        originating_message_id: row.try_get("originating_message_id").map_err(backend)?,
        price: row.try_get("price").map_err(backend)?,
        duration_months: u32::try_from(duration_months)
            .map_err(|_| StoreError::Corrupt(format!("duration_months {duration_months}")))?,
        status: status.parse::<OfferStatus>().map_err(StoreError::Corrupt)?,
        expires_at: row.try_get("expires_at").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message, StoreError> {
    let kind: String = row.try_get("kind").map_err(backend)?;

    Ok(Message {
        id: row.try_get("id").map_err(backend)?,
        conversation_id: row.try_get("conversation_id").map_err(backend)?,
        sender_id: row.try_get("sender_id").map_err(backend)?,
        kind: kind.parse::<MessageKind>().map_err(StoreError::Corrupt)?,
        offer_id: row.try_get("offer_id").map_err(backend)?,
        body: row.try_get("body").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

#[async_trait]
impl OfferStore for PgStore {
    async fn create_offer(&self, offer: NewOffer, now: DateTime<Utc>) -> Result<Offer, StoreError> {
        let duration_months = i32::try_from(offer.duration_months).map_err(|_| {
            StoreError::Corrupt(format!("duration_months {}", offer.duration_months))
        })?;
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

        sqlx::query(
            r#"
            INSERT INTO offers (
                id, coach_id, customer_id, originating_message_id, price, duration_months,
                status, expires_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $8)
            "#,
        )
        .bind(offer.id)
        .bind(offer.coach_id)
        .bind(offer.customer_id)
        .bind(offer.originating_message_id)
        .bind(offer.price)
        .bind(duration_months)
        .bind(offer.expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(offer)
    }

    async fn get_offer(&self, offer_id: Uuid) -> Result<Option<Offer>, StoreError> {
        let row = sqlx::query(&format!("SELECT {OFFER_COLUMNS} FROM offers WHERE id = $1"))
            .bind(offer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.as_ref().map(offer_from_row).transpose()
    }

    async fn transition_offer(
        &self,
        offer_id: Uuid,
        from: OfferStatus,
        to: OfferStatus,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE offers
            SET status = $3, updated_at = $4
            WHERE id = $1
              AND status = $2
              AND ($3 <> 'accepted' OR expires_at >= $4)
            "#,
        )
        .bind(offer_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 1 {
            return Ok(TransitionOutcome::Applied);
        }

        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM offers WHERE id = $1)")
                .bind(offer_id)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
        if !exists {
            return Err(StoreError::NotFound(format!("offer {offer_id}")));
        }

        Ok(TransitionOutcome::Conflict)
    }

    async fn pending_past_expiry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM offers
            WHERE status = 'pending' AND expires_at < $1
            ORDER BY expires_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn get_profile(&self, profile_id: Uuid) -> Result<Option<CustomerProfile>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, coach_id, plan, plan_expiry, platform_plan, updated_at
            FROM profiles
            WHERE id = $1
            "#,
        )
        .bind(profile_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(CustomerProfile {
            id: row.try_get("id").map_err(backend)?,
            coach_id: row.try_get("coach_id").map_err(backend)?,
            plan: row.try_get("plan").map_err(backend)?,
            plan_expiry: row.try_get("plan_expiry").map_err(backend)?,
            platform_plan: row.try_get("platform_plan").map_err(backend)?,
            updated_at: row.try_get("updated_at").map_err(backend)?,
        }))
    }

    async fn grant_coach(&self, grant: &CoachGrant) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET coach_id = $2, plan = $3, plan_expiry = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(grant.customer_id)
        .bind(grant.coach_id)
        .bind(&grant.plan)
        .bind(grant.plan_expiry)
        .bind(grant.granted_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("profile {}", grant.customer_id)));
        }
        Ok(())
    }

    async fn downgrade_platform_plan(
        &self,
        profile_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE profiles SET platform_plan = 'free', updated_at = $2 WHERE id = $1",
        )
        .bind(profile_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl EngagementStore for PgStore {
    async fn insert_contract(&self, contract: &Contract) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO contracts (
                id, coach_id, customer_id, offer_id, status, start_date, end_date,
                price_cents, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (offer_id) DO NOTHING
            "#,
        )
        .bind(contract.id)
        .bind(contract.coach_id)
        .bind(contract.customer_id)
        .bind(contract.offer_id)
        .bind(&contract.status)
        .bind(contract.start_date)
        .bind(contract.end_date)
        .bind(contract.price_cents)
        .bind(contract.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(inserted(result.rows_affected()))
    }

    async fn insert_payout(&self, payout: &Payout) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO payouts (
                id, coach_id, offer_id, amount_cents, platform_fee_cents, net_amount_cents,
                status, period_start, period_end, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (offer_id) DO NOTHING
            "#,
        )
        .bind(payout.id)
        .bind(payout.coach_id)
        .bind(payout.offer_id)
        .bind(payout.amount_cents)
        .bind(payout.platform_fee_cents)
        .bind(payout.net_amount_cents)
        .bind(&payout.status)
        .bind(payout.period_start)
        .bind(payout.period_end)
        .bind(payout.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(inserted(result.rows_affected()))
    }

    async fn contract_for_offer(&self, offer_id: Uuid) -> Result<Option<Contract>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, coach_id, customer_id, offer_id, status, start_date, end_date,
                   price_cents, created_at
            FROM contracts
            WHERE offer_id = $1
            "#,
        )
        .bind(offer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Contract {
            id: row.try_get("id").map_err(backend)?,
            coach_id: row.try_get("coach_id").map_err(backend)?,
            customer_id: row.try_get("customer_id").map_err(backend)?,
            offer_id: row.try_get("offer_id").map_err(backend)?,
            status: row.try_get("status").map_err(backend)?,
            start_date: row.try_get("start_date").map_err(backend)?,
            end_date: row.try_get("end_date").map_err(backend)?,
            price_cents: row.try_get("price_cents").map_err(backend)?,
            created_at: row.try_get("created_at").map_err(backend)?,
        }))
    }

    async fn payout_for_offer(&self, offer_id: Uuid) -> Result<Option<Payout>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, coach_id, offer_id, amount_cents, platform_fee_cents, net_amount_cents,
                   status, period_start, period_end, created_at
            FROM payouts
            WHERE offer_id = $1
            "#,
        )
        .bind(offer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Payout {
            id: row.try_get("id").map_err(backend)?,
            coach_id: row.try_get("coach_id").map_err(backend)?,
            offer_id: row.try_get("offer_id").map_err(backend)?,
            amount_cents: row.try_get("amount_cents").map_err(backend)?,
            platform_fee_cents: row.try_get("platform_fee_cents").map_err(backend)?,
            net_amount_cents: row.try_get("net_amount_cents").map_err(backend)?,
            status: row.try_get("status").map_err(backend)?,
            period_start: row.try_get("period_start").map_err(backend)?,
            period_end: row.try_get("period_end").map_err(backend)?,
            created_at: row.try_get("created_at").map_err(backend)?,
        }))
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn find_or_create_conversation(
        &self,
        coach_id: Uuid,
        customer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Conversation, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, coach_id, customer_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (coach_id, customer_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(coach_id)
        .bind(customer_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        let row = sqlx::query(
            "SELECT id, created_at FROM conversations WHERE coach_id = $1 AND customer_id = $2",
        )
        .bind(coach_id)
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(Conversation {
            id: row.try_get("id").map_err(backend)?,
            coach_id,
            customer_id,
            created_at: row.try_get("created_at").map_err(backend)?,
        })
    }

    async fn append_message(&self, message: &Message) -> Result<InsertOutcome, StoreError> {
        // The partial unique index on offer_id fences acceptance announcements.
        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, kind, offer_id, body, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(message.kind.as_str())
        .bind(message.offer_id)
        .bind(&message.body)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(inserted(result.rows_affected()))
    }

    async fn acceptance_announcement(&self, offer_id: Uuid) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE offer_id = $1 AND kind = 'offer_accepted'"
        ))
        .bind(offer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(message_from_row).transpose()
    }

    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = $1 ORDER BY created_at, id"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(message_from_row).collect()
    }
}

#[async_trait]
impl StepLedger for PgStore {
    async fn completed_steps(
        &self,
        offer_id: Uuid,
    ) -> Result<BTreeSet<ProvisioningStep>, StoreError> {
        let steps = sqlx::query_scalar::<_, String>(
            "SELECT step FROM offer_reconciliation_steps WHERE offer_id = $1",
        )
        .bind(offer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        steps
            .iter()
            .map(|step| step.parse::<ProvisioningStep>().map_err(StoreError::Corrupt))
            .collect()
    }

    async fn mark_step_completed(
        &self,
        offer_id: Uuid,
        step: ProvisioningStep,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO offer_reconciliation_steps (offer_id, step, completed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (offer_id, step) DO NOTHING
            "#,
        )
        .bind(offer_id)
        .bind(step.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn incomplete_accepted_offers(
        &self,
        max_attempts: u32,
        limit: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let step_count = i64::try_from(ProvisioningStep::ALL.len())
            .map_err(|_| StoreError::Corrupt("step count".to_string()))?;

        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT o.id
            FROM offers o
            LEFT JOIN offer_reconciliation_steps s ON s.offer_id = o.id
            LEFT JOIN offer_redrive_attempts a ON a.offer_id = o.id
            WHERE o.status = 'accepted'
              AND COALESCE(a.attempts, 0) < $2
            GROUP BY o.id, o.updated_at, a.last_attempted_at
            HAVING COUNT(s.step) < $1
            ORDER BY a.last_attempted_at ASC NULLS FIRST, o.updated_at, o.id
            LIMIT $3
            "#,
        )
        .bind(step_count)
        .bind(i64::from(max_attempts))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)
    }

    async fn record_redrive_attempt(
        &self,
        offer_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let attempts = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO offer_redrive_attempts (offer_id, attempts, last_attempted_at)
            VALUES ($1, 1, $2)
            ON CONFLICT (offer_id) DO UPDATE
            SET attempts = offer_redrive_attempts.attempts + 1,
                last_attempted_at = EXCLUDED.last_attempted_at
            RETURNING attempts
            "#,
        )
        .bind(offer_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        u32::try_from(attempts)
            .map_err(|_| StoreError::Corrupt(format!("negative attempt count {attempts}")))
    }
}
