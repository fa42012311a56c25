use chrono::{DateTime, Months, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::models::Offer;

/// 15% platform commission on coach earnings.
pub fn platform_fee_rate() -> Decimal {
    Decimal::new(15, 2)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayoutSplit {
    pub amount_cents: i64,
    pub platform_fee_cents: i64,
    pub net_amount_cents: i64,
}

pub fn price_to_cents(price: Decimal) -> Option<i64> {
    (price * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

pub fn payout_split(price: Decimal) -> Option<PayoutSplit> {
    let amount_cents = price_to_cents(price)?;
    let platform_fee_cents = (Decimal::from(amount_cents) * platform_fee_rate())
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()?;

    Some(PayoutSplit {
        amount_cents,
        platform_fee_cents,
        net_amount_cents: amount_cents - platform_fee_cents,
    })
}

/// Engagement window for an offer accepted at `accepted_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngagementTerm {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl EngagementTerm {
    pub fn for_offer(offer: &Offer, accepted_at: DateTime<Utc>) -> Option<Self> {
        let start_date = accepted_at.date_naive();
        let end_date = start_date.checked_add_months(Months::new(offer.duration_months))?;
        Some(Self {
            start_date,
            end_date,
        })
    }
}
