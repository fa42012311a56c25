use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use coachpay_core::{EntitlementUnit, ReconcileStore};
use coachpay_platform::{PgStore, RedisBus, ServiceConfig, apply_schema, connect_database};
use coachpay_reconcile::{ExpiryMonitor, ReconcileOutcome, ReconcileSettings, Reconciler};
use futures_util::{StreamExt, stream};
use tracing::{error, info, warn};
use uuid::Uuid;

const REDRIVE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RedriveSummary {
    attempted: usize,
    completed: usize,
    outstanding: usize,
    errored: usize,
    parked: usize,
}

#[derive(Debug, Clone, Copy)]
struct RedriveLimits {
    batch: i64,
    max_attempts: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "coachpay_ops=info".to_string()),
        )
        .init();

    let config = ServiceConfig::worker_from_env()?;
    if config.entitlement_unit == EntitlementUnit::Weeks {
        warn!("ENTITLEMENT_UNIT=weeks grants plan expiry in weeks instead of calendar months");
    }

    let pool = connect_database(&config.database_url).await?;
    apply_schema(&pool).await?;
    let store: Arc<dyn ReconcileStore> = Arc::new(PgStore::new(pool));

    let settings = ReconcileSettings {
        entitlement_unit: config.entitlement_unit,
        ..ReconcileSettings::default()
    };
    let mut reconciler = Reconciler::new(store.clone(), settings);
    if let Some(redis_url) = config.redis_url.as_deref() {
        reconciler = reconciler.with_notifier(Arc::new(RedisBus::connect(redis_url)?));
    }
    let reconciler = Arc::new(reconciler);
    let monitor = ExpiryMonitor::new(store.clone());

    info!(
        interval_secs = config.sweep_interval.as_secs(),
        batch = config.sweep_batch_size,
        redrive_max_attempts = config.redrive_max_attempts,
        "ops worker started"
    );

    let limits = RedriveLimits {
        batch: config.sweep_batch_size,
        max_attempts: config.redrive_max_attempts,
    };
    let mut ticker = tokio::time::interval(config.sweep_interval);
    loop {
        ticker.tick().await;
        let now = Utc::now();

        match monitor.sweep(now, config.sweep_batch_size).await {
            Ok(sweep) if sweep.raced > 0 => {
                info!(raced = sweep.raced, "offers settled while the expiry sweep ran");
            }
            Ok(_) => {}
            Err(err) => error!("expiry sweep failed: {err:#}"),
        }

        match redrive_provisioning(&store, &reconciler, now, limits).await {
            Ok(summary) if summary.attempted > 0 => info!(
                attempted = summary.attempted,
                completed = summary.completed,
                outstanding = summary.outstanding,
                errored = summary.errored,
                parked = summary.parked,
                "provisioning re-drive finished"
            ),
            Ok(_) => {}
            Err(err) => error!("provisioning re-drive failed: {err:#}"),
        }
    }
}

/// Re-runs the orchestrator for accepted offers whose step ledger is incomplete.
///
/// Every re-drive that leaves an offer incomplete is counted, so offers that keep
/// failing rotate to the back of the queue and stop being picked once they reach
/// `max_attempts`.
async fn redrive_provisioning(
    store: &Arc<dyn ReconcileStore>,
    reconciler: &Arc<Reconciler>,
    now: DateTime<Utc>,
    limits: RedriveLimits,
) -> Result<RedriveSummary> {
    let offer_ids = store
        .incomplete_accepted_offers(limits.max_attempts, limits.batch)
        .await?;
    let mut summary = RedriveSummary {
        attempted: offer_ids.len(),
        ..RedriveSummary::default()
    };

    let results: Vec<(Uuid, Result<ReconcileOutcome, _>)> = stream::iter(offer_ids)
        .map(|offer_id| async move { (offer_id, reconciler.reconcile(offer_id, now).await) })
        .buffer_unordered(REDRIVE_CONCURRENCY)
        .collect()
        .await;

    for (offer_id, result) in results {
        match result {
            Ok(ReconcileOutcome::Accepted { report, .. }) if report.is_complete() => {
                summary.completed += 1;
                continue;
            }
            Ok(ReconcileOutcome::Accepted { report, .. }) => {
                warn!(
                    offer_id = %offer_id,
                    failed_steps = report.failed.len(),
                    "provisioning still incomplete"
                );
                summary.outstanding += 1;
            }
            Ok(ReconcileOutcome::Skipped(reason)) => {
                warn!(offer_id = %offer_id, reason = ?reason, "re-drive skipped offer");
                summary.outstanding += 1;
            }
            Err(err) => {
                error!(offer_id = %offer_id, error = %err, "re-drive failed");
                summary.errored += 1;
            }
        }

        let attempts = match store.record_redrive_attempt(offer_id, now).await {
            Ok(attempts) => attempts,
            Err(err) => {
                error!(offer_id = %offer_id, error = %err, "could not record re-drive attempt");
                continue;
            }
        };
        if attempts >= limits.max_attempts {
            error!(
                offer_id = %offer_id,
                attempts,
                "provisioning parked after repeated re-drive failures; needs operator attention"
            );
            summary.parked += 1;
        }
    }

    Ok(summary)
}
