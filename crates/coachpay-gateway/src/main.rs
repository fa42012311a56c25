use std::{net::SocketAddr, sync::Arc};

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use chrono::{Duration, Utc};
use coachpay_core::{
    AcceptanceNotifier, EntitlementUnit, MAX_OFFER_VALIDITY_HOURS, PaymentGateway, ReconcileStore,
};
use coachpay_platform::{
    CreateCheckoutRequest, CreateCheckoutResponse, CreateOfferRequest, HostedCheckoutClient,
    OfferView, PgStore, RedisBus, RejectOfferRequest, ServiceConfig, SyncRequest, WebhookAck,
    apply_schema, connect_database,
};
use coachpay_reconcile::{
    CheckoutError, CheckoutSessionIssuer, ClientSync, IngestError, IngestOutcome, OfferDesk,
    OfferDraft, OfferError, PaymentEventIngester, ReconcileOutcome, ReconcileSettings, Reconciler,
    SIGNATURE_HEADER, SyncError, SyncPoller, SyncReport, SyncStatus,
};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    offers: Arc<OfferDesk>,
    checkout: Arc<CheckoutSessionIssuer>,
    ingester: Arc<PaymentEventIngester>,
    client_sync: Arc<ClientSync>,
    poller: SyncPoller,
}

impl AppState {
    fn assemble(
        store: Arc<dyn ReconcileStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Option<Arc<dyn AcceptanceNotifier>>,
        config: &ServiceConfig,
    ) -> Self {
        let settings = ReconcileSettings {
            entitlement_unit: config.entitlement_unit,
            ..ReconcileSettings::default()
        };
        let mut reconciler = Reconciler::new(store.clone(), settings);
        if let Some(notifier) = notifier {
            reconciler = reconciler.with_notifier(notifier);
        }
        let reconciler = Arc::new(reconciler);

        Self {
            offers: Arc::new(OfferDesk::new(
                store.clone(),
                Duration::hours(config.offer_ttl_hours.clamp(1, MAX_OFFER_VALIDITY_HOURS)),
            )),
            checkout: Arc::new(CheckoutSessionIssuer::new(
                store.clone(),
                gateway.clone(),
                config.checkout.currency.clone(),
            )),
            ingester: Arc::new(PaymentEventIngester::new(
                config.webhook_secret.as_bytes(),
                reconciler.clone(),
                store,
            )),
            client_sync: Arc::new(ClientSync::new(gateway, reconciler)),
            poller: SyncPoller {
                attempts: config.sync_poll_attempts,
                interval: config.sync_poll_interval,
            },
        }
    }
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "coachpay_gateway=info,coachpay_reconcile=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    if config.entitlement_unit == EntitlementUnit::Weeks {
        warn!("ENTITLEMENT_UNIT=weeks grants plan expiry in weeks instead of calendar months");
    }

    let pool = connect_database(&config.database_url).await?;
    apply_schema(&pool).await?;
    let store: Arc<dyn ReconcileStore> = Arc::new(PgStore::new(pool));
    let gateway: Arc<dyn PaymentGateway> =
        Arc::new(HostedCheckoutClient::new(&config.checkout)?);

    let notifier: Option<Arc<dyn AcceptanceNotifier>> = match config.redis_url.as_deref() {
        Some(redis_url) => Some(Arc::new(RedisBus::connect(redis_url)?)),
        None => {
            info!("REDIS_URL not set, acceptance notifications disabled");
            None
        }
    };

    let state = AppState::assemble(store, gateway, notifier, &config);
    let router = build_router(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/offers", post(create_offer))
        .route("/offers/{offer_id}", get(get_offer))
        .route("/offers/{offer_id}/reject", post(reject_offer))
        .route("/checkout/sessions", post(create_checkout_session))
        .route("/checkout/sync", post(sync_checkout))
        .route("/webhooks/payments", post(payment_webhook))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn create_offer(
    State(state): State<AppState>,
    Json(payload): Json<CreateOfferRequest>,
) -> Result<(StatusCode, Json<OfferView>), (StatusCode, String)> {
    let expires_in = match payload.expires_in_hours {
        Some(hours) if !(1..=MAX_OFFER_VALIDITY_HOURS).contains(&hours) => {
            return Err(invalid_request(format!(
                "expires_in_hours must be between 1 and {MAX_OFFER_VALIDITY_HOURS}"
            )));
        }
        Some(hours) => Duration::try_hours(hours),
        None => None,
    };

    let now = Utc::now();
    let offer = state
        .offers
        .create(
            OfferDraft {
                coach_id: payload.coach_id,
                customer_id: payload.customer_id,
                price: payload.price,
                duration_months: payload.duration_months,
                expires_in,
            },
            now,
        )
        .await
        .map_err(offer_error)?;

    Ok((StatusCode::CREATED, Json(OfferView::at(&offer, now))))
}

async fn get_offer(
    State(state): State<AppState>,
    Path(offer_id): Path<Uuid>,
) -> Result<Json<OfferView>, (StatusCode, String)> {
    let offer = state.offers.get(offer_id).await.map_err(offer_error)?;
    Ok(Json(OfferView::at(&offer, Utc::now())))
}

async fn reject_offer(
    State(state): State<AppState>,
    Path(offer_id): Path<Uuid>,
    Json(payload): Json<RejectOfferRequest>,
) -> Result<Json<OfferView>, (StatusCode, String)> {
    let now = Utc::now();
    let offer = state
        .offers
        .reject(offer_id, payload.customer_id, now)
        .await
        .map_err(offer_error)?;
    Ok(Json(OfferView::at(&offer, now)))
}

async fn create_checkout_session(
    State(state): State<AppState>,
    Json(payload): Json<CreateCheckoutRequest>,
) -> Result<Json<CreateCheckoutResponse>, (StatusCode, String)> {
    let session = state
        .checkout
        .create_session(payload.offer_id, &payload.return_url, Utc::now())
        .await
        .map_err(checkout_error)?;

    Ok(Json(CreateCheckoutResponse {
        session_id: session.session_id,
        url: session.url,
    }))
}

async fn sync_checkout(
    State(state): State<AppState>,
    Json(payload): Json<SyncRequest>,
) -> Result<(StatusCode, Json<SyncReport>), (StatusCode, String)> {
    let session_id = payload.session_id.trim();
    if session_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "sessionId is required".to_string()));
    }

    let result = if payload.wait {
        state.poller.poll(&state.client_sync, session_id).await
    } else {
        state.client_sync.sync(session_id, Utc::now()).await
    };

    match result {
        Ok(report) => Ok((StatusCode::OK, Json(report))),
        Err(SyncError::Upstream(err)) => {
            warn!(
                session_id = %session_id,
                error = %err,
                "checkout sync could not reach payment gateway"
            );
            Ok((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(SyncReport {
                    status: SyncStatus::Error,
                    offer_id: None,
                    detail: Some("payment gateway unavailable".to_string()),
                }),
            ))
        }
        Err(err @ SyncError::Reconcile(_)) => {
            error!(session_id = %session_id, error = %err, "checkout sync failed");
            Err(internal_error(err))
        }
    }
}

async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, (StatusCode, String)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match state.ingester.ingest(&body, signature, Utc::now()).await {
        Ok(outcome) => Ok(Json(WebhookAck {
            received: true,
            outcome: webhook_outcome(&outcome).to_string(),
        })),
        Err(err) if err.is_retryable() => {
            error!(error = %err, "webhook processing failed, awaiting redelivery");
            Err(internal_error(err))
        }
        Err(err @ IngestError::BadSignature) => Err((StatusCode::BAD_REQUEST, err.to_string())),
        Err(err) => {
            warn!(error = %err, "malformed webhook event");
            Err((StatusCode::BAD_REQUEST, err.to_string()))
        }
    }
}

fn webhook_outcome(outcome: &IngestOutcome) -> &'static str {
    match outcome {
        IngestOutcome::Reconciled {
            outcome: ReconcileOutcome::Accepted { report, .. },
            ..
        } if !report.is_complete() => "partial",
        IngestOutcome::Reconciled {
            outcome: ReconcileOutcome::Accepted {
                transitioned: true, ..
            },
            ..
        } => "accepted",
        IngestOutcome::Reconciled {
            outcome: ReconcileOutcome::Accepted { .. },
            ..
        } => "already_accepted",
        IngestOutcome::Reconciled { .. } => "noop",
        IngestOutcome::PlanDowngraded { .. } => "plan_downgraded",
        IngestOutcome::Ignored { .. } => "ignored",
    }
}

fn offer_error(err: OfferError) -> (StatusCode, String) {
    match err {
        OfferError::Invalid(_) => invalid_request(err),
        OfferError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        OfferError::Forbidden(_) => (StatusCode::FORBIDDEN, err.to_string()),
        OfferError::InvalidState { .. } => (StatusCode::CONFLICT, err.to_string()),
        OfferError::Store(_) => internal_error(err),
    }
}

fn checkout_error(err: CheckoutError) -> (StatusCode, String) {
    match err {
        CheckoutError::InvalidState { .. } => (StatusCode::CONFLICT, err.to_string()),
        CheckoutError::InvalidReturnUrl(_) => invalid_request(err),
        CheckoutError::UpstreamUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        CheckoutError::UpstreamRejected(_) => (StatusCode::BAD_GATEWAY, err.to_string()),
        CheckoutError::Store(_) => internal_error(err),
    }
}

fn invalid_request<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, err.to_string())
}

fn internal_error<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
