use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use coachpay_core::{
    CheckoutSession, CheckoutSessionRequest, CheckoutSessionStatus, GatewayError, PaymentGateway,
    SessionPaymentState,
};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Hosted checkout held in memory. Sessions are settled by calling
/// [`InMemoryPaymentGateway::settle`].
#[derive(Default)]
pub struct InMemoryPaymentGateway {
    sessions: RwLock<HashMap<String, (CheckoutSessionRequest, SessionPaymentState)>>,
    unavailable: AtomicBool,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn settle(&self, session_id: &str, state: SessionPaymentState) -> bool {
        match self.sessions.write().await.get_mut(session_id) {
            Some(entry) => {
                entry.1 = state;
                true
            }
            None => false,
        }
    }

    /// Registers a session directly, as if created by another process.
    pub async fn insert_session(
        &self,
        session_id: &str,
        request: CheckoutSessionRequest,
        state: SessionPaymentState,
    ) {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), (request, state));
    }

    pub async fn request_for(&self, session_id: &str) -> Option<CheckoutSessionRequest> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|(request, _)| request.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn ensure_available(&self) -> Result<(), GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        self.ensure_available()?;
        let session_id = format!("cs_mem_{}", Uuid::new_v4().simple());
        self.sessions.write().await.insert(
            session_id.clone(),
            (request.clone(), SessionPaymentState::Unpaid),
        );
        Ok(CheckoutSession {
            url: Some(format!("https://checkout.invalid/pay/{session_id}")),
            session_id,
        })
    }

    async fn checkout_session_status(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSessionStatus, GatewayError> {
        self.ensure_available()?;
        let sessions = self.sessions.read().await;
        let (request, payment) = sessions
            .get(session_id)
            .ok_or_else(|| GatewayError::UnknownSession(session_id.to_string()))?;
        Ok(CheckoutSessionStatus {
            session_id: session_id.to_string(),
            client_reference: Some(request.client_reference.clone()),
            payment: *payment,
        })
    }
}
