pub mod events;
pub mod fees;
pub mod gateway;
pub mod models;
pub mod storage;

pub use events::{EventParseError, GatewayEvent};
pub use fees::{EngagementTerm, PayoutSplit, payout_split, platform_fee_rate, price_to_cents};
pub use gateway::{
    AcceptanceNotifier, CheckoutSession, CheckoutSessionRequest, CheckoutSessionStatus,
    GatewayError, MIN_CHECKOUT_WINDOW_MINUTES, NotifyError, OfferAcceptedEvent, PaymentGateway,
    SessionPaymentState, is_valid_session_id,
};
pub use models::{
    CoachGrant, Contract, Conversation, CustomerProfile, EntitlementUnit, MAX_OFFER_VALIDITY_HOURS,
    Message, MessageKind, NewOffer, Offer, OfferStatus, Payout, offer_client_reference,
    parse_offer_client_reference,
};
pub use storage::{
    ConversationStore, EngagementStore, InsertOutcome, OfferStore, ProfileStore,
    ProvisioningStep, ReconcileStore, StepLedger, StoreError, TransitionOutcome,
};
