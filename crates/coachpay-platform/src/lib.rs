pub mod checkout_client;
pub mod config;
pub mod contracts;
pub mod db;
pub mod pg_store;
pub mod redis_bus;

pub use checkout_client::HostedCheckoutClient;
pub use config::{CheckoutConfig, ServiceConfig};
pub use contracts::{
    CreateCheckoutRequest, CreateCheckoutResponse, CreateOfferRequest, OfferView,
    RejectOfferRequest, SyncRequest, WebhookAck,
};
pub use db::{apply_schema, connect_database};
pub use pg_store::PgStore;
pub use redis_bus::{OFFERS_ACCEPTED_CHANNEL, RedisBus};
