pub mod checkout;
pub mod expiry;
pub mod ingest;
pub mod offers;
pub mod orchestrator;
pub mod signature;
pub mod sync;

pub use checkout::{CheckoutError, CheckoutSessionIssuer};
pub use expiry::{ExpiryMonitor, ExpirySweep, NotActionable};
pub use ingest::{IngestError, IngestOutcome, PaymentEventIngester};
pub use offers::{OfferDesk, OfferDraft, OfferError};
pub use orchestrator::{
    ProvisioningReport, ReconcileError, ReconcileOutcome, ReconcileSettings, Reconciler,
    SkipReason, StepFailure,
};
pub use signature::{
    SIGNATURE_HEADER, compute_signature, format_signature_header, verify_signature,
};
pub use sync::{ClientSync, SyncError, SyncPoller, SyncReport, SyncStatus};
