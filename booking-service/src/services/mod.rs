pub mod appointments;
pub mod invoices;
pub mod ledger;
pub mod metrics;
pub mod notifier;
pub mod payment_links;
pub mod pipeline;
pub mod refunds;
pub mod signature;
pub mod store;
pub mod sweeper;
pub mod synchronizer;

pub use appointments::AppointmentService;
pub use invoices::InvoiceStateMachine;
pub use ledger::IdempotencyLedger;
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{HttpNotifier, LogNotifier, Notifier};
pub use payment_links::PaymentLinkService;
pub use pipeline::{PaymentPipeline, PipelineOutcome};
pub use refunds::{HttpRefundGateway, ManualRefundGateway, RefundGateway};
pub use signature::{HashAlgorithm, SignatureVerifier};
pub use store::{MemoryStore, MongoStore, Store};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use synchronizer::Synchronizer;
