pub mod admission;
pub mod config;
pub mod delivery;
pub mod maintenance;
pub mod processor;
pub mod retry;
pub mod secret;
pub mod signature;

pub use admission::{AdmissionError, WebhookAdmission};
pub use config::WebhookConfig;
pub use delivery::DeliveryQueue;
pub use maintenance::MaintenanceSweeper;
pub use processor::{PayloadProcessor, PaymentPayloadProcessor};
pub use retry::RetryScheduler;
pub use secret::SecretStore;
pub use signature::{SignatureVerification, SignatureVerifier};
