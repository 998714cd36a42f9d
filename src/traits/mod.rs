//! Trait definitions for dependency injection
//!
//! The HTTP client and the registration store are abstracted behind traits
//! so the pipeline can be exercised without a network or a database file.

mod registration_store;
mod webhook_client;

pub use registration_store::{LedgerError, RegistrationStore};
pub use webhook_client::{OutboundRequest, WebhookAuth, WebhookClient, WebhookError, WebhookResponse};

#[cfg(test)]
pub use webhook_client::MockWebhookClient;
