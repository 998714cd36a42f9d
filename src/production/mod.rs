//! Production implementations of traits

mod webhook_client;

pub use webhook_client::ReqwestWebhookClient;
