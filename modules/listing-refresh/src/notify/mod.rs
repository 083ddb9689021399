pub mod backend;
pub mod log;
pub mod router;
pub mod webhook;

pub use backend::NotifyBackend;
pub use log::LogBackend;
pub use router::NotifyRouter;
pub use webhook::WebhookBackend;
