pub mod channel;
pub mod enrich;
pub mod inflight;
pub mod notify;
pub mod reconciler;
pub mod retry;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod trigger;
pub mod types;
