pub mod bus;
pub mod classify;
pub mod config;
pub mod dedup;
pub mod event;
pub mod ids;
pub mod metrics;
pub mod retry;
pub mod runtime;
pub mod schema;
pub mod secrets;
pub mod store;
