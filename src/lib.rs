pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod idempotency;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod service;
pub mod staging;
pub mod storage;
pub mod validator;

// Use cases and the ports they depend on, and the adapters that implement them
pub mod app;
pub mod infra;
