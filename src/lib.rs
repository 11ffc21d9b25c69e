//! crewdeck -- command-line client for a multi-agent crew orchestration service.
//!
//! This crate provides the client-side state stores for crews and their
//! executions, the REST and live-update transports that keep them in sync
//! with the service, and durable local storage.

pub mod api;
pub mod channel;
pub mod config;
pub mod context;
pub mod export;
pub mod model;
pub mod notify;
pub mod storage;
pub mod store;

pub use context::AppContext;
