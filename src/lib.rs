//! Funnel Dispatch: persistent two-track follow-up messaging.

pub mod config;
pub mod error;
pub mod funnel;
pub mod gateway;
pub mod store;
