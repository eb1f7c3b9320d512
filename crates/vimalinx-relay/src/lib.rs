//! Vimalinx relay - the broker between mobile chat clients and gateway
//! machines. Clients post messages and subscribe to an SSE outbox; gateways
//! long-poll for inbound work (or receive webhooks) and push replies back.

pub mod config;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod inbound;
pub mod instances;
pub mod machines;
pub mod persist;
pub mod security;
pub mod server;
pub mod sessions;
