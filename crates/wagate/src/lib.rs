//! Wagate - connection manager for WhatsApp gateway (WAHA) sessions.
//!
//! Keeps an in-memory mirror of each tenant's gateway session, drives QR
//! pairing by polling, and reports progress to the embedding application as
//! a stream of [`protocol::SessionNotice`] values.

pub mod config;
pub mod gateway;
pub mod session;

pub use wagate_protocol as protocol;
