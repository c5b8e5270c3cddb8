//! API handlers for Tessera.
//!
//! `oauth` holds the token, revocation, authorization and bulk revocation
//! endpoints; `session` the cookie-based browser flow.

pub mod health;
pub mod oauth;
pub mod session;
