//! # Tessera (multi-tenant OAuth2/OIDC token issuance and session core)
//!
//! Tessera mints and rotates tokens for many tenants from a single process.
//!
//! ## Tenancy
//!
//! Every request resolves an effective tenant slug (`X-Tenant-Slug`, the
//! `tenant` query parameter, or the request host in `domain` issuer mode) and
//! runs against that tenant's store. Without a slug the global store is used.
//! The issuer placed in `iss` follows the configured mode: `global`, `path`
//! (`https://issuer/tenantA`) or `domain` (`https://tenantA.issuer`).
//!
//! ## Tokens
//!
//! - `authorization_code` with mandatory PKCE `S256`; codes are single use.
//! - `refresh_token` with rotation; presenting a rotated token again revokes
//!   the whole family.
//! - `client_credentials` for confidential clients.
//!
//! Only SHA-256 hashes of codes, refresh tokens and session ids are stored.
//!
//! ## Sessions
//!
//! Browser sessions live behind an opaque `sid` cookie. Cookie-authenticated
//! writes use a double-submit CSRF check (`csrf_token` cookie echoed in
//! `X-CSRF-Token`).

pub mod api;
pub mod cli;
pub mod hash;
pub mod issuer;
pub mod oauth;
pub mod session;
pub mod store;
pub mod tenancy;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
