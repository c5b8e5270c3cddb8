//! OAuth2/OIDC token issuance.

pub mod claims;
pub mod client_auth;
pub mod codes;
pub mod form;
pub mod pkce;
pub mod revocation;
pub mod scope;
pub mod service;
pub mod signer;

pub use claims::{Claims, SystemClaims, TokenUse};
pub use codes::{AuthorizationCode, AuthorizationCodeStore, MemoryCodeStore, PgCodeStore};
pub use service::{TokenConfig, TokenResponse, TokenService};
pub use signer::{JwtSigner, TokenSigner};
