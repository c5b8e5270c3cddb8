//! Browser session endpoints: CSRF issuance, login, logout and introspection.

pub mod csrf;
pub mod info;
pub mod login;
pub mod logout;
