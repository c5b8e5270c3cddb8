//! Space-delimited OAuth scope sets.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const OPENID: &str = "openid";

/// Ordered, de-duplicated scope list. Order follows first appearance so the
/// `scope` response field reads the way the client asked for it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeSet(Vec<String>);

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidScope(pub String);

impl fmt::Display for InvalidScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid scope token: {}", self.0)
    }
}

impl std::error::Error for InvalidScope {}

impl ScopeSet {
    /// Parse a space-delimited scope string (RFC 6749 §3.3).
    ///
    /// # Errors
    /// Returns `InvalidScope` if a token contains characters outside `NQCHAR`.
    pub fn parse(value: &str) -> Result<Self, InvalidScope> {
        let mut scopes: Vec<String> = Vec::new();
        for token in value.split(' ').filter(|token| !token.is_empty()) {
            if !token.chars().all(is_scope_char) {
                return Err(InvalidScope(token.to_string()));
            }
            if !scopes.iter().any(|existing| existing == token) {
                scopes.push(token.to_string());
            }
        }
        Ok(Self(scopes))
    }

    #[must_use]
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut scopes: Vec<String> = Vec::new();
        for token in tokens {
            let token = token.into();
            if !token.is_empty() && !scopes.contains(&token) {
                scopes.push(token);
            }
        }
        Self(scopes)
    }

    #[must_use]
    pub fn contains(&self, scope: &str) -> bool {
        self.0.iter().any(|existing| existing == scope)
    }

    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.0.iter().all(|scope| other.contains(scope))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn has_openid(&self) -> bool {
        self.contains(OPENID)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

impl Serialize for ScopeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ScopeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}

// NQCHAR = %x21 / %x23-5B / %x5D-7E
fn is_scope_char(c: char) -> bool {
    matches!(c, '\x21' | '\x23'..='\x5B' | '\x5D'..='\x7E')
}
