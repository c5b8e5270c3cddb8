//! JWT claims minted by the token endpoint.
//!
//! Roles and permissions never sit at the top level: they are nested under the
//! issuer's system namespace so they cannot collide with OIDC claims.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize, Serializer, ser::SerializeMap};
use serde_json::{Map, Value};
use thiserror::Error;

use super::scope::ScopeSet;
use crate::issuer::ResolvedIssuer;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenUse {
    Access,
    Refresh,
    Id,
}

/// `{roles, perms}` nested under the system namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemClaims {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub perms: Vec<String>,
}

impl SystemClaims {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.perms.is_empty()
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|existing| existing == role)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClaimsError {
    #[error("claim {0} must not be empty")]
    Empty(&'static str),
    #[error("token lifetime must be positive")]
    Lifetime,
    #[error("invalid system claims: {0}")]
    System(String),
}

/// Typed JWT claims; invariants are checked when the value is built.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "RawClaims")]
pub struct Claims {
    iss: String,
    sub: String,
    aud: String,
    tid: String,
    scope: ScopeSet,
    amr: Vec<String>,
    acr: Option<String>,
    nonce: Option<String>,
    iat: i64,
    exp: i64,
    jti: String,
    token_use: TokenUse,
    adm: bool,
    namespace: String,
    system: SystemClaims,
    profile: Map<String, Value>,
}

impl Claims {
    /// # Errors
    /// Returns an error if any identity claim is empty or `ttl` is not positive.
    pub fn new(
        issuer: &ResolvedIssuer,
        sub: &str,
        tid: &str,
        aud: &str,
        token_use: TokenUse,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Self, ClaimsError> {
        for (name, value) in [
            ("iss", issuer.issuer.as_str()),
            ("sub", sub),
            ("tid", tid),
            ("aud", aud),
        ] {
            if value.trim().is_empty() {
                return Err(ClaimsError::Empty(name));
            }
        }
        if ttl <= Duration::zero() {
            return Err(ClaimsError::Lifetime);
        }
        Ok(Self {
            iss: issuer.issuer.clone(),
            sub: sub.to_string(),
            aud: aud.to_string(),
            tid: tid.to_string(),
            scope: ScopeSet::default(),
            amr: Vec::new(),
            acr: None,
            nonce: None,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
            token_use,
            adm: false,
            namespace: issuer.namespace.clone(),
            system: SystemClaims::default(),
            profile: Map::new(),
        })
    }

    #[must_use]
    pub fn with_scope(mut self, scope: ScopeSet) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_amr(mut self, amr: Vec<String>) -> Self {
        self.amr = amr;
        self
    }

    #[must_use]
    pub fn with_acr(mut self, acr: Option<String>) -> Self {
        self.acr = acr.filter(|acr| !acr.is_empty());
        self
    }

    #[must_use]
    pub fn with_nonce(mut self, nonce: Option<String>) -> Self {
        self.nonce = nonce.filter(|nonce| !nonce.is_empty());
        self
    }

    #[must_use]
    pub fn with_system(mut self, system: SystemClaims) -> Self {
        self.system = system;
        self
    }

    #[must_use]
    pub fn with_admin(mut self, adm: bool) -> Self {
        self.adm = adm;
        self
    }

    /// Extra top-level claims (OIDC profile fields). Reserved names are dropped.
    #[must_use]
    pub fn with_profile(mut self, profile: Map<String, Value>) -> Self {
        self.profile = profile
            .into_iter()
            .filter(|(key, _)| !is_reserved(key, &self.namespace))
            .collect();
        self
    }

    #[must_use]
    pub fn iss(&self) -> &str {
        &self.iss
    }

    #[must_use]
    pub fn sub(&self) -> &str {
        &self.sub
    }

    #[must_use]
    pub fn aud(&self) -> &str {
        &self.aud
    }

    #[must_use]
    pub fn tid(&self) -> &str {
        &self.tid
    }

    #[must_use]
    pub fn scope(&self) -> &ScopeSet {
        &self.scope
    }

    #[must_use]
    pub fn amr(&self) -> &[String] {
        &self.amr
    }

    #[must_use]
    pub fn acr(&self) -> Option<&str> {
        self.acr.as_deref()
    }

    #[must_use]
    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    #[must_use]
    pub fn exp(&self) -> i64 {
        self.exp
    }

    #[must_use]
    pub fn token_use(&self) -> TokenUse {
        self.token_use
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.adm
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn system(&self) -> &SystemClaims {
        &self.system
    }

    #[must_use]
    pub fn profile(&self) -> &Map<String, Value> {
        &self.profile
    }
}

const RESERVED: [&str; 14] = [
    "iss",
    "sub",
    "aud",
    "tid",
    "scope",
    "amr",
    "acr",
    "nonce",
    "iat",
    "exp",
    "nbf",
    "jti",
    "token_use",
    "adm",
];

fn is_reserved(key: &str, namespace: &str) -> bool {
    key == namespace || RESERVED.contains(&key)
}

impl Serialize for Claims {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("iss", &self.iss)?;
        map.serialize_entry("sub", &self.sub)?;
        map.serialize_entry("aud", &self.aud)?;
        map.serialize_entry("tid", &self.tid)?;
        if !self.scope.is_empty() {
            map.serialize_entry("scope", &self.scope)?;
        }
        if !self.amr.is_empty() {
            map.serialize_entry("amr", &self.amr)?;
        }
        if let Some(acr) = &self.acr {
            map.serialize_entry("acr", acr)?;
        }
        if let Some(nonce) = &self.nonce {
            map.serialize_entry("nonce", nonce)?;
        }
        map.serialize_entry("iat", &self.iat)?;
        map.serialize_entry("exp", &self.exp)?;
        map.serialize_entry("jti", &self.jti)?;
        map.serialize_entry("token_use", &self.token_use)?;
        if self.adm {
            map.serialize_entry("adm", &true)?;
        }
        if !self.system.is_empty() {
            map.serialize_entry(&self.namespace, &self.system)?;
        }
        for (key, value) in &self.profile {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[derive(Deserialize)]
struct RawClaims {
    iss: String,
    sub: String,
    aud: String,
    tid: String,
    #[serde(default)]
    scope: ScopeSet,
    #[serde(default)]
    amr: Vec<String>,
    #[serde(default)]
    acr: Option<String>,
    #[serde(default)]
    nonce: Option<String>,
    iat: i64,
    exp: i64,
    jti: String,
    token_use: TokenUse,
    #[serde(default)]
    adm: bool,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TryFrom<RawClaims> for Claims {
    type Error = ClaimsError;

    fn try_from(mut raw: RawClaims) -> Result<Self, Self::Error> {
        for (name, value) in [
            ("iss", raw.iss.as_str()),
            ("sub", raw.sub.as_str()),
            ("tid", raw.tid.as_str()),
            ("aud", raw.aud.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(ClaimsError::Empty(name));
            }
        }
        let issuer = ResolvedIssuer::from_issuer(&raw.iss);
        let system = match raw.extra.remove(&issuer.namespace) {
            Some(value) => serde_json::from_value(value)
                .map_err(|err| ClaimsError::System(err.to_string()))?,
            None => SystemClaims::default(),
        };
        raw.extra.remove("nbf");
        Ok(Self {
            iss: raw.iss,
            sub: raw.sub,
            aud: raw.aud,
            tid: raw.tid,
            scope: raw.scope,
            amr: raw.amr,
            acr: raw.acr,
            nonce: raw.nonce,
            iat: raw.iat,
            exp: raw.exp,
            jti: raw.jti,
            token_use: raw.token_use,
            adm: raw.adm,
            namespace: issuer.namespace,
            system,
            profile: raw.extra,
        })
    }
}
