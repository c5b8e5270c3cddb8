//! `application/x-www-form-urlencoded` request bodies.

use std::collections::HashMap;
use url::form_urlencoded;

use crate::api::error::ApiError;

/// Decoded form parameters. A parameter may appear at most once (RFC 6749 §3.2).
#[derive(Clone, Debug, Default)]
pub struct FormParams(HashMap<String, String>);

impl FormParams {
    /// # Errors
    /// `invalid_request` if a parameter is repeated.
    pub fn parse(body: &[u8]) -> Result<Self, ApiError> {
        let mut params = HashMap::new();
        for (key, value) in form_urlencoded::parse(body) {
            if params.insert(key.to_string(), value.into_owned()).is_some() {
                return Err(ApiError::invalid_request(format!(
                    "parameter {key} repeated"
                )));
            }
        }
        Ok(Self(params))
    }

    /// Parameters sent without a value are treated as omitted.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// # Errors
    /// `invalid_request` naming the missing parameter.
    pub fn require(&self, name: &str) -> Result<&str, ApiError> {
        self.get(name)
            .ok_or_else(|| ApiError::invalid_request(format!("missing {name}")))
    }
}
