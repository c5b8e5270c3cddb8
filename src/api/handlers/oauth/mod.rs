pub mod authorize;
pub mod logout_all;
pub mod revoke;
pub mod token;

use axum::http::{HeaderMap, header::CONTENT_TYPE};

/// `application/x-www-form-urlencoded`, parameters such as `charset` allowed.
pub(crate) fn has_form_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|value| {
            value
                .trim()
                .eq_ignore_ascii_case("application/x-www-form-urlencoded")
        })
}
