use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AuthQuery {
    pub(crate) token: Option<String>,
}

/// Checks the `?token=` query parameter against the configured secret. No
/// secret, or an empty one, admits everyone.
pub(crate) fn is_authorized(expected: Option<&str>, query_token: Option<&str>) -> bool {
    match expected {
        None | Some("") => true,
        Some(expected) => query_token == Some(expected),
    }
}
