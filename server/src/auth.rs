use subtle::ConstantTimeEq;

/// Validates `Authorization: Bearer <token>` against the configured token
/// with a constant-time comparison. Length still leaks, as it does with any
/// digest compare; the token value does not.
pub fn is_valid_bearer(auth_header: Option<&str>, expected_token: &str) -> bool {
    let Some(header) = auth_header else {
        return false;
    };
    let Some(token) = header.strip_prefix("Bearer ") else {
        return false;
    };
    token.as_bytes().ct_eq(expected_token.as_bytes()).into()
}
