//! Per-function API key authentication.
//!
//! The presented key is accepted from, in order: `Authorization: Bearer`,
//! the `api_key`/`apiKey` query parameter, and the `X-Api-Key` header.
//! Comparison against the stored key is constant-time.

use crate::error::{Error, Result};
use crate::store::FunctionDescriptor;

/// Extract the key a request presents, honoring the precedence order.
pub fn presented_key(headers: &[(String, String)], query_string: &str) -> Option<String> {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("authorization") {
            if let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")) {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    for pair in query_string.split('&') {
        if let Some((name, value)) = pair.split_once('=') {
            if (name == "api_key" || name == "apiKey") && !value.is_empty() {
                return urlencoding::decode(value).ok().map(|v| v.into_owned());
            }
        }
    }

    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("x-api-key"))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Constant-time byte comparison; length differences still take the same
/// time per byte scanned.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = (a.len() ^ b.len()) as u8;
    let longest = a.len().max(b.len());
    for i in 0..longest {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

/// Enforce the function's API key requirement.
pub fn authenticate(
    descriptor: &FunctionDescriptor,
    headers: &[(String, String)],
    query_string: &str,
) -> Result<()> {
    if !descriptor.requires_api_key {
        return Ok(());
    }
    let Some(stored) = descriptor.api_key.as_deref().filter(|k| !k.is_empty()) else {
        // Requires a key but none is stored: nothing can ever authenticate.
        return Err(Error::Unauthorized(
            "function requires an API key but has none configured".into(),
        ));
    };
    let Some(presented) = presented_key(headers, query_string) else {
        return Err(Error::Unauthorized("API key required".into()));
    };
    if constant_time_eq(presented.as_bytes(), stored.as_bytes()) {
        Ok(())
    } else {
        Err(Error::Unauthorized("Invalid API key".into()))
    }
}
