//! Access token payload decoding.
//!
//! Only the payload is read. The signature is not verified here: the client
//! treats the token as opaque and relies on the server rejecting bad tokens
//! with a 401.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value as JsonValue;

use crate::error::DecodeError;
use crate::models::Identity;

/// Claims read from an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub identity: Identity,
    pub expires_at: DateTime<Utc>,
}

impl Claims {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the token expires within `window` of `now` (or already has).
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now < window
    }
}

/// Decode the payload segment of a JWT into claims.
pub fn decode(token: &str) -> Result<Claims, DecodeError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(DecodeError::Malformed(parts.len()));
    }

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    let payload: JsonValue = serde_json::from_slice(&payload_bytes)
        .map_err(|e| DecodeError::Json(e.to_string()))?;

    let email = required_str(&payload, "sub")?;
    let id = match payload.get("userId") {
        Some(JsonValue::String(s)) if !s.is_empty() => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => return Err(DecodeError::MissingClaim("userId")),
    };
    let name = required_str(&payload, "name")?;
    let exp = payload
        .get("exp")
        .and_then(JsonValue::as_i64)
        .ok_or(DecodeError::MissingClaim("exp"))?;
    let expires_at = Utc
        .timestamp_opt(exp, 0)
        .single()
        .ok_or(DecodeError::MissingClaim("exp"))?;

    Ok(Claims {
        identity: Identity {
            id,
            email,
            name,
            picture: optional_str(&payload, "picture"),
            provider: optional_str(&payload, "provider"),
        },
        expires_at,
    })
}

fn required_str(payload: &JsonValue, key: &'static str) -> Result<String, DecodeError> {
    payload
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or(DecodeError::MissingClaim(key))
}

fn optional_str(payload: &JsonValue, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Build an unsigned token around the given payload.
#[cfg(test)]
pub(crate) fn encode_unsigned(payload: &JsonValue) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.signature", header, body)
}

/// Token for `a@b.com` expiring `expires_in` from now.
#[cfg(test)]
pub(crate) fn test_token(expires_in: Duration) -> String {
    test_token_for("a@b.com", expires_in)
}

#[cfg(test)]
pub(crate) fn test_token_for(email: &str, expires_in: Duration) -> String {
    encode_unsigned(&serde_json::json!({
        "sub": email,
        "userId": 42,
        "name": "Ada Lovelace",
        "picture": "https://example.com/ada.png",
        "provider": "google",
        "exp": (Utc::now() + expires_in).timestamp(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_valid_token() {
        let token = encode_unsigned(&json!({
            "sub": "a@b.com",
            "userId": "u-1",
            "name": "Ada",
            "provider": "google",
            "exp": 2_000_000_000i64,
        }));

        let claims = decode(&token).unwrap();
        assert_eq!(claims.identity.email, "a@b.com");
        assert_eq!(claims.identity.id, "u-1");
        assert_eq!(claims.identity.name, "Ada");
        assert_eq!(claims.identity.picture, None);
        assert_eq!(claims.identity.provider.as_deref(), Some("google"));
        assert_eq!(claims.expires_at.timestamp(), 2_000_000_000);
    }

    #[test]
    fn test_numeric_user_id_is_normalized() {
        let claims = decode(&test_token(Duration::hours(1))).unwrap();
        assert_eq!(claims.identity.id, "42");
    }

    #[test]
    fn test_padded_payload_is_accepted() {
        let token = test_token(Duration::hours(1));
        let parts: Vec<&str> = token.split('.').collect();
        let padded = format!("{}.{}==.{}", parts[0], parts[1], parts[2]);
        assert!(decode(&padded).is_ok());
    }

    #[test]
    fn test_decode_rejects_wrong_segment_count() {
        assert_eq!(decode("abc"), Err(DecodeError::Malformed(1)));
        assert_eq!(decode("a.b.c.d"), Err(DecodeError::Malformed(4)));
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(matches!(decode("a.!!!.c"), Err(DecodeError::Base64(_))));
    }

    #[test]
    fn test_decode_rejects_non_json_payload() {
        let body = URL_SAFE_NO_PAD.encode("not json");
        let token = format!("h.{}.s", body);
        assert!(matches!(decode(&token), Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_decode_rejects_missing_claims() {
        let token = encode_unsigned(&json!({"sub": "a@b.com", "name": "Ada", "exp": 1}));
        assert_eq!(decode(&token), Err(DecodeError::MissingClaim("userId")));

        let token = encode_unsigned(&json!({"sub": "a@b.com", "userId": 1, "name": "Ada"}));
        assert_eq!(decode(&token), Err(DecodeError::MissingClaim("exp")));
    }

    #[test]
    fn test_expiry_window() {
        let now = Utc::now();
        let claims = decode(&test_token(Duration::minutes(4))).unwrap();
        assert!(!claims.is_expired(now));
        assert!(claims.expires_within(Duration::minutes(5), now));
        assert!(!claims.expires_within(Duration::minutes(3), now));

        let expired = decode(&test_token(Duration::minutes(-1))).unwrap();
        assert!(expired.is_expired(now));
        assert!(expired.expires_within(Duration::minutes(5), now));
    }
}
