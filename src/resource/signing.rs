//! Request signing for the session service

use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::BTreeMap;

use crate::{Result, SessionError};

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_APP_ID: &str = "x-app-id";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_SIGNATURE: &str = "x-signature";

/// Authentication headers for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub app_id: String,
    pub timestamp: u64,
    pub signature: String,
}

impl SignedHeaders {
    pub fn into_headers(self) -> Vec<(String, String)> {
        vec![
            (HEADER_APP_ID.to_string(), self.app_id),
            (HEADER_TIMESTAMP.to_string(), self.timestamp.to_string()),
            (HEADER_SIGNATURE.to_string(), self.signature),
        ]
    }
}

/// HMAC-SHA256 signer keyed by the application secret.
#[derive(Clone)]
pub struct Signer {
    app_id: String,
    secret: String,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").field("app_id", &self.app_id).finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(app_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self { app_id: app_id.into(), secret: secret.into() }
    }

    /// Sign `body` at `timestamp_ms`.
    ///
    /// The MAC covers the decimal timestamp followed by [`canonical_json`] of the body.
    pub fn sign(&self, body: &Value, timestamp_ms: u64) -> Result<SignedHeaders> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| SessionError::invalid_config(format!("signing key rejected: {e}")))?;
        mac.update(timestamp_ms.to_string().as_bytes());
        mac.update(canonical_json(body).as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(SignedHeaders { app_id: self.app_id.clone(), timestamp: timestamp_ms, signature })
    }
}

/// Serialize with object keys sorted and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    sorted(value).to_string()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, sorted(v))).collect();
            let mut out = Map::new();
            for (key, value) in ordered {
                out.insert(key.clone(), value);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_form_sorts_nested_keys() {
        let body = json!({ "z": 1, "a": { "y": [ { "k": 2, "b": 1 } ], "c": "x y" } });
        assert_eq!(canonical_json(&body), r#"{"a":{"c":"x y","y":[{"b":1,"k":2}]},"z":1}"#);
    }

    #[test]
    fn signature_is_stable_across_key_order() {
        let signer = Signer::new("app", "secret");
        let a = signer.sign(&json!({ "avatar_id": "a1", "b": 2 }), 1_700_000_000_000).unwrap();
        let b = signer.sign(&json!({ "b": 2, "avatar_id": "a1" }), 1_700_000_000_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.signature.len(), 64);

        let later = signer.sign(&json!({ "b": 2, "avatar_id": "a1" }), 1_700_000_000_001).unwrap();
        assert_ne!(a.signature, later.signature);
    }

    #[test]
    fn headers_carry_app_and_timestamp() {
        let headers = Signer::new("app-7", "k").sign(&json!({}), 42).unwrap().into_headers();
        assert_eq!(headers[0], (HEADER_APP_ID.to_string(), "app-7".to_string()));
        assert_eq!(headers[1], (HEADER_TIMESTAMP.to_string(), "42".to_string()));
        assert_eq!(headers[2].0, HEADER_SIGNATURE);
    }

    #[test]
    fn debug_hides_secret() {
        let rendered = format!("{:?}", Signer::new("app", "hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
