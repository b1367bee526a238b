use http::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Fingerprint of a request: lowercase hex SHA-256 digest, always 64 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedKey(String);

impl EncodedKey {
    /// Length of every key produced by the bundled encoders.
    pub const HEX_LEN: usize = 64;

    /// Wraps an already computed digest. Custom encoders use this.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EncodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EncodedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Request attributes that take part in fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAttributes {
    pub method: Method,
    pub path: String,
    pub body: Vec<u8>,
}

impl RequestAttributes {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Turns a raw idempotency key plus request attributes into an [`EncodedKey`].
///
/// Implementations must be deterministic across processes and restarts:
/// no salt, no clock, no randomness. Two inputs that encode to the same
/// value are treated as the same request.
pub trait KeyEncoder: Send + Sync {
    fn encode(&self, raw_key: &str, request: &RequestAttributes) -> EncodedKey;
}

/// Default encoder: SHA-256 over the raw key, method, path and body.
///
/// Every field is written as an 8-byte big-endian length followed by its bytes,
/// so shifting bytes between adjacent fields always changes the digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256KeyEncoder;

impl Sha256KeyEncoder {
    pub fn new() -> Self {
        Self
    }

    fn update_field(hasher: &mut Sha256, field: &[u8]) {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
}

impl KeyEncoder for Sha256KeyEncoder {
    fn encode(&self, raw_key: &str, request: &RequestAttributes) -> EncodedKey {
        let mut hasher = Sha256::new();

        Self::update_field(&mut hasher, raw_key.as_bytes());
        Self::update_field(&mut hasher, request.method.as_str().as_bytes());
        Self::update_field(&mut hasher, request.path.as_bytes());
        Self::update_field(&mut hasher, &request.body);

        EncodedKey::from_digest(&hasher.finalize())
    }
}

/// Encoder that only looks at the client-provided key.
///
/// Any request carrying the same raw key is a duplicate, whatever its method,
/// path or body.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawKeyEncoder;

impl RawKeyEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl KeyEncoder for RawKeyEncoder {
    fn encode(&self, raw_key: &str, _request: &RequestAttributes) -> EncodedKey {
        let mut hasher = Sha256::new();
        hasher.update(raw_key.as_bytes());
        EncodedKey::from_digest(&hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THE_KEY: &str = "7495e32b-709b-4fae-bfd4-2497094bf3fd";

    fn voucher_request() -> RequestAttributes {
        RequestAttributes::new(Method::POST, "/views/create/")
            .with_body(r#"{"id":1,"name":"myvoucher0","internal_name":"myvoucher0"}"#)
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let encoder = Sha256KeyEncoder::new();
        let key1 = encoder.encode(THE_KEY, &voucher_request());
        let key2 = encoder.encode(THE_KEY, &voucher_request());

        assert_eq!(key1, key2);
    }

    #[test]
    fn test_key_length_is_fixed() {
        let encoder = Sha256KeyEncoder::new();
        let short = encoder.encode("a", &RequestAttributes::new(Method::POST, "/"));
        let long = encoder.encode(&"k".repeat(500), &voucher_request().with_body(vec![7u8; 4096]));

        assert_eq!(short.as_str().len(), EncodedKey::HEX_LEN);
        assert_eq!(long.as_str().len(), EncodedKey::HEX_LEN);
        assert!(short.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_different_attributes_different_keys() {
        let encoder = Sha256KeyEncoder::new();
        let base = encoder.encode(THE_KEY, &voucher_request());

        let other_body = voucher_request().with_body(r#"{"id":2}"#);
        let other_path = RequestAttributes::new(Method::POST, "/views/create-manual/")
            .with_body(voucher_request().body);
        let other_method = RequestAttributes::new(Method::PUT, "/views/create/")
            .with_body(voucher_request().body);

        assert_ne!(base, encoder.encode(THE_KEY, &other_body));
        assert_ne!(base, encoder.encode(THE_KEY, &other_path));
        assert_ne!(base, encoder.encode(THE_KEY, &other_method));
        assert_ne!(base, encoder.encode("another-key", &voucher_request()));
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let encoder = Sha256KeyEncoder::new();
        let a = encoder.encode("ab", &RequestAttributes::new(Method::POST, "c"));
        let b = encoder.encode("a", &RequestAttributes::new(Method::POST, "bc"));

        assert_ne!(a, b);
    }

    #[test]
    fn test_raw_key_encoder_ignores_attributes() {
        let encoder = RawKeyEncoder::new();
        let key1 = encoder.encode(THE_KEY, &voucher_request());
        let key2 = encoder.encode(THE_KEY, &RequestAttributes::new(Method::DELETE, "/elsewhere"));
        let key3 = encoder.encode("different-request", &voucher_request());

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
        assert_eq!(key1.as_str().len(), EncodedKey::HEX_LEN);
    }

    #[test]
    fn test_encoded_key_serializes_as_plain_string() {
        let key = EncodedKey::new("00ff");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"00ff\"");
        assert_eq!(key.to_string(), "00ff");
    }
}
