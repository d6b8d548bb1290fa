//! Encoding of values stored in a device's secret bundle.
//!
//! Every field under `spec.keys.data` is standard base64 over UTF-8 text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Errors decoding a secret bundle field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretError {
    /// The field is not valid base64.
    #[error("invalid base64: {0}")]
    Base64(String),

    /// The decoded bytes are not UTF-8.
    #[error("decoded value is not valid UTF-8")]
    Utf8,
}

/// Decode a base64 secret field into text.
///
/// # Errors
///
/// Returns an error if the value is not base64 or does not decode to UTF-8.
pub fn decode_secret(encoded: &str) -> Result<String, SecretError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| SecretError::Base64(e.to_string()))?;
    String::from_utf8(bytes).map_err(|_| SecretError::Utf8)
}

/// Encode text as a base64 secret field.
#[must_use]
pub fn encode_secret(plain: &str) -> String {
    STANDARD.encode(plain.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_known_value() {
        assert_eq!(decode_secret("cGk=").unwrap(), "pi");
        assert_eq!(encode_secret("pi"), "cGk=");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode_secret("!!!"), Err(SecretError::Base64(_))));
        // 0xff 0xfe is not UTF-8
        assert_eq!(decode_secret("//4="), Err(SecretError::Utf8));
    }
}
