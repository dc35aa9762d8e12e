//! Typed decode target for message payloads

use serde::de::DeserializeOwned;

use crate::error::DecodeError;

/// A domain type the pipeline can decode and persist.
///
/// ```rust,ignore
/// impl Payload for User {
///     fn key(&self) -> String {
///         self.id.clone()
///     }
/// }
/// ```
pub trait Payload: DeserializeOwned + Send + Sync + 'static {
    /// Persistence identity; upserts are keyed on it.
    fn key(&self) -> String;
}

/// Decode JSON payload bytes into `T`.
pub fn decode<T: Payload>(bytes: &[u8]) -> Result<T, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError("empty payload".to_string()));
    }
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Item {
        sku: String,
    }

    impl Payload for Item {
        fn key(&self) -> String {
            self.sku.clone()
        }
    }

    #[test]
    fn test_decode_ok() {
        let item: Item = decode(br#"{"sku":"A-1"}"#).unwrap();
        assert_eq!(item.key(), "A-1");
    }

    #[test]
    fn test_decode_rejects_empty_and_garbage() {
        assert!(decode::<Item>(b"").is_err());
        assert!(decode::<Item>(b"not json").is_err());
        assert!(decode::<Item>(br#"{"name":"missing sku"}"#).is_err());
    }
}
