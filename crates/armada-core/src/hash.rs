use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Stable SHA-256 hex digest of a value's JSON encoding.
///
/// `serde_json::Map` is a `BTreeMap` without the `preserve_order`
/// feature, so object keys serialize sorted and equal documents hash equal.
pub fn spec_hash<T: Serialize + ?Sized>(value: &T) -> CoreResult<String> {
    let bytes = serde_json::to_vec(value).map_err(|e| CoreError::Parse(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(spec_hash(&a).unwrap(), spec_hash(&b).unwrap());
        assert_ne!(spec_hash(&a).unwrap(), spec_hash(&json!({"a": 1})).unwrap());
        assert_eq!(spec_hash(&a).unwrap().len(), 64);
    }
}
