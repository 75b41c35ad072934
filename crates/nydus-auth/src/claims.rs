//! User-hash extraction from Xbox-stage responses
//!
//! Both Xbox stages return the user hash at `DisplayClaims.xui[0].uhs`. The
//! descent is data-driven: each step names the key or index to take and, by
//! its variant, the carrier kind the current node must have. A kind mismatch
//! anywhere in the walk is a malformed-upstream error naming the exact step,
//! never a silently empty hash.

use serde_json::Value;

use crate::error::{Error, Result};

/// One descent step: take a key from an object or an index from an array.
#[derive(Debug, Clone, Copy)]
enum Step {
    Key(&'static str),
    Index(usize),
}

/// Where the user hash lives in an Xbox Live / XSTS response body.
const USER_HASH_PATH: &[Step] = &[
    Step::Key("DisplayClaims"),
    Step::Key("xui"),
    Step::Index(0),
    Step::Key("uhs"),
];

/// Walk `USER_HASH_PATH` through the response body and return the hash.
pub fn extract_user_hash(body: &Value) -> Result<String> {
    let mut node = body;
    for step in USER_HASH_PATH {
        node = match *step {
            Step::Key(key) => {
                let object = node.as_object().ok_or_else(|| {
                    Error::MalformedResponse(format!(
                        "expected an object carrying {key:?} in the user-hash path, found {}",
                        kind(node)
                    ))
                })?;
                object.get(key).ok_or_else(|| {
                    Error::MalformedResponse(format!("user-hash path is missing key {key:?}"))
                })?
            }
            Step::Index(idx) => {
                let array = node.as_array().ok_or_else(|| {
                    Error::MalformedResponse(format!(
                        "expected an array at index {idx} in the user-hash path, found {}",
                        kind(node)
                    ))
                })?;
                array.get(idx).ok_or_else(|| {
                    Error::MalformedResponse(format!(
                        "user-hash path index {idx} is out of bounds (len {})",
                        array.len()
                    ))
                })?
            }
        };
    }

    node.as_str().map(str::to_owned).ok_or_else(|| {
        Error::MalformedResponse(format!(
            "user-hash path ended on {}, not a string",
            kind(node)
        ))
    })
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_hash_from_wellformed_body() {
        let body = json!({
            "IssueInstant": "2026-03-14T09:26:53.1234567Z",
            "NotAfter": "2026-03-15T09:26:53.1234567Z",
            "Token": "xbl-token",
            "DisplayClaims": { "xui": [ { "uhs": "187000000000" } ] }
        });
        assert_eq!(extract_user_hash(&body).unwrap(), "187000000000");
    }

    #[test]
    fn object_step_on_array_fails() {
        let body = json!([{ "DisplayClaims": {} }]);
        let err = extract_user_hash(&body).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)), "{err}");
    }

    #[test]
    fn array_step_on_object_fails() {
        let body = json!({ "DisplayClaims": { "xui": { "uhs": "h" } } });
        let err = extract_user_hash(&body).unwrap_err();
        assert!(err.to_string().contains("expected an array"), "{err}");
    }

    #[test]
    fn missing_key_fails() {
        let body = json!({ "DisplayClaims": { "other": [] } });
        let err = extract_user_hash(&body).unwrap_err();
        assert!(err.to_string().contains("missing key"), "{err}");
    }

    #[test]
    fn empty_array_fails() {
        let body = json!({ "DisplayClaims": { "xui": [] } });
        let err = extract_user_hash(&body).unwrap_err();
        assert!(err.to_string().contains("out of bounds"), "{err}");
    }

    #[test]
    fn non_string_leaf_fails() {
        let body = json!({ "DisplayClaims": { "xui": [ { "uhs": 42 } ] } });
        let err = extract_user_hash(&body).unwrap_err();
        assert!(err.to_string().contains("not a string"), "{err}");
    }
}
