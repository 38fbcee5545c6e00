//! Document matchers for secondary indexes.
//!
//! A matcher selects the subset of the global sequence a secondary index
//! covers. Matchers are persisted inside the index metadata so an index can
//! be reopened without the caller restating its definition. Three forms:
//!
//! - [`Matcher::Object`]: property constraints applied recursively, deep
//!   equality on leaves — evaluated natively
//! - [`Matcher::Builtin`]: tagged predicates evaluated natively
//! - [`Matcher::Script`]: an opaque user script plus an HMAC-SHA256 tag
//!   under the storage secret; evaluation dispatches to a [`ScriptEngine`]
//!   collaborator and is rejected when none is configured
//!
//! The HMAC tag means a reopened store refuses to run script sources that
//! were not written under its own secret.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::StorageError;

/// Sandboxed evaluator for persisted script matchers.
///
/// The engine decides what the script source means; the storage core only
/// authenticates it. Implementations must be deterministic per document.
pub trait ScriptEngine: Send {
    fn matches(&self, source: &str, document: &Value) -> Result<bool, StorageError>;
}

/// Natively evaluated matcher tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinMatcher {
    /// Matches every document.
    All,
}

/// A persisted user script with its authentication tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptMatcher {
    /// Opaque script source, interpreted by the configured [`ScriptEngine`].
    pub source: String,
    /// Hex HMAC-SHA256 of `source` under the storage secret.
    pub hmac: String,
}

/// A predicate over documents, in persistable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Matcher {
    /// Property constraints, applied recursively; deep equality on leaves.
    Object(Map<String, Value>),
    /// A natively evaluated tag.
    Builtin(BuiltinMatcher),
    /// An authenticated user script.
    Script(ScriptMatcher),
}

impl Matcher {
    /// Builds an object matcher from property constraints.
    ///
    /// Returns `None` when `constraints` is not a JSON object.
    pub fn object(constraints: Value) -> Option<Self> {
        match constraints {
            Value::Object(map) => Some(Matcher::Object(map)),
            _ => None,
        }
    }

    /// Builds a script matcher, tagging `source` under `secret`.
    pub fn script(source: impl Into<String>, secret: &str) -> Self {
        let source = source.into();
        let hmac = hmac_tag(secret, &source);
        Matcher::Script(ScriptMatcher { source, hmac })
    }

    /// Verifies the authentication tag of a script matcher.
    ///
    /// Non-script matchers carry no tag and always verify. The comparison
    /// is constant-time.
    pub fn verify_hmac(&self, secret: &str) -> bool {
        match self {
            Matcher::Script(script) => {
                let expected = hmac_tag(secret, &script.source);
                expected.as_bytes().ct_eq(script.hmac.as_bytes()).into()
            }
            Matcher::Object(_) | Matcher::Builtin(_) => true,
        }
    }

    /// Evaluates the matcher against a document.
    ///
    /// # Errors
    ///
    /// [`StorageError::ScriptRejected`] for a script matcher when no engine
    /// is configured; engine errors are passed through.
    pub fn matches(
        &self,
        document: &Value,
        engine: Option<&dyn ScriptEngine>,
    ) -> Result<bool, StorageError> {
        match self {
            Matcher::Object(constraints) => Ok(object_matches(constraints, document)),
            Matcher::Builtin(BuiltinMatcher::All) => Ok(true),
            Matcher::Script(script) => match engine {
                Some(engine) => engine.matches(&script.source, document),
                None => Err(StorageError::ScriptRejected),
            },
        }
    }
}

/// Evaluates an optional matcher against an optional document.
///
/// A missing document matches nothing; a missing matcher matches everything.
pub fn matches(
    document: Option<&Value>,
    matcher: Option<&Matcher>,
    engine: Option<&dyn ScriptEngine>,
) -> Result<bool, StorageError> {
    let Some(document) = document else {
        return Ok(false);
    };
    match matcher {
        None => Ok(true),
        Some(matcher) => matcher.matches(document, engine),
    }
}

/// Recursive property-constraint evaluation.
fn object_matches(constraints: &Map<String, Value>, document: &Value) -> bool {
    let Some(fields) = document.as_object() else {
        return false;
    };
    constraints.iter().all(|(key, want)| match fields.get(key) {
        Some(have) => match want {
            Value::Object(nested) => object_matches(nested, have),
            leaf => leaf == have,
        },
        None => false,
    })
}

/// Hex HMAC-SHA256 tag of `source` under `secret`.
fn hmac_tag(secret: &str, source: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(source.as_bytes());
    let tag = mac.finalize().into_bytes();
    tag.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedEngine(bool);

    impl ScriptEngine for FixedEngine {
        fn matches(&self, _source: &str, _document: &Value) -> Result<bool, StorageError> {
            Ok(self.0)
        }
    }

    #[test]
    fn object_matcher_deep_equality() {
        let matcher = Matcher::object(json!({"type": "order", "payload": {"state": "open"}}))
            .expect("object constraints");
        let hit = json!({"type": "order", "payload": {"state": "open", "amount": 3}});
        let miss_leaf = json!({"type": "order", "payload": {"state": "closed"}});
        let miss_key = json!({"type": "order"});
        assert!(matcher.matches(&hit, None).unwrap());
        assert!(!matcher.matches(&miss_leaf, None).unwrap());
        assert!(!matcher.matches(&miss_key, None).unwrap());
    }

    #[test]
    fn object_matcher_rejects_non_objects() {
        let matcher = Matcher::object(json!({"a": 1})).unwrap();
        assert!(!matcher.matches(&json!(42), None).unwrap());
        assert!(!matcher.matches(&json!([1, 2]), None).unwrap());
    }

    #[test]
    fn missing_document_or_matcher() {
        let matcher = Matcher::Builtin(BuiltinMatcher::All);
        assert!(!matches(None, Some(&matcher), None).unwrap());
        assert!(matches(Some(&json!({})), None, None).unwrap());
    }

    #[test]
    fn script_matcher_requires_engine() {
        let matcher = Matcher::script("doc.foo > 1", "secret");
        let err = matcher.matches(&json!({"foo": 2}), None).unwrap_err();
        assert!(matches!(err, StorageError::ScriptRejected));

        let engine = FixedEngine(true);
        assert!(matcher.matches(&json!({"foo": 2}), Some(&engine)).unwrap());
    }

    #[test]
    fn script_hmac_verification() {
        let matcher = Matcher::script("doc.foo % 2 === 1", "foo");
        assert!(matcher.verify_hmac("foo"));
        assert!(!matcher.verify_hmac("bar"));
    }

    #[test]
    fn tampered_script_source_fails_verification() {
        let Matcher::Script(mut script) = Matcher::script("true", "secret") else {
            unreachable!()
        };
        script.source = "false".to_string();
        assert!(!Matcher::Script(script).verify_hmac("secret"));
    }

    #[test]
    fn matcher_serde_shapes() {
        let object = Matcher::object(json!({"kind": "a"})).unwrap();
        let json = serde_json::to_value(&object).unwrap();
        assert_eq!(json, json!({"object": {"kind": "a"}}));

        let builtin = Matcher::Builtin(BuiltinMatcher::All);
        assert_eq!(serde_json::to_value(&builtin).unwrap(), json!({"builtin": "all"}));

        let script = Matcher::script("x", "k");
        let round: Matcher =
            serde_json::from_value(serde_json::to_value(&script).unwrap()).unwrap();
        assert_eq!(round, script);
    }
}
