//! Flat key/value configuration documents and the vendor override merge.

use std::path::Path;

use serde_json::{Map, Value};

use crate::ConfigError;

/// A configuration mapping: top-level key to JSON value.
///
/// Keys are kept sorted, so serializing the same mapping always yields the
/// same bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveConfig(Map<String, Value>);

impl EffectiveConfig {
    #[must_use]
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Load a `.json` or `.toml` document. Anything else is parsed as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        if is_toml {
            Self::from_toml_str(&content)
                .map_err(|e| e.with_source_path(&path.display().to_string()))
        } else {
            Self::from_json_str(&content)
                .map_err(|e| e.with_source_path(&path.display().to_string()))
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_str(s).map_err(|e| ConfigError::Parse(String::new(), e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let table: toml::Table =
            toml::from_str(s).map_err(|e| ConfigError::Parse(String::new(), e.to_string()))?;
        let value = serde_json::to_value(table)
            .map_err(|e| ConfigError::Parse(String::new(), e.to_string()))?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(ConfigError::NotAMapping(json_type_name(&other))),
        }
    }

    /// Layer `overlay` on top of `self`; see [`merge`].
    #[must_use]
    pub fn merged_with(&self, overlay: &Self) -> Self {
        merge(self, overlay)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Canonical on-disk form: pretty JSON with a trailing newline.
    #[must_use]
    pub fn to_canonical_string(&self) -> String {
        let mut out = serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| "{}".to_string());
        out.push('\n');
        out
    }
}

impl From<Map<String, Value>> for EffectiveConfig {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Merge a vendor override onto a base mapping.
///
/// Every base key survives; a key present in both takes the override value
/// wholesale (top-level replacement, nested objects are not merged);
/// override-only keys are added. Nothing is ever removed.
#[must_use]
pub fn merge(base: &EffectiveConfig, overlay: &EffectiveConfig) -> EffectiveConfig {
    let mut merged = base.0.clone();
    for (k, v) in &overlay.0 {
        merged.insert(k.clone(), v.clone());
    }
    EffectiveConfig(merged)
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> EffectiveConfig {
        EffectiveConfig::from_value(value).unwrap()
    }

    #[test]
    fn test_override_wins_and_base_preserved() {
        let base = doc(json!({"seqlength": 2048, "batchsize": 4, "zero_optimization": {"stage": 1}}));
        let vendor = doc(json!({"batchsize": 8, "steps_per_print": 10}));

        let merged = merge(&base, &vendor);
        assert_eq!(merged.get("seqlength"), Some(&json!(2048)));
        assert_eq!(merged.get("batchsize"), Some(&json!(8)));
        assert_eq!(merged.get("steps_per_print"), Some(&json!(10)));
        assert_eq!(merged.get("zero_optimization"), Some(&json!({"stage": 1})));
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn test_nested_objects_replaced_wholesale() {
        let base = doc(json!({"zero_optimization": {"stage": 1, "overlap_comm": true}}));
        let vendor = doc(json!({"zero_optimization": {"stage": 3}}));

        let merged = merge(&base, &vendor);
        assert_eq!(merged.get("zero_optimization"), Some(&json!({"stage": 3})));
    }

    #[test]
    fn test_merge_idempotent() {
        let base = doc(json!({"a": 1, "b": "x", "c": [1, 2]}));
        let vendor = doc(json!({"b": "y", "d": false}));

        let once = merge(&base, &vendor);
        let twice = merge(&once, &vendor);
        assert_eq!(once, twice);
        assert_eq!(once.to_canonical_string(), twice.to_canonical_string());
    }

    #[test]
    fn test_merge_associative_in_effect() {
        let base = doc(json!({"a": 1, "b": 2, "c": 3}));
        let o1 = doc(json!({"a": 10, "d": 4}));
        // Touches a key disjoint from o1 plus one identical to o1.
        let o2 = doc(json!({"c": 30, "d": 4}));

        let left = merge(&merge(&base, &o1), &o2);
        let right = merge(&base, &merge(&o1, &o2));
        assert_eq!(left, right);
    }

    #[test]
    fn test_canonical_string_is_sorted_and_stable() {
        let a = EffectiveConfig::from_json_str(r#"{"zeta": 1, "alpha": 2}"#).unwrap();
        let b = EffectiveConfig::from_json_str(r#"{"alpha": 2, "zeta": 1}"#).unwrap();
        assert_eq!(a.to_canonical_string(), b.to_canonical_string());
        assert!(a.to_canonical_string().find("alpha") < a.to_canonical_string().find("zeta"));
        assert!(a.to_canonical_string().ends_with('\n'));
    }

    #[test]
    fn test_toml_document() {
        let cfg = EffectiveConfig::from_toml_str(
            r#"
seqlength = 4096
precision = "bf16"
theoryflops = 312e12

[deepspeed]
stage = 2
"#,
        )
        .unwrap();
        assert_eq!(cfg.get("seqlength"), Some(&json!(4096)));
        assert_eq!(cfg.get("precision"), Some(&json!("bf16")));
        assert_eq!(cfg.get("deepspeed"), Some(&json!({"stage": 2})));
    }

    #[test]
    fn test_non_mapping_rejected() {
        let err = EffectiveConfig::from_json_str("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, ConfigError::NotAMapping("array")));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("ds_config.json");
        let toml_path = dir.path().join("case.toml");
        std::fs::write(&json_path, r#"{"gbs": 512}"#).unwrap();
        std::fs::write(&toml_path, "gbs = 256\n").unwrap();

        assert_eq!(
            EffectiveConfig::load(&json_path).unwrap().get("gbs"),
            Some(&json!(512))
        );
        assert_eq!(
            EffectiveConfig::load(&toml_path).unwrap().get("gbs"),
            Some(&json!(256))
        );

        let missing = EffectiveConfig::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io(..)));
    }
}
