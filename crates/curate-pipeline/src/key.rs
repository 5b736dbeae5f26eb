//! Stage cache keys.
//!
//! A key is derived from the stage name, a snapshot of the configuration
//! the stage consumes, and the fingerprint of the stage's input. All three
//! are merged into one sorted-key JSON object, hashed with SHA-256, and
//! truncated to [`DIGEST_LEN`](crate::fingerprint::DIGEST_LEN) hex
//! characters. The truncated hash names the cache directory; collisions
//! are not detected.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint::{Fingerprint, short_digest};
use crate::types::{KeyError, PipelineConfig};

/// Reserved key entry holding the stage name.
pub const STAGE_FIELD: &str = "stage";

/// Reserved key entry holding the input fingerprint.
pub const INPUT_HASH_FIELD: &str = "input_hash";

/// Which configuration fields a stage's output depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigScope {
    /// Every set field, including collaborator `extra` fields.
    #[default]
    All,
    /// The named built-in fields plus every collaborator `extra` field.
    /// Names absent from the config are ignored.
    Fields(&'static [&'static str]),
}

impl ConfigScope {
    /// Take the snapshot of `config` this scope describes.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Serialize`] if the config cannot be serialized.
    pub fn snapshot(self, config: &PipelineConfig) -> Result<ConfigSnapshot, KeyError> {
        let mut fields = config.fields()?;
        if let Self::Fields(names) = self {
            fields.retain(|name, _| {
                names.contains(&name.as_str()) || config.extra.contains_key(name)
            });
        }
        Ok(ConfigSnapshot(fields))
    }
}

/// The configuration fields that feed one stage's key, sorted by name.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct ConfigSnapshot(BTreeMap<String, Value>);

impl ConfigSnapshot {
    /// Value of a field, if the snapshot contains it.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Number of fields in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the snapshot has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A derived cache key: the stage name plus a short hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageKey {
    stage: String,
    hash: String,
}

impl StageKey {
    /// The stage this key belongs to.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// The short hex hash.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The cache directory name, `{stage}_{hash}`.
    #[must_use]
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.stage, self.hash)
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.stage, self.hash)
    }
}

/// Derive the cache key for `stage_name` run with `config` on an input
/// whose fingerprint is `input`.
///
/// `config` must serialize to a JSON object. Fields that serialize to
/// `null` are dropped, so unset optional fields never change a key. The
/// reserved entries [`STAGE_FIELD`] and [`INPUT_HASH_FIELD`] overwrite
/// config fields of the same name.
///
/// The result depends only on the field values, never on declaration or
/// insertion order, and is identical across processes.
///
/// # Errors
///
/// Returns [`KeyError`] if `config` cannot be serialized to an object.
pub fn derive_key<C>(stage_name: &str, config: &C, input: &Fingerprint) -> Result<StageKey, KeyError>
where
    C: Serialize + ?Sized,
{
    let Value::Object(map) = serde_json::to_value(config)? else {
        return Err(KeyError::NotAnObject);
    };

    let mut fields: BTreeMap<String, Value> =
        map.into_iter().filter(|(_, v)| !v.is_null()).collect();
    fields.insert(STAGE_FIELD.to_string(), Value::from(stage_name));
    fields.insert(INPUT_HASH_FIELD.to_string(), Value::from(input.as_str()));

    let canonical = serde_json::to_vec(&fields)?;
    Ok(StageKey {
        stage: stage_name.to_string(),
        hash: short_digest(&canonical),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fingerprint::DIGEST_LEN;

    fn fp(s: &str) -> Fingerprint {
        serde_json::from_value(Value::from(s)).unwrap()
    }

    #[test]
    fn key_is_deterministic() {
        let config = PipelineConfig::default();
        let a = derive_key("resize", &config, &fp("0badc0de")).unwrap();
        let b = derive_key("resize", &config.clone(), &fp("0badc0de")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash().len(), DIGEST_LEN);
        assert_eq!(a.stage(), "resize");
        assert_eq!(a.dir_name(), format!("resize_{}", a.hash()));
        assert_eq!(a.to_string(), a.dir_name());
    }

    /// Pinned value: a change here means every existing cache entry on
    /// disk silently becomes a miss.
    #[test]
    fn key_is_stable_across_releases() {
        let config = serde_json::json!({ "target_size": 512 });
        let key = derive_key("resize", &config, &fp("0badc0de")).unwrap();
        let expected = short_digest(
            br#"{"input_hash":"0badc0de","stage":"resize","target_size":512}"#,
        );
        assert_eq!(key.hash(), expected);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut a = serde_json::Map::new();
        a.insert("b".to_string(), Value::from(2));
        a.insert("a".to_string(), Value::from(1));
        let mut b = serde_json::Map::new();
        b.insert("a".to_string(), Value::from(1));
        b.insert("b".to_string(), Value::from(2));

        assert_eq!(
            derive_key("s", &a, &fp("00000000")).unwrap(),
            derive_key("s", &b, &fp("00000000")).unwrap()
        );
    }

    #[test]
    fn null_fields_are_dropped() {
        let with_null = serde_json::json!({ "target_size": 512, "min_size": null });
        let without = serde_json::json!({ "target_size": 512 });
        assert_eq!(
            derive_key("s", &with_null, &fp("00000000")).unwrap(),
            derive_key("s", &without, &fp("00000000")).unwrap()
        );
    }

    #[test]
    fn each_input_changes_the_key() {
        let config = PipelineConfig::default();
        let base = derive_key("resize", &config, &fp("00000000")).unwrap();

        let other_stage = derive_key("select", &config, &fp("00000000")).unwrap();
        assert_ne!(base.hash(), other_stage.hash());

        let other_input = derive_key("resize", &config, &fp("11111111")).unwrap();
        assert_ne!(base, other_input);

        let other_config = PipelineConfig {
            jpeg_quality: 80,
            ..PipelineConfig::default()
        };
        let other_config = derive_key("resize", &other_config, &fp("00000000")).unwrap();
        assert_ne!(base, other_config);
    }

    #[test]
    fn non_object_config_is_rejected() {
        let result = derive_key("s", &42, &fp("00000000"));
        assert!(matches!(result, Err(KeyError::NotAnObject)));
    }

    #[test]
    fn scope_all_keeps_every_set_field() {
        let mut config = PipelineConfig::default();
        config.extra.insert("detector".to_string(), Value::from("hog"));
        let snapshot = ConfigScope::All.snapshot(&config).unwrap();
        assert_eq!(snapshot.len(), config.fields().unwrap().len());
        assert_eq!(snapshot.get("detector"), Some(&Value::from("hog")));
        assert!(snapshot.get("min_size").is_none());
    }

    #[test]
    fn scope_fields_keeps_only_named_fields() {
        let config = PipelineConfig::default();
        let snapshot = ConfigScope::Fields(&["target_size", "min_size", "nonexistent"])
            .snapshot(&config)
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("target_size"), Some(&Value::from(512)));
    }

    #[test]
    fn scope_fields_keeps_extra_fields() {
        let mut config = PipelineConfig::default();
        config
            .extra
            .insert("detector_model".to_string(), Value::from("cnn"));
        let snapshot = ConfigScope::Fields(&[]).snapshot(&config).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("detector_model"), Some(&Value::from("cnn")));
        assert!(snapshot.get("target_size").is_none());
    }

    #[test]
    fn scoped_key_follows_extra_fields() {
        let scope = ConfigScope::Fields(&["target_size"]);
        let a = PipelineConfig::default();
        let mut b = PipelineConfig::default();
        b.extra.insert("detector_model".to_string(), Value::from("cnn"));
        let ka = derive_key("s", &scope.snapshot(&a).unwrap(), &fp("00000000")).unwrap();
        let kb = derive_key("s", &scope.snapshot(&b).unwrap(), &fp("00000000")).unwrap();
        assert_ne!(ka, kb);
    }

    #[test]
    fn scoped_key_ignores_unrelated_fields() {
        let scope = ConfigScope::Fields(&["target_size"]);
        let a = PipelineConfig::default();
        let b = PipelineConfig {
            jpeg_quality: 10,
            ..PipelineConfig::default()
        };
        let ka = derive_key("s", &scope.snapshot(&a).unwrap(), &fp("00000000")).unwrap();
        let kb = derive_key("s", &scope.snapshot(&b).unwrap(), &fp("00000000")).unwrap();
        assert_eq!(ka, kb);
    }
}
