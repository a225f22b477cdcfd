//! Content-addressed registry of versioned run configurations.
//!
//! Every distinct configuration body registered under a base name is stored
//! as `{base}_v_{k}.json`. Registering a body equal to an existing version
//! (ignoring the `name` and `gpus` fields) hands back that version instead of
//! allocating a new one.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use wn_types::{validation_error, WnResult};

const VERSION_SEPARATOR: &str = "_v_";
const IGNORED_FIELDS: [&str; 2] = ["name", "gpus"];

#[derive(Debug, Clone)]
pub struct ConfigRegistry {
    dir: PathBuf,
}

impl ConfigRegistry {
    pub fn open<P: AsRef<Path>>(dir: P) -> WnResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self, version: &str) -> PathBuf {
        self.dir.join(format!("{}.json", version))
    }

    /// Register `body` under `base` and return its versioned name.
    pub fn register(&self, base: &str, body: &Value) -> WnResult<String> {
        let Some(fields) = body.as_object() else {
            return Err(validation_error!("config body for {} must be an object", base));
        };
        let base = base_name(base);
        if base.is_empty() {
            return Err(validation_error!("config base name must not be empty"));
        }

        let versions = self.versions(base)?;
        for k in &versions {
            let name = version_name(base, *k);
            let stored = self.load(&name)?;
            if let Some(stored) = stored.as_object() {
                if comparable(stored) == comparable(fields) {
                    info!("Reusing config version {}", name);
                    return Ok(name);
                }
            }
        }

        let next = versions.last().map_or(0, |k| k + 1);
        let name = version_name(base, next);
        let mut stored = fields.clone();
        stored.insert("name".to_string(), Value::String(name.clone()));
        std::fs::write(self.path(&name), serde_json::to_string_pretty(&stored)?)?;
        info!("Registered config version {}", name);
        Ok(name)
    }

    pub fn load(&self, version: &str) -> WnResult<Value> {
        let version = version.strip_suffix(".json").unwrap_or(version);
        let text = std::fs::read_to_string(self.path(version))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Version numbers registered under `base`, ascending.
    pub fn versions(&self, base: &str) -> WnResult<Vec<usize>> {
        let base = base_name(base);
        let prefix = format!("{}{}", base, VERSION_SEPARATOR);
        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let file_name = entry?.file_name();
            let Some(file_name) = file_name.to_str() else { continue };
            if let Some(k) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|k| k.parse::<usize>().ok())
            {
                versions.push(k);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

fn version_name(base: &str, k: usize) -> String {
    format!("{}{}{}", base, VERSION_SEPARATOR, k)
}

/// `accdoa_v_3.json` and `accdoa_v_3` both name the base `accdoa`.
fn base_name(name: &str) -> &str {
    let name = name.strip_suffix(".json").unwrap_or(name);
    match name.rsplit_once(VERSION_SEPARATOR) {
        Some((base, k)) if !k.is_empty() && k.chars().all(|c| c.is_ascii_digit()) => base,
        _ => name,
    }
}

fn comparable(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .filter(|(key, _)| !IGNORED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn first_registration_is_version_zero() {
        let dir = tempdir().unwrap();
        let registry = ConfigRegistry::open(dir.path()).unwrap();
        let name = registry
            .register("accdoa", &json!({"trials_per_round": 8}))
            .unwrap();
        assert_eq!(name, "accdoa_v_0");

        let stored = registry.load(&name).unwrap();
        assert_eq!(stored["name"], "accdoa_v_0");
        assert_eq!(stored["trials_per_round"], 8);
    }

    #[test]
    fn identical_bodies_share_a_version() {
        let dir = tempdir().unwrap();
        let registry = ConfigRegistry::open(dir.path()).unwrap();
        let a = registry
            .register("accdoa", &json!({"threshold": 0.05, "gpus": "0", "name": "x"}))
            .unwrap();
        let b = registry
            .register("accdoa", &json!({"threshold": 0.05, "gpus": "1,2"}))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.versions("accdoa").unwrap(), vec![0]);
    }

    #[test]
    fn distinct_bodies_get_increasing_versions() {
        let dir = tempdir().unwrap();
        let registry = ConfigRegistry::open(dir.path()).unwrap();
        registry.register("accdoa", &json!({"threshold": 0.05})).unwrap();
        registry.register("accdoa", &json!({"threshold": 0.1})).unwrap();
        let third = registry
            .register("accdoa_v_1.json", &json!({"threshold": 0.2}))
            .unwrap();
        assert_eq!(third, "accdoa_v_2");
        assert_eq!(registry.versions("accdoa").unwrap(), vec![0, 1, 2]);
        // other bases are independent
        assert_eq!(registry.register("seld", &json!({})).unwrap(), "seld_v_0");
    }

    #[test]
    fn base_names_strip_suffixes() {
        assert_eq!(base_name("accdoa"), "accdoa");
        assert_eq!(base_name("accdoa.json"), "accdoa");
        assert_eq!(base_name("accdoa_v_12.json"), "accdoa");
        assert_eq!(base_name("accdoa_v_x"), "accdoa_v_x");
        assert_eq!(base_name("my_v_1_v_2"), "my_v_1");
    }

    #[test]
    fn non_object_bodies_are_rejected() {
        let dir = tempdir().unwrap();
        let registry = ConfigRegistry::open(dir.path()).unwrap();
        assert!(registry.register("accdoa", &json!([1, 2])).is_err());
    }
}
