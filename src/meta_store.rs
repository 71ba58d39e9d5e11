use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

pub const META_FILE_NAME: &str = "meta.json";

pub type MetaRow = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaDocument {
    #[serde(default)]
    general: BTreeMap<String, Value>,
    #[serde(default)]
    arrays: BTreeMap<String, Vec<MetaRow>>,
}

/// Key/value settings stored next to a mod's files.
///
/// Each capability reads and writes its own keys; keys nobody claims are
/// preserved across a read/write cycle.
#[derive(Debug, Clone)]
pub struct MetaStore {
    path: PathBuf,
    doc: MetaDocument,
}

impl MetaStore {
    pub fn path_for(dir: &Path) -> PathBuf {
        dir.join(META_FILE_NAME)
    }

    /// Opens the store for `dir`. A missing file yields an empty store.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = Self::path_for(dir);
        if !path.exists() {
            return Ok(Self {
                path,
                doc: MetaDocument::default(),
            });
        }
        let raw = fs::read_to_string(&path).with_context(|| format!("read {:?}", path))?;
        let doc = if raw.trim().is_empty() {
            MetaDocument::default()
        } else {
            serde_json::from_str(&raw).with_context(|| format!("parse {:?}", path))?
        };
        Ok(Self { path, doc })
    }

    pub fn empty(dir: &Path) -> Self {
        Self {
            path: Self::path_for(dir),
            doc: MetaDocument::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, key: &str) -> bool {
        self.doc.general.contains_key(key)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.doc.general.get(key)
    }

    pub fn string(&self, key: &str) -> Option<String> {
        match self.doc.general.get(key)? {
            Value::String(value) => Some(value.clone()),
            Value::Number(value) => Some(value.to_string()),
            Value::Bool(value) => Some(value.to_string()),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        value_as_int(self.doc.general.get(key)?)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.doc.general.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.doc.general.remove(key);
    }

    pub fn array(&self, name: &str) -> &[MetaRow] {
        self.doc
            .arrays
            .get(name)
            .map(|rows| rows.as_slice())
            .unwrap_or(&[])
    }

    pub fn set_array(&mut self, name: &str, rows: Vec<MetaRow>) {
        if rows.is_empty() {
            self.doc.arrays.remove(name);
        } else {
            self.doc.arrays.insert(name.to_string(), rows);
        }
    }

    /// Flushes the store to disk through a temp file.
    pub fn sync(&self) -> Result<()> {
        let raw = serde_json::to_string_pretty(&self.doc).context("serialize mod metadata")?;
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, raw).with_context(|| format!("write {:?}", temp))?;
        fs::rename(&temp, &self.path).with_context(|| format!("finalize {:?}", self.path))?;
        Ok(())
    }
}

pub fn value_as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

pub fn row(pairs: &[(&str, Value)]) -> MetaRow {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        assert!(!store.contains("notes"));
        assert!(store.array("installedFiles").is_empty());
    }

    #[test]
    fn sync_preserves_unknown_keys() {
        let dir = TempDir::new().unwrap();
        fs::write(
            MetaStore::path_for(dir.path()),
            r#"{"general":{"custom":"keep","modid":"42"}}"#,
        )
        .unwrap();

        let mut store = MetaStore::open(dir.path()).unwrap();
        assert_eq!(store.int("modid"), Some(42));
        store.set("notes", "hello");
        store.set_array(
            "installedFiles",
            vec![row(&[("modid", json!(1)), ("fileid", json!(2))])],
        );
        store.sync().unwrap();

        let reopened = MetaStore::open(dir.path()).unwrap();
        assert_eq!(reopened.string("custom").as_deref(), Some("keep"));
        assert_eq!(reopened.string("notes").as_deref(), Some("hello"));
        assert_eq!(reopened.array("installedFiles").len(), 1);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(MetaStore::path_for(dir.path()), "{ nope").unwrap();
        assert!(MetaStore::open(dir.path()).is_err());
    }

    #[test]
    fn sync_into_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::empty(&dir.path().join("gone"));
        assert!(store.sync().is_err());
    }
}
