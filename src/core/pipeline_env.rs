//! Persisted Environment: the filesystem-backed key/value space shared between steps.
//!
//! A dotted key such as `git.commitId` maps to `<root>/git/commitId`. JSON
//! values live in a sibling file with a `.json` suffix (`<root>/custom/config.json`).
//! Writes are buffered and land atomically on `flush`.

use crate::error::{Error, ErrorCode, Result};
use crate::utils::io;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const PIPELINE_ENV_DIR: &str = "commonPipelineEnvironment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Text,
    Json,
    Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnvValue {
    Text(String),
    Json(Value),
    Bytes(Vec<u8>),
}

impl EnvValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            EnvValue::Text(_) => ValueKind::Text,
            EnvValue::Json(_) => ValueKind::Json,
            EnvValue::Bytes(_) => ValueKind::Bytes,
        }
    }

    /// JSON view used when a PE value feeds the config resolver or is printed.
    pub fn to_json(&self) -> Value {
        match self {
            EnvValue::Text(s) => Value::String(s.clone()),
            EnvValue::Json(v) => v.clone(),
            EnvValue::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            EnvValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for EnvValue {
    fn from(value: &str) -> Self {
        EnvValue::Text(value.to_string())
    }
}

impl From<String> for EnvValue {
    fn from(value: String) -> Self {
        EnvValue::Text(value)
    }
}

impl From<Value> for EnvValue {
    fn from(value: Value) -> Self {
        EnvValue::Json(value)
    }
}

/// Validate a dotted key: non-empty segments, no path tricks.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.split('.').all(|segment| {
            !segment.is_empty()
                && !segment.contains('/')
                && !segment.contains('\\')
                && !segment.starts_with('~')
        })
        && !key.ends_with(".json");
    if valid {
        Ok(())
    } else {
        Err(Error::validation_invalid_argument(
            "key",
            format!("'{}' is not a valid pipeline environment key", key),
        ))
    }
}

#[derive(Debug)]
pub struct PipelineEnv {
    root: PathBuf,
    pending: Mutex<BTreeMap<String, EnvValue>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FlushFailure {
    key: String,
    error: String,
}

impl PipelineEnv {
    /// Open the PE below `env_root` (`<env_root>/commonPipelineEnvironment`).
    pub fn open(env_root: &Path) -> Self {
        Self::at(env_root.join(PIPELINE_ENV_DIR))
    }

    /// Open a PE rooted exactly at `root`.
    pub fn at(root: PathBuf) -> Self {
        Self {
            root,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn text_path(&self, key: &str) -> PathBuf {
        key.split('.').fold(self.root.clone(), |p, s| p.join(s))
    }

    fn json_path(&self, key: &str) -> PathBuf {
        let text = self.text_path(key);
        let mut name = text.file_name().unwrap_or_default().to_os_string();
        name.push(".json");
        text.with_file_name(name)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, EnvValue>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Buffer a value; it reaches disk on `flush`. Buffered values are
    /// visible to `read` immediately.
    pub fn write(&self, key: &str, value: impl Into<EnvValue>) -> Result<()> {
        validate_key(key)?;
        self.pending().insert(key.to_string(), value.into());
        Ok(())
    }

    /// Read a value, inferring its kind from the file layout. A `.json`
    /// file yields `Json`, valid UTF-8 yields `Text`, anything else `Bytes`.
    pub fn read(&self, key: &str) -> Result<Option<EnvValue>> {
        validate_key(key)?;
        if let Some(value) = self.pending().get(key) {
            return Ok(Some(value.clone()));
        }

        let op = format!("read pipeline env '{}'", key);
        if let Some(bytes) = io::read_optional(&self.json_path(key), &op)? {
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| Error::internal_json(e.to_string(), Some(op.clone())))?;
            return Ok(Some(EnvValue::Json(value)));
        }
        match io::read_optional(&self.text_path(key), &op)? {
            Some(bytes) => Ok(Some(match String::from_utf8(bytes) {
                Ok(text) => EnvValue::Text(text),
                Err(e) => EnvValue::Bytes(e.into_bytes()),
            })),
            None => Ok(None),
        }
    }

    /// Read a value as the kind its declaring ResourceRef names.
    pub fn read_as(&self, key: &str, kind: ValueKind) -> Result<Option<EnvValue>> {
        let value = match self.read(key)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let converted = match (kind, value) {
            (ValueKind::Text, EnvValue::Text(s)) => EnvValue::Text(s),
            (ValueKind::Text, EnvValue::Json(Value::String(s))) => EnvValue::Text(s),
            (ValueKind::Text, EnvValue::Json(v)) => EnvValue::Text(v.to_string()),
            (ValueKind::Text, EnvValue::Bytes(b)) => {
                EnvValue::Text(String::from_utf8_lossy(&b).into_owned())
            }
            (ValueKind::Json, EnvValue::Json(v)) => EnvValue::Json(v),
            (ValueKind::Json, EnvValue::Text(s)) => EnvValue::Json(
                serde_json::from_str(&s).unwrap_or(Value::String(s)),
            ),
            (ValueKind::Json, EnvValue::Bytes(b)) => EnvValue::Json(Value::String(
                String::from_utf8_lossy(&b).into_owned(),
            )),
            (ValueKind::Bytes, EnvValue::Bytes(b)) => EnvValue::Bytes(b),
            (ValueKind::Bytes, EnvValue::Text(s)) => EnvValue::Bytes(s.into_bytes()),
            (ValueKind::Bytes, EnvValue::Json(v)) => EnvValue::Bytes(v.to_string().into_bytes()),
        };
        Ok(Some(converted))
    }

    pub fn pending_keys(&self) -> Vec<String> {
        self.pending().keys().cloned().collect()
    }

    /// Write every buffered value to disk. Each key is attempted; failures
    /// are collected and reported together. Successfully written keys leave
    /// the buffer.
    pub fn flush(&self) -> Result<()> {
        let mut pending = self.pending();
        let mut failures = Vec::new();

        let keys: Vec<String> = pending.keys().cloned().collect();
        for key in keys {
            let Some(value) = pending.get(&key) else { continue };
            match self.persist(&key, value) {
                Ok(()) => {
                    pending.remove(&key);
                }
                Err(err) => failures.push(FlushFailure {
                    key,
                    error: err.message,
                }),
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        let keys: Vec<&str> = failures.iter().map(|f| f.key.as_str()).collect();
        Err(Error::new(
            ErrorCode::InternalIoError,
            format!("failed to persist pipeline env keys: {}", keys.join(", ")),
            serde_json::to_value(&failures).unwrap_or(Value::Null),
        ))
    }

    fn persist(&self, key: &str, value: &EnvValue) -> Result<()> {
        let op = format!("write pipeline env '{}'", key);
        let (target, stale) = match value {
            EnvValue::Json(_) => (self.json_path(key), self.text_path(key)),
            _ => (self.text_path(key), self.json_path(key)),
        };
        match value {
            EnvValue::Text(s) => io::write_file_atomic(&target, s, &op)?,
            EnvValue::Bytes(b) => io::write_bytes_atomic(&target, b, &op)?,
            EnvValue::Json(v) => {
                let text = serde_json::to_string(v)
                    .map_err(|e| Error::internal_json(e.to_string(), Some(op.clone())))?;
                io::write_file_atomic(&target, &text, &op)?
            }
        }
        if stale.is_file() {
            fs::remove_file(&stale)
                .map_err(|e| Error::internal_io(e.to_string(), Some(op.clone())))?;
        }
        Ok(())
    }

    /// Every persisted value as one JSON object keyed by dotted key, with
    /// buffered values layered on top.
    pub fn load_all(&self) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        if self.root.is_dir() {
            self.collect(&self.root, "", &mut out)?;
        }
        for (key, value) in self.pending().iter() {
            out.insert(key.clone(), value.to_json());
        }
        Ok(out)
    }

    fn collect(&self, dir: &Path, prefix: &str, out: &mut Map<String, Value>) -> Result<()> {
        let op = "list pipeline env";
        let entries = fs::read_dir(dir)
            .map_err(|e| Error::internal_io(e.to_string(), Some(op.to_string())))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::internal_io(e.to_string(), Some(op.to_string())))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                let nested = format!("{}{}.", prefix, name);
                self.collect(&path, &nested, out)?;
                continue;
            }
            let (key, is_json) = match name.strip_suffix(".json") {
                Some(stem) => (format!("{}{}", prefix, stem), true),
                None => (format!("{}{}", prefix, name), false),
            };
            let bytes = fs::read(&path)
                .map_err(|e| Error::internal_io(e.to_string(), Some(op.to_string())))?;
            let value = if is_json {
                serde_json::from_slice(&bytes)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            } else {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            };
            out.insert(key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_and_json_round_trip_through_flush() {
        let dir = tempfile::tempdir().unwrap();
        let pe = PipelineEnv::open(dir.path());

        pe.write("git.commitId", "abc123").unwrap();
        pe.write("abap.addonDescriptor", json!({"addonProduct": "/DMO/PRODUCT"}))
            .unwrap();
        pe.flush().unwrap();

        let root = dir.path().join("commonPipelineEnvironment");
        assert_eq!(fs::read_to_string(root.join("git/commitId")).unwrap(), "abc123");
        assert!(root.join("abap/addonDescriptor.json").is_file());

        let fresh = PipelineEnv::open(dir.path());
        assert_eq!(
            fresh.read("git.commitId").unwrap(),
            Some(EnvValue::Text("abc123".to_string()))
        );
        assert_eq!(
            fresh.read("abap.addonDescriptor").unwrap(),
            Some(EnvValue::Json(json!({"addonProduct": "/DMO/PRODUCT"})))
        );
    }

    #[test]
    fn missing_keys_read_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let pe = PipelineEnv::open(dir.path());
        assert_eq!(pe.read("container.imageNameTag").unwrap(), None);
    }

    #[test]
    fn buffered_writes_are_visible_before_flush() {
        let dir = tempfile::tempdir().unwrap();
        let pe = PipelineEnv::open(dir.path());
        pe.write("build.logs", "out/logs.zip").unwrap();
        assert_eq!(
            pe.read("build.logs").unwrap(),
            Some(EnvValue::Text("out/logs.zip".to_string()))
        );
        assert!(!dir.path().join("commonPipelineEnvironment/build/logs").exists());
    }

    #[test]
    fn bytes_read_back_by_declared_kind() {
        let dir = tempfile::tempdir().unwrap();
        let pe = PipelineEnv::open(dir.path());
        pe.write("custom.blob", EnvValue::Bytes(vec![0xff, 0x00, 0x10]))
            .unwrap();
        pe.flush().unwrap();
        assert_eq!(
            pe.read_as("custom.blob", ValueKind::Bytes).unwrap(),
            Some(EnvValue::Bytes(vec![0xff, 0x00, 0x10]))
        );
    }

    #[test]
    fn switching_kind_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let pe = PipelineEnv::open(dir.path());
        pe.write("custom.value", json!([1, 2])).unwrap();
        pe.flush().unwrap();
        pe.write("custom.value", "plain").unwrap();
        pe.flush().unwrap();

        assert_eq!(
            pe.read("custom.value").unwrap(),
            Some(EnvValue::Text("plain".to_string()))
        );
        assert!(!pe.root().join("custom/value.json").exists());
    }

    #[test]
    fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let pe = PipelineEnv::open(dir.path());
        for key in ["", "a..b", "a/b", ".hidden", "x.json"] {
            assert!(pe.write(key, "v").is_err(), "key {:?} accepted", key);
        }
    }

    #[test]
    fn flush_reports_failed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let pe = PipelineEnv::open(dir.path());
        // a file where a directory is needed
        fs::create_dir_all(pe.root()).unwrap();
        fs::write(pe.root().join("git"), "blocker").unwrap();

        pe.write("git.commitId", "abc").unwrap();
        pe.write("build.ok", "yes").unwrap();
        let err = pe.flush().unwrap_err();

        assert!(err.message.contains("git.commitId"));
        assert_eq!(pe.pending_keys(), vec!["git.commitId".to_string()]);
        assert_eq!(
            fs::read_to_string(pe.root().join("build/ok")).unwrap(),
            "yes"
        );
    }

    #[test]
    fn load_all_merges_disk_and_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let pe = PipelineEnv::open(dir.path());
        pe.write("git.commitId", "abc").unwrap();
        pe.write("custom.list", json!(["a"])).unwrap();
        pe.flush().unwrap();
        pe.write("git.branch", "main").unwrap();

        let all = pe.load_all().unwrap();
        assert_eq!(all["git.commitId"], json!("abc"));
        assert_eq!(all["custom.list"], json!(["a"]));
        assert_eq!(all["git.branch"], json!("main"));
    }
}
