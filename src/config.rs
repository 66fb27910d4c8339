//! Group-scoped key/value configuration view (C1).
//!
//! The original DCMTK-based service reads configuration through Qt's
//! `QSettings`: a nested `group/key = value` document where a lookup
//! first checks the "current group" and falls back to the root. We keep
//! that read-mostly, group-scoped contract but back it with a `toml`
//! document instead, since that is the format the rest of the pack reads
//! with `figment`/`serde` (see `settings.rs`).
//!
//! `ConfigView` is deliberately dumber than the typed [`crate::settings`]
//! layer: it is the interface the DIMSE state machine and the enrichment/
//! OCR pipeline use to pull ad hoc, per-printer values (`info[]`, `tag[]`,
//! `query.*`) whose shape isn't worth a dedicated struct.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use toml::Value;

use crate::error::ConfigError;

/// A group-scoped, read-mostly view over a TOML configuration document.
///
/// Cloning a `ConfigView` is cheap relative to the documents involved
/// (configuration files are small) and gives each association worker its
/// own cursor into the document, so `begin_group`/`end_group` calls from
/// concurrent sessions never interfere with each other.
#[derive(Debug, Clone)]
pub struct ConfigView {
    root: Value,
    path: PathBuf,
    group_stack: Vec<String>,
}

impl ConfigView {
    /// Load a configuration document from `path`, creating an empty one
    /// if it does not yet exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let root = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Persist {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str(&text)?
        } else {
            Value::Table(Default::default())
        };
        Ok(Self {
            root,
            path,
            group_stack: Vec::new(),
        })
    }

    /// Enter `name` as a nested scope; subsequent `get`/`set` calls read
    /// and write `<group>.<name>.<key>` until a matching `end_group`.
    pub fn begin_group(&mut self, name: impl Into<String>) {
        self.group_stack.push(name.into());
    }

    /// Leave the innermost scope entered by `begin_group`.
    pub fn end_group(&mut self) {
        self.group_stack.pop();
    }

    /// Run `f` with the view scoped to `name`, restoring the previous
    /// scope afterwards regardless of how `f` returns.
    pub fn with_group<T>(&mut self, name: impl Into<String>, f: impl FnOnce(&mut Self) -> T) -> T {
        self.begin_group(name);
        let result = f(self);
        self.end_group();
        result
    }

    /// Names of the tables nested directly under the current scope.
    pub fn child_groups(&self) -> BTreeSet<String> {
        match self.current_scope() {
            Some(Value::Table(t)) => t
                .iter()
                .filter(|(_, v)| v.is_table())
                .map(|(k, _)| k.clone())
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Look up `key`, preferring the current group, falling back to root.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(scope) = self.current_scope() {
            if let Some(v) = scope.get(key) {
                return Some(v.clone());
            }
        }
        self.root.get(key).cloned()
    }

    /// `get` with a typed default, converting the stored value with
    /// [`ValueExt`]'s helper accessors.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key)
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.as_integer()).unwrap_or(default)
    }

    /// A string-array-valued key (e.g. `storage-servers`), empty if unset.
    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(|v| v.as_array().cloned())
            .map(|arr| {
                arr.into_iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of entries in the array-of-tables at `key`
    /// (`info[]`/`tag[]`-style config arrays), and a cursor to read them.
    pub fn begin_read_array(&self, key: &str) -> Vec<Value> {
        self.get(key)
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    }

    /// The array at `key` defined at the document root, ignoring whatever
    /// group is currently active. Used for config keys documented as
    /// "root+printer" scoped (`tag[]`), where both arrays apply rather
    /// than the group overriding the root, unlike `get`'s single-value
    /// fallback.
    pub fn root_array(&self, key: &str) -> Vec<Value> {
        self.root
            .get(key)
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    }

    /// The array at `key` defined directly in the current scope, with no
    /// fallback to root. Paired with [`Self::root_array`] to implement
    /// "root+printer" scoped array concatenation.
    pub fn local_array(&self, key: &str) -> Vec<Value> {
        self.current_scope()
            .and_then(|scope| scope.get(key))
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    }

    /// Set `key = value` within the current scope, creating intermediate
    /// tables as needed. Not visible until [`Self::sync`] persists it.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let scope = self.current_scope_mut();
        if let Value::Table(t) = scope {
            t.insert(key.to_string(), value.into());
        }
    }

    /// Persist pending writes to the backing file. The caller is expected
    /// to call this after updating `next-spool-ts` so a crash between
    /// ticks cannot starve or double-fire the retry worker.
    pub fn sync(&self) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(&self.root).map_err(|e| ConfigError::Persist {
            path: self.path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, text).map_err(|source| ConfigError::Persist {
            path: self.path.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| ConfigError::Persist {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn current_scope(&self) -> Option<&Value> {
        let mut cur = &self.root;
        for name in &self.group_stack {
            cur = cur.get(name)?;
        }
        Some(cur)
    }

    fn current_scope_mut(&mut self) -> &mut Value {
        let mut cur = &mut self.root;
        for name in &self.group_stack {
            if !matches!(cur.get(name.as_str()), Some(Value::Table(_))) {
                if let Value::Table(t) = cur {
                    t.insert(name.clone(), Value::Table(Default::default()));
                }
            }
            cur = cur.get_mut(name.as_str()).expect("just inserted");
        }
        cur
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn view_from(toml_text: &str) -> ConfigView {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(toml_text.as_bytes()).unwrap();
        let (_, path) = f.keep().unwrap();
        ConfigView::load(path).unwrap()
    }

    #[test]
    fn group_scoped_get_falls_back_to_root() {
        let mut cfg = view_from(
            r#"
            timeout = 30

            [P1]
            aetitle = "PRINTER1"
            "#,
        );
        cfg.begin_group("P1");
        assert_eq!(cfg.get_string("aetitle", ""), "PRINTER1");
        assert_eq!(cfg.get_i64("timeout", 0), 30);
        cfg.end_group();
        assert_eq!(cfg.get_string("aetitle", "fallback"), "fallback");
    }

    #[test]
    fn child_groups_lists_nested_tables_only() {
        let cfg = view_from(
            r#"
            port = 104

            [P1]
            aetitle = "A"

            [P2]
            aetitle = "B"
            "#,
        );
        let groups = cfg.child_groups();
        assert!(groups.contains("P1"));
        assert!(groups.contains("P2"));
        assert!(!groups.contains("port"));
    }

    #[test]
    fn set_then_sync_then_reload_round_trips() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"spool-interval-in-seconds = 600\n").unwrap();
        let (_, path) = f.keep().unwrap();
        let mut cfg = ConfigView::load(&path).unwrap();
        cfg.set("next-spool-ts", Value::Integer(1_700_000_000));
        cfg.sync().unwrap();

        let reloaded = ConfigView::load(&path).unwrap();
        assert_eq!(reloaded.get_i64("next-spool-ts", 0), 1_700_000_000);
    }
}
