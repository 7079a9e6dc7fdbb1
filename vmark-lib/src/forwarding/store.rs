use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{NodeError, Result};
use crate::forwarding::rule::{validate_name, Rule, INVERSE_PREFIX};
use crate::forwarding::table::ForwardingTable;

/// On-disk snapshot shape. User rules only: inverses are computed state
/// and are regenerated after load, never trusted from disk.
#[derive(Debug, Serialize, Deserialize, Default)]
struct Snapshot {
    rules: Vec<SnapshotRule>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRule {
    name: String,
    in_interface: String,
    svlan: Option<u16>,
    cvlan: Option<u16>,
    out_interface: String,
    pop_tags: u8,
    push_svlan: Option<u16>,
    push_cvlan: Option<u16>,
    active: bool,
}

impl From<&Rule> for SnapshotRule {
    fn from(rule: &Rule) -> Self {
        Self {
            name: rule.name.clone(),
            in_interface: rule.in_interface.clone(),
            svlan: rule.svlan,
            cvlan: rule.cvlan,
            out_interface: rule.out_interface.clone(),
            pop_tags: rule.pop_tags,
            push_svlan: rule.push_svlan,
            push_cvlan: rule.push_cvlan,
            active: rule.active,
        }
    }
}

impl From<SnapshotRule> for Rule {
    fn from(row: SnapshotRule) -> Self {
        Rule {
            name: row.name,
            in_interface: row.in_interface,
            svlan: row.svlan,
            cvlan: row.cvlan,
            out_interface: row.out_interface,
            pop_tags: row.pop_tags,
            push_svlan: row.push_svlan,
            push_cvlan: row.push_cvlan,
            active: row.active,
            auto_inverse: false,
            origin_name: None,
        }
    }
}

/// JSON snapshot persistence for the forwarding table.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load user rules from disk. A missing file is an empty table.
    /// Entries that fail validation are dropped with a warning so one bad
    /// row cannot take the whole control plane down.
    pub fn load(&self) -> Result<ForwardingTable> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ForwardingTable::new())
            }
            Err(e) => {
                return Err(NodeError::Persistence(format!(
                    "read {}: {e}",
                    self.path.display()
                )))
            }
        };
        let snapshot: Snapshot = serde_json::from_str(&text).map_err(|e| {
            NodeError::Persistence(format!("parse {}: {e}", self.path.display()))
        })?;

        let mut table = ForwardingTable::new();
        for row in snapshot.rules {
            let rule: Rule = row.into();
            if rule.name.starts_with(INVERSE_PREFIX) {
                warn!(rule = %rule.name, "dropping persisted inverse row; inverses are recomputed");
                continue;
            }
            if let Err(e) = validate_name(&rule.name).and_then(|()| rule.validate(true)) {
                warn!(rule = %rule.name, error = %e, "dropping invalid persisted rule");
                continue;
            }
            if let Err(e) = table.upsert(rule.clone()) {
                warn!(rule = %rule.name, error = %e, "dropping conflicting persisted rule");
            }
        }
        table.rebuild_inverses();
        Ok(table)
    }

    /// Atomically replace the snapshot: write a temp file in the same
    /// directory, fsync, rename over the target.
    pub fn save(&self, rules: &[Rule]) -> Result<()> {
        let snapshot = Snapshot {
            rules: rules
                .iter()
                .filter(|r| !r.auto_inverse && r.origin_name.is_none())
                .map(SnapshotRule::from)
                .collect(),
        };
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| NodeError::Persistence(format!("serialize snapshot: {e}")))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                NodeError::Persistence(format!("create {}: {e}", parent.display()))
            })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)
            .map_err(|e| NodeError::Persistence(format!("create {}: {e}", tmp.display())))?;
        file.write_all(json.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| NodeError::Persistence(format!("write {}: {e}", tmp.display())))?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|e| {
            NodeError::Persistence(format!(
                "rename {} -> {}: {e}",
                tmp.display(),
                self.path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::rule::RuleParams;

    fn rule(name: &str, svlan: u16, active: bool) -> Rule {
        RuleParams {
            name: name.into(),
            in_interface: "eth0".into(),
            svlan: Some(svlan),
            out_interface: "eth1".into(),
            active,
            ..Default::default()
        }
        .into_rule()
        .unwrap()
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("rules.json"));

        let mut table = ForwardingTable::new();
        table.upsert(rule("r1", 100, true)).unwrap();
        table.upsert(rule("r2", 200, false)).unwrap();
        store.save(table.list()).unwrap();

        let loaded = store.load().unwrap();
        let names: Vec<_> = loaded.list().iter().map(|r| r.name.as_str()).collect();
        // Inverses are regenerated, not persisted.
        assert_eq!(names, ["r1", "egress-r1", "r2"]);
        assert!(loaded.get("r1").unwrap().active);
        assert!(!loaded.get("r2").unwrap().active);
    }

    #[test]
    fn missing_snapshot_is_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("rules.json"));
        assert!(store.load().unwrap().list().is_empty());
    }

    #[test]
    fn invalid_rows_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let json = r#"{ "rules": [
            { "name": "ok", "in_interface": "eth0", "svlan": 100, "cvlan": null,
              "out_interface": "eth1", "pop_tags": 0, "push_svlan": null,
              "push_cvlan": null, "active": false },
            { "name": "bad", "in_interface": "eth0", "svlan": 5000, "cvlan": null,
              "out_interface": "eth1", "pop_tags": 0, "push_svlan": null,
              "push_cvlan": null, "active": false }
        ] }"#;
        fs::write(&path, json).unwrap();

        let loaded = SnapshotStore::new(&path).load().unwrap();
        let names: Vec<_> = loaded.list().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["ok"]);
    }

    #[test]
    fn snapshot_excludes_inverse_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("rules.json"));
        let mut table = ForwardingTable::new();
        table.upsert(rule("r1", 100, true)).unwrap();
        store.save(table.list()).unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        assert!(!text.contains("egress-r1"));
    }
}
