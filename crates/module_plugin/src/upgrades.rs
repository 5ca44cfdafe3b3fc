//! Migration of persisted actions, feedbacks and config across breaking
//! module versions.
//!
//! A module ships an ordered list of upgrade scripts, one per breaking
//! change. Every persisted record carries the index of the last script it
//! has passed (`upgradeIndex`); a record without one is grouped at the
//! caller's `default_upgrade_index`. [`run_upgrades`] folds records into
//! the script pipeline in version order, so a record written by version
//! `k` is visible to script `i` only after every script in `k+1..i` has
//! already run over it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One persisted action/feedback entry as the upgrade pipeline sees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Last upgrade step this record passed. `None` means the record was
    /// written by the current version.
    #[serde(rename = "upgradeIndex", skip_serializing_if = "Option::is_none")]
    pub upgrade_index: Option<i64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MigrationRecord {
    pub fn new(upgrade_index: Option<i64>, fields: Map<String, Value>) -> Self {
        Self {
            upgrade_index,
            fields,
        }
    }
}

/// Everything a single upgrade script is allowed to look at: the records
/// that are due by this step, plus the config once it becomes due.
#[derive(Debug, Clone, Default)]
pub struct UpgradeBatch {
    pub actions: HashMap<String, MigrationRecord>,
    pub feedbacks: HashMap<String, MigrationRecord>,
    pub config: Option<Value>,
}

/// Replacements a script hands back. Ids not present are left as-is;
/// ids that were not in the batch are ignored.
#[derive(Debug, Clone, Default)]
pub struct UpgradeChanges {
    pub actions: HashMap<String, MigrationRecord>,
    pub feedbacks: HashMap<String, MigrationRecord>,
    pub config: Option<Value>,
}

pub type UpgradeScript = Box<dyn Fn(&UpgradeBatch) -> UpgradeChanges + Send + Sync>;

/// Migrated state to be written back by the caller. A record appears here
/// when a script replaced it, or when it still carried a version marker:
/// the latter is the acknowledgement that lets the caller clear the
/// marker even though no script changed the record structurally.
#[derive(Debug, Clone, Default)]
pub struct UpgradeResult {
    pub actions: HashMap<String, MigrationRecord>,
    pub feedbacks: HashMap<String, MigrationRecord>,
    /// `Some` iff the config participated in at least one script.
    pub config: Option<Value>,
    /// Index persisted state is at after this run.
    pub upgrade_index: i64,
}

struct Tracked {
    record: MigrationRecord,
    /// Step the record is waiting behind; it becomes visible to script
    /// `due_at + 1` and everything after.
    due_at: i64,
    had_marker: bool,
    replaced: bool,
}

fn track(records: HashMap<String, MigrationRecord>, default: i64) -> HashMap<String, Tracked> {
    records
        .into_iter()
        .map(|(id, record)| {
            let tracked = Tracked {
                due_at: record.upgrade_index.unwrap_or(default),
                had_marker: record.upgrade_index.is_some(),
                replaced: false,
                record,
            };
            (id, tracked)
        })
        .collect()
}

fn due(pool: &HashMap<String, Tracked>, step: i64) -> HashMap<String, MigrationRecord> {
    pool.iter()
        .filter(|(_, t)| t.due_at < step)
        .map(|(id, t)| (id.clone(), t.record.clone()))
        .collect()
}

fn apply(pool: &mut HashMap<String, Tracked>, changes: HashMap<String, MigrationRecord>, step: i64) {
    for (id, record) in changes {
        if let Some(t) = pool.get_mut(&id) {
            if t.due_at < step {
                t.record = record;
                t.replaced = true;
            }
        }
    }
}

fn finish(pool: HashMap<String, Tracked>) -> HashMap<String, MigrationRecord> {
    pool.into_iter()
        .filter(|(_, t)| t.had_marker || t.replaced)
        .map(|(id, t)| (id, t.record))
        .collect()
}

/// Run every applicable upgrade script, strictly once, in version order.
///
/// Already-migrated state (markers cleared, `default_upgrade_index` at the
/// newest script) folds nothing in, so a second run is a no-op. The config
/// object joins the batch exactly once, at the first script index past
/// `default_upgrade_index`, and stays in for the remaining scripts.
pub fn run_upgrades(
    actions: HashMap<String, MigrationRecord>,
    feedbacks: HashMap<String, MigrationRecord>,
    config: Value,
    default_upgrade_index: i64,
    scripts: &[UpgradeScript],
) -> UpgradeResult {
    let mut actions = track(actions, default_upgrade_index);
    let mut feedbacks = track(feedbacks, default_upgrade_index);

    let start = actions
        .values()
        .chain(feedbacks.values())
        .map(|t| t.due_at)
        .chain(std::iter::once(default_upgrade_index))
        .min()
        .unwrap_or(default_upgrade_index);

    let mut current_config = config;
    let mut config_in_batch = false;

    for i in start.max(0)..scripts.len() as i64 {
        let batch_actions = due(&actions, i);
        let batch_feedbacks = due(&feedbacks, i);
        if !config_in_batch && i > default_upgrade_index {
            config_in_batch = true;
        }
        if batch_actions.is_empty() && batch_feedbacks.is_empty() && !config_in_batch {
            continue;
        }

        let batch = UpgradeBatch {
            actions: batch_actions,
            feedbacks: batch_feedbacks,
            config: config_in_batch.then(|| current_config.clone()),
        };
        let changes = scripts[i as usize](&batch);

        apply(&mut actions, changes.actions, i);
        apply(&mut feedbacks, changes.feedbacks, i);
        if config_in_batch {
            if let Some(cfg) = changes.config {
                current_config = cfg;
            }
        }
    }

    UpgradeResult {
        actions: finish(actions),
        feedbacks: finish(feedbacks),
        config: config_in_batch.then_some(current_config),
        upgrade_index: scripts.len() as i64 - 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(index: Option<i64>, marker: &str) -> MigrationRecord {
        let mut fields = Map::new();
        fields.insert("marker".into(), json!(marker));
        MigrationRecord::new(index, fields)
    }

    /// A script that appends its own index to every record it sees.
    fn stamping_script(step: i64) -> UpgradeScript {
        Box::new(move |batch: &UpgradeBatch| {
            let mut changes = UpgradeChanges::default();
            for (id, rec) in &batch.actions {
                let mut rec = rec.clone();
                let mut steps = rec
                    .fields
                    .get("steps")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                steps.push(json!(step));
                rec.fields.insert("steps".into(), Value::Array(steps));
                changes.actions.insert(id.clone(), rec);
            }
            if let Some(cfg) = &batch.config {
                let mut cfg = cfg.clone();
                cfg["config_ran"] = json!(step);
                changes.config = Some(cfg);
            }
            changes
        })
    }

    #[test]
    fn scripts_run_in_order_from_a_records_version() {
        let scripts: Vec<UpgradeScript> = (0..4).map(stamping_script).collect();
        let mut actions = HashMap::new();
        // passed step 1 already, so it must see exactly steps 2 and 3
        actions.insert("a".to_string(), record(Some(1), "old"));

        let out = run_upgrades(actions, HashMap::new(), json!({}), 3, &scripts);
        assert_eq!(out.actions["a"].fields["steps"], json!([2, 3]));
        assert_eq!(out.upgrade_index, 3);
        // config already at index 3, so it never joined
        assert!(out.config.is_none());
    }

    #[test]
    fn config_joins_exactly_once_past_its_default_index() {
        let scripts: Vec<UpgradeScript> = (0..4).map(stamping_script).collect();
        let out = run_upgrades(
            HashMap::new(),
            HashMap::new(),
            json!({"host": "10.0.0.1"}),
            1,
            &scripts,
        );
        let cfg = out.config.expect("config participated");
        // joined at script 2 and stayed through script 3
        assert_eq!(cfg["config_ran"], json!(3));
        assert_eq!(cfg["host"], json!("10.0.0.1"));
    }

    #[test]
    fn marked_records_past_the_newest_script_are_acknowledged_untouched() {
        let scripts: Vec<UpgradeScript> = (0..2).map(stamping_script).collect();
        let mut actions = HashMap::new();
        actions.insert("current".to_string(), record(Some(1), "keep"));

        let out = run_upgrades(actions, HashMap::new(), json!({}), 1, &scripts);
        // never visible to any script, but still present for write-back so
        // the caller clears its marker
        let rec = &out.actions["current"];
        assert_eq!(rec.fields["marker"], json!("keep"));
        assert!(!rec.fields.contains_key("steps"));
    }

    #[test]
    fn unmarked_records_fall_back_to_the_default_index() {
        let scripts: Vec<UpgradeScript> = (0..3).map(stamping_script).collect();
        let mut actions = HashMap::new();
        actions.insert("legacy".to_string(), record(None, "legacy"));

        // config (and with it, unmarked records) last migrated at step 0
        let out = run_upgrades(actions, HashMap::new(), json!({}), 0, &scripts);
        assert_eq!(out.actions["legacy"].fields["steps"], json!([1, 2]));
    }

    #[test]
    fn unmarked_records_at_the_current_default_stay_out_of_the_output() {
        let scripts: Vec<UpgradeScript> = (0..3).map(stamping_script).collect();
        let mut actions = HashMap::new();
        actions.insert("fresh".to_string(), record(None, "fresh"));
        actions.insert("old".to_string(), record(Some(-1), "old"));

        let out = run_upgrades(actions, HashMap::new(), json!({}), 2, &scripts);
        assert!(!out.actions.contains_key("fresh"));
        assert_eq!(out.actions["old"].fields["steps"], json!([0, 1, 2]));
    }

    #[test]
    fn second_run_over_migrated_state_changes_nothing() {
        let scripts: Vec<UpgradeScript> = (0..3).map(stamping_script).collect();
        let mut actions = HashMap::new();
        actions.insert("a".to_string(), record(Some(0), "x"));

        let first = run_upgrades(actions, HashMap::new(), json!({"v": 1}), 0, &scripts);
        assert!(!first.actions.is_empty());
        assert!(first.config.is_some());

        // caller persisted: markers cleared, config index now at the latest
        let migrated: HashMap<String, MigrationRecord> = first
            .actions
            .into_iter()
            .map(|(id, mut rec)| {
                rec.upgrade_index = None;
                (id, rec)
            })
            .collect();
        let second = run_upgrades(
            migrated,
            HashMap::new(),
            first.config.unwrap(),
            first.upgrade_index,
            &scripts,
        );
        assert!(second.actions.is_empty());
        assert!(second.feedbacks.is_empty());
        assert!(second.config.is_none());
    }

    #[test]
    fn feedbacks_fold_independently_of_actions() {
        let scripts: Vec<UpgradeScript> = vec![Box::new(|batch: &UpgradeBatch| {
            let mut changes = UpgradeChanges::default();
            for (id, rec) in &batch.feedbacks {
                let mut rec = rec.clone();
                rec.fields.insert("seen".into(), json!(true));
                changes.feedbacks.insert(id.clone(), rec);
            }
            changes
        })];
        let mut feedbacks = HashMap::new();
        feedbacks.insert("f".to_string(), record(Some(-1), "fb"));

        let out = run_upgrades(HashMap::new(), feedbacks, json!({}), 0, &scripts);
        assert_eq!(out.feedbacks["f"].fields["seen"], json!(true));
        assert!(out.actions.is_empty());
    }
}
