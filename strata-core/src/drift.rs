//! Drift - Compare a baseline state document with a live snapshot
//!
//! Compares the state recorded in the backend with a freshly captured
//! snapshot of the same lineage and produces a [`DriftReport`]. The
//! comparison is a pure function of its inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use strata_state::{BackendError, OutputValue, ResourceAddress, ResourceRecord, StateDocument};

use crate::error::CoreResult;

/// Placeholder shown instead of sensitive output values
pub const REDACTED: &str = "(sensitive)";

/// How a resource or output differs between baseline and live
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Present live, absent from the baseline
    Added,
    /// Present in the baseline, gone live
    Removed,
    Modified,
    Unchanged,
}

impl ChangeKind {
    /// Returns whether this kind involves a change
    pub fn is_change(&self) -> bool {
        !matches!(self, ChangeKind::Unchanged)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Modified => "modified",
            ChangeKind::Unchanged => "unchanged",
        };
        f.write_str(name)
    }
}

/// One differing attribute, at a dotted path into nested mappings
///
/// `None` means the attribute is absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDiff {
    pub path: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl fmt::Display for AttributeDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {}",
            self.path,
            render_value(self.before.as_ref()),
            render_value(self.after.as_ref())
        )
    }
}

/// Render a value for humans: strings bare, everything else as JSON
pub fn render_value(value: Option<&Value>) -> String {
    match value {
        None => "(absent)".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDiff {
    pub address: ResourceAddress,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attribute_diffs: Vec<AttributeDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDiff {
    pub name: String,
    pub kind: ChangeKind,
    /// Either side marked the output sensitive; values are redacted
    pub sensitive: bool,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Identifies a compared document without copying it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub lineage: String,
    pub version: u64,
    pub serial: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl DocumentRef {
    pub fn of(document: &StateDocument) -> Self {
        Self {
            lineage: document.lineage.clone(),
            version: document.version,
            serial: document.serial,
            source: document.metadata.source.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
}

impl DriftSummary {
    fn count(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Added => self.added += 1,
            ChangeKind::Removed => self.removed += 1,
            ChangeKind::Modified => self.modified += 1,
            ChangeKind::Unchanged => self.unchanged += 1,
        }
    }

    pub fn drifted(&self) -> usize {
        self.added + self.removed + self.modified
    }
}

/// Result of comparing a baseline with a live snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub timestamp: DateTime<Utc>,
    pub baseline: DocumentRef,
    pub live_snapshot: DocumentRef,
    /// Resource changes ordered by address
    pub changes: Vec<ResourceDiff>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_changes: Vec<OutputDiff>,
    /// Counts over all compared resources, listed or not
    pub summary: DriftSummary,
}

impl DriftReport {
    pub fn has_drift(&self) -> bool {
        self.summary.drifted() > 0 || !self.output_changes.is_empty()
    }

    /// The entry for `address`, if it is listed
    pub fn change_for(&self, address: &ResourceAddress) -> Option<&ResourceDiff> {
        self.changes.iter().find(|c| &c.address == address)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriftOptions {
    /// Also list resources that did not change
    pub include_unchanged: bool,
}

/// Compare `baseline` with `live`, stamped with the current time
pub fn detect(baseline: &StateDocument, live: &StateDocument) -> CoreResult<DriftReport> {
    detect_at(baseline, live, &DriftOptions::default(), Utc::now())
}

/// Compare `baseline` with `live` with explicit options and timestamp
///
/// Fails with `LineageMismatch` when the documents belong to different
/// lineages. Identical inputs always produce identical reports.
pub fn detect_at(
    baseline: &StateDocument,
    live: &StateDocument,
    options: &DriftOptions,
    timestamp: DateTime<Utc>,
) -> CoreResult<DriftReport> {
    if baseline.lineage != live.lineage {
        return Err(BackendError::LineageMismatch {
            expected: baseline.lineage.clone(),
            actual: live.lineage.clone(),
        }
        .into());
    }

    let mut summary = DriftSummary::default();
    let mut changes = Vec::new();

    let addresses: BTreeSet<&ResourceAddress> = baseline
        .resources
        .keys()
        .chain(live.resources.keys())
        .collect();

    for address in addresses {
        let diff = diff_resource(
            address,
            baseline.resources.get(address),
            live.resources.get(address),
        );
        summary.count(diff.kind);
        if diff.kind.is_change() || options.include_unchanged {
            changes.push(diff);
        }
    }

    Ok(DriftReport {
        timestamp,
        baseline: DocumentRef::of(baseline),
        live_snapshot: DocumentRef::of(live),
        changes,
        output_changes: diff_outputs(&baseline.outputs, &live.outputs),
        summary,
    })
}

fn diff_resource(
    address: &ResourceAddress,
    baseline: Option<&ResourceRecord>,
    live: Option<&ResourceRecord>,
) -> ResourceDiff {
    let (kind, attribute_diffs) = match (baseline, live) {
        (None, _) => (ChangeKind::Added, Vec::new()),
        (_, None) => (ChangeKind::Removed, Vec::new()),
        (Some(before), Some(after)) => {
            let diffs = find_changed_attributes(&before.attributes, &after.attributes);
            if diffs.is_empty() {
                (ChangeKind::Unchanged, diffs)
            } else {
                (ChangeKind::Modified, diffs)
            }
        }
    };

    ResourceDiff {
        address: address.clone(),
        kind,
        attribute_diffs,
    }
}

/// Find changed attributes between the baseline and live attribute maps
pub fn find_changed_attributes(
    before: &BTreeMap<String, Value>,
    after: &BTreeMap<String, Value>,
) -> Vec<AttributeDiff> {
    let mut diffs = Vec::new();
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    for key in keys {
        diff_values(key.clone(), before.get(key), after.get(key), &mut diffs);
    }
    diffs
}

/// A value an absent attribute is considered equal to
fn is_default(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn diff_values(path: String, before: Option<&Value>, after: Option<&Value>, out: &mut Vec<AttributeDiff>) {
    match (before, after) {
        (None, None) => {}
        (None, Some(value)) | (Some(value), None) if is_default(value) => {}
        // Mappings compare key by key; key order never matters
        (Some(Value::Object(b)), Some(Value::Object(a))) => {
            let keys: BTreeSet<&String> = b.keys().chain(a.keys()).collect();
            for key in keys {
                diff_values(child_path(&path, key), b.get(key), a.get(key), out);
            }
        }
        // Sequences and scalars compare whole
        (Some(b), Some(a)) if b == a => {}
        _ => out.push(AttributeDiff {
            path,
            before: before.cloned(),
            after: after.cloned(),
        }),
    }
}

fn child_path(parent: &str, key: &str) -> String {
    let plain = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':' || c == '/');
    if plain {
        format!("{}.{}", parent, key)
    } else {
        let quoted = serde_json::to_string(key).unwrap_or_else(|_| format!("\"{}\"", key));
        format!("{}[{}]", parent, quoted)
    }
}

fn diff_outputs(
    before: &BTreeMap<String, OutputValue>,
    after: &BTreeMap<String, OutputValue>,
) -> Vec<OutputDiff> {
    let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();

    names
        .into_iter()
        .filter_map(|name| {
            let b = before.get(name);
            let a = after.get(name);
            let kind = match (b, a) {
                (None, Some(_)) => ChangeKind::Added,
                (Some(_), None) => ChangeKind::Removed,
                (Some(b), Some(a)) if b.value != a.value => ChangeKind::Modified,
                _ => return None,
            };
            let sensitive = b.is_some_and(|o| o.sensitive) || a.is_some_and(|o| o.sensitive);
            let shown = |output: Option<&OutputValue>| {
                output.map(|o| {
                    if sensitive {
                        Value::String(REDACTED.to_string())
                    } else {
                        o.value.clone()
                    }
                })
            };
            Some(OutputDiff {
                name: name.clone(),
                kind,
                sensitive,
                before: shown(b),
                after: shown(a),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    fn doc(resources: Vec<ResourceRecord>) -> StateDocument {
        let mut state = StateDocument::with_lineage("lineage-1");
        for record in resources {
            state.upsert_resource(record);
        }
        state
    }

    fn bucket(acl: &str) -> ResourceRecord {
        ResourceRecord::new(addr("aws_s3_bucket.logs")).with_attribute("acl", json!(acl))
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap()
    }

    #[test]
    fn detect_reports_modified_attribute() {
        let baseline = doc(vec![bucket("private")]);
        let live = doc(vec![bucket("public-read")]);

        let report = detect(&baseline, &live).unwrap();

        assert_eq!(report.changes.len(), 1);
        let change = &report.changes[0];
        assert_eq!(change.address, addr("aws_s3_bucket.logs"));
        assert_eq!(change.kind, ChangeKind::Modified);
        assert_eq!(change.attribute_diffs.len(), 1);
        assert_eq!(change.attribute_diffs[0].to_string(), "acl: private -> public-read");
    }

    #[test]
    fn detect_identical_is_empty() {
        let baseline = doc(vec![bucket("private")]);
        let report = detect(&baseline, &baseline.clone()).unwrap();
        assert!(report.changes.is_empty());
        assert!(!report.has_drift());
        assert_eq!(report.summary.unchanged, 1);
    }

    #[test]
    fn detect_added_and_removed_exactly_once() {
        let baseline = doc(vec![
            bucket("private"),
            ResourceRecord::new(addr("aws_vpc.old")),
        ]);
        let live = doc(vec![
            bucket("private"),
            ResourceRecord::new(addr("aws_vpc.new")),
            ResourceRecord::new(addr("aws_subnet.a[0]")),
        ]);

        let report = detect(&baseline, &live).unwrap();
        let kinds: Vec<(String, ChangeKind)> = report
            .changes
            .iter()
            .map(|c| (c.address.to_string(), c.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("aws_subnet.a[0]".to_string(), ChangeKind::Added),
                ("aws_vpc.new".to_string(), ChangeKind::Added),
                ("aws_vpc.old".to_string(), ChangeKind::Removed),
            ]
        );
        assert_eq!(report.summary.added, 2);
        assert_eq!(report.summary.removed, 1);
    }

    #[test]
    fn detect_rejects_lineage_mismatch() {
        let baseline = doc(vec![]);
        let live = StateDocument::with_lineage("lineage-2");
        let err = detect(&baseline, &live).unwrap_err();
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn detect_is_deterministic() {
        let baseline = doc(vec![bucket("private"), ResourceRecord::new(addr("aws_vpc.a"))]);
        let live = doc(vec![bucket("public-read"), ResourceRecord::new(addr("aws_vpc.b"))]);
        let options = DriftOptions::default();

        let first = detect_at(&baseline, &live, &options, at()).unwrap();
        let second = detect_at(&baseline, &live, &options, at()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn detect_include_unchanged() {
        let baseline = doc(vec![bucket("private"), ResourceRecord::new(addr("aws_vpc.a"))]);
        let live = doc(vec![bucket("public-read"), ResourceRecord::new(addr("aws_vpc.a"))]);
        let options = DriftOptions {
            include_unchanged: true,
        };

        let report = detect_at(&baseline, &live, &options, at()).unwrap();
        assert_eq!(report.changes.len(), 2);
        assert_eq!(
            report.change_for(&addr("aws_vpc.a")).unwrap().kind,
            ChangeKind::Unchanged
        );
    }

    #[test]
    fn mappings_compare_order_insensitive_and_nested() {
        let before = ResourceRecord::new(addr("aws_vpc.main"))
            .with_attribute("tags", json!({"Env": "prod", "Team": "core"}));
        let after = ResourceRecord::new(addr("aws_vpc.main"))
            .with_attribute("tags", json!({"Team": "core", "Env": "staging"}));

        let diffs = find_changed_attributes(&before.attributes, &after.attributes);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "tags.Env");
        assert_eq!(diffs[0].to_string(), "tags.Env: prod -> staging");
    }

    #[test]
    fn sequences_compare_order_sensitive() {
        let before = BTreeMap::from([("ports".to_string(), json!([80, 443]))]);
        let after = BTreeMap::from([("ports".to_string(), json!([443, 80]))]);

        let diffs = find_changed_attributes(&before, &after);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "ports");
    }

    #[test]
    fn absent_attribute_counts_as_modified_unless_default() {
        let before = BTreeMap::from([
            ("description".to_string(), json!("")),
            ("tags".to_string(), json!({})),
        ]);
        let after = BTreeMap::from([
            ("policy".to_string(), json!(null)),
            ("versioning".to_string(), json!(true)),
        ]);

        let diffs = find_changed_attributes(&before, &after);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "versioning");
        assert_eq!(diffs[0].before, None);
        assert_eq!(diffs[0].to_string(), "versioning: (absent) -> true");
    }

    #[test]
    fn attribute_level_absence_makes_resource_modified() {
        let baseline = doc(vec![bucket("private")]);
        let live = doc(vec![bucket("private").with_attribute("logging", json!({"target": "b"}))]);

        let report = detect(&baseline, &live).unwrap();
        assert_eq!(report.changes[0].kind, ChangeKind::Modified);
        assert_eq!(report.changes[0].attribute_diffs[0].path, "logging");
    }

    #[test]
    fn keys_with_dots_are_quoted_in_paths() {
        let before = BTreeMap::from([("tags".to_string(), json!({"kubernetes.io/role": "a"}))]);
        let after = BTreeMap::from([("tags".to_string(), json!({"kubernetes.io/role": "b"}))]);
        let diffs = find_changed_attributes(&before, &after);
        assert_eq!(diffs[0].path, "tags[\"kubernetes.io/role\"]");
    }

    #[test]
    fn sensitive_outputs_are_redacted() {
        let mut baseline = doc(vec![]);
        baseline
            .outputs
            .insert("password".to_string(), OutputValue::sensitive(json!("old")));
        baseline
            .outputs
            .insert("endpoint".to_string(), OutputValue::new(json!("a.example.com")));
        let mut live = baseline.clone();
        live.outputs
            .insert("password".to_string(), OutputValue::sensitive(json!("new")));
        live.outputs.remove("endpoint");

        let report = detect(&baseline, &live).unwrap();
        assert!(report.has_drift());
        assert_eq!(report.output_changes.len(), 2);

        let endpoint = &report.output_changes[0];
        assert_eq!(endpoint.name, "endpoint");
        assert_eq!(endpoint.kind, ChangeKind::Removed);

        let password = &report.output_changes[1];
        assert_eq!(password.kind, ChangeKind::Modified);
        assert!(password.sensitive);
        assert_eq!(password.before, Some(json!(REDACTED)));
        assert_eq!(password.after, Some(json!(REDACTED)));
        assert!(!serde_json::to_string(&report).unwrap().contains("new"));
    }
}
