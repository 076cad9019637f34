//! State document structures and their canonical JSON encoding
//!
//! A [`StateDocument`] is the authoritative record of the resources a
//! workspace manages. It carries three distinct counters:
//!
//! - `format_version`: the schema the document was written with
//! - `version`: the storage compare-and-swap token, bumped by every write
//! - `serial`: the logical edit count, bumped by whoever changes content

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::backend::{BackendError, BackendResult};

/// The main state document that persists to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateDocument {
    /// State document schema version
    pub format_version: u32,
    /// Storage version, used for optimistic concurrency checks
    pub version: u64,
    /// Logical edit counter for audit/history ordering
    pub serial: u64,
    /// Unique identifier for this state lineage (prevents accidental overwrites)
    pub lineage: String,
    #[serde(default)]
    pub metadata: StateMetadata,
    /// All managed resources keyed by address
    #[serde(default)]
    pub resources: BTreeMap<ResourceAddress, ResourceRecord>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputValue>,
}

impl StateDocument {
    /// Current state document schema version
    pub const CURRENT_FORMAT_VERSION: u32 = 1;

    /// Create a new empty state document with a fresh lineage
    pub fn new() -> Self {
        Self::with_lineage(uuid::Uuid::new_v4().to_string())
    }

    /// Create a new empty state document with a specific lineage
    pub fn with_lineage(lineage: impl Into<String>) -> Self {
        Self {
            format_version: Self::CURRENT_FORMAT_VERSION,
            version: 0,
            serial: 0,
            lineage: lineage.into(),
            metadata: StateMetadata::default(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Parse and validate a state document
    ///
    /// The schema version is checked before the full parse so that a
    /// document written by a newer release is rejected with
    /// [`BackendError::UnsupportedSchema`] instead of being parsed lossily.
    pub fn load(bytes: &[u8]) -> BackendResult<Self> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| BackendError::CorruptState(format!("not valid JSON: {}", e)))?;

        let format_version = raw
            .get("format_version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                BackendError::CorruptState("missing or non-integer format_version".to_string())
            })?;

        if format_version > u64::from(Self::CURRENT_FORMAT_VERSION) {
            return Err(BackendError::UnsupportedSchema {
                found: format_version,
                supported: Self::CURRENT_FORMAT_VERSION,
            });
        }
        if format_version == 0 {
            return Err(BackendError::CorruptState(
                "format_version 0 is not a valid schema".to_string(),
            ));
        }

        let document: StateDocument = serde_json::from_value(raw)
            .map_err(|e| BackendError::CorruptState(e.to_string()))?;
        document.validate()?;
        Ok(document)
    }

    /// Serialize to the canonical encoding (sorted keys, pretty printed,
    /// trailing newline)
    pub fn serialize(&self) -> BackendResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize state: {}", e)))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Check structural invariants that serde cannot express
    pub fn validate(&self) -> BackendResult<()> {
        if self.lineage.trim().is_empty() {
            return Err(BackendError::CorruptState("lineage is empty".to_string()));
        }
        for (key, record) in &self.resources {
            if key != &record.address {
                return Err(BackendError::CorruptState(format!(
                    "resource keyed as {} declares address {}",
                    key, record.address
                )));
            }
        }
        Ok(())
    }

    /// Increment serial for a content change
    pub fn increment_serial(&mut self) {
        self.serial += 1;
    }

    pub fn resource(&self, address: &ResourceAddress) -> Option<&ResourceRecord> {
        self.resources.get(address)
    }

    /// Add or replace a resource record
    pub fn upsert_resource(&mut self, record: ResourceRecord) {
        self.resources.insert(record.address.clone(), record);
    }

    pub fn remove_resource(&mut self, address: &ResourceAddress) -> Option<ResourceRecord> {
        self.resources.remove(address)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Addresses ordered so that every resource comes after its dependencies.
    ///
    /// Dependencies on addresses absent from this document are ignored.
    /// Cycles are broken by falling back to address order.
    pub fn dependency_order(&self) -> Vec<&ResourceAddress> {
        let mut ordered = Vec::with_capacity(self.resources.len());
        let mut visited = BTreeSet::new();
        let mut in_progress = BTreeSet::new();

        fn visit<'a>(
            address: &'a ResourceAddress,
            doc: &'a StateDocument,
            visited: &mut BTreeSet<&'a ResourceAddress>,
            in_progress: &mut BTreeSet<&'a ResourceAddress>,
            ordered: &mut Vec<&'a ResourceAddress>,
        ) {
            if visited.contains(address) || !in_progress.insert(address) {
                return;
            }
            if let Some(record) = doc.resources.get(address) {
                for dep in &record.dependencies {
                    if let Some((key, _)) = doc.resources.get_key_value(dep) {
                        visit(key, doc, visited, in_progress, ordered);
                    }
                }
            }
            in_progress.remove(address);
            visited.insert(address);
            ordered.push(address);
        }

        for address in self.resources.keys() {
            visit(address, self, &mut visited, &mut in_progress, &mut ordered);
        }
        ordered
    }
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptive metadata about where a document came from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateMetadata {
    /// Version of the IaC tool that produced the resource data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terraform_version: Option<String>,
    /// Kind of artifact this document was imported from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// When the resource data was captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

/// State of a single managed resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceRecord {
    pub address: ResourceAddress,
    /// Provider that manages this resource (e.g., "registry.terraform.io/hashicorp/aws")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Provider-reported attribute values
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Addresses this resource depends on
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceAddress>,
    /// Marked for forced replacement
    #[serde(default)]
    pub tainted: bool,
}

impl ResourceRecord {
    pub fn new(address: ResourceAddress) -> Self {
        Self {
            address,
            provider: None,
            attributes: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            tainted: false,
        }
    }

    /// Set an attribute value
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_dependency(mut self, address: ResourceAddress) -> Self {
        self.dependencies.insert(address);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_tainted(mut self, tainted: bool) -> Self {
        self.tainted = tainted;
        self
    }
}

/// A root module output value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputValue {
    pub value: serde_json::Value,
    #[serde(default)]
    pub sensitive: bool,
}

impl OutputValue {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            sensitive: false,
        }
    }

    pub fn sensitive(value: serde_json::Value) -> Self {
        Self {
            value,
            sensitive: true,
        }
    }
}

/// Whether an address names a managed resource or a data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceMode {
    Managed,
    Data,
}

/// Instance key of a resource created with `count` or `for_each`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceKey {
    Int(u64),
    Str(String),
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKey::Int(i) => write!(f, "[{}]", i),
            InstanceKey::Str(s) => {
                let quoted = serde_json::to_string(s).map_err(|_| fmt::Error)?;
                write!(f, "[{}]", quoted)
            }
        }
    }
}

/// Resource address: `[module.<name>.]*[data.]<type>.<name>[<index>]`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    /// Module call segments, including any instance key (e.g., `net[0]`)
    pub module_path: Vec<String>,
    pub mode: ResourceMode,
    pub resource_type: String,
    pub name: String,
    pub index: Option<InstanceKey>,
}

impl ResourceAddress {
    /// Create a root-module managed resource address without index
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module_path: Vec::new(),
            mode: ResourceMode::Managed,
            resource_type: resource_type.into(),
            name: name.into(),
            index: None,
        }
    }

    pub fn with_index(mut self, index: InstanceKey) -> Self {
        self.index = Some(index);
        self
    }

    pub fn in_module(mut self, module: impl Into<String>) -> Self {
        self.module_path.push(module.into());
        self
    }

    pub fn is_data_source(&self) -> bool {
        self.mode == ResourceMode::Data
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for module in &self.module_path {
            write!(f, "module.{}.", module)?;
        }
        if self.mode == ResourceMode::Data {
            write!(f, "data.")?;
        }
        write!(f, "{}.{}", self.resource_type, self.name)?;
        if let Some(index) = &self.index {
            write!(f, "{}", index)?;
        }
        Ok(())
    }
}

impl FromStr for ResourceAddress {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            BackendError::CorruptState(format!("invalid resource address '{}': {}", s, reason))
        };

        let segments = split_segments(s).ok_or_else(|| invalid("unbalanced brackets or quotes"))?;
        let mut rest = segments.as_slice();
        let mut module_path = Vec::new();

        while rest.len() > 2 && rest[0] == "module" {
            let (name, _) = split_index(rest[1]).ok_or_else(|| invalid("bad module index"))?;
            if !is_identifier(name) {
                return Err(invalid("bad module name"));
            }
            module_path.push(rest[1].to_string());
            rest = &rest[2..];
        }

        let mode = if rest.len() == 3 && rest[0] == "data" {
            rest = &rest[1..];
            ResourceMode::Data
        } else {
            ResourceMode::Managed
        };

        let [resource_type, name_segment] = rest else {
            return Err(invalid("expected <type>.<name>"));
        };
        if !is_identifier(resource_type) || matches!(*resource_type, "module" | "data") {
            return Err(invalid("bad resource type"));
        }
        let (name, index) = split_index(name_segment).ok_or_else(|| invalid("bad instance key"))?;
        if !is_identifier(name) {
            return Err(invalid("bad resource name"));
        }

        Ok(Self {
            module_path,
            mode,
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            index,
        })
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = BackendError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceAddress> for String {
    fn from(address: ResourceAddress) -> Self {
        address.to_string()
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Split on `.` outside of `[...]` and quoted strings
fn split_segments(s: &str) -> Option<Vec<&str>> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut in_brackets = false;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' if in_brackets => in_quotes = !in_quotes,
            '[' if !in_quotes => {
                if in_brackets {
                    return None;
                }
                in_brackets = true;
            }
            ']' if !in_quotes => {
                if !in_brackets {
                    return None;
                }
                in_brackets = false;
            }
            '.' if !in_brackets => {
                segments.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_brackets || in_quotes {
        return None;
    }
    segments.push(&s[start..]);
    Some(segments)
}

/// Split `name[key]` into its name and parsed instance key
fn split_index(segment: &str) -> Option<(&str, Option<InstanceKey>)> {
    let Some(open) = segment.find('[') else {
        return Some((segment, None));
    };
    let key = segment[open..].strip_prefix('[')?.strip_suffix(']')?;
    let index = if key.starts_with('"') {
        InstanceKey::Str(serde_json::from_str::<String>(key).ok()?)
    } else {
        InstanceKey::Int(key.parse().ok()?)
    };
    Some((&segment[..open], Some(index)))
}
