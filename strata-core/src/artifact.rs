//! Ingestion of IaC tool artifacts into state documents
//!
//! Three JSON inputs are recognized by shape:
//!
//! - a strata state document (integer `format_version`, `lineage`)
//! - raw Terraform state, as written by `terraform state pull` (`"version": 4`)
//! - `terraform show -json` output, either for a state (`values`) or for
//!   a plan (`prior_state`, the refreshed snapshot the plan was made from)
//!
//! Only the first two carry a lineage. A `show -json` snapshot is bound to
//! the lineage of the document it is compared with or pushed over.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use strata_state::{
    BackendError, InstanceKey, OutputValue, ResourceAddress, ResourceRecord, StateDocument,
};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Terraform state format version this module reads
const TERRAFORM_STATE_VERSION: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Native,
    TerraformState,
    ShowJson,
    PlanJson,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactKind::Native => "native",
            ArtifactKind::TerraformState => "terraform-state",
            ArtifactKind::ShowJson => "show-json",
            ArtifactKind::PlanJson => "plan-json",
        };
        f.write_str(name)
    }
}

/// A state document read from an artifact
#[derive(Debug, Clone)]
pub struct Artifact {
    pub kind: ArtifactKind,
    document: StateDocument,
}

impl Artifact {
    /// Whether the artifact named its own lineage
    pub fn has_lineage(&self) -> bool {
        !self.document.lineage.is_empty()
    }

    pub fn document(&self) -> &StateDocument {
        &self.document
    }

    /// The document, taking `lineage` if the artifact carried none
    pub fn bind_lineage(mut self, lineage: &str) -> StateDocument {
        if self.document.lineage.is_empty() {
            self.document.lineage = lineage.to_string();
        }
        self.document
    }

    /// The document, with a fresh lineage if the artifact carried none
    pub fn into_document(self) -> StateDocument {
        if self.has_lineage() {
            self.document
        } else {
            let lineage = StateDocument::new().lineage;
            self.bind_lineage(&lineage)
        }
    }
}

/// Read and parse an artifact file
pub fn load_artifact(path: &Path) -> CoreResult<Artifact> {
    let bytes = std::fs::read(path).map_err(|e| CoreError::io(path, e))?;
    let artifact = parse_artifact(&bytes, path)?;
    debug!(
        path = %path.display(),
        kind = %artifact.kind,
        resources = artifact.document.resource_count(),
        "loaded artifact"
    );
    Ok(artifact)
}

/// Parse artifact bytes; `origin` only labels errors
pub fn parse_artifact(bytes: &[u8], origin: &Path) -> CoreResult<Artifact> {
    let raw: Value = serde_json::from_slice(bytes)
        .map_err(|e| CoreError::artifact(origin, format!("not valid JSON: {}", e)))?;
    let Some(object) = raw.as_object() else {
        return Err(CoreError::artifact(origin, "expected a JSON object"));
    };

    if object.get("format_version").is_some_and(Value::is_u64) {
        let document = StateDocument::load(bytes)?;
        return Ok(Artifact {
            kind: ArtifactKind::Native,
            document,
        });
    }

    if let Some(version) = object.get("version").and_then(Value::as_u64) {
        if version != TERRAFORM_STATE_VERSION {
            return Err(CoreError::artifact(
                origin,
                format!(
                    "Terraform state version {} is not supported (expected {})",
                    version, TERRAFORM_STATE_VERSION
                ),
            ));
        }
        return from_terraform_state(object)
            .map(|document| Artifact {
                kind: ArtifactKind::TerraformState,
                document,
            })
            .map_err(|reason| CoreError::artifact(origin, reason));
    }

    if object.get("format_version").is_some_and(Value::is_string) {
        let (kind, values) = if object.contains_key("prior_state") || object.contains_key("planned_values") {
            let values = object.get("prior_state").and_then(|prior| prior.get("values"));
            (ArtifactKind::PlanJson, values)
        } else {
            (ArtifactKind::ShowJson, object.get("values"))
        };

        let mut document = StateDocument::with_lineage("");
        document.metadata.terraform_version = object
            .get("terraform_version")
            .and_then(Value::as_str)
            .map(str::to_string);
        document.metadata.source = Some(kind.to_string());
        if let Some(values) = values {
            read_show_values(values, &mut document)
                .map_err(|reason| CoreError::artifact(origin, reason))?;
        }
        return Ok(Artifact { kind, document });
    }

    Err(CoreError::artifact(
        origin,
        "neither a strata state document, Terraform state nor `terraform show -json` output",
    ))
}

fn parse_address(address: &str) -> Result<ResourceAddress, String> {
    address.parse().map_err(|e: BackendError| e.to_string())
}

fn instance_key(value: &Value) -> Result<Option<InstanceKey>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(|i| Some(InstanceKey::Int(i)))
            .ok_or_else(|| format!("invalid instance key {}", n)),
        Value::String(s) => Ok(Some(InstanceKey::Str(s.clone()))),
        other => Err(format!("invalid instance key {}", other)),
    }
}

fn attributes_of(value: Option<&Value>) -> BTreeMap<String, Value> {
    value
        .and_then(Value::as_object)
        .map(|attrs| attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn dependencies_of(value: Option<&Value>) -> Result<BTreeSet<ResourceAddress>, String> {
    value
        .and_then(Value::as_array)
        .map(|deps| {
            deps.iter()
                .filter_map(Value::as_str)
                .map(parse_address)
                .collect()
        })
        .unwrap_or_else(|| Ok(BTreeSet::new()))
}

fn outputs_of(value: Option<&Value>) -> BTreeMap<String, OutputValue> {
    value
        .and_then(Value::as_object)
        .map(|outputs| {
            outputs
                .iter()
                .map(|(name, output)| {
                    let value = output.get("value").cloned().unwrap_or(Value::Null);
                    let sensitive = output
                        .get("sensitive")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    (name.clone(), OutputValue { value, sensitive })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Map a `terraform state pull` document
fn from_terraform_state(object: &Map<String, Value>) -> Result<StateDocument, String> {
    let lineage = object
        .get("lineage")
        .and_then(Value::as_str)
        .filter(|l| !l.is_empty())
        .ok_or("Terraform state has no lineage")?;

    let mut document = StateDocument::with_lineage(lineage);
    document.serial = object.get("serial").and_then(Value::as_u64).unwrap_or(0);
    document.metadata.terraform_version = object
        .get("terraform_version")
        .and_then(Value::as_str)
        .map(str::to_string);
    document.metadata.source = Some(ArtifactKind::TerraformState.to_string());
    document.outputs = outputs_of(object.get("outputs"));

    let resources = object
        .get("resources")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for resource in resources {
        let field = |name: &str| resource.get(name).and_then(Value::as_str);
        let resource_type = field("type").ok_or("resource without type")?;
        let name = field("name").ok_or("resource without name")?;

        let mut base = String::new();
        if let Some(module) = field("module") {
            base.push_str(module);
            base.push('.');
        }
        if field("mode") == Some("data") {
            base.push_str("data.");
        }
        base.push_str(resource_type);
        base.push('.');
        base.push_str(name);

        let instances = resource
            .get("instances")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for instance in instances {
            let mut address = parse_address(&base)?;
            address.index = instance_key(instance.get("index_key").unwrap_or(&Value::Null))?;

            let mut record = ResourceRecord::new(address);
            record.provider = field("provider").map(provider_source);
            record.attributes = attributes_of(instance.get("attributes"));
            record.dependencies = dependencies_of(instance.get("dependencies"))?;
            record.tainted = instance.get("status").and_then(Value::as_str) == Some("tainted");
            document.upsert_resource(record);
        }
    }

    Ok(document)
}

/// `provider["registry.terraform.io/hashicorp/aws"]` -> `registry.terraform.io/hashicorp/aws`
fn provider_source(provider: &str) -> String {
    provider
        .split_once("[\"")
        .and_then(|(_, rest)| rest.split_once("\"]"))
        .map(|(source, _)| source.to_string())
        .unwrap_or_else(|| provider.to_string())
}

/// Read `values` of `terraform show -json`: outputs plus the module tree
fn read_show_values(values: &Value, document: &mut StateDocument) -> Result<(), String> {
    document.outputs = outputs_of(values.get("outputs"));
    if let Some(root) = values.get("root_module") {
        read_show_module(root, document)?;
    }
    Ok(())
}

fn read_show_module(module: &Value, document: &mut StateDocument) -> Result<(), String> {
    let resources = module
        .get("resources")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for resource in resources {
        let address = resource
            .get("address")
            .and_then(Value::as_str)
            .ok_or("resource without address")?;
        let mut record = ResourceRecord::new(parse_address(address)?);
        record.provider = resource
            .get("provider_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        record.attributes = attributes_of(resource.get("values"));
        record.dependencies = dependencies_of(resource.get("depends_on"))?;
        record.tainted = resource.get("tainted").and_then(Value::as_bool).unwrap_or(false);
        document.upsert_resource(record);
    }

    let children = module
        .get("child_modules")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for child in children {
        read_show_module(child, document)?;
    }
    Ok(())
}
