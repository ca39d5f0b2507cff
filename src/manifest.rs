//! The structured manifest emitted by user deployment programs.
//!
//! The wire format is a single JSON document on stdout. Unknown fields are
//! accepted but not required, so older CLIs keep working against newer SDKs.
use serde::Deserialize;

use crate::error::ManifestError;

/// Resource kinds the backend can store, in deploy order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Reusable capability referenced by agents.
    Skill,
    /// Conversational agent definition.
    Agent,
    /// Workflow definition composed of agents and skills.
    Workflow,
}

impl ResourceKind {
    /// Deploy order: later kinds reference earlier ones by slug.
    pub fn deploy_order() -> [ResourceKind; 3] {
        [ResourceKind::Skill, ResourceKind::Agent, ResourceKind::Workflow]
    }

    /// Stable name used in references and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Skill => "skill",
            ResourceKind::Agent => "agent",
            ResourceKind::Workflow => "workflow",
        }
    }

    /// Prefix of server-minted ids for this kind.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ResourceKind::Skill => "skl",
            ResourceKind::Agent => "agt",
            ResourceKind::Workflow => "wfl",
        }
    }
}

/// One declared resource.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ManifestEntry {
    /// Naming metadata; `metadata.name` is the slug source.
    pub metadata: EntryMetadata,
    /// Kind-specific payload, passed through to the backend untouched.
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// Naming metadata of a manifest entry.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EntryMetadata {
    /// Slug of the resource, unique per (org, kind).
    pub name: String,
    /// Optional human-readable display name.
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
}

/// The harvested manifest.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Manifest {
    /// Declared agents.
    #[serde(default)]
    pub agents: Vec<ManifestEntry>,
    /// Declared workflows.
    #[serde(default)]
    pub workflows: Vec<ManifestEntry>,
    /// Declared skills.
    #[serde(default)]
    pub skills: Vec<ManifestEntry>,
}

impl Manifest {
    /// Parses the JSON payload captured from a deployment program's stdout.
    pub fn parse(payload: &[u8]) -> Result<Manifest, ManifestError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// True when the manifest declares no resources at all.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.workflows.is_empty() && self.skills.is_empty()
    }

    /// Entries of one kind.
    pub fn entries(&self, kind: ResourceKind) -> &[ManifestEntry] {
        match kind {
            ResourceKind::Skill => &self.skills,
            ResourceKind::Agent => &self.agents,
            ResourceKind::Workflow => &self.workflows,
        }
    }

    /// Total number of declared resources.
    pub fn len(&self) -> usize {
        self.agents.len() + self.workflows.len() + self.skills.len()
    }
}
