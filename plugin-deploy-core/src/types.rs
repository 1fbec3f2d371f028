use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DeployError;
use crate::state::LifecycleState;

// ─── Process key ──────────────────────────────────────────────

/// `(id, version)` of a process definition. Ordered by id, then version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProcessKey {
    pub id: String,
    pub version: String,
}

impl ProcessKey {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.id, self.version)
    }
}

impl FromStr for ProcessKey {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('|') {
            Some((id, version))
                if !id.is_empty() && !version.is_empty() && !version.contains('|') =>
            {
                Ok(Self::new(id, version))
            }
            _ => Err(DeployError::InvalidProcessKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for ProcessKey {
    type Error = DeployError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ProcessKey> for String {
    fn from(key: ProcessKey) -> Self {
        key.to_string()
    }
}

// ─── Resource kinds ───────────────────────────────────────────

/// Artifact kinds a process plugin may ship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    NamingSystem,
    CodeSystem,
    ValueSet,
    StructureDefinition,
    Library,
    Measure,
    Questionnaire,
    ActivityDefinition,
    Task,
}

impl ResourceKind {
    /// Position within one batch. Referenced kinds come before the kinds
    /// that reference them.
    pub fn sort_priority(self) -> u8 {
        match self {
            Self::NamingSystem => 0,
            Self::CodeSystem => 1,
            Self::ValueSet => 2,
            Self::StructureDefinition => 3,
            Self::Library => 4,
            Self::Measure => 5,
            Self::Questionnaire => 6,
            Self::ActivityDefinition => 7,
            Self::Task => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NamingSystem => "NamingSystem",
            Self::CodeSystem => "CodeSystem",
            Self::ValueSet => "ValueSet",
            Self::StructureDefinition => "StructureDefinition",
            Self::Library => "Library",
            Self::Measure => "Measure",
            Self::Questionnaire => "Questionnaire",
            Self::ActivityDefinition => "ActivityDefinition",
            Self::Task => "Task",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NamingSystem" => Self::NamingSystem,
            "CodeSystem" => Self::CodeSystem,
            "ValueSet" => Self::ValueSet,
            "StructureDefinition" => Self::StructureDefinition,
            "Library" => Self::Library,
            "Measure" => Self::Measure,
            "Questionnaire" => Self::Questionnaire,
            "ActivityDefinition" => Self::ActivityDefinition,
            "Task" => Self::Task,
            other => return Err(format!("unknown resource kind '{other}'")),
        })
    }
}

// ─── Artifact identity ────────────────────────────────────────

/// Identifier system under which task templates are registered.
pub const TASK_IDENTIFIER_SYSTEM: &str = "urn:process-plugin:task-identifier";

/// Natural key of an artifact, valid before the store has assigned an id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum ArtifactIdentity {
    UrlVersion {
        kind: ResourceKind,
        url: String,
        version: String,
    },
    Name {
        kind: ResourceKind,
        name: String,
    },
    Identifier {
        kind: ResourceKind,
        value: String,
    },
}

impl ArtifactIdentity {
    pub fn url_version(
        kind: ResourceKind,
        url: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self::UrlVersion {
            kind,
            url: url.into(),
            version: version.into(),
        }
    }

    pub fn name(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::Name {
            kind,
            name: name.into(),
        }
    }

    pub fn identifier(kind: ResourceKind, value: impl Into<String>) -> Self {
        Self::Identifier {
            kind,
            value: value.into(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::UrlVersion { kind, .. }
            | Self::Name { kind, .. }
            | Self::Identifier { kind, .. } => *kind,
        }
    }

    /// URL-encoded search parameters selecting exactly this artifact.
    pub fn condition(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        match self {
            Self::UrlVersion { url, version, .. } => {
                query.append_pair("url", url).append_pair("version", version);
            }
            Self::Name { name, .. } => {
                query.append_pair("name", name);
            }
            Self::Identifier { value, .. } => {
                query.append_pair("identifier", &format!("{TASK_IDENTIFIER_SYSTEM}|{value}"));
            }
        }
        query.finish()
    }
}

impl fmt::Display for ArtifactIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?{}", self.kind(), self.condition())
    }
}

// ─── Plugins ──────────────────────────────────────────────────

/// An artifact as declared by a loaded plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredArtifact {
    pub identity: ArtifactIdentity,
    pub payload: serde_json::Value,
}

/// One process shipped by a plugin, with the artifacts it depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginProcess {
    pub key: ProcessKey,
    /// Serialized process model, handed to the registry unparsed.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub artifacts: Vec<DeclaredArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessPlugin {
    pub name: String,
    pub version: String,
    /// Draft plugins are redeployed and re-synced on every pass.
    #[serde(default)]
    pub draft: bool,
    pub processes: Vec<PluginProcess>,
}

// ─── Stored and merged artifacts ──────────────────────────────

/// Artifact known to the store from a previous pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub identity: ArtifactIdentity,
    pub store_id: Uuid,
}

/// Merged view of one artifact across every process that declares it.
/// Lives for exactly one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnedArtifact {
    pub identity: ArtifactIdentity,
    /// Absent when the artifact was recovered from store records only.
    pub payload: Option<serde_json::Value>,
    pub owning_processes: BTreeSet<ProcessKey>,
    pub store_id: Option<Uuid>,
    pub old_state: LifecycleState,
    pub new_state: LifecycleState,
}

impl OwnedArtifact {
    pub fn kind(&self) -> ResourceKind {
        self.identity.kind()
    }

    /// Payload with its `status` field set to match `new_state`.
    pub fn payload_with_status(&self) -> Result<serde_json::Value, DeployError> {
        let mut payload = self
            .payload
            .clone()
            .ok_or_else(|| DeployError::MissingPayload(self.identity.clone()))?;
        if let (Some(status), Some(object)) =
            (self.new_state.status_code(), payload.as_object_mut())
        {
            object.insert("status".to_string(), serde_json::Value::from(status));
        }
        Ok(payload)
    }
}
