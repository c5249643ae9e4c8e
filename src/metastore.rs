//! Project and schema metadata
//!
//! The rollup core asks the metastore two things: whether a project exists,
//! and what type a field has so value scripts can be checked when a rule is
//! registered. [`InMemoryMetastore`] is the reference implementation; it also
//! creates projects (issuing API keys) and tracks collection schemas.
//!
//! Naming rules:
//!
//! - projects: `[A-Za-z0-9_]`, not `public`/`information_schema`, no `pg_` prefix
//! - collections: `[A-Za-z0-9_]`, not `public`, no `pg_` or `_` prefix

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::MetastoreError;

/// Length of generated API keys
pub const API_KEY_LENGTH: usize = 64;

const RESERVED_PROJECTS: [&str; 2] = ["information_schema", "public"];

/// Type of a collection field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    /// 64-bit integer
    Long,
    /// Double precision float
    Double,
    /// Text
    String,
    /// Boolean
    Boolean,
    /// Calendar date
    Date,
    /// Time of day
    Time,
    /// Date and time
    Timestamp,
    /// Array of values
    Array,
}

impl FieldType {
    /// Whether numeric aggregations can read the field
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Long | FieldType::Double)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Long => "LONG",
            FieldType::Double => "DOUBLE",
            FieldType::String => "STRING",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Array => "ARRAY",
        };
        f.write_str(name)
    }
}

/// A named, typed collection field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether events may omit the field
    pub nullable: bool,
}

impl SchemaField {
    /// Nullable field
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
        }
    }
}

/// API keys issued for a new project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectApiKeys {
    /// Full access
    pub master_key: String,
    /// Query access
    pub read_key: String,
    /// Ingestion access
    pub write_key: String,
}

impl ProjectApiKeys {
    fn generate() -> Self {
        Self {
            master_key: generate_key(),
            read_key: generate_key(),
            write_key: generate_key(),
        }
    }
}

fn generate_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LENGTH)
        .map(char::from)
        .collect()
}

/// Metadata capabilities the rollup engine depends on
pub trait Metastore: Send + Sync {
    /// Create a project and issue its API keys
    fn create_project(&self, project: &str) -> Result<ProjectApiKeys, MetastoreError>;

    /// Whether the project exists
    fn project_exists(&self, project: &str) -> bool;

    /// All projects, sorted
    fn projects(&self) -> Vec<String>;

    /// Collections of a project with their fields
    fn collections(&self, project: &str) -> Result<BTreeMap<String, Vec<SchemaField>>, MetastoreError>;

    /// Add the fields a collection does not have yet; returns the full schema
    fn create_or_get_collection_fields(
        &self,
        project: &str,
        collection: &str,
        fields: &[SchemaField],
    ) -> Result<Vec<SchemaField>, MetastoreError>;

    /// Type of `field` in any collection of the project, if declared
    fn field_type(&self, project: &str, field: &str) -> Option<FieldType> {
        self.collections(project).ok().and_then(|collections| {
            collections
                .values()
                .flatten()
                .find(|f| f.name == field)
                .map(|f| f.field_type)
        })
    }
}

#[derive(Debug)]
struct ProjectEntry {
    keys: ProjectApiKeys,
    collections: BTreeMap<String, Vec<SchemaField>>,
}

/// Metastore held in process memory
#[derive(Debug, Default)]
pub struct InMemoryMetastore {
    projects: RwLock<HashMap<String, ProjectEntry>>,
}

impl InMemoryMetastore {
    /// Create an empty metastore
    pub fn new() -> Self {
        Self::default()
    }

    /// Which key kinds `key` grants for `project`
    pub fn key_kinds(&self, project: &str, key: &str) -> BTreeSet<&'static str> {
        let mut kinds = BTreeSet::new();
        if let Some(entry) = self.projects.read().get(project) {
            if entry.keys.master_key == key {
                kinds.insert("master");
            }
            if entry.keys.read_key == key {
                kinds.insert("read");
            }
            if entry.keys.write_key == key {
                kinds.insert("write");
            }
        }
        kinds
    }
}

fn validate_project_name(project: &str) -> Result<(), MetastoreError> {
    let invalid = |reason: &str| MetastoreError::InvalidName {
        name: project.to_string(),
        reason: reason.to_string(),
    };
    if project.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if RESERVED_PROJECTS.contains(&project) || project.starts_with("pg_") {
        return Err(invalid("reserved name"));
    }
    if !is_identifier(project) {
        return Err(invalid("only alphanumeric characters and '_' are allowed"));
    }
    Ok(())
}

fn validate_collection_name(collection: &str) -> Result<(), MetastoreError> {
    let invalid = |reason: &str| MetastoreError::InvalidName {
        name: collection.to_string(),
        reason: reason.to_string(),
    };
    if collection.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if collection == "public" {
        return Err(invalid("collection name 'public' is not allowed"));
    }
    if collection.starts_with("pg_") || collection.starts_with('_') {
        return Err(invalid("must not start with 'pg_' or '_'"));
    }
    if !is_identifier(collection) {
        return Err(invalid("only alphanumeric characters and '_' are allowed"));
    }
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Metastore for InMemoryMetastore {
    fn create_project(&self, project: &str) -> Result<ProjectApiKeys, MetastoreError> {
        validate_project_name(project)?;

        let mut projects = self.projects.write();
        if projects.contains_key(project) {
            return Err(MetastoreError::ProjectAlreadyExists(project.to_string()));
        }

        let keys = ProjectApiKeys::generate();
        projects.insert(
            project.to_string(),
            ProjectEntry {
                keys: keys.clone(),
                collections: BTreeMap::new(),
            },
        );
        tracing::info!(project, "Project created");
        Ok(keys)
    }

    fn project_exists(&self, project: &str) -> bool {
        self.projects.read().contains_key(project)
    }

    fn projects(&self) -> Vec<String> {
        let mut projects: Vec<String> = self.projects.read().keys().cloned().collect();
        projects.sort();
        projects
    }

    fn collections(&self, project: &str) -> Result<BTreeMap<String, Vec<SchemaField>>, MetastoreError> {
        self.projects
            .read()
            .get(project)
            .map(|entry| entry.collections.clone())
            .ok_or_else(|| MetastoreError::ProjectNotFound(project.to_string()))
    }

    fn create_or_get_collection_fields(
        &self,
        project: &str,
        collection: &str,
        fields: &[SchemaField],
    ) -> Result<Vec<SchemaField>, MetastoreError> {
        validate_collection_name(collection)?;

        let mut projects = self.projects.write();
        let entry = projects
            .get_mut(project)
            .ok_or_else(|| MetastoreError::ProjectNotFound(project.to_string()))?;

        let schema = entry.collections.entry(collection.to_string()).or_default();
        let mut added = 0;
        for field in fields {
            if !schema.iter().any(|existing| existing.name == field.name) {
                schema.push(field.clone());
                added += 1;
            }
        }
        if added > 0 {
            tracing::debug!(project, collection, added, "Collection fields added");
        }
        Ok(schema.clone())
    }
}
